//! Conjugate Gradient Squared (CGS) Solver
//!
//! This module implements the CGS iterative method for solving nonsymmetric linear systems Ax = b.
//! The CGS algorithm is based on the BiConjugate Gradient (BiCG) method, but squares the residual
//! polynomials, which avoids products with the transpose. It may converge erratically or break
//! down on ill-conditioned problems.
//!
//! Left and right preconditioning are supported. With the natural norm the
//! monitored quantity is `sqrt|(r, r̃)|`.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM. §7.4.1
//! - Sonneveld, P. (1989). CGS, a fast Lanczos-type solver for nonsymmetric linear systems.

use crate::context::ksp_context::KspContext;
use crate::core::kernels::{axpy, copy, waxpy};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::solver::{KspMethod, work_error};
use crate::utils::convergence::NormType;

/// CGS has no parameters of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cgs;

impl Cgs {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Scalar> KspMethod<T> for Cgs {
    fn name(&self) -> &'static str {
        "cgs"
    }

    fn work_vectors(&self) -> usize {
        7
    }

    fn supported_sides(&self) -> &'static [PcSide] {
        &[PcSide::Left, PcSide::Right]
    }

    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        match side {
            PcSide::Left => &[NormType::Preconditioned, NormType::Natural, NormType::None],
            PcSide::Right => &[NormType::Unpreconditioned, NormType::Natural, NormType::None],
            PcSide::Symmetric => &[],
        }
    }

    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        let [r, rp, v, t, q, p, u] = work else {
            return Err(work_error("cgs"));
        };
        let norm = ksp.norm_type();
        let max_it = ksp.tolerances().max_it;

        ksp.initial_residual(x, v, t, r, b)?;
        let dp = match norm {
            NormType::None => T::zero(),
            _ => ksp.norm(r)?,
        };
        ksp.its = 0;
        if ksp.iteration_done(0, dp) {
            return Ok(());
        }

        copy(r, rp);
        let mut rhoold = ksp.dot(r, rp)?;
        copy(r, u);
        copy(r, p);
        ksp.pc_apply_ba_or_ab(p, v, t)?;

        for i in 0..max_it {
            let s = ksp.dot(v, rp)?;
            if s == T::zero() {
                ksp.breakdown("cgs", "(v, r̃)");
                return Ok(());
            }
            let a = rhoold / s;
            waxpy(-a, v, u, q); // q ← u − a v
            waxpy(T::one(), u, q, t); // t ← u + q
            axpy(a, t, x);
            // v ← K (u + q), u is scratch here
            ksp.pc_apply_ba_or_ab(t, v, u)?;
            axpy(-a, v, r);
            let rho = ksp.dot(r, rp)?;
            let dp = match norm {
                NormType::Natural => rho.abs().sqrt(),
                NormType::None => T::zero(),
                _ => ksp.norm(r)?,
            };
            ksp.its = i + 1;
            if ksp.iteration_done(i + 1, dp) {
                return Ok(());
            }

            if rhoold == T::zero() {
                ksp.breakdown("cgs", "rho");
                return Ok(());
            }
            let beta = rho / rhoold;
            waxpy(beta, q, r, u); // u ← r + β q
            axpy(beta, p, q);
            waxpy(beta, q, u, p); // p ← u + β (q + β p)
            ksp.pc_apply_ba_or_ab(p, v, q)?;
            rhoold = rho;
        }
        Ok(())
    }
}
