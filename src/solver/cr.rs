//! Conjugate Residual (CR) solver
//!
//! Minimises the A-norm of the preconditioned residual. Intended for symmetric
//! (possibly indefinite) operators with a symmetric preconditioner.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM. §6.8

use crate::context::ksp_context::KspContext;
use crate::core::kernels::{axpy, aypx, copy};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::solver::{KspMethod, work_error};
use crate::utils::convergence::NormType;

#[derive(Debug, Clone, Copy, Default)]
pub struct Cr;

impl Cr {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Scalar> KspMethod<T> for Cr {
    fn name(&self) -> &'static str {
        "cr"
    }

    fn work_vectors(&self) -> usize {
        6
    }

    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        match side {
            PcSide::Left => &[
                NormType::Preconditioned,
                NormType::Unpreconditioned,
                NormType::Natural,
                NormType::None,
            ],
            _ => &[],
        }
    }

    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        // r: true residual, rt: preconditioned residual
        let [r, rt, p, ap, art, q] = work else {
            return Err(work_error("cr"));
        };
        let norm = ksp.norm_type();
        let max_it = ksp.tolerances().max_it;

        if ksp.guess_zero() {
            copy(b, r);
        } else {
            ksp.op_mult(x, r)?;
            aypx(-T::one(), b, r);
        }
        ksp.pc_apply(r, p)?;
        ksp.op_mult(p, ap)?;
        copy(p, rt);
        copy(ap, art);
        let mut btop = ksp.dot(rt, art)?;
        let dp = match norm {
            NormType::Preconditioned => ksp.norm(rt)?,
            NormType::Unpreconditioned => ksp.norm(r)?,
            NormType::Natural => btop.abs().sqrt(),
            NormType::None => T::zero(),
        };
        ksp.its = 0;
        if ksp.iteration_done(0, dp) {
            return Ok(());
        }

        for i in 0..max_it {
            ksp.pc_apply(ap, q)?;
            let apq = ksp.dot(ap, q)?;
            if apq == T::zero() {
                ksp.breakdown("cr", "(Ap, BAp)");
                return Ok(());
            }
            let ai = btop / apq;
            axpy(ai, p, x);
            axpy(-ai, q, rt);
            ksp.op_mult(rt, art)?;
            let bbot = btop;
            btop = ksp.dot(rt, art)?;

            let dp = match norm {
                NormType::Preconditioned => ksp.norm(rt)?,
                NormType::Natural => btop.abs().sqrt(),
                NormType::None => T::zero(),
                NormType::Unpreconditioned => {
                    axpy(-ai, ap, r);
                    ksp.norm(r)?
                }
            };
            ksp.its = i + 1;
            if ksp.iteration_done(i + 1, dp) {
                return Ok(());
            }

            if bbot == T::zero() {
                ksp.breakdown("cr", "(r, Ar)");
                return Ok(());
            }
            let bi = btop / bbot;
            aypx(bi, rt, p);
            aypx(bi, art, ap);
        }
        Ok(())
    }
}
