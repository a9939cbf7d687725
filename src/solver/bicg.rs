//! Biconjugate Gradient (BiCG) solver
//!
//! Runs the CG recurrence on the system and, simultaneously, on its transpose
//! with a shadow residual. Needs both `Aᵀ` and `Bᵀ`; left preconditioning only.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM. §7.3
//! - Fletcher, R. (1976). Conjugate gradient methods for indefinite systems.

use crate::context::ksp_context::KspContext;
use crate::core::kernels::{axpy, aypx, copy};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::solver::{KspMethod, work_error};
use crate::utils::convergence::NormType;

/// BiCG has no parameters of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiCg;

impl BiCg {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Scalar> KspMethod<T> for BiCg {
    fn name(&self) -> &'static str {
        "bicg"
    }

    fn work_vectors(&self) -> usize {
        6
    }

    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        match side {
            PcSide::Left => &[NormType::Preconditioned, NormType::Unpreconditioned],
            _ => &[],
        }
    }

    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        let [rl, zl, pl, rr, zr, pr] = work else {
            return Err(work_error("bicg"));
        };
        let norm = ksp.norm_type();
        let max_it = ksp.tolerances().max_it;

        // r ← b − A x, shadow residual starts equal to it
        if ksp.guess_zero() {
            copy(b, rr);
        } else {
            ksp.op_mult(x, rr)?;
            aypx(-T::one(), b, rr);
        }
        copy(rr, rl);
        ksp.pc_apply(rr, zr)?;
        ksp.pc_apply_transpose(rl, zl)?;
        let mut dp = match norm {
            NormType::Preconditioned => ksp.norm(zr)?,
            _ => ksp.norm(rr)?,
        };
        ksp.its = 0;
        if ksp.iteration_done(0, dp) {
            return Ok(());
        }

        let mut betaold = T::one();
        for i in 0..max_it {
            let beta = ksp.dot(zr, rl)?;
            if i == 0 {
                if beta == T::zero() {
                    ksp.breakdown("bicg", "beta");
                    return Ok(());
                }
                copy(zr, pr);
                copy(zl, pl);
            } else {
                let s = beta / betaold;
                aypx(s, zr, pr);
                aypx(s, zl, pl);
            }
            betaold = beta;

            ksp.op_mult(pr, zr)?;
            ksp.op_mult_transpose(pl, zl)?;
            let dpi = ksp.dot(zr, pl)?;
            if dpi == T::zero() {
                ksp.breakdown("bicg", "p'Ap");
                return Ok(());
            }
            let a = beta / dpi;
            axpy(a, pr, x);
            axpy(-a, zr, rr);
            axpy(-a, zl, rl);

            if norm == NormType::Preconditioned {
                ksp.pc_apply(rr, zr)?;
                ksp.pc_apply_transpose(rl, zl)?;
                dp = ksp.norm(zr)?;
            } else {
                dp = ksp.norm(rr)?;
            }
            ksp.its = i + 1;
            if ksp.iteration_done(i + 1, dp) {
                return Ok(());
            }
            if norm == NormType::Unpreconditioned {
                ksp.pc_apply(rr, zr)?;
                ksp.pc_apply_transpose(rl, zl)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::LinearOperator;
    use crate::utils::convergence::ConvergedReason;
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    #[test]
    fn bicg_solves_nonsymmetric_system() {
        let a = Mat::<f64>::from_fn(4, 4, |i, j| if i == j { 10.0 } else { 1.0 + 0.5 * (i as f64 - j as f64) });
        let x_true = [1.0, -2.0, 0.5, 3.0];
        let mut b = vec![0.0; 4];
        a.mult(&x_true, &mut b).unwrap();

        let mut ksp = KspContext::<f64>::new();
        ksp.set_operators(&a).set_type(BiCg::new()).set_tolerances(1e-12, 1e-50, 1e5, 50);
        let mut x = vec![0.0; 4];
        let stats = ksp.solve(&b, &mut x).unwrap();
        assert!(stats.converged, "{stats:?}");
        assert!(stats.iterations <= 8);
        for (xi, ti) in x.iter().zip(&x_true) {
            assert_abs_diff_eq!(*xi, *ti, epsilon = 1e-8);
        }
        assert_eq!(ksp.residual_history().len(), stats.iterations + 1);
        assert_ne!(ksp.reason(), ConvergedReason::DivergedBreakdown);
    }
}
