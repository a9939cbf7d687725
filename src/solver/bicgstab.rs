//! BiCGStab solver (Saad §7.4.2)
//!
//! Stabilised BiCG: each step combines a BiCG step with a one-dimensional
//! residual minimisation. Left and right preconditioning are supported; the
//! monitored norm is that of the residual the recurrence carries (preconditioned
//! for left, true residual for right).

use crate::context::ksp_context::KspContext;
use crate::core::kernels::{axpy, aypx, copy, set, waxpy};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::solver::{KspMethod, work_error};
use crate::utils::convergence::{ConvergedReason, NormType};

#[derive(Debug, Clone, Copy, Default)]
pub struct BiCgStab;

impl BiCgStab {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Scalar> KspMethod<T> for BiCgStab {
    fn name(&self) -> &'static str {
        "bcgs"
    }

    fn work_vectors(&self) -> usize {
        6
    }

    fn supported_sides(&self) -> &'static [PcSide] {
        &[PcSide::Left, PcSide::Right]
    }

    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        match side {
            PcSide::Left => &[NormType::Preconditioned, NormType::None],
            PcSide::Right => &[NormType::Unpreconditioned, NormType::None],
            PcSide::Symmetric => &[],
        }
    }

    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        let [r, rp, v, t, s, p] = work else {
            return Err(work_error("bcgs"));
        };
        let with_norm = ksp.norm_type() != NormType::None;
        let max_it = ksp.tolerances().max_it;

        ksp.initial_residual(x, v, t, r, b)?;
        let mut dp = if with_norm { ksp.norm(r)? } else { T::zero() };
        ksp.its = 0;
        if ksp.iteration_done(0, dp) {
            return Ok(());
        }

        copy(r, rp);
        let mut rhoold = T::one();
        let mut alpha = T::one();
        let mut omegaold = T::one();
        set(T::zero(), p);
        set(T::zero(), v);

        for i in 0..max_it {
            let rho = ksp.dot(r, rp)?;
            if rho == T::zero() {
                ksp.breakdown("bcgs", "(r, r̃)");
                return Ok(());
            }
            if omegaold == T::zero() {
                ksp.breakdown("bcgs", "omega");
                return Ok(());
            }
            let beta = (rho / rhoold) * (alpha / omegaold);
            axpy(-omegaold, v, p); // p ← p − ω v
            aypx(beta, r, p); // p ← r + β p
            ksp.pc_apply_ba_or_ab(p, v, t)?;
            let d1 = ksp.dot(v, rp)?;
            if d1 == T::zero() {
                ksp.breakdown("bcgs", "(v, r̃)");
                return Ok(());
            }
            alpha = rho / d1;
            waxpy(-alpha, v, r, s); // s ← r − α v
            // t ← K s, r is scratch here
            ksp.pc_apply_ba_or_ab(s, t, r)?;
            let d1 = ksp.dot(s, t)?;
            let d2 = ksp.dot(t, t)?;
            if d2 == T::zero() {
                // t = K s = 0: only a solution if s itself vanished
                if ksp.dot(s, s)? != T::zero() {
                    ksp.breakdown("bcgs", "(t, t)");
                    return Ok(());
                }
                axpy(alpha, p, x);
                ksp.its = i + 1;
                ksp.reason = ConvergedReason::ConvergedRtol;
                ksp.record(i + 1, T::zero());
                return Ok(());
            }
            let omega = d1 / d2;
            axpy(alpha, p, x);
            axpy(omega, s, x);
            waxpy(-omega, t, s, r); // r ← s − ω t
            if with_norm {
                dp = ksp.norm(r)?;
            }
            rhoold = rho;
            omegaold = omega;

            ksp.its = i + 1;
            if ksp.iteration_done(i + 1, dp) {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::LinearOperator;
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    // Helper: well-conditioned non-symmetric 3x3 matrix
    fn nonsym_3x3() -> (Mat<f64>, Vec<f64>) {
        let a = Mat::from_fn(3, 3, |i, j| if i == j { 8.0 } else { (i + 2 * j) as f64 * 0.5 + 1.0 });
        let x_true = [1.0, 2.0, 3.0];
        let mut b = vec![0.0; 3];
        a.mult(&x_true, &mut b).unwrap();
        (a, b)
    }

    #[test]
    fn bicgstab_solves_well_conditioned_nonsym() {
        let (a, b) = nonsym_3x3();
        let mut x = vec![0.0; 3];
        let mut ksp = KspContext::<f64>::new();
        ksp.set_operators(&a).set_type(BiCgStab::new()).set_tolerances(1e-12, 1e-50, 1e5, 100);
        let stats = ksp.solve(&b, &mut x).unwrap();
        assert!(stats.converged, "BiCGStab did not converge: stats = {:?}", stats);
        let x_true = [1.0, 2.0, 3.0];
        for i in 0..3 {
            assert_abs_diff_eq!(x[i], x_true[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn bicgstab_right_preconditioned_uses_true_residual() {
        let (a, b) = nonsym_3x3();
        let mut x = vec![0.0; 3];
        let mut ksp = KspContext::<f64>::new();
        ksp.set_operators(&a).set_type(BiCgStab::new()).set_pc_side(PcSide::Right);
        ksp.solve(&b, &mut x).unwrap();
        assert_eq!(ksp.norm_type(), NormType::Unpreconditioned);
        let bnorm = b.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert_abs_diff_eq!(ksp.residual_history()[0], bnorm, epsilon = 1e-12);
    }
}
