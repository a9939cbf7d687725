//! Chebyshev iteration
//!
//! A fixed-coefficient three-term recurrence driven by estimates `[emin, emax]`
//! of the extreme eigenvalues of the preconditioned operator `B A`. No inner
//! products are needed except for the optional residual norm, which makes the
//! method attractive as a smoother.
//!
//! The bounds must satisfy `emin < emax` and have the same sign; they are
//! checked when set through [`Chebyshev::set_eigenvalues`] and again at set-up.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM. §12.3
//! - Golub, G. H., & Varga, R. S. (1961). Chebyshev semi-iterative methods.

use crate::context::ksp_context::KspContext;
use crate::core::kernels::{aypx, copy};
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::solver::{KspMethod, work_error};
use crate::utils::convergence::{ConvergedReason, NormType};
use crate::utils::events::add_flops;

/// Chebyshev iteration with eigenvalue bounds `[emin, emax]`.
#[derive(Debug, Clone, Copy)]
pub struct Chebyshev<T> {
    emin: T,
    emax: T,
}

impl<T: Scalar> Default for Chebyshev<T> {
    fn default() -> Self {
        Self { emin: T::from_wire(1e-2), emax: T::from_wire(1e2) }
    }
}

impl<T: Scalar> Chebyshev<T> {
    /// Bounds are validated at set-up, not here.
    pub fn new(emin: T, emax: T) -> Self {
        Self { emin, emax }
    }

    pub fn set_eigenvalues(&mut self, emin: T, emax: T) -> Result<(), KError> {
        check_bounds(emin, emax)?;
        self.emin = emin;
        self.emax = emax;
        Ok(())
    }

    pub fn eigenvalues(&self) -> (T, T) {
        (self.emin, self.emax)
    }
}

fn check_bounds<T: Scalar>(emin: T, emax: T) -> Result<(), KError> {
    let reason = if emax <= emin {
        "maximum must be larger than minimum"
    } else if emax * emin <= T::zero() {
        "both bounds must have the same sign"
    } else {
        return Ok(());
    };
    Err(KError::InvalidEigenvalueBounds { emin: emin.to_wire(), emax: emax.to_wire(), reason })
}

impl<T: Scalar> KspMethod<T> for Chebyshev<T> {
    fn name(&self) -> &'static str {
        "chebyshev"
    }

    fn work_vectors(&self) -> usize {
        3
    }

    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        match side {
            PcSide::Left => &[NormType::Preconditioned, NormType::Unpreconditioned, NormType::None],
            _ => &[],
        }
    }

    fn set_up(&self, _ksp: &KspContext<'_, T>) -> Result<(), KError> {
        check_bounds(self.emin, self.emax)
    }

    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        let [w0, w1, r] = work else {
            return Err(work_error("chebyshev"));
        };
        let norm = ksp.norm_type();
        let max_it = ksp.tolerances().max_it;
        let n = x.len();
        let two = T::one() + T::one();

        // scale·B maps the spectrum into [-alpha, alpha] around one
        let scale = two / (self.emax + self.emin);
        let alpha = T::one() - scale * self.emin;
        let mu = T::one() / alpha;
        let omegaprod = two / alpha;

        if ksp.guess_zero() {
            copy(b, r);
        } else {
            ksp.op_mult(x, r)?;
            aypx(-T::one(), b, r);
        }
        ksp.pc_apply(r, w0)?;
        aypx(scale, x, w0);

        // three iterates rotated in place, x is one of them
        let mut p: [&mut [T]; 3] = [x, w0.as_mut_slice(), w1.as_mut_slice()];
        let (mut km1, mut k, mut kp1) = (0, 1, 2);
        let mut c = [T::one(), mu, T::zero()];
        ksp.its = 0;

        for i in 0..max_it {
            ksp.its = i + 1;
            c[kp1] = two * mu * c[k] - c[km1];
            let omega = omegaprod * c[k] / c[kp1];

            ksp.op_mult(&*p[k], r)?;
            aypx(-T::one(), b, r);
            ksp.pc_apply(r, &mut *p[kp1])?;

            if norm != NormType::None {
                let rnorm = match norm {
                    NormType::Unpreconditioned => ksp.norm(r)?,
                    _ => ksp.norm(&*p[kp1])?,
                };
                if ksp.iteration_done(i, rnorm) {
                    break;
                }
            }

            // y⁽ᵏ⁺¹⁾ = ω (y⁽ᵏ⁾ − y⁽ᵏ⁻¹⁾ + scale·B r⁽ᵏ⁾) + y⁽ᵏ⁻¹⁾
            let ws = omega * scale;
            let wm = T::one() - omega;
            for j in 0..n {
                let v = ws * p[kp1][j] + wm * p[km1][j] + omega * p[k][j];
                p[kp1][j] = v;
            }
            add_flops(5 * n);

            (km1, k, kp1) = (k, kp1, km1);
        }

        if ksp.reason == ConvergedReason::Iterating && norm != NormType::None {
            ksp.reason = ConvergedReason::DivergedIts;
            ksp.op_mult(&*p[k], r)?;
            aypx(-T::one(), b, r);
            let rnorm = match norm {
                NormType::Unpreconditioned => ksp.norm(r)?,
                _ => {
                    ksp.pc_apply(r, &mut *p[kp1])?;
                    ksp.norm(&*p[kp1])?
                }
            };
            let its = ksp.its;
            ksp.record(its, rnorm);
        }

        if k != 0 {
            let (head, tail) = p.split_at_mut(1);
            head[0].copy_from_slice(&*tail[k - 1]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    #[test]
    fn bounds_are_validated() {
        let mut cheb = Chebyshev::<f64>::default();
        assert!(matches!(
            cheb.set_eigenvalues(2.0, 1.0),
            Err(KError::InvalidEigenvalueBounds { reason: "maximum must be larger than minimum", .. })
        ));
        assert!(matches!(
            cheb.set_eigenvalues(-1.0, 1.0),
            Err(KError::InvalidEigenvalueBounds { reason: "both bounds must have the same sign", .. })
        ));
        cheb.set_eigenvalues(0.5, 2.0).unwrap();
        assert_eq!(cheb.eigenvalues(), (0.5, 2.0));
    }

    #[test]
    fn converges_on_diagonal_with_exact_bounds() {
        let a = Mat::<f64>::from_fn(4, 4, |i, j| if i == j { 1.0 + i as f64 } else { 0.0 });
        let b = vec![1.0, 2.0, 3.0, 4.0];
        let mut ksp = KspContext::<f64>::new();
        ksp.set_operators(&a).set_type(Chebyshev::new(1.0, 4.0)).set_tolerances(1e-10, 1e-50, 1e5, 500);
        let mut x = vec![0.0; 4];
        let stats = ksp.solve(&b, &mut x).unwrap();
        assert!(stats.converged, "{stats:?}");
        for xi in &x {
            assert_abs_diff_eq!(*xi, 1.0, epsilon = 1e-8);
        }
    }
}
