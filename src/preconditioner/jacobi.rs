// Jacobi preconditioner implementation

use crate::core::traits::{LinearOperator, Scalar};
use crate::error::KError;
use crate::preconditioner::Preconditioner;
use crate::utils::events::add_flops;

/// Jacobi preconditioner: B = D⁻¹
///
/// Zero diagonal entries are passed through unscaled.
#[derive(Debug, Clone)]
pub struct Jacobi<T> {
    pub(crate) inv_diag: Vec<T>,
}

impl<T: Scalar> Jacobi<T> {
    /// new with empty state; user must call `setup`.
    pub fn new() -> Self {
        Self { inv_diag: Vec::new() }
    }
}

impl<T: Scalar> Default for Jacobi<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Preconditioner<T> for Jacobi<T> {
    fn setup(&mut self, op: &dyn LinearOperator<T>) -> Result<(), KError> {
        let mut diag = vec![T::zero(); op.local_rows()];
        op.diagonal(&mut diag)?;
        self.inv_diag = diag
            .into_iter()
            .map(|d| if d != T::zero() { T::one() / d } else { T::one() })
            .collect();
        Ok(())
    }

    fn apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if x.len() != self.inv_diag.len() || y.len() != x.len() {
            return Err(KError::DimensionMismatch { expected: self.inv_diag.len(), got: x.len() });
        }
        for ((yi, &xi), &di) in y.iter_mut().zip(x).zip(&self.inv_diag) {
            *yi = di * xi;
        }
        add_flops(x.len());
        Ok(())
    }

    fn apply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.apply(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    #[test]
    fn scales_by_inverse_diagonal() {
        let a = Mat::<f64>::from_fn(3, 3, |i, j| if i == j { (i + 1) as f64 } else { 0.5 });
        let mut pc = Jacobi::new();
        pc.setup(&a).unwrap();
        let mut y = [0.0; 3];
        pc.apply(&[1.0, 1.0, 3.0], &mut y).unwrap();
        assert_abs_diff_eq!(y[0], 1.0);
        assert_abs_diff_eq!(y[1], 0.5);
        assert_abs_diff_eq!(y[2], 1.0);
    }
}
