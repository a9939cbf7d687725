//! Wrappers for faer dense matrix types and inner products.
//!
//! This module implements the operator capability for `faer::Mat`, so dense
//! matrices can be handed to the Krylov layer directly, and provides the two
//! inner products used by the solvers:
//!
//! - `()` is the serial inner product (rayon-parallel when that feature is on).
//! - [`DistributedInnerProduct`] reduces local partial sums over a [`Comm`].
//!
//! # References
//! - [faer crate documentation](https://docs.rs/faer)

use crate::core::kernels;
use crate::core::traits::{InnerProduct, LinearOperator, Scalar};
use crate::error::KError;
use crate::parallel::Comm;
use crate::utils::events::add_flops;
use faer::Mat;

fn check_len(expected: usize, got: usize) -> Result<(), KError> {
    if expected == got {
        Ok(())
    } else {
        Err(KError::DimensionMismatch { expected, got })
    }
}

/// Dense matrices act as serial operators.
impl<T: Scalar> LinearOperator<T> for Mat<T> {
    fn local_rows(&self) -> usize {
        self.nrows()
    }

    fn local_cols(&self) -> usize {
        self.ncols()
    }

    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        check_len(self.ncols(), x.len())?;
        check_len(self.nrows(), y.len())?;
        for i in 0..self.nrows() {
            let mut acc = T::zero();
            for j in 0..self.ncols() {
                acc = acc + self[(i, j)] * x[j];
            }
            y[i] = acc;
        }
        add_flops(2 * self.nrows() * self.ncols());
        Ok(())
    }

    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        check_len(self.nrows(), x.len())?;
        check_len(self.ncols(), y.len())?;
        for j in 0..self.ncols() {
            let mut acc = T::zero();
            for i in 0..self.nrows() {
                acc = acc + self[(i, j)] * x[i];
            }
            y[j] = acc;
        }
        add_flops(2 * self.nrows() * self.ncols());
        Ok(())
    }

    fn diagonal(&self, d: &mut [T]) -> Result<(), KError> {
        check_len(self.nrows().min(self.ncols()), d.len())?;
        for (i, di) in d.iter_mut().enumerate() {
            *di = self[(i, i)];
        }
        Ok(())
    }
}

/// Serial inner product over local slices.
impl<T: Scalar> InnerProduct<T> for () {
    fn dot(&self, x: &[T], y: &[T]) -> Result<T, KError> {
        check_len(x.len(), y.len())?;
        Ok(kernels::dot(x, y))
    }
}

/// Distributed inner product and norm.
///
/// Wraps a communicator; each call computes the local partial sum and reduces
/// it across all processes, so every rank receives the same value.
pub struct DistributedInnerProduct<'a, C: Comm> {
    /// Reference to the communicator implementing the `Comm` trait.
    pub comm: &'a C,
}

impl<'a, C: Comm> DistributedInnerProduct<'a, C> {
    pub fn new(comm: &'a C) -> Self {
        Self { comm }
    }
}

impl<T: Scalar, C: Comm> InnerProduct<T> for DistributedInnerProduct<'_, C> {
    fn dot(&self, x: &[T], y: &[T]) -> Result<T, KError> {
        check_len(x.len(), y.len())?;
        let local = kernels::dot(x, y).to_wire();
        let global = self.comm.all_reduce_sum(local)?;
        Ok(T::from_wire(global))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dense_transpose_matches_explicit_transpose() {
        let a = Mat::from_fn(3, 2, |i, j| (i * 2 + j) as f64 + 1.0);
        let x = vec![1.0, -1.0, 2.0];
        let mut y = vec![0.0; 2];
        a.mult_transpose(&x, &mut y).unwrap();
        // columns of a: [1,3,5] and [2,4,6]
        assert_abs_diff_eq!(y[0], 1.0 - 3.0 + 10.0);
        assert_abs_diff_eq!(y[1], 2.0 - 4.0 + 12.0);
    }

    #[test]
    fn dense_mult_rejects_bad_lengths() {
        let a = Mat::from_fn(2, 2, |_, _| 1.0f64);
        let mut y = vec![0.0; 2];
        assert!(matches!(
            a.mult(&[1.0, 2.0, 3.0], &mut y),
            Err(KError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }
}
