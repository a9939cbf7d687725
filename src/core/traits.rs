//! Core linear-algebra traits for kryst-baij.
//!
//! Vectors are plain local slices; anything that needs global reductions goes
//! through an [`InnerProduct`], and anything that needs neighbour data goes
//! through the operator itself.

use crate::error::KError;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Real scalar type usable by the matrix engine and the solvers.
///
/// Values cross process boundaries as `f64`.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {
    /// Widen to the wire representation.
    fn to_wire(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
    /// Narrow from the wire representation.
    fn from_wire(v: f64) -> Self {
        Self::from_f64(v).unwrap_or_else(Self::nan)
    }
}

impl<T> Scalar for T where T: Float + FromPrimitive + Debug + Send + Sync + 'static {}

/// How a value combines with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Overwrite (last writer wins).
    Insert,
    /// Accumulate.
    Add,
}

/// Operator capability consumed by the Krylov layer.
///
/// Outputs are only defined when the call returns `Ok`.
pub trait LinearOperator<T: Scalar> {
    /// Number of locally owned rows (length of `y` in [`mult`](Self::mult)).
    fn local_rows(&self) -> usize;

    /// Number of locally owned columns (length of `x` in [`mult`](Self::mult)).
    fn local_cols(&self) -> usize {
        self.local_rows()
    }

    /// y ← A x
    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError>;

    /// y ← Aᵀ x
    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError>;

    /// z ← y + A x
    fn mult_add(&self, x: &[T], y: &[T], z: &mut [T]) -> Result<(), KError> {
        self.mult(x, z)?;
        for (zi, &yi) in z.iter_mut().zip(y) {
            *zi = *zi + yi;
        }
        Ok(())
    }

    /// Extract the locally owned part of the main diagonal.
    fn diagonal(&self, _d: &mut [T]) -> Result<(), KError> {
        Err(KError::Unsupported("diagonal extraction"))
    }
}

impl<T: Scalar, A: LinearOperator<T> + ?Sized> LinearOperator<T> for &A {
    fn local_rows(&self) -> usize {
        (**self).local_rows()
    }
    fn local_cols(&self) -> usize {
        (**self).local_cols()
    }
    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        (**self).mult(x, y)
    }
    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        (**self).mult_transpose(x, y)
    }
    fn mult_add(&self, x: &[T], y: &[T], z: &mut [T]) -> Result<(), KError> {
        (**self).mult_add(x, y, z)
    }
    fn diagonal(&self, d: &mut [T]) -> Result<(), KError> {
        (**self).diagonal(d)
    }
}

/// Two-phase insert/assemble capability.
pub trait MatAssembly<T: Scalar> {
    /// Insert a dense `rows.len() × cols.len()` row-oriented patch of values.
    fn set_values(
        &mut self,
        rows: &[usize],
        cols: &[usize],
        values: &[T],
        mode: InsertMode,
    ) -> Result<(), KError>;

    /// Read a dense `rows.len() × cols.len()` row-oriented patch of values.
    fn get_values(&self, rows: &[usize], cols: &[usize], values: &mut [T]) -> Result<(), KError>;

    /// Start exchanging off-process entries.
    fn assembly_begin(&mut self) -> Result<(), KError>;

    /// Finish the exchange and make the matrix usable.
    fn assembly_end(&mut self) -> Result<(), KError>;

    /// Begin followed immediately by End.
    fn assemble(&mut self) -> Result<(), KError> {
        self.assembly_begin()?;
        self.assembly_end()
    }
}

/// Inner products & norms.
pub trait InnerProduct<T: Scalar> {
    /// Compute dot(x, y).
    fn dot(&self, x: &[T], y: &[T]) -> Result<T, KError>;
    /// Compute ‖x‖₂.
    fn norm(&self, x: &[T]) -> Result<T, KError> {
        Ok(self.dot(x, x)?.abs().sqrt())
    }
}
