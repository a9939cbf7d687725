//! Preconditioners for the Krylov solvers.
//!
//! A preconditioner `B ≈ A⁻¹` is consumed through [`Preconditioner`] only; the
//! methods never know what is behind it. Besides `apply` and its transpose the
//! trait offers the combined operator/preconditioner product
//! ([`apply_ba_or_ab`](Preconditioner::apply_ba_or_ab)) used by methods that
//! support both left and right preconditioning.

use crate::core::traits::{LinearOperator, Scalar};
use crate::error::KError;
use std::fmt;
use std::str::FromStr;

pub mod jacobi;

pub use jacobi::Jacobi;

/// Which side the preconditioner is applied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcSide {
    #[default]
    Left,
    Right,
    Symmetric,
}

impl FromStr for PcSide {
    type Err = KError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "symmetric" => Ok(Self::Symmetric),
            _ => Err(KError::InvalidOption { key: "ksp_pc_side".into(), value: s.into() }),
        }
    }
}

impl fmt::Display for PcSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Symmetric => "symmetric",
        })
    }
}

/// A preconditioner B ≈ A⁻¹ acting on local vector slices.
pub trait Preconditioner<T: Scalar> {
    /// Prepare from the operator (e.g. extract its diagonal).
    fn setup(&mut self, _op: &dyn LinearOperator<T>) -> Result<(), KError> {
        Ok(())
    }

    /// y ← B x
    fn apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError>;

    /// y ← Bᵀ x
    fn apply_transpose(&self, _x: &[T], _y: &mut [T]) -> Result<(), KError> {
        Err(KError::Unsupported("transpose application of this preconditioner"))
    }

    /// y ← B A x (left) or y ← A B x (right); `work` is scratch of the same length.
    fn apply_ba_or_ab(
        &self,
        op: &dyn LinearOperator<T>,
        side: PcSide,
        x: &[T],
        y: &mut [T],
        work: &mut [T],
    ) -> Result<(), KError> {
        match side {
            PcSide::Left => {
                op.mult(x, work)?;
                self.apply(work, y)
            }
            PcSide::Right => {
                self.apply(x, work)?;
                op.mult(work, y)
            }
            PcSide::Symmetric => Err(KError::Unsupported("symmetric application of an unsplit preconditioner")),
        }
    }

    /// Transpose of [`apply_ba_or_ab`](Self::apply_ba_or_ab): y ← Aᵀ Bᵀ x (left) or y ← Bᵀ Aᵀ x (right).
    fn apply_ba_or_ab_transpose(
        &self,
        op: &dyn LinearOperator<T>,
        side: PcSide,
        x: &[T],
        y: &mut [T],
        work: &mut [T],
    ) -> Result<(), KError> {
        match side {
            PcSide::Left => {
                self.apply_transpose(x, work)?;
                op.mult_transpose(work, y)
            }
            PcSide::Right => {
                op.mult_transpose(x, work)?;
                self.apply_transpose(work, y)
            }
            PcSide::Symmetric => Err(KError::Unsupported("symmetric application of an unsplit preconditioner")),
        }
    }
}

/// B = I.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreconditioner;

impl<T: Scalar> Preconditioner<T> for NoPreconditioner {
    fn apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if x.len() != y.len() {
            return Err(KError::DimensionMismatch { expected: x.len(), got: y.len() });
        }
        y.copy_from_slice(x);
        Ok(())
    }

    fn apply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.apply(x, y)
    }
}

impl<T: Scalar, P: Preconditioner<T> + ?Sized> Preconditioner<T> for Box<P> {
    fn setup(&mut self, op: &dyn LinearOperator<T>) -> Result<(), KError> {
        (**self).setup(op)
    }
    fn apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        (**self).apply(x, y)
    }
    fn apply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        (**self).apply_transpose(x, y)
    }
}
