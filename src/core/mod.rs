//! Core traits, micro-kernels and dense wrappers.

pub mod kernels;
pub mod traits;
pub mod wrappers;

pub use traits::{InnerProduct, InsertMode, LinearOperator, MatAssembly, Scalar};
pub use wrappers::DistributedInnerProduct;
