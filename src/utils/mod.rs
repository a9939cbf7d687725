//! Convergence bookkeeping and event logging.

pub mod convergence;
pub mod events;

pub use convergence::{ConvergedReason, ConvergenceTest, NormType, SolveStats, Tolerances};
