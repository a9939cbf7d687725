//! kryst-baij: distributed block-sparse matrices and PETSc-style Krylov solvers
//!
//! The matrix engine partitions a block-sparse (BAIJ) matrix by block rows
//! across processes and assembles it with a two-phase insert protocol that
//! ships off-process entries to their owners. The Krylov layer (BiCG, CGS,
//! Chebyshev, CR, BiCGStab) runs on any [`LinearOperator`], so the same
//! solvers work on dense `faer` matrices, serial block stores and the
//! distributed matrix.

pub mod parallel;

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod io;
pub mod matrix;
pub mod preconditioner;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use context::*;
pub use self::core::*;
pub use error::*;
pub use matrix::*;
pub use preconditioner::*;
pub use solver::*;
pub use utils::*;

// Re-export SolveStats at the crate root for convenience
pub use utils::convergence::SolveStats;
