//! Solver and preconditioner contexts.
//!
//! Contexts own the configuration of a solve: which Krylov method, which
//! preconditioner, which tolerances and norm, and the state the method leaves
//! behind (iteration count, residual norm, reason, history).
//!
//! Modules:
//! - [`ksp_context`]: the `KspContext` driving a Krylov method.
//! - [`pc_context`]: preconditioner selection by name.
//!
//! # Example
//! ```rust
//! use faer::Mat;
//! use kryst_baij::context::KspContext;
//! use kryst_baij::solver::BiCgStab;
//!
//! let a = Mat::<f64>::from_fn(3, 3, |i, j| if i == j { 4.0 } else { 1.0 });
//! let b = vec![6.0; 3];
//! let mut x = vec![0.0; 3];
//! let mut ksp = KspContext::new();
//! ksp.set_operators(&a).set_type(BiCgStab::new());
//! let stats = ksp.solve(&b, &mut x).unwrap();
//! assert!(stats.converged);
//! ```
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems. SIAM.
//! - PETSc documentation: https://petsc.org/release/docs/manualpages/KSP/

pub mod ksp_context;
pub use ksp_context::KspContext;
pub mod pc_context;
pub use pc_context::PcType;
