//! Krylov subspace methods.
//!
//! Each method is a small struct holding only its own parameters; everything
//! shared (operator, preconditioner, tolerances, history) lives in the
//! [`KspContext`] that drives it. A method declares how many work vectors it
//! needs, which preconditioner sides and norm types it supports, and then runs
//! its recurrence through the context helpers.
//!
//! | name        | method                        | sides        | work |
//! |-------------|-------------------------------|--------------|------|
//! | `bicg`      | biconjugate gradient          | left         | 6    |
//! | `cgs`       | conjugate gradient squared    | left, right  | 7    |
//! | `chebyshev` | Chebyshev iteration           | left         | 3    |
//! | `cr`        | conjugate residual            | left         | 6    |
//! | `bcgs`      | BiCGStab                      | left, right  | 6    |
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, 2nd Edition. SIAM.
//! - van der Vorst, H. (1992). Bi-CGSTAB. SIAM J. Sci. Stat. Comput. 13(2).

use crate::context::ksp_context::KspContext;
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::PcSide;
use crate::utils::convergence::NormType;

pub mod bicg;
pub mod bicgstab;
pub mod cgs;
pub mod chebyshev;
pub mod cr;
pub mod registry;

pub use bicg::BiCg;
pub use bicgstab::BiCgStab;
pub use cgs::Cgs;
pub use chebyshev::Chebyshev;
pub use cr::Cr;
pub use registry::KspRegistry;

/// A Krylov method driven by a [`KspContext`].
pub trait KspMethod<T: Scalar> {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Number of local work vectors `solve` expects.
    fn work_vectors(&self) -> usize;

    fn supported_sides(&self) -> &'static [PcSide] {
        &[PcSide::Left]
    }

    /// Norm types usable with `side`; the first one is the default.
    fn supported_norms(&self, side: PcSide) -> &'static [NormType];

    fn supports_norm(&self, side: PcSide, norm: NormType) -> bool {
        self.supported_norms(side).contains(&norm)
    }

    fn default_norm(&self, side: PcSide) -> NormType {
        self.supported_norms(side).first().copied().unwrap_or(NormType::None)
    }

    /// Validate parameters against the context before work vectors are allocated.
    fn set_up(&self, _ksp: &KspContext<'_, T>) -> Result<(), KError> {
        Ok(())
    }

    /// Run the iteration. `work` holds [`work_vectors`](Self::work_vectors)
    /// vectors of local length; `x` carries the initial guess in and the
    /// solution out. The terminal reason is left in the context.
    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError>;
}

/// The built-in methods.
#[derive(Debug, Clone)]
pub enum KrylovMethod<T> {
    BiCg(BiCg),
    Cgs(Cgs),
    Chebyshev(Chebyshev<T>),
    Cr(Cr),
    BiCgStab(BiCgStab),
}

impl<T: Scalar> KrylovMethod<T> {
    fn as_dyn(&self) -> &dyn KspMethod<T> {
        match self {
            KrylovMethod::BiCg(m) => m,
            KrylovMethod::Cgs(m) => m,
            KrylovMethod::Chebyshev(m) => m,
            KrylovMethod::Cr(m) => m,
            KrylovMethod::BiCgStab(m) => m,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn KspMethod<T> {
        match self {
            KrylovMethod::BiCg(m) => m,
            KrylovMethod::Cgs(m) => m,
            KrylovMethod::Chebyshev(m) => m,
            KrylovMethod::Cr(m) => m,
            KrylovMethod::BiCgStab(m) => m,
        }
    }
}

impl<T: Scalar> KspMethod<T> for KrylovMethod<T> {
    fn name(&self) -> &'static str {
        self.as_dyn().name()
    }
    fn work_vectors(&self) -> usize {
        self.as_dyn().work_vectors()
    }
    fn supported_sides(&self) -> &'static [PcSide] {
        self.as_dyn().supported_sides()
    }
    fn supported_norms(&self, side: PcSide) -> &'static [NormType] {
        self.as_dyn().supported_norms(side)
    }
    fn set_up(&self, ksp: &KspContext<'_, T>) -> Result<(), KError> {
        self.as_dyn().set_up(ksp)
    }
    fn solve(&mut self, ksp: &mut KspContext<'_, T>, work: &mut [Vec<T>], b: &[T], x: &mut [T]) -> Result<(), KError> {
        self.as_dyn_mut().solve(ksp, work, b, x)
    }
}

impl<T> From<BiCg> for KrylovMethod<T> {
    fn from(m: BiCg) -> Self {
        KrylovMethod::BiCg(m)
    }
}

impl<T> From<Cgs> for KrylovMethod<T> {
    fn from(m: Cgs) -> Self {
        KrylovMethod::Cgs(m)
    }
}

impl<T> From<Chebyshev<T>> for KrylovMethod<T> {
    fn from(m: Chebyshev<T>) -> Self {
        KrylovMethod::Chebyshev(m)
    }
}

impl<T> From<Cr> for KrylovMethod<T> {
    fn from(m: Cr) -> Self {
        KrylovMethod::Cr(m)
    }
}

impl<T> From<BiCgStab> for KrylovMethod<T> {
    fn from(m: BiCgStab) -> Self {
        KrylovMethod::BiCgStab(m)
    }
}

/// Destructure the context's work vectors, failing if set-up allocated too few.
fn work_error(method: &'static str) -> KError {
    KError::SolveError(format!("{method}: work vectors not allocated"))
}
