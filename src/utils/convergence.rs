//! Convergence tracking & tolerance checks for iterative solvers.

use crate::core::traits::Scalar;

/// Which residual-size quantity a method reports to monitors and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// Skip norm computation; the solve runs to the iteration limit.
    None,
    /// ‖B r‖₂
    Preconditioned,
    /// ‖b − A x‖₂
    Unpreconditioned,
    /// Square root of a bilinear form the method already has at hand.
    Natural,
}

impl std::str::FromStr for NormType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "none" => Ok(NormType::None),
            "preconditioned" => Ok(NormType::Preconditioned),
            "unpreconditioned" => Ok(NormType::Unpreconditioned),
            "natural" => Ok(NormType::Natural),
            _ => Err(()),
        }
    }
}

/// Why a solve stopped (or that it has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergedReason {
    Iterating,
    ConvergedRtol,
    ConvergedAtol,
    /// Ran the requested number of iterations without computing norms.
    ConvergedIts,
    DivergedDtol,
    DivergedIts,
    DivergedBreakdown,
    DivergedNanOrInf,
}

impl ConvergedReason {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            ConvergedReason::ConvergedRtol | ConvergedReason::ConvergedAtol | ConvergedReason::ConvergedIts
        )
    }

    pub fn is_diverged(self) -> bool {
        matches!(
            self,
            ConvergedReason::DivergedDtol
                | ConvergedReason::DivergedIts
                | ConvergedReason::DivergedBreakdown
                | ConvergedReason::DivergedNanOrInf
        )
    }

    pub fn is_terminal(self) -> bool {
        self != ConvergedReason::Iterating
    }
}

/// Stopping criteria.
#[derive(Debug, Clone, Copy)]
pub struct Tolerances<T> {
    pub rtol: T,
    pub atol: T,
    pub dtol: T,
    pub max_it: usize,
}

impl<T: Scalar> Default for Tolerances<T> {
    fn default() -> Self {
        Self {
            rtol: T::from_f64(1e-5).unwrap_or_else(T::epsilon),
            atol: T::from_f64(1e-50).unwrap_or_else(T::min_positive_value),
            dtol: T::from_f64(1e5).unwrap_or_else(T::max_value),
            max_it: 10_000,
        }
    }
}

/// Pluggable convergence test, called after every iteration (and at iteration 0).
pub trait ConvergenceTest<T> {
    fn test(&mut self, its: usize, rnorm: T, tol: &Tolerances<T>) -> ConvergedReason;
}

impl<T, F> ConvergenceTest<T> for F
where
    F: FnMut(usize, T, &Tolerances<T>) -> ConvergedReason,
{
    fn test(&mut self, its: usize, rnorm: T, tol: &Tolerances<T>) -> ConvergedReason {
        self(its, rnorm, tol)
    }
}

/// Relative/absolute/divergence test.
///
/// At iteration 0 the initial norm is recorded and the target becomes
/// `max(rtol·‖r₀‖, atol)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConvergence<T> {
    rnorm0: T,
    ttol: T,
}

impl<T: Scalar> DefaultConvergence<T> {
    pub fn new() -> Self {
        Self { rnorm0: T::zero(), ttol: T::zero() }
    }
}

impl<T: Scalar> ConvergenceTest<T> for DefaultConvergence<T> {
    fn test(&mut self, its: usize, rnorm: T, tol: &Tolerances<T>) -> ConvergedReason {
        if its == 0 {
            self.rnorm0 = rnorm;
            self.ttol = (tol.rtol * rnorm).max(tol.atol);
        }
        if !rnorm.is_finite() {
            return ConvergedReason::DivergedNanOrInf;
        }
        if rnorm <= self.ttol {
            if rnorm < tol.atol {
                ConvergedReason::ConvergedAtol
            } else {
                ConvergedReason::ConvergedRtol
            }
        } else if rnorm >= tol.dtol * self.rnorm0 {
            ConvergedReason::DivergedDtol
        } else {
            ConvergedReason::Iterating
        }
    }
}

/// Never stops early; used when no norm is computed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipConvergence;

impl<T> ConvergenceTest<T> for SkipConvergence {
    fn test(&mut self, _its: usize, _rnorm: T, _tol: &Tolerances<T>) -> ConvergedReason {
        ConvergedReason::Iterating
    }
}

/// Bounded buffer of residual norms.
#[derive(Debug, Clone)]
pub struct ResidualHistory<T> {
    values: Vec<T>,
    max_len: usize,
    /// Clear at the start of every solve.
    pub reset: bool,
}

impl<T: Copy> ResidualHistory<T> {
    pub fn new(max_len: usize) -> Self {
        Self { values: Vec::new(), max_len, reset: true }
    }

    /// Append unless full; later values are dropped.
    pub fn push(&mut self, rnorm: T) {
        if self.values.len() < self.max_len {
            self.values.push(rnorm);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn capacity(&self) -> usize {
        self.max_len
    }
}

#[derive(Clone, Debug)]
pub struct SolveStats<T> {
    pub iterations: usize,
    pub final_residual: T,
    pub converged: bool,
    pub reason: ConvergedReason,
}
