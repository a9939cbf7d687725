//! Krylov solver context (KSP).
//!
//! `KspContext` holds everything a Krylov method needs besides its own
//! scalars: the operator, the preconditioner, the inner product, the work
//! vectors, the tolerances and the bookkeeping of an iteration (count,
//! residual norm, terminal reason, history, monitors, convergence test).
//!
//! # Usage
//!
//! 1. Create with [`KspContext::new`] (operator-free, identity preconditioner).
//! 2. Attach the operator, optionally a preconditioner and an inner product.
//! 3. Pick a method with [`set_type`](KspContext::set_type) or
//!    [`set_from_options`](KspContext::set_from_options).
//! 4. Call [`solve`](KspContext::solve); repeat with new right-hand sides or a
//!    re-assembled operator as often as needed.
//!
//! Methods never talk to the operator or preconditioner directly: they go
//! through [`op_mult`](KspContext::op_mult), [`pc_apply`](KspContext::pc_apply)
//! and friends, which swap in the transposes when the context is set to solve
//! `Aᵀx = b`. Right preconditioning is handled here as well: the method iterates
//! on a correction `y` with zero initial guess and the context forms
//! `x = x₀ + B y` afterwards.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems. SIAM.
//! - PETSc documentation: https://petsc.org/release/docs/manualpages/KSP/

use crate::config::options::Options;
use crate::context::pc_context::PcType;
use crate::core::kernels;
use crate::core::traits::{InnerProduct, LinearOperator, Scalar};
use crate::error::KError;
use crate::preconditioner::{NoPreconditioner, PcSide, Preconditioner};
use crate::solver::registry::KspRegistry;
use crate::solver::{KrylovMethod, KspMethod};
use crate::utils::convergence::{
    ConvergedReason, ConvergenceTest, DefaultConvergence, NormType, ResidualHistory, SkipConvergence, SolveStats,
    Tolerances,
};
use crate::utils::events::Event;
use tracing::{debug, trace};

/// Default capacity of the residual history.
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

type Monitor<'a, T> = Box<dyn FnMut(usize, T) + 'a>;

pub struct KspContext<'a, T: Scalar> {
    op: Option<&'a dyn LinearOperator<T>>,
    pc: Box<dyn Preconditioner<T> + 'a>,
    ip: Box<dyn InnerProduct<T> + 'a>,
    method: Option<KrylovMethod<T>>,
    tol: Tolerances<T>,
    /// Norm asked for by the user; `None` means the method's default.
    requested_norm: Option<NormType>,
    norm: NormType,
    pc_side: PcSide,
    guess_zero: bool,
    transpose_solve: bool,
    pub(crate) its: usize,
    pub(crate) rnorm: T,
    pub(crate) reason: ConvergedReason,
    history: ResidualHistory<T>,
    monitors: Vec<Monitor<'a, T>>,
    converged: Box<dyn ConvergenceTest<T> + 'a>,
    work: Vec<Vec<T>>,
    is_set_up: bool,
}

impl<'a, T: Scalar> Default for KspContext<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Scalar> KspContext<'a, T> {
    pub fn new() -> Self {
        Self {
            op: None,
            pc: Box::new(NoPreconditioner),
            ip: Box::new(()),
            method: None,
            tol: Tolerances::default(),
            requested_norm: None,
            norm: NormType::Preconditioned,
            pc_side: PcSide::Left,
            guess_zero: true,
            transpose_solve: false,
            its: 0,
            rnorm: T::zero(),
            reason: ConvergedReason::Iterating,
            history: ResidualHistory::new(DEFAULT_HISTORY_SIZE),
            monitors: Vec::new(),
            converged: Box::new(DefaultConvergence::new()),
            work: Vec::new(),
            is_set_up: false,
        }
    }

    // ----- configuration -----

    pub fn set_operators(&mut self, op: &'a dyn LinearOperator<T>) -> &mut Self {
        self.op = Some(op);
        self.is_set_up = false;
        self
    }

    pub fn set_pc(&mut self, pc: impl Preconditioner<T> + 'a) -> &mut Self {
        self.pc = Box::new(pc);
        self.is_set_up = false;
        self
    }

    pub fn set_inner_product(&mut self, ip: impl InnerProduct<T> + 'a) -> &mut Self {
        self.ip = Box::new(ip);
        self
    }

    pub fn set_type(&mut self, method: impl Into<KrylovMethod<T>>) -> &mut Self {
        self.method = Some(method.into());
        self.is_set_up = false;
        self
    }

    pub fn method(&self) -> Option<&KrylovMethod<T>> {
        self.method.as_ref()
    }

    pub fn method_mut(&mut self) -> Option<&mut KrylovMethod<T>> {
        self.is_set_up = false;
        self.method.as_mut()
    }

    pub fn set_tolerances(&mut self, rtol: T, atol: T, dtol: T, max_it: usize) -> &mut Self {
        self.tol = Tolerances { rtol, atol, dtol, max_it };
        self
    }

    pub fn tolerances(&self) -> &Tolerances<T> {
        &self.tol
    }

    pub fn set_norm_type(&mut self, norm: NormType) -> &mut Self {
        self.requested_norm = Some(norm);
        self
    }

    /// Norm used by the last (or current) solve.
    pub fn norm_type(&self) -> NormType {
        self.norm
    }

    pub fn set_pc_side(&mut self, side: PcSide) -> &mut Self {
        self.pc_side = side;
        self.is_set_up = false;
        self
    }

    pub fn pc_side(&self) -> PcSide {
        self.pc_side
    }

    /// Use the incoming contents of `x` as initial guess instead of zero.
    pub fn set_initial_guess_nonzero(&mut self, nonzero: bool) -> &mut Self {
        self.guess_zero = !nonzero;
        self
    }

    pub fn guess_zero(&self) -> bool {
        self.guess_zero
    }

    /// Solve `Aᵀ x = b` instead of `A x = b`.
    pub fn set_transpose_solve(&mut self, on: bool) -> &mut Self {
        self.transpose_solve = on;
        self
    }

    pub fn add_monitor(&mut self, monitor: impl FnMut(usize, T) + 'a) -> &mut Self {
        self.monitors.push(Box::new(monitor));
        self
    }

    pub fn clear_monitors(&mut self) {
        self.monitors.clear();
    }

    pub fn set_convergence_test(&mut self, test: impl ConvergenceTest<T> + 'a) -> &mut Self {
        self.converged = Box::new(test);
        self
    }

    /// History capacity; `reset` clears it at the start of every solve.
    pub fn set_residual_history(&mut self, capacity: usize, reset: bool) -> &mut Self {
        self.history = ResidualHistory::new(capacity);
        self.history.reset = reset;
        self
    }

    /// Apply `ksp_*` and `pc_type` options.
    pub fn set_from_options(&mut self, opts: &Options, registry: &KspRegistry<T>) -> Result<&mut Self, KError> {
        if let Some(name) = opts.get_str("ksp_type") {
            self.set_type(registry.create(name)?);
        }
        let rtol = opts.get_or("ksp_rtol", self.tol.rtol.to_wire())?;
        let atol = opts.get_or("ksp_atol", self.tol.atol.to_wire())?;
        let dtol = opts.get_or("ksp_divtol", self.tol.dtol.to_wire())?;
        let max_it = opts.get_or("ksp_max_it", self.tol.max_it)?;
        self.set_tolerances(T::from_wire(rtol), T::from_wire(atol), T::from_wire(dtol), max_it);
        if let Some(raw) = opts.get_str("ksp_norm_type") {
            let norm = raw.parse::<NormType>().map_err(|()| KError::InvalidOption {
                key: "ksp_norm_type".into(),
                value: raw.into(),
            })?;
            self.set_norm_type(norm);
        }
        if let Some(side) = opts.get::<PcSide>("ksp_pc_side")? {
            self.set_pc_side(side);
        }
        if opts.has("ksp_initial_guess_nonzero") {
            self.set_initial_guess_nonzero(opts.get_flag("ksp_initial_guess_nonzero")?);
        }
        if let Some((emin, emax)) = opts.get_pair::<f64>("ksp_chebyshev_eigenvalues")? {
            match self.method.as_mut() {
                Some(KrylovMethod::Chebyshev(cheb)) => cheb.set_eigenvalues(T::from_wire(emin), T::from_wire(emax))?,
                _ => debug!("ksp_chebyshev_eigenvalues ignored, method is not chebyshev"),
            }
        }
        if let Some(size) = opts.get::<usize>("ksp_history_size")? {
            self.set_residual_history(size, self.history.reset);
        }
        if let Some(pc) = opts.get::<PcType>("pc_type")? {
            self.pc = pc.build();
        }
        self.is_set_up = false;
        Ok(self)
    }

    // ----- lifecycle -----

    fn operator(&self) -> Result<&'a dyn LinearOperator<T>, KError> {
        self.op.ok_or(KError::WrongState("no operator set"))
    }

    /// Validate the configuration, allocate work vectors and set up the preconditioner.
    pub fn set_up(&mut self) -> Result<(), KError> {
        let _span = Event::KspSetUp.span().entered();
        let op = self.operator()?;
        let method = self.method.as_ref().ok_or(KError::WrongState("no Krylov method selected"))?;
        if !method.supported_sides().contains(&self.pc_side) {
            return Err(KError::UnsupportedPcSide { method: method.name(), side: self.pc_side });
        }
        method.set_up(self)?;
        let name = method.name();
        let nwork = method.work_vectors();
        let n = op.local_rows();
        if self.work.len() != nwork || self.work.first().is_some_and(|w| w.len() != n) {
            self.work = vec![vec![T::zero(); n]; nwork];
        }
        self.pc.setup(op)?;
        self.is_set_up = true;
        debug!(method = name, side = %self.pc_side, work = nwork, "ksp set up");
        Ok(())
    }

    /// Solve `A x = b` (or `Aᵀ x = b`). `x` is the initial guess when the
    /// initial guess is declared nonzero, and receives the solution.
    ///
    /// Breakdown and divergence are reported through the returned reason, not as errors.
    pub fn solve(&mut self, b: &[T], x: &mut [T]) -> Result<SolveStats<T>, KError> {
        if !self.is_set_up {
            self.set_up()?;
        }
        let _span = Event::KspSolve.span().entered();
        let op = self.operator()?;
        if b.len() != op.local_rows() {
            return Err(KError::DimensionMismatch { expected: op.local_rows(), got: b.len() });
        }
        if x.len() != op.local_cols() {
            return Err(KError::DimensionMismatch { expected: op.local_cols(), got: x.len() });
        }
        let mut method = self.method.take().ok_or(KError::WrongState("no Krylov method selected"))?;
        let norm = self.requested_norm.unwrap_or_else(|| method.default_norm(self.pc_side));
        if !method.supports_norm(self.pc_side, norm) {
            let err = KError::UnsupportedNormType { method: method.name(), norm, side: self.pc_side };
            self.method = Some(method);
            return Err(err);
        }
        self.norm = norm;
        self.its = 0;
        self.rnorm = T::zero();
        self.reason = ConvergedReason::Iterating;
        if self.history.reset {
            self.history.clear();
        }
        let saved_test = (norm == NormType::None)
            .then(|| std::mem::replace(&mut self.converged, Box::new(SkipConvergence)));

        if self.guess_zero {
            kernels::set(T::zero(), x);
        }
        let mut work = std::mem::take(&mut self.work);
        let result = if self.pc_side == PcSide::Right {
            self.solve_right(&mut method, &mut work, b, x)
        } else {
            method.solve(self, &mut work, b, x)
        };
        self.work = work;
        if let Some(test) = saved_test {
            self.converged = test;
        }
        let name = method.name();
        self.method = Some(method);
        result?;

        if self.reason == ConvergedReason::Iterating {
            self.reason = if norm == NormType::None {
                ConvergedReason::ConvergedIts
            } else {
                ConvergedReason::DivergedIts
            };
        }
        debug!(method = name, its = self.its, rnorm = ?self.rnorm, reason = ?self.reason, "ksp solve finished");
        Ok(SolveStats {
            iterations: self.its,
            final_residual: self.rnorm,
            converged: self.reason.is_converged(),
            reason: self.reason,
        })
    }

    /// Iterate on `A B y = b − A x₀` from `y = 0`, then set `x = x₀ + B y`.
    fn solve_right(
        &mut self,
        method: &mut KrylovMethod<T>,
        work: &mut [Vec<T>],
        b: &[T],
        x: &mut [T],
    ) -> Result<(), KError> {
        let had_guess = !self.guess_zero;
        let x0 = had_guess.then(|| x.to_vec());
        let rhs = match &x0 {
            Some(x0) => {
                let mut r = vec![T::zero(); b.len()];
                self.op_mult(x0, &mut r)?;
                kernels::aypx(-T::one(), b, &mut r);
                r
            }
            None => b.to_vec(),
        };
        kernels::set(T::zero(), x);
        self.guess_zero = true;
        let result = method.solve(self, work, &rhs, x);
        self.guess_zero = !had_guess;
        result?;

        let mut t = vec![T::zero(); x.len()];
        self.pc_apply(x, &mut t)?;
        match x0 {
            Some(x0) => kernels::waxpy(T::one(), &t, &x0, x),
            None => kernels::copy(&t, x),
        }
        Ok(())
    }

    /// Drop work vectors; the next solve sets up again.
    pub fn reset(&mut self) {
        self.work.clear();
        self.history.clear();
        self.is_set_up = false;
        self.its = 0;
        self.reason = ConvergedReason::Iterating;
    }

    // ----- results -----

    pub fn residual_history(&self) -> &[T] {
        self.history.as_slice()
    }

    pub fn reason(&self) -> ConvergedReason {
        self.reason
    }

    pub fn iterations(&self) -> usize {
        self.its
    }

    pub fn residual_norm(&self) -> T {
        self.rnorm
    }

    // ----- helpers for the methods -----

    /// y ← A x, or Aᵀ x for transpose solves.
    pub fn op_mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        let op = self.operator()?;
        if self.transpose_solve { op.mult_transpose(x, y) } else { op.mult(x, y) }
    }

    /// y ← Aᵀ x, or A x for transpose solves.
    pub fn op_mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        let op = self.operator()?;
        if self.transpose_solve { op.mult(x, y) } else { op.mult_transpose(x, y) }
    }

    /// y ← B x, or Bᵀ x for transpose solves.
    pub fn pc_apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if self.transpose_solve { self.pc.apply_transpose(x, y) } else { self.pc.apply(x, y) }
    }

    /// y ← Bᵀ x, or B x for transpose solves.
    pub fn pc_apply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if self.transpose_solve { self.pc.apply(x, y) } else { self.pc.apply_transpose(x, y) }
    }

    /// y ← B A x (left) or A B x (right), with transposes swapped in for transpose solves.
    pub fn pc_apply_ba_or_ab(&self, x: &[T], y: &mut [T], work: &mut [T]) -> Result<(), KError> {
        let op = self.operator()?;
        if self.transpose_solve {
            Transposed(&*self.pc).apply_ba_or_ab(&Transposed(op), self.pc_side, x, y, work)
        } else {
            self.pc.apply_ba_or_ab(op, self.pc_side, x, y, work)
        }
    }

    pub fn dot(&self, x: &[T], y: &[T]) -> Result<T, KError> {
        self.ip.dot(x, y)
    }

    pub fn norm(&self, x: &[T]) -> Result<T, KError> {
        self.ip.norm(x)
    }

    /// r ← B (b − A x) for left preconditioning, r ← b − A x otherwise.
    ///
    /// `t1` and `t2` are scratch; `t2` ends up holding the unpreconditioned residual.
    pub fn initial_residual(&self, x: &[T], t1: &mut [T], t2: &mut [T], r: &mut [T], b: &[T]) -> Result<(), KError> {
        if self.guess_zero {
            kernels::copy(b, t2);
        } else {
            self.op_mult(x, t1)?;
            kernels::waxpy(-T::one(), t1, b, t2);
        }
        match self.pc_side {
            PcSide::Left => self.pc_apply(t2, r),
            _ => {
                kernels::copy(t2, r);
                Ok(())
            }
        }
    }

    /// Log `rnorm` to the history and call the monitors, without testing.
    pub(crate) fn record(&mut self, its: usize, rnorm: T) {
        self.rnorm = rnorm;
        self.history.push(rnorm);
        for monitor in &mut self.monitors {
            monitor(its, rnorm);
        }
    }

    /// Record and run the convergence test. Returns `true` once the solve must stop.
    pub(crate) fn iteration_done(&mut self, its: usize, rnorm: T) -> bool {
        self.record(its, rnorm);
        self.reason = self.converged.test(its, rnorm, &self.tol);
        trace!(its, rnorm = ?rnorm, reason = ?self.reason, "ksp iteration");
        self.reason.is_terminal()
    }

    /// Stop with [`ConvergedReason::DivergedBreakdown`]; `quantity` names the vanished divisor.
    pub(crate) fn breakdown(&mut self, method: &'static str, quantity: &'static str) {
        self.reason = ConvergedReason::DivergedBreakdown;
        debug!(method, its = self.its, quantity, "breakdown");
    }
}

/// Operator or preconditioner viewed through its transpose.
struct Transposed<'b, A: ?Sized>(&'b A);

impl<T: Scalar> LinearOperator<T> for Transposed<'_, dyn LinearOperator<T> + '_> {
    fn local_rows(&self) -> usize {
        self.0.local_cols()
    }
    fn local_cols(&self) -> usize {
        self.0.local_rows()
    }
    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.0.mult_transpose(x, y)
    }
    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.0.mult(x, y)
    }
}

impl<T: Scalar> Preconditioner<T> for Transposed<'_, dyn Preconditioner<T> + '_> {
    fn apply(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.0.apply_transpose(x, y)
    }
    fn apply_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        self.0.apply(x, y)
    }
}
