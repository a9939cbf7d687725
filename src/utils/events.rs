//! Named begin/end events and the floating-point operation counter.
//!
//! Events are `tracing` spans; whether they are recorded is up to the
//! subscriber installed by the application. The flop counter is per thread,
//! which makes it per process for both the MPI backend and the in-process
//! thread world. Neither ever affects control flow.

use std::cell::Cell;
use tracing::Span;

thread_local! {
    static FLOPS: Cell<f64> = const { Cell::new(0.0) };
}

/// Charge `n` floating-point operations to this process.
pub fn add_flops(n: usize) {
    FLOPS.with(|f| f.set(f.get() + n as f64));
}

/// Floating-point operations charged so far on this process.
pub fn flops() -> f64 {
    FLOPS.with(Cell::get)
}

pub fn reset_flops() {
    FLOPS.with(|f| f.set(0.0));
}

/// Logged phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    MatSetValues,
    MatAssemblyBegin,
    MatAssemblyEnd,
    MatMult,
    MatMultAdd,
    MatMultTranspose,
    MatLoad,
    MatScale,
    MatDiagonalScale,
    MatNorm,
    MatZeroRows,
    VecScatterBegin,
    VecScatterEnd,
    KspSetUp,
    KspSolve,
}

impl Event {
    pub fn name(self) -> &'static str {
        match self {
            Event::MatSetValues => "MatSetValues",
            Event::MatAssemblyBegin => "MatAssemblyBegin",
            Event::MatAssemblyEnd => "MatAssemblyEnd",
            Event::MatMult => "MatMult",
            Event::MatMultAdd => "MatMultAdd",
            Event::MatMultTranspose => "MatMultTranspose",
            Event::MatLoad => "MatLoad",
            Event::MatScale => "MatScale",
            Event::MatDiagonalScale => "MatDiagonalScale",
            Event::MatNorm => "MatNorm",
            Event::MatZeroRows => "MatZeroRows",
            Event::VecScatterBegin => "VecScatterBegin",
            Event::VecScatterEnd => "VecScatterEnd",
            Event::KspSetUp => "KSPSetUp",
            Event::KspSolve => "KSPSolve",
        }
    }

    /// Open the span for this event; it ends when the returned guard's span is dropped.
    pub fn span(self) -> Span {
        tracing::debug_span!("event", name = self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flop_counter_is_per_thread() {
        reset_flops();
        add_flops(10);
        add_flops(5);
        let other = std::thread::spawn(|| {
            add_flops(3);
            flops()
        })
        .join()
        .unwrap();
        assert_eq!(other, 3.0);
        assert_eq!(flops(), 15.0);
    }
}
