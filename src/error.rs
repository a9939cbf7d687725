use thiserror::Error;

// Unified error type for kryst-baij

#[derive(Error, Debug)]
pub enum KError {
    #[error("{what} index {index} out of range [0, {bound})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        bound: usize,
    },
    #[error("new nonzero at ({row}, {col}) caused a malloc on a matrix frozen against new nonzero locations")]
    NewNonzeroDisallowed { row: usize, col: usize },
    #[error("some processes inserted values while others added")]
    MixedInsertModes,
    #[error("operation not valid in the current state: {0}")]
    WrongState(&'static str),
    #[error("{method} does not support {side:?} preconditioning")]
    UnsupportedPcSide {
        method: &'static str,
        side: crate::preconditioner::PcSide,
    },
    #[error("{method} does not support norm type {norm:?} with {side:?} preconditioning")]
    UnsupportedNormType {
        method: &'static str,
        norm: crate::utils::convergence::NormType,
        side: crate::preconditioner::PcSide,
    },
    #[error("invalid eigenvalue bounds min {emin} max {emax}: {reason}")]
    InvalidEigenvalueBounds {
        emin: f64,
        emax: f64,
        reason: &'static str,
    },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed binary data: {0}")]
    Format(String),
    #[error("invalid value {value:?} for option -{key}")]
    InvalidOption { key: String, value: String },
    #[error("unknown {kind} type {name:?}")]
    UnknownType { kind: &'static str, name: String },
    #[error("solve error: {0}")]
    SolveError(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
