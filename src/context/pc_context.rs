//! Preconditioner selection by name.
//!
//! `PcType` is what `-pc_type` parses into; [`PcType::build`] turns it into a
//! boxed [`Preconditioner`] ready to be handed to a
//! [`KspContext`](crate::context::KspContext).
//!
//! # Example
//!
//! ```rust
//! use kryst_baij::context::pc_context::PcType;
//! let pc: PcType = "jacobi".parse().unwrap();
//! let _boxed = pc.build::<f64>();
//! ```

use crate::core::traits::Scalar;
use crate::error::KError;
use crate::preconditioner::{Jacobi, NoPreconditioner, Preconditioner};
use std::str::FromStr;

/// Supported preconditioner types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcType {
    /// Identity.
    #[default]
    None,
    /// Diagonal scaling.
    Jacobi,
}

impl PcType {
    pub fn build<T: Scalar>(self) -> Box<dyn Preconditioner<T>> {
        match self {
            PcType::None => Box::new(NoPreconditioner),
            PcType::Jacobi => Box::new(Jacobi::new()),
        }
    }
}

impl FromStr for PcType {
    type Err = KError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(PcType::None),
            "jacobi" => Ok(PcType::Jacobi),
            other => Err(KError::UnknownType { kind: "preconditioner", name: other.to_string() }),
        }
    }
}
