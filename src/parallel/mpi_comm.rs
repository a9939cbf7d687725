//! MPI-based parallel communication module.
//!
//! This module provides an implementation of the `Comm` trait using the MPI (Message Passing Interface)
//! backend for distributed-memory parallelism. Sends are buffered (`MPI_Bsend` into an attached
//! buffer) so that every rank can post all of its sends before any receive without deadlocking;
//! a message is transmitted as two consecutive tagged sends (integers, then values), which MPI's
//! non-overtaking rule keeps paired.
//!
//! # References
//! - [MPI Standard](https://www.mpi-forum.org/)
//!
//! # Example
//! ```no_run
//! # #[cfg(feature = "mpi")]
//! # {
//! use kryst_baij::parallel::{Comm, MpiComm};
//! let comm = MpiComm::new().unwrap();
//! println!("Rank: {} / {}", comm.rank(), comm.size());
//! comm.barrier().unwrap();
//! # }
//! ```

use super::{Comm, Message, Payload, RecvRequest, ReduceOp, SendRequest, Tag};
use crate::error::KError;
use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

/// Default size of the attached send buffer.
pub const DEFAULT_BUFFER_BYTES: usize = 64 << 20;

/// MPI communicator wrapper for distributed parallelism.
///
/// Holds the MPI world communicator and the universe that keeps MPI initialised;
/// MPI is finalised when this value is dropped.
pub struct MpiComm {
    /// The MPI world communicator (all processes in the job).
    pub world: SimpleCommunicator,
    /// The rank (ID) of this process within the communicator.
    pub rank: usize,
    /// The total number of processes in the communicator.
    pub size: usize,
    // declared last so it is dropped after `world`
    universe: Universe,
}

impl MpiComm {
    /// Initializes MPI with the default send buffer.
    pub fn new() -> Result<Self, KError> {
        Self::with_buffer_size(DEFAULT_BUFFER_BYTES)
    }

    /// Initializes MPI and attaches a send buffer of `bytes` bytes.
    pub fn with_buffer_size(bytes: usize) -> Result<Self, KError> {
        let mut universe = mpi::initialize()
            .ok_or_else(|| KError::Transport("MPI was already initialized".into()))?;
        universe.set_buffer_size(bytes);
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Ok(MpiComm { world, rank, size, universe })
    }

    /// Size of the attached send buffer.
    pub fn buffer_size(&self) -> usize {
        self.universe.buffer_size()
    }

    fn system_op(op: ReduceOp) -> SystemOperation {
        match op {
            ReduceOp::Sum => SystemOperation::sum(),
            ReduceOp::Max => SystemOperation::max(),
            ReduceOp::BitOr => SystemOperation::bitwise_or(),
            ReduceOp::LogicalAnd => SystemOperation::logical_and(),
        }
    }
}

impl Comm for MpiComm {
    /// Returns the rank (ID) of this process.
    fn rank(&self) -> usize {
        self.rank
    }
    /// Returns the total number of processes in the communicator.
    fn size(&self) -> usize {
        self.size
    }
    /// Synchronizes all processes at a barrier.
    fn barrier(&self) -> Result<(), KError> {
        self.world.barrier();
        Ok(())
    }

    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>, KError> {
        if op == ReduceOp::BitOr || op == ReduceOp::LogicalAnd {
            return Err(KError::Unsupported("bitwise reduction of floating-point values"));
        }
        let mut out = vec![0.0; local.len()];
        self.world.all_reduce_into(local, &mut out[..], Self::system_op(op));
        Ok(out)
    }

    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>, KError> {
        let mut out = vec![0u64; local.len()];
        self.world.all_reduce_into(local, &mut out[..], Self::system_op(op));
        Ok(out)
    }

    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, KError> {
        if dest >= self.size {
            return Err(KError::OutOfRange { what: "destination rank", index: dest, bound: self.size });
        }
        let process = self.world.process_at_rank(dest as i32);
        process.buffered_send_with_tag(&payload.indices[..], tag.to_i32());
        process.buffered_send_with_tag(&payload.values[..], tag.to_i32());
        Ok(SendRequest { dest, tag })
    }

    fn irecv(&self, source: Option<usize>, tag: Tag) -> Result<RecvRequest, KError> {
        if let Some(s) = source {
            if s >= self.size {
                return Err(KError::OutOfRange { what: "source rank", index: s, bound: self.size });
            }
        }
        Ok(RecvRequest { source, tag })
    }

    fn wait_recv(&self, req: RecvRequest) -> Result<Message, KError> {
        let raw_tag = req.tag.to_i32();
        let (indices, status) = match req.source {
            Some(s) => self.world.process_at_rank(s as i32).receive_vec_with_tag::<u64>(raw_tag),
            None => self.world.any_process().receive_vec_with_tag::<u64>(raw_tag),
        };
        let source = status.source_rank();
        if source < 0 {
            return Err(KError::Transport(format!("invalid source rank {source}")));
        }
        let (values, _) = self.world.process_at_rank(source).receive_vec_with_tag::<f64>(raw_tag);
        Ok(Message { source: source as usize, tag: req.tag, payload: Payload { indices, values } })
    }

    fn wait_send(&self, _req: SendRequest) -> Result<(), KError> {
        // buffered sends complete locally
        Ok(())
    }
}
