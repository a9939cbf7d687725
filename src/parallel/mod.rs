//! Process/messaging layer.
//!
//! Every process runs single-threaded and cooperates with the others only
//! through the [`Comm`] trait: point-to-point messages with explicit posted
//! request handles, plus a handful of reductions. Three backends exist:
//!
//! - [`SerialComm`]: one process, reductions are the identity.
//! - [`ThreadWorld`]: N "processes" as OS threads inside one program, talking
//!   over channels. This is what the tests use.
//! - `MpiComm` (feature `mpi`): rsmpi.

use crate::error::KError;

pub mod serial_comm;
pub mod thread_comm;
pub use serial_comm::SerialComm;
pub use thread_comm::{ThreadComm, ThreadWorld};

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

/// What an exchange is for. Combined with a sequence number so that
/// consecutive exchanges of the same kind never match each other's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagKind {
    Stash = 1,
    BlockStash = 2,
    ScatterSetup = 3,
    ScatterForward = 4,
    ScatterReverse = 5,
    Collective = 6,
    ZeroRows = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub kind: TagKind,
    pub seq: u32,
}

impl Tag {
    pub fn new(kind: TagKind, seq: u32) -> Self {
        Self { kind, seq }
    }

    /// Pack into 15 bits, the tag range every MPI implementation accepts:
    /// kind in the top three bits, the sequence number modulo 4096 below.
    pub fn to_i32(self) -> i32 {
        (((self.kind as u32) << SEQ_BITS) | (self.seq & SEQ_MASK)) as i32
    }
}

const SEQ_BITS: u32 = 12;
const SEQ_MASK: u32 = (1 << SEQ_BITS) - 1;

/// Upper bound MPI guarantees for `MPI_TAG_UB`.
pub const MAX_PORTABLE_TAG: i32 = 32_767;

/// One message: an integer part and a floating-point part.
///
/// Values always travel as `f64`; integers as `u64`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub indices: Vec<u64>,
    pub values: Vec<f64>,
}

impl Payload {
    pub fn new(indices: Vec<u64>, values: Vec<f64>) -> Self {
        Self { indices, values }
    }
}

/// A received message.
#[derive(Debug, Clone)]
pub struct Message {
    pub source: usize,
    pub tag: Tag,
    pub payload: Payload,
}

/// Handle for a posted send.
#[derive(Debug)]
#[must_use = "sends must be waited on"]
pub struct SendRequest {
    pub dest: usize,
    pub tag: Tag,
}

/// Handle for a posted receive; `source == None` matches any sender.
#[derive(Debug)]
#[must_use = "receives must be waited on"]
pub struct RecvRequest {
    pub source: Option<usize>,
    pub tag: Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    BitOr,
    LogicalAnd,
}

pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self) -> Result<(), KError>;

    /// Element-wise reduction of floating-point values over all processes.
    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>, KError>;

    /// Element-wise reduction of integers over all processes.
    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>, KError>;

    /// Post a send; completes no later than [`wait_send`](Comm::wait_send).
    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, KError>;

    /// Post a receive.
    fn irecv(&self, source: Option<usize>, tag: Tag) -> Result<RecvRequest, KError>;

    /// Block until a posted receive is matched.
    fn wait_recv(&self, req: RecvRequest) -> Result<Message, KError>;

    fn wait_send(&self, req: SendRequest) -> Result<(), KError>;

    fn all_reduce_sum(&self, x: f64) -> Result<f64, KError> {
        Ok(self.all_reduce_f64(&[x], ReduceOp::Sum)?[0])
    }

    fn all_reduce_bor(&self, bits: u32) -> Result<u32, KError> {
        Ok(self.all_reduce_u64(&[u64::from(bits)], ReduceOp::BitOr)?[0] as u32)
    }

    fn all_reduce_and(&self, flag: bool) -> Result<bool, KError> {
        Ok(self.all_reduce_u64(&[u64::from(flag)], ReduceOp::LogicalAnd)?[0] != 0)
    }

    fn wait_all_sends(&self, reqs: Vec<SendRequest>) -> Result<(), KError> {
        reqs.into_iter().try_for_each(|r| self.wait_send(r))
    }
}

pub(crate) fn combine_f64(op: ReduceOp, acc: &mut [f64], other: &[f64]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a = match op {
            ReduceOp::Sum => *a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::BitOr => ((*a as u64) | (b as u64)) as f64,
            ReduceOp::LogicalAnd => f64::from(u8::from(*a != 0.0 && b != 0.0)),
        };
    }
}

pub(crate) fn combine_u64(op: ReduceOp, acc: &mut [u64], other: &[u64]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a = match op {
            ReduceOp::Sum => *a + b,
            ReduceOp::Max => (*a).max(b),
            ReduceOp::BitOr => *a | b,
            ReduceOp::LogicalAnd => u64::from(*a != 0 && b != 0),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_tags_fit_the_portable_mpi_range() {
        let kinds = [
            TagKind::Stash,
            TagKind::BlockStash,
            TagKind::ScatterSetup,
            TagKind::ScatterForward,
            TagKind::ScatterReverse,
            TagKind::Collective,
            TagKind::ZeroRows,
        ];
        for kind in kinds {
            for seq in [0, 1, 4095, 4096, u32::MAX] {
                let t = Tag::new(kind, seq).to_i32();
                assert!((0..=MAX_PORTABLE_TAG).contains(&t), "{kind:?}/{seq} -> {t}");
            }
        }
        // kinds never collide, whatever the sequence number
        assert_ne!(Tag::new(TagKind::Stash, 7).to_i32(), Tag::new(TagKind::BlockStash, 7).to_i32());
        assert_eq!(Tag::new(TagKind::Stash, 5).to_i32(), Tag::new(TagKind::Stash, 4096 + 5).to_i32());
    }
}
