//! Single-process communicator.

use super::{Comm, Message, Payload, RecvRequest, ReduceOp, SendRequest, Tag};
use crate::error::KError;
use std::cell::RefCell;
use std::collections::VecDeque;

/// Communicator of size one. Messages to self are queued locally.
#[derive(Debug, Default)]
pub struct SerialComm {
    loopback: RefCell<VecDeque<Message>>,
}

impl SerialComm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), KError> {
        Ok(())
    }

    fn all_reduce_f64(&self, local: &[f64], _op: ReduceOp) -> Result<Vec<f64>, KError> {
        Ok(local.to_vec())
    }

    fn all_reduce_u64(&self, local: &[u64], _op: ReduceOp) -> Result<Vec<u64>, KError> {
        Ok(local.to_vec())
    }

    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, KError> {
        if dest != 0 {
            return Err(KError::OutOfRange { what: "destination rank", index: dest, bound: 1 });
        }
        self.loopback.borrow_mut().push_back(Message { source: 0, tag, payload });
        Ok(SendRequest { dest, tag })
    }

    fn irecv(&self, source: Option<usize>, tag: Tag) -> Result<RecvRequest, KError> {
        Ok(RecvRequest { source, tag })
    }

    fn wait_recv(&self, req: RecvRequest) -> Result<Message, KError> {
        let mut queue = self.loopback.borrow_mut();
        let pos = queue
            .iter()
            .position(|m| m.tag == req.tag)
            .ok_or_else(|| KError::Transport(format!("no message with tag {:?} sent to self", req.tag)))?;
        queue
            .remove(pos)
            .ok_or_else(|| KError::Transport("loopback queue changed underneath".into()))
    }

    fn wait_send(&self, _req: SendRequest) -> Result<(), KError> {
        Ok(())
    }
}
