//! In-process "world": one OS thread per rank, channels between them.
//!
//! Each rank owns a single inbound channel. A receive scans the rank's
//! mailbox of already-arrived but unmatched messages first, then drains the
//! channel, parking anything that does not match. Messages from one sender on
//! one tag therefore stay in send order. Collectives are built from
//! point-to-point messages (gather to rank 0, broadcast back).

use super::{
    combine_f64, combine_u64, Comm, Message, Payload, RecvRequest, ReduceOp, SendRequest, Tag,
    TagKind,
};
use crate::error::KError;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Barrier};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawns ranks and joins them.
pub struct ThreadWorld;

impl ThreadWorld {
    /// Run `f` on `size` ranks concurrently and collect the per-rank results in rank order.
    ///
    /// # Panics
    /// A panic on any rank is resumed on the caller once all ranks have finished.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        Self::run_with_timeout(size, DEFAULT_TIMEOUT, f)
    }

    /// Like [`run`](Self::run) with a custom receive timeout.
    pub fn run_with_timeout<F, R>(size: usize, timeout: Duration, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let size = size.max(1);
        let (senders, receivers): (Vec<Sender<Message>>, Vec<Receiver<Message>>) =
            (0..size).map(|_| mpsc::channel()).unzip();
        let barrier = Arc::new(Barrier::new(size));
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = receivers
                .into_iter()
                .enumerate()
                .map(|(rank, inbox)| {
                    let comm = ThreadComm {
                        rank,
                        size,
                        peers: senders.clone(),
                        inbox,
                        mailbox: RefCell::new(VecDeque::new()),
                        barrier: Arc::clone(&barrier),
                        collective_seq: Cell::new(0),
                        timeout,
                    };
                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(comm))
                        .unwrap_or_else(|e| panic!("failed to spawn rank {rank}: {e}"))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                .collect()
        })
    }
}

/// One rank's endpoint inside a [`ThreadWorld`].
pub struct ThreadComm {
    rank: usize,
    size: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    mailbox: RefCell<VecDeque<Message>>,
    barrier: Arc<Barrier>,
    collective_seq: Cell<u32>,
    timeout: Duration,
}

impl ThreadComm {
    fn next_collective_tag(&self) -> Tag {
        let seq = self.collective_seq.get();
        self.collective_seq.set(seq.wrapping_add(1));
        Tag::new(TagKind::Collective, seq)
    }

    fn send_now(&self, dest: usize, tag: Tag, payload: Payload) -> Result<(), KError> {
        let peer = self.peers.get(dest).ok_or(KError::OutOfRange {
            what: "destination rank",
            index: dest,
            bound: self.size,
        })?;
        peer.send(Message { source: self.rank, tag, payload })
            .map_err(|_| KError::Transport(format!("rank {dest} has exited")))
    }

    fn matches(msg: &Message, source: Option<usize>, tag: Tag) -> bool {
        msg.tag == tag && source.is_none_or(|s| s == msg.source)
    }

    fn receive(&self, source: Option<usize>, tag: Tag) -> Result<Message, KError> {
        {
            let mut mailbox = self.mailbox.borrow_mut();
            if let Some(pos) = mailbox.iter().position(|m| Self::matches(m, source, tag)) {
                if let Some(msg) = mailbox.remove(pos) {
                    return Ok(msg);
                }
            }
        }
        loop {
            match self.inbox.recv_timeout(self.timeout) {
                Ok(msg) if Self::matches(&msg, source, tag) => return Ok(msg),
                Ok(msg) => self.mailbox.borrow_mut().push_back(msg),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(KError::Transport(format!(
                        "rank {} timed out waiting for {:?} from {:?}",
                        self.rank, tag, source
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(KError::Transport(format!("rank {} lost all peers", self.rank)));
                }
            }
        }
    }

    /// Reduce to rank 0 in rank order, then broadcast.
    fn reduce_payload(
        &self,
        local: Payload,
        combine: impl Fn(&mut Payload, &Payload),
    ) -> Result<Payload, KError> {
        let tag = self.next_collective_tag();
        if self.size == 1 {
            return Ok(local);
        }
        if self.rank == 0 {
            let mut parts: Vec<Message> = (1..self.size)
                .map(|src| self.receive(Some(src), tag))
                .collect::<Result<_, _>>()?;
            parts.sort_by_key(|m| m.source);
            let mut acc = local;
            for part in &parts {
                combine(&mut acc, &part.payload);
            }
            for dest in 1..self.size {
                self.send_now(dest, tag, acc.clone())?;
            }
            Ok(acc)
        } else {
            self.send_now(0, tag, local)?;
            Ok(self.receive(Some(0), tag)?.payload)
        }
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), KError> {
        self.barrier.wait();
        Ok(())
    }

    fn all_reduce_f64(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>, KError> {
        let out = self.reduce_payload(Payload::new(Vec::new(), local.to_vec()), |acc, other| {
            combine_f64(op, &mut acc.values, &other.values)
        })?;
        Ok(out.values)
    }

    fn all_reduce_u64(&self, local: &[u64], op: ReduceOp) -> Result<Vec<u64>, KError> {
        let out = self.reduce_payload(Payload::new(local.to_vec(), Vec::new()), |acc, other| {
            combine_u64(op, &mut acc.indices, &other.indices)
        })?;
        Ok(out.indices)
    }

    fn isend(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, KError> {
        self.send_now(dest, tag, payload)?;
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
        self.receive(req.source, req.tag)
    }

    fn wait_send(&self, _req: SendRequest) -> Result<(), KError> {
        // channel sends are buffered; posting already completed the transfer
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_reduce_sum_agrees_on_every_rank() {
        let sums = ThreadWorld::run(4, |comm| comm.all_reduce_sum(comm.rank() as f64 + 1.0).unwrap());
        assert_eq!(sums, vec![10.0; 4]);
    }

    #[test]
    fn bitwise_or_and_logical_and() {
        let out = ThreadWorld::run(3, |comm| {
            let bits = comm.all_reduce_bor(1 << comm.rank()).unwrap();
            let all = comm.all_reduce_and(comm.rank() != 1).unwrap();
            (bits, all)
        });
        assert!(out.iter().all(|&(bits, all)| bits == 0b111 && !all));
    }

    #[test]
    fn out_of_order_messages_are_matched_by_tag() {
        let got = ThreadWorld::run(2, |comm| -> Result<Vec<u64>, KError> {
            let a = Tag::new(TagKind::Stash, 0);
            let b = Tag::new(TagKind::Stash, 1);
            if comm.rank() == 0 {
                let s1 = comm.isend(1, a, Payload::new(vec![1], vec![]))?;
                let s2 = comm.isend(1, b, Payload::new(vec![2], vec![]))?;
                comm.wait_all_sends(vec![s1, s2])?;
                Ok(Vec::new())
            } else {
                let rb = comm.irecv(Some(0), b)?;
                let ra = comm.irecv(None, a)?;
                let mb = comm.wait_recv(rb)?;
                let ma = comm.wait_recv(ra)?;
                Ok(vec![mb.payload.indices[0], ma.payload.indices[0]])
            }
        });
        assert_eq!(got[1].as_ref().unwrap(), &vec![2, 1]);
    }

    #[test]
    fn missing_peer_message_times_out() {
        let out = ThreadWorld::run_with_timeout(2, Duration::from_millis(50), |comm| {
            if comm.rank() == 1 {
                let r = comm.irecv(Some(0), Tag::new(TagKind::Stash, 9)).unwrap();
                comm.wait_recv(r).map(|_| ())
            } else {
                Ok(())
            }
        });
        assert!(matches!(out[1], Err(KError::Transport(_))));
    }
}
