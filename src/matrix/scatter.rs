//! Communication plan for the off-diagonal operand.
//!
//! The off-diagonal block of a process references a sorted set of remote block
//! columns (`garray`). The plan records, per neighbour, which ghost slots it
//! fills (receive side) and which locally owned entries it must ship (send
//! side). Building it is collective: each process tells every owner which of
//! its columns it needs.
//!
//! Forward gathers fill the ghost buffer for `y += B·ghost`; reverse
//! scatter-adds ship `Bᵀ` contributions back to the owners.

use super::layout::Layout;
use crate::core::traits::Scalar;
use crate::error::KError;
use crate::parallel::{Comm, Payload, RecvRequest, ReduceOp, SendRequest, Tag, TagKind};
use crate::utils::events::Event;
use std::cell::Cell;
use tracing::debug;

#[derive(Debug, Clone)]
struct Neighbour {
    rank: usize,
    /// Point indices (ghost slots on the receive side, local owned points on the send side).
    points: Vec<usize>,
}

#[derive(Debug)]
pub struct ScatterPlan {
    recv_from: Vec<Neighbour>,
    send_to: Vec<Neighbour>,
    ghost_len: usize,
    seq: Cell<u32>,
}

/// Requests posted by a `*_begin` call.
#[derive(Debug)]
#[must_use = "a scatter must be ended"]
pub struct ScatterHandle {
    sends: Vec<SendRequest>,
    recvs: Vec<(usize, RecvRequest)>,
}

impl ScatterPlan {
    /// Plan the gather of the point entries behind `garray` (collective).
    pub fn build<C: Comm>(comm: &C, garray: &[usize], cols: &Layout, tag_seq: u32) -> Result<Self, KError> {
        let bs = cols.block_size();
        let size = comm.size();
        let mut wanted: Vec<Vec<usize>> = vec![Vec::new(); size];
        let mut recv_from = Vec::new();
        // garray is sorted, so each owner's columns form one contiguous run
        let mut k = 0;
        while k < garray.len() {
            let owner = cols.owner_of_block(garray[k]).ok_or(KError::OutOfRange {
                what: "block column",
                index: garray[k],
                bound: cols.global_blocks(),
            })?;
            let first = k;
            while k < garray.len() && cols.range_of(owner).contains(&garray[k]) {
                wanted[owner].push(garray[k]);
                k += 1;
            }
            let points = (first * bs..k * bs).collect();
            recv_from.push(Neighbour { rank: owner, points });
        }

        let mut asking = vec![0u64; size];
        for n in &recv_from {
            asking[n.rank] = 1;
        }
        let nreceives = comm.all_reduce_u64(&asking, ReduceOp::Sum)?[comm.rank()] as usize;

        let tag = Tag::new(TagKind::ScatterSetup, tag_seq);
        let mut sends = Vec::with_capacity(recv_from.len());
        for n in &recv_from {
            let request = wanted[n.rank].iter().map(|&b| b as u64).collect();
            sends.push(comm.isend(n.rank, tag, Payload::new(request, Vec::new()))?);
        }
        let pending = (0..nreceives).map(|_| comm.irecv(None, tag)).collect::<Result<Vec<_>, _>>()?;
        let start = cols.start();
        let mut send_to = Vec::with_capacity(nreceives);
        for req in pending {
            let msg = comm.wait_recv(req)?;
            let mut points = Vec::with_capacity(msg.payload.indices.len() * bs);
            for &b in &msg.payload.indices {
                let b = b as usize;
                if !cols.owns_block(b) {
                    return Err(KError::Transport(format!(
                        "rank {} asked for block column {} which is not owned here",
                        msg.source, b
                    )));
                }
                points.extend((b - start) * bs..(b - start + 1) * bs);
            }
            send_to.push(Neighbour { rank: msg.source, points });
        }
        send_to.sort_by_key(|n| n.rank);
        comm.wait_all_sends(sends)?;

        debug!(
            ghosts = garray.len(),
            from = recv_from.len(),
            to = send_to.len(),
            "scatter plan built"
        );
        Ok(Self { recv_from, send_to, ghost_len: garray.len() * bs, seq: Cell::new(0) })
    }

    /// Length of the ghost buffer in points.
    pub fn ghost_len(&self) -> usize {
        self.ghost_len
    }

    pub fn num_neighbours(&self) -> (usize, usize) {
        (self.recv_from.len(), self.send_to.len())
    }

    fn next_tag(&self, kind: TagKind) -> Tag {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        Tag::new(kind, seq)
    }

    fn post<T: Scalar, C: Comm>(
        &self,
        comm: &C,
        kind: TagKind,
        outgoing: &[Neighbour],
        incoming: &[Neighbour],
        src: &[T],
    ) -> Result<ScatterHandle, KError> {
        let _span = Event::VecScatterBegin.span().entered();
        let tag = self.next_tag(kind);
        let recvs = incoming
            .iter()
            .enumerate()
            .map(|(i, n)| comm.irecv(Some(n.rank), tag).map(|r| (i, r)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut sends = Vec::with_capacity(outgoing.len());
        for n in outgoing {
            let values = n.points.iter().map(|&p| src[p].to_wire()).collect();
            sends.push(comm.isend(n.rank, tag, Payload::new(Vec::new(), values))?);
        }
        Ok(ScatterHandle { sends, recvs })
    }

    fn complete<T: Scalar, C: Comm>(
        comm: &C,
        handle: ScatterHandle,
        incoming: &[Neighbour],
        dst: &mut [T],
        mode_add: bool,
    ) -> Result<(), KError> {
        let _span = Event::VecScatterEnd.span().entered();
        for (i, req) in handle.recvs {
            let msg = comm.wait_recv(req)?;
            let points = &incoming[i].points;
            if msg.payload.values.len() != points.len() {
                return Err(KError::Transport(format!(
                    "scatter from rank {} carried {} values, expected {}",
                    msg.source,
                    msg.payload.values.len(),
                    points.len()
                )));
            }
            for (&p, &v) in points.iter().zip(&msg.payload.values) {
                let v = T::from_wire(v);
                dst[p] = if mode_add { dst[p] + v } else { v };
            }
        }
        comm.wait_all_sends(handle.sends)
    }

    /// Ship the owned entries other processes need.
    pub fn gather_begin<T: Scalar, C: Comm>(&self, comm: &C, x_local: &[T]) -> Result<ScatterHandle, KError> {
        self.post(comm, TagKind::ScatterForward, &self.send_to, &self.recv_from, x_local)
    }

    /// Receive remote entries into `ghost`.
    pub fn gather_end<T: Scalar, C: Comm>(&self, comm: &C, handle: ScatterHandle, ghost: &mut [T]) -> Result<(), KError> {
        Self::complete(comm, handle, &self.recv_from, ghost, false)
    }

    /// Ship ghost contributions back to their owners.
    pub fn reverse_add_begin<T: Scalar, C: Comm>(&self, comm: &C, ghost: &[T]) -> Result<ScatterHandle, KError> {
        self.post(comm, TagKind::ScatterReverse, &self.recv_from, &self.send_to, ghost)
    }

    /// Add received contributions into the owned vector.
    pub fn reverse_add_end<T: Scalar, C: Comm>(&self, comm: &C, handle: ScatterHandle, y_local: &mut [T]) -> Result<(), KError> {
        Self::complete(comm, handle, &self.send_to, y_local, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ThreadWorld;

    #[test]
    fn gather_and_reverse_add_over_three_ranks() {
        // 6 block columns of size 2, two per rank; x holds global point index as value
        let out = ThreadWorld::run(3, |comm| {
            let cols = Layout::split(6, 2, comm.size(), comm.rank());
            let garray: Vec<usize> = (0..6).filter(|b| !cols.owns_block(*b)).collect();
            let plan = ScatterPlan::build(&comm, &garray, &cols, 0).unwrap();
            let x: Vec<f64> = cols.point_range().map(|p| p as f64).collect();
            let mut ghost = vec![0.0; plan.ghost_len()];
            let h = plan.gather_begin(&comm, &x).unwrap();
            plan.gather_end(&comm, h, &mut ghost).unwrap();

            let ones = vec![1.0; plan.ghost_len()];
            let mut y = vec![0.0; cols.local_size()];
            let h = plan.reverse_add_begin(&comm, &ones).unwrap();
            plan.reverse_add_end(&comm, h, &mut y).unwrap();
            (garray, ghost, y)
        });
        let (garray, ghost, y) = &out[1];
        assert_eq!(garray, &vec![0, 1, 4, 5]);
        assert_eq!(ghost, &vec![0.0, 1.0, 2.0, 3.0, 8.0, 9.0, 10.0, 11.0]);
        // every owned point is a ghost on both other ranks
        assert_eq!(y, &vec![2.0; 4]);
    }
}
