//! Buffer for entries destined for rows owned by other processes.
//!
//! Entries are kept in insertion order. At assembly begin they are grouped
//! by owning process (preserving order inside each group), every process
//! learns how many messages it will receive through one sum-reduction, and
//! the groups are posted as one message per destination.

use crate::core::traits::Scalar;
use crate::error::KError;
use crate::parallel::{Comm, Payload, RecvRequest, ReduceOp, SendRequest, Tag};
use std::ops::Range;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct Stash<T> {
    /// Values per entry: 1 for point entries, bs² for blocks.
    entry_len: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<T>,
    reallocs: usize,
}

impl<T: Scalar> Stash<T> {
    pub fn new(entry_len: usize, capacity: usize) -> Self {
        Self {
            entry_len: entry_len.max(1),
            rows: Vec::with_capacity(capacity),
            cols: Vec::with_capacity(capacity),
            vals: Vec::with_capacity(capacity * entry_len.max(1)),
            reallocs: 0,
        }
    }

    pub fn entry_len(&self) -> usize {
        self.entry_len
    }

    pub fn push(&mut self, row: usize, col: usize, values: &[T]) -> Result<(), KError> {
        if values.len() != self.entry_len {
            return Err(KError::DimensionMismatch { expected: self.entry_len, got: values.len() });
        }
        if self.rows.len() == self.rows.capacity() {
            self.reallocs += 1;
        }
        self.rows.push(row);
        self.cols.push(col);
        self.vals.extend_from_slice(values);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Times the buffer had to grow.
    pub fn reallocations(&self) -> usize {
        self.reallocs
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.cols.clear();
        self.vals.clear();
    }

    /// Post this process's entries and the matching receives (collective).
    ///
    /// `owner` maps a stashed row to its owning process. The stash is empty afterwards.
    pub fn scatter_begin<C: Comm>(
        &mut self,
        comm: &C,
        tag: Tag,
        owner: impl Fn(usize) -> Option<usize>,
    ) -> Result<StashExchange, KError> {
        let size = comm.size();
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (i, &row) in self.rows.iter().enumerate() {
            let p = owner(row).ok_or(KError::OutOfRange { what: "stashed row", index: row, bound: usize::MAX })?;
            groups[p].push(i);
        }

        let mut sending = vec![0u64; size];
        for (p, g) in groups.iter().enumerate() {
            sending[p] = u64::from(!g.is_empty());
        }
        let incoming = comm.all_reduce_u64(&sending, ReduceOp::Sum)?;
        let nreceives = incoming[comm.rank()] as usize;

        let e = self.entry_len;
        let mut sends = Vec::new();
        for (dest, g) in groups.iter().enumerate().filter(|(_, g)| !g.is_empty()) {
            let mut indices = Vec::with_capacity(2 * g.len());
            let mut values = Vec::with_capacity(e * g.len());
            for &i in g {
                indices.push(self.rows[i] as u64);
                indices.push(self.cols[i] as u64);
                values.extend(self.vals[i * e..(i + 1) * e].iter().map(|v| v.to_wire()));
            }
            trace!(dest, entries = g.len(), "posting stash message");
            sends.push(comm.isend(dest, tag, Payload::new(indices, values))?);
        }
        let pending = (0..nreceives).map(|_| comm.irecv(None, tag)).collect::<Result<Vec<_>, _>>()?;
        debug!(entries = self.len(), messages = sends.len(), nreceives, "stash scatter begin");
        self.clear();
        Ok(StashExchange { entry_len: e, sends, pending })
    }
}

/// Messages in flight for one stash exchange.
#[derive(Debug)]
#[must_use = "a stash exchange must be drained and finished"]
pub struct StashExchange {
    entry_len: usize,
    sends: Vec<SendRequest>,
    pending: Vec<RecvRequest>,
}

impl StashExchange {
    /// Receives not yet waited on.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the next incoming message, `None` once all have arrived.
    pub fn next_message<C: Comm, T: Scalar>(&mut self, comm: &C) -> Result<Option<StashMessage<T>>, KError> {
        let Some(req) = self.pending.pop() else {
            return Ok(None);
        };
        let msg = comm.wait_recv(req)?;
        let Payload { indices, values } = msg.payload;
        let n = indices.len() / 2;
        if indices.len() % 2 != 0 || values.len() != n * self.entry_len {
            return Err(KError::Transport(format!(
                "stash message from rank {} is malformed ({} indices, {} values)",
                msg.source,
                indices.len(),
                values.len()
            )));
        }
        let (rows, cols): (Vec<usize>, Vec<usize>) = indices.chunks_exact(2).map(|rc| (rc[0] as usize, rc[1] as usize)).unzip();
        Ok(Some(StashMessage {
            source: msg.source,
            entry_len: self.entry_len,
            rows,
            cols,
            vals: values.into_iter().map(T::from_wire).collect(),
        }))
    }

    /// Complete the sends.
    pub fn finish<C: Comm>(self, comm: &C) -> Result<(), KError> {
        comm.wait_all_sends(self.sends)
    }
}

/// Entries received from one process.
#[derive(Debug, Clone)]
pub struct StashMessage<T> {
    pub source: usize,
    entry_len: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub vals: Vec<T>,
}

impl<T> StashMessage<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of entries `r`.
    pub fn values(&self, r: Range<usize>) -> &[T] {
        &self.vals[r.start * self.entry_len..r.end * self.entry_len]
    }

    /// Maximal runs of consecutive entries sharing a row.
    pub fn row_runs(&self) -> Vec<(usize, Range<usize>)> {
        let mut runs = Vec::new();
        let mut i = 0;
        while i < self.rows.len() {
            let row = self.rows[i];
            let mut j = i + 1;
            while j < self.rows.len() && self.rows[j] == row {
                j += 1;
            }
            runs.push((row, i..j));
            i = j;
        }
        runs
    }
}
