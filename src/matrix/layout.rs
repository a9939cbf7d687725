//! Contiguous ownership ranges of block rows (or block columns) per process.

use crate::error::KError;
use crate::parallel::{Comm, ReduceOp};

/// Which process owns which block indices.
///
/// `starts` has `size + 1` entries; process `p` owns blocks
/// `starts[p]..starts[p + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    bs: usize,
    starts: Vec<usize>,
    rank: usize,
}

impl Layout {
    /// Split `global_blocks` as evenly as possible, earlier ranks taking the remainder.
    pub fn split(global_blocks: usize, bs: usize, size: usize, rank: usize) -> Self {
        let size = size.max(1);
        let base = global_blocks / size;
        let extra = global_blocks % size;
        let mut starts = Vec::with_capacity(size + 1);
        let mut acc = 0;
        starts.push(0);
        for p in 0..size {
            acc += base + usize::from(p < extra);
            starts.push(acc);
        }
        Self { bs, starts, rank }
    }

    /// Build from each process contributing its own local block count (collective).
    pub fn from_local<C: Comm>(comm: &C, local_blocks: usize, bs: usize) -> Result<Self, KError> {
        let mut mine = vec![0u64; comm.size()];
        mine[comm.rank()] = local_blocks as u64;
        let counts = comm.all_reduce_u64(&mine, ReduceOp::Sum)?;
        let mut starts = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0;
        starts.push(0);
        for c in counts {
            acc += c as usize;
            starts.push(acc);
        }
        Ok(Self { bs, starts, rank: comm.rank() })
    }

    pub fn block_size(&self) -> usize {
        self.bs
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_procs(&self) -> usize {
        self.starts.len() - 1
    }

    pub fn global_blocks(&self) -> usize {
        self.starts[self.starts.len() - 1]
    }

    pub fn global_size(&self) -> usize {
        self.global_blocks() * self.bs
    }

    /// First locally owned block.
    pub fn start(&self) -> usize {
        self.starts[self.rank]
    }

    /// One past the last locally owned block.
    pub fn end(&self) -> usize {
        self.starts[self.rank + 1]
    }

    pub fn local_blocks(&self) -> usize {
        self.end() - self.start()
    }

    pub fn local_size(&self) -> usize {
        self.local_blocks() * self.bs
    }

    /// Range of point indices owned locally.
    pub fn point_range(&self) -> std::ops::Range<usize> {
        self.start() * self.bs..self.end() * self.bs
    }

    /// Block range owned by process `p`.
    pub fn range_of(&self, p: usize) -> std::ops::Range<usize> {
        self.starts[p]..self.starts[p + 1]
    }

    pub fn owns_block(&self, b: usize) -> bool {
        (self.start()..self.end()).contains(&b)
    }

    /// Owning process of block `b`, `None` if out of range.
    pub fn owner_of_block(&self, b: usize) -> Option<usize> {
        if b >= self.global_blocks() {
            return None;
        }
        // first p with starts[p + 1] > b
        Some(self.starts[1..].partition_point(|&end| end <= b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_gives_remainder_to_leading_ranks() {
        let l = Layout::split(10, 2, 3, 1);
        assert_eq!(l.range_of(0), 0..4);
        assert_eq!(l.range_of(1), 4..7);
        assert_eq!(l.range_of(2), 7..10);
        assert_eq!(l.point_range(), 8..14);
        assert_eq!(l.global_size(), 20);
    }

    #[test]
    fn owner_lookup_skips_empty_ranks() {
        let l = Layout::split(2, 1, 4, 0);
        assert_eq!(l.owner_of_block(0), Some(0));
        assert_eq!(l.owner_of_block(1), Some(1));
        assert_eq!(l.owner_of_block(2), None);
        let l = Layout::split(5, 1, 3, 2);
        assert_eq!(l.owner_of_block(4), Some(2));
        assert!(l.owns_block(4));
        assert!(!l.owns_block(1));
    }

    #[test]
    fn from_local_counts() {
        let layouts = crate::parallel::ThreadWorld::run(3, |comm| {
            Layout::from_local(&comm, comm.rank() + 1, 1).unwrap()
        });
        assert_eq!(layouts[2].range_of(2), 3..6);
        assert_eq!(layouts[0].global_blocks(), 6);
    }
}
