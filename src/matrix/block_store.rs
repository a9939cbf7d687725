//! Single-process block compressed row storage.
//!
//! Each block row keeps a sorted run of block-column indices followed by
//! unused capacity. Values are stored `bs × bs` per block, row-major inside the
//! block, in the same slot order as the column indices. A row that runs out
//! of room is widened in place (everything after it moves up), so later rows
//! keep their relative layout and no value is lost. [`BlockStore::compact`]
//! squeezes the padding out again.
//!
//! # References
//! - Saad, Y. (2003). Iterative Methods for Sparse Linear Systems, §3.4 (storage schemes).

use super::hash_index::{HashIndex, HashLookup};
use crate::core::traits::{InsertMode, LinearOperator, Scalar};
use crate::error::KError;
use crate::utils::events::add_flops;
use tracing::debug;

/// Minimum number of block slots added when a row overflows.
pub const CHUNK_SIZE: usize = 10;

/// What to do when an insertion needs a new nonzero block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewNonzeroPolicy {
    #[default]
    Allow,
    /// Silently drop values at new locations.
    Ignore,
    /// Refuse with [`KError::NewNonzeroDisallowed`].
    Error,
}

#[derive(Debug, Clone)]
pub struct BlockStore<T> {
    bs: usize,
    mbs: usize,
    nbs: usize,
    /// Slot where each row begins; `row_start[mbs]` is the total slot count.
    row_start: Vec<usize>,
    row_len: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<T>,
    policy: NewNonzeroPolicy,
    reallocs: usize,
    hash: Option<HashIndex>,
}

impl<T: Scalar> BlockStore<T> {
    /// `mbs × nbs` blocks of size `bs`, with room for `nz` blocks in every row.
    pub fn new(mbs: usize, nbs: usize, bs: usize, nz: usize) -> Self {
        Self::with_row_capacity(nbs, bs, &vec![nz; mbs])
    }

    /// One block row per entry of `caps`, each with the given capacity.
    pub fn with_row_capacity(nbs: usize, bs: usize, caps: &[usize]) -> Self {
        let bs = bs.max(1);
        let mut row_start = Vec::with_capacity(caps.len() + 1);
        let mut acc = 0;
        row_start.push(0);
        for &c in caps {
            acc += c.min(nbs);
            row_start.push(acc);
        }
        Self {
            bs,
            mbs: caps.len(),
            nbs,
            row_start,
            row_len: vec![0; caps.len()],
            cols: vec![0; acc],
            vals: vec![T::zero(); acc * bs * bs],
            policy: NewNonzeroPolicy::Allow,
            reallocs: 0,
            hash: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.bs
    }

    pub fn block_rows(&self) -> usize {
        self.mbs
    }

    pub fn block_cols(&self) -> usize {
        self.nbs
    }

    pub fn rows(&self) -> usize {
        self.mbs * self.bs
    }

    pub fn cols(&self) -> usize {
        self.nbs * self.bs
    }

    /// Number of stored blocks.
    pub fn nonzero_blocks(&self) -> usize {
        self.row_len.iter().sum()
    }

    /// Number of block slots, used or not.
    pub fn allocated_blocks(&self) -> usize {
        self.cols.len()
    }

    /// How many times a row had to be widened.
    pub fn reallocations(&self) -> usize {
        self.reallocs
    }

    pub fn policy(&self) -> NewNonzeroPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: NewNonzeroPolicy) {
        self.policy = policy;
    }

    pub fn row_len(&self, brow: usize) -> usize {
        self.row_len[brow]
    }

    fn row_cap(&self, brow: usize) -> usize {
        self.row_start[brow + 1] - self.row_start[brow]
    }

    /// Block columns and values of one block row, without copying.
    pub fn get_row(&self, brow: usize) -> (&[usize], &[T]) {
        let start = self.row_start[brow];
        let end = start + self.row_len[brow];
        let bs2 = self.bs * self.bs;
        (&self.cols[start..end], &self.vals[start * bs2..end * bs2])
    }

    /// Entries of point row `row` inside its stored blocks, as `(point column, value)`
    /// in ascending column order. Explicit zeros in a stored block are included.
    pub fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let bs = self.bs;
        let r = row % bs;
        let (cols, vals) = self.get_row(row / bs);
        cols.iter().enumerate().flat_map(move |(k, &bc)| {
            let blk = &vals[k * bs * bs + r * bs..k * bs * bs + (r + 1) * bs];
            blk.iter().enumerate().map(move |(c, &v)| (bc * bs + c, v))
        })
    }

    /// Raw storage, for comparisons.
    pub fn raw_parts(&self) -> (&[usize], &[usize], &[usize], &[T]) {
        (&self.row_start, &self.row_len, &self.cols, &self.vals)
    }

    fn check_point(&self, row: usize, col: usize) -> Result<(), KError> {
        if row >= self.rows() {
            return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows() });
        }
        if col >= self.cols() {
            return Err(KError::OutOfRange { what: "column", index: col, bound: self.cols() });
        }
        Ok(())
    }

    /// Slot of an existing block, or the slot it would be inserted at.
    fn find(&self, brow: usize, bcol: usize) -> Result<usize, usize> {
        let start = self.row_start[brow];
        let used = &self.cols[start..start + self.row_len[brow]];
        used.binary_search(&bcol).map(|i| start + i).map_err(|i| start + i)
    }

    fn grow_row(&mut self, brow: usize) {
        let extra = self.row_cap(brow).max(CHUNK_SIZE);
        let bs2 = self.bs * self.bs;
        let at = self.row_start[brow + 1];
        self.cols.splice(at..at, std::iter::repeat_n(0, extra));
        self.vals.splice(at * bs2..at * bs2, std::iter::repeat_n(T::zero(), extra * bs2));
        for s in &mut self.row_start[brow + 1..] {
            *s += extra;
        }
        self.reallocs += 1;
        debug!(brow, extra, reallocs = self.reallocs, "block row widened");
    }

    /// Slot for `(brow, bcol)`, creating a zero block if allowed.
    /// `None` means the value must be dropped.
    fn slot_for(&mut self, brow: usize, bcol: usize) -> Result<Option<usize>, KError> {
        if let Some(HashLookup::Hit(slot)) = self.hash.as_ref().map(|h| h.lookup(brow, bcol)) {
            return Ok(Some(slot));
        }
        let pos = match self.find(brow, bcol) {
            Ok(slot) => return Ok(Some(slot)),
            Err(pos) => pos,
        };
        match self.policy {
            NewNonzeroPolicy::Ignore => return Ok(None),
            NewNonzeroPolicy::Error => {
                return Err(KError::NewNonzeroDisallowed { row: brow * self.bs, col: bcol * self.bs });
            }
            NewNonzeroPolicy::Allow => {}
        }
        if self.row_len[brow] == self.row_cap(brow) {
            // widening only moves rows after this one, `pos` stays valid
            self.grow_row(brow);
        }
        let bs2 = self.bs * self.bs;
        let end = self.row_start[brow] + self.row_len[brow];
        self.cols.copy_within(pos..end, pos + 1);
        self.vals.copy_within(pos * bs2..end * bs2, (pos + 1) * bs2);
        self.cols[pos] = bcol;
        self.vals[pos * bs2..(pos + 1) * bs2].fill(T::zero());
        self.row_len[brow] += 1;
        // slot numbers after `pos` moved
        self.hash = None;
        Ok(Some(pos))
    }

    /// Set one point entry (local point indices).
    pub fn set_value(&mut self, row: usize, col: usize, value: T, mode: InsertMode) -> Result<(), KError> {
        self.check_point(row, col)?;
        let bs = self.bs;
        if let Some(slot) = self.slot_for(row / bs, col / bs)? {
            let v = &mut self.vals[slot * bs * bs + (row % bs) * bs + col % bs];
            *v = match mode {
                InsertMode::Insert => value,
                InsertMode::Add => *v + value,
            };
        }
        Ok(())
    }

    /// Set a whole `bs × bs` block (row-major).
    pub fn set_block(&mut self, brow: usize, bcol: usize, block: &[T], mode: InsertMode) -> Result<(), KError> {
        let bs2 = self.bs * self.bs;
        if block.len() != bs2 {
            return Err(KError::DimensionMismatch { expected: bs2, got: block.len() });
        }
        self.check_point(brow * self.bs, bcol * self.bs)?;
        if let Some(slot) = self.slot_for(brow, bcol)? {
            let dst = &mut self.vals[slot * bs2..(slot + 1) * bs2];
            match mode {
                InsertMode::Insert => dst.copy_from_slice(block),
                InsertMode::Add => {
                    for (d, &s) in dst.iter_mut().zip(block) {
                        *d = *d + s;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stored value, or zero if the block is absent.
    pub fn get_value(&self, row: usize, col: usize) -> Result<T, KError> {
        self.check_point(row, col)?;
        let bs = self.bs;
        Ok(match self.find(row / bs, col / bs) {
            Ok(slot) => self.vals[slot * bs * bs + (row % bs) * bs + col % bs],
            Err(_) => T::zero(),
        })
    }

    /// Drop unused capacity. Calling it again is a no-op.
    pub fn compact(&mut self) {
        let total = self.nonzero_blocks();
        if self.cols.len() == total {
            return;
        }
        let bs2 = self.bs * self.bs;
        let mut cols = Vec::with_capacity(total);
        let mut vals = Vec::with_capacity(total * bs2);
        let mut row_start = Vec::with_capacity(self.mbs + 1);
        row_start.push(0);
        for brow in 0..self.mbs {
            let (c, v) = self.get_row(brow);
            cols.extend_from_slice(c);
            vals.extend_from_slice(v);
            row_start.push(cols.len());
        }
        debug!(freed = self.cols.len() - total, "compacted block store");
        self.cols = cols;
        self.vals = vals;
        self.row_start = row_start;
        self.hash = None;
    }

    /// Zero all values, keeping the nonzero structure.
    pub fn zero_entries(&mut self) {
        self.vals.fill(T::zero());
    }

    /// Zero point row `row` in every stored block, keeping the structure.
    pub fn zero_row(&mut self, row: usize) -> Result<(), KError> {
        if row >= self.rows() {
            return Err(KError::OutOfRange { what: "row", index: row, bound: self.rows() });
        }
        let bs = self.bs;
        let brow = row / bs;
        let r = row % bs;
        let start = self.row_start[brow];
        for slot in start..start + self.row_len[brow] {
            let off = slot * bs * bs + r * bs;
            self.vals[off..off + bs].fill(T::zero());
        }
        Ok(())
    }

    /// A ← a·A
    pub fn scale(&mut self, a: T) {
        for v in &mut self.vals {
            *v = *v * a;
        }
        add_flops(self.nonzero_blocks() * self.bs * self.bs);
    }

    /// A ← diag(l)·A, one factor per point row.
    pub fn scale_rows(&mut self, l: &[T]) {
        let bs = self.bs;
        for brow in 0..self.mbs {
            let start = self.row_start[brow];
            for slot in start..start + self.row_len[brow] {
                let blk = &mut self.vals[slot * bs * bs..(slot + 1) * bs * bs];
                for (r, row) in blk.chunks_exact_mut(bs).enumerate() {
                    let f = l[brow * bs + r];
                    row.iter_mut().for_each(|v| *v = *v * f);
                }
            }
        }
        add_flops(self.nonzero_blocks() * bs * bs);
    }

    /// A ← A·diag(r), one factor per point column.
    pub fn scale_columns(&mut self, r: &[T]) {
        let bs = self.bs;
        for brow in 0..self.mbs {
            let start = self.row_start[brow];
            for slot in start..start + self.row_len[brow] {
                let bc = self.cols[slot];
                let blk = &mut self.vals[slot * bs * bs..(slot + 1) * bs * bs];
                for row in blk.chunks_exact_mut(bs) {
                    for (c, v) in row.iter_mut().enumerate() {
                        *v = *v * r[bc * bs + c];
                    }
                }
            }
        }
        add_flops(self.nonzero_blocks() * bs * bs);
    }

    pub fn build_hash(&mut self, factor: f64) {
        let entries: Vec<(usize, usize, usize)> = (0..self.mbs)
            .flat_map(|brow| {
                let start = self.row_start[brow];
                (start..start + self.row_len[brow]).map(move |s| (brow, s))
            })
            .map(|(brow, s)| (brow, self.cols[s], s))
            .collect();
        self.hash = Some(HashIndex::build(entries, self.nonzero_blocks(), factor));
    }

    pub fn hash_index(&self) -> Option<&HashIndex> {
        self.hash.as_ref()
    }

    /// Distinct block columns in use, ascending.
    pub fn used_columns(&self) -> Vec<usize> {
        let mut used: Vec<usize> = (0..self.mbs).flat_map(|r| self.get_row(r).0.iter().copied()).collect();
        used.sort_unstable();
        used.dedup();
        used
    }

    /// Renumber block columns through a monotone map and change the column count.
    pub fn remap_columns(&mut self, map: impl Fn(usize) -> usize, nbs: usize) {
        for brow in 0..self.mbs {
            let start = self.row_start[brow];
            for c in &mut self.cols[start..start + self.row_len[brow]] {
                *c = map(*c);
            }
        }
        self.nbs = nbs;
        self.hash = None;
    }

    /// y ← y + A x
    pub fn mult_add_into(&self, x: &[T], y: &mut [T]) {
        let bs = self.bs;
        let bs2 = bs * bs;
        for brow in 0..self.mbs {
            let (cols, vals) = self.get_row(brow);
            let yb = &mut y[brow * bs..(brow + 1) * bs];
            for (k, &bc) in cols.iter().enumerate() {
                let blk = &vals[k * bs2..(k + 1) * bs2];
                let xb = &x[bc * bs..(bc + 1) * bs];
                for r in 0..bs {
                    let mut acc = T::zero();
                    for c in 0..bs {
                        acc = acc + blk[r * bs + c] * xb[c];
                    }
                    yb[r] = yb[r] + acc;
                }
            }
        }
        add_flops(2 * self.nonzero_blocks() * bs2);
    }

    /// y ← y + Aᵀ x
    pub fn mult_transpose_add_into(&self, x: &[T], y: &mut [T]) {
        let bs = self.bs;
        let bs2 = bs * bs;
        for brow in 0..self.mbs {
            let (cols, vals) = self.get_row(brow);
            let xb = &x[brow * bs..(brow + 1) * bs];
            for (k, &bc) in cols.iter().enumerate() {
                let blk = &vals[k * bs2..(k + 1) * bs2];
                let yb = &mut y[bc * bs..(bc + 1) * bs];
                for r in 0..bs {
                    for c in 0..bs {
                        yb[c] = yb[c] + blk[r * bs + c] * xb[r];
                    }
                }
            }
        }
        add_flops(2 * self.nonzero_blocks() * bs2);
    }

    /// Main diagonal of a square store; zero where no block is stored.
    pub fn diagonal_into(&self, d: &mut [T]) {
        let bs = self.bs;
        d.fill(T::zero());
        for brow in 0..self.mbs.min(self.nbs) {
            if let Ok(slot) = self.find(brow, brow) {
                for r in 0..bs {
                    d[brow * bs + r] = self.vals[slot * bs * bs + r * bs + r];
                }
            }
        }
    }
}

impl<T: Scalar> LinearOperator<T> for BlockStore<T> {
    fn local_rows(&self) -> usize {
        self.rows()
    }

    fn local_cols(&self) -> usize {
        self.cols()
    }

    fn mult(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if x.len() != self.cols() {
            return Err(KError::DimensionMismatch { expected: self.cols(), got: x.len() });
        }
        if y.len() != self.rows() {
            return Err(KError::DimensionMismatch { expected: self.rows(), got: y.len() });
        }
        y.fill(T::zero());
        self.mult_add_into(x, y);
        Ok(())
    }

    fn mult_transpose(&self, x: &[T], y: &mut [T]) -> Result<(), KError> {
        if x.len() != self.rows() {
            return Err(KError::DimensionMismatch { expected: self.rows(), got: x.len() });
        }
        if y.len() != self.cols() {
            return Err(KError::DimensionMismatch { expected: self.cols(), got: y.len() });
        }
        y.fill(T::zero());
        self.mult_transpose_add_into(x, y);
        Ok(())
    }

    fn diagonal(&self, d: &mut [T]) -> Result<(), KError> {
        let n = self.rows().min(self.cols());
        if d.len() != n {
            return Err(KError::DimensionMismatch { expected: n, got: d.len() });
        }
        self.diagonal_into(d);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sorted_insertion_and_accumulate() {
        let mut a = BlockStore::<f64>::new(2, 4, 1, 2);
        a.set_value(0, 3, 3.0, InsertMode::Insert).unwrap();
        a.set_value(0, 1, 1.0, InsertMode::Insert).unwrap();
        a.set_value(0, 2, 2.0, InsertMode::Insert).unwrap();
        a.set_value(0, 1, 4.0, InsertMode::Add).unwrap();
        let (cols, vals) = a.get_row(0);
        assert_eq!(cols, &[1, 2, 3]);
        assert_eq!(vals, &[5.0, 2.0, 3.0]);
        assert_eq!(a.reallocations(), 1);
        assert_eq!(a.get_value(1, 0).unwrap(), 0.0);
    }

    #[test]
    fn growth_preserves_later_rows() {
        let mut a = BlockStore::<f64>::new(3, 30, 1, 1);
        a.set_value(2, 7, 7.0, InsertMode::Insert).unwrap();
        for c in 0..25 {
            a.set_value(1, c, c as f64, InsertMode::Insert).unwrap();
        }
        assert_eq!(a.row_len(1), 25);
        assert_eq!(a.get_row(2), (&[7usize][..], &[7.0][..]));
        assert!(a.reallocations() >= 2);
        for c in 0..25 {
            assert_eq!(a.get_value(1, c).unwrap(), c as f64);
        }
    }

    #[test]
    fn compact_is_idempotent() {
        let mut a = BlockStore::<f64>::new(3, 3, 2, 3);
        a.set_value(0, 0, 1.0, InsertMode::Insert).unwrap();
        a.set_value(5, 4, 2.0, InsertMode::Insert).unwrap();
        a.compact();
        let (rs, rl, c, v) = a.raw_parts();
        let first = (rs.to_vec(), rl.to_vec(), c.to_vec(), v.to_vec());
        assert_eq!(a.allocated_blocks(), a.nonzero_blocks());
        a.compact();
        let (rs, rl, c, v) = a.raw_parts();
        assert_eq!(first, (rs.to_vec(), rl.to_vec(), c.to_vec(), v.to_vec()));
    }

    #[test]
    fn frozen_store_rejects_new_blocks_but_updates_existing() {
        let mut a = BlockStore::<f64>::new(2, 2, 1, 2);
        a.set_value(0, 0, 1.0, InsertMode::Insert).unwrap();
        a.set_policy(NewNonzeroPolicy::Error);
        a.set_value(0, 0, 2.0, InsertMode::Add).unwrap();
        assert!(matches!(
            a.set_value(1, 1, 1.0, InsertMode::Insert),
            Err(KError::NewNonzeroDisallowed { row: 1, col: 1 })
        ));
        a.set_policy(NewNonzeroPolicy::Ignore);
        a.set_value(1, 1, 1.0, InsertMode::Insert).unwrap();
        assert_eq!(a.nonzero_blocks(), 1);
        assert_eq!(a.get_value(0, 0).unwrap(), 3.0);
    }

    #[test]
    fn out_of_range_is_reported() {
        let mut a = BlockStore::<f64>::new(2, 2, 2, 1);
        assert!(matches!(
            a.set_value(4, 0, 1.0, InsertMode::Insert),
            Err(KError::OutOfRange { what: "row", index: 4, bound: 4 })
        ));
        assert!(matches!(a.get_value(0, 9), Err(KError::OutOfRange { what: "column", .. })));
    }

    #[test]
    fn hash_path_updates_in_place_and_misses_fall_back() {
        let mut a = BlockStore::<f64>::new(2, 2, 2, 2);
        a.set_block(0, 1, &[1.0, 2.0, 3.0, 4.0], InsertMode::Insert).unwrap();
        a.set_block(1, 0, &[5.0, 6.0, 7.0, 8.0], InsertMode::Insert).unwrap();
        a.compact();
        a.build_hash(2.0);
        assert_eq!(a.hash_index().unwrap().lookup(0, 1), HashLookup::Hit(0));
        a.set_value(1, 3, 10.0, InsertMode::Add).unwrap();
        assert_eq!(a.get_value(1, 3).unwrap(), 14.0);
        assert!(a.hash_index().is_some());
        // new block: miss, sorted path inserts and drops the index
        a.set_value(0, 0, 1.0, InsertMode::Insert).unwrap();
        assert!(a.hash_index().is_none());
        assert_eq!(a.get_row(0).0, &[0, 1]);
    }

    #[test]
    fn row_entries_scaling_and_zeroing() {
        let mut a = BlockStore::<f64>::new(2, 2, 2, 2);
        a.set_block(0, 1, &[1.0, 2.0, 3.0, 4.0], InsertMode::Insert).unwrap();
        a.set_block(0, 0, &[5.0, 0.0, 0.0, 6.0], InsertMode::Insert).unwrap();
        let row1: Vec<(usize, f64)> = a.row_entries(1).collect();
        assert_eq!(row1, vec![(0, 0.0), (1, 6.0), (2, 3.0), (3, 4.0)]);

        a.scale(2.0);
        a.scale_rows(&[1.0, 0.5, 1.0, 1.0]);
        a.scale_columns(&[1.0, 1.0, 10.0, 1.0]);
        assert_eq!(a.get_row(0).1, &[10.0, 0.0, 0.0, 6.0, 20.0, 4.0, 30.0, 4.0]);

        a.zero_row(1).unwrap();
        assert_eq!(a.get_row(0).1, &[10.0, 0.0, 0.0, 0.0, 20.0, 4.0, 0.0, 0.0]);
        assert_eq!(a.nonzero_blocks(), 2);
        assert!(a.zero_row(4).is_err());
    }

    #[test]
    fn block_mult_and_transpose() {
        // 2x2 blocks of size 2 -> dense 4x4
        let mut a = BlockStore::<f64>::new(2, 2, 2, 2);
        a.set_block(0, 0, &[1.0, 2.0, 3.0, 4.0], InsertMode::Insert).unwrap();
        a.set_block(1, 0, &[0.0, 1.0, 1.0, 0.0], InsertMode::Insert).unwrap();
        a.set_block(1, 1, &[2.0, 0.0, 0.0, 2.0], InsertMode::Insert).unwrap();
        let x = [1.0, 1.0, 2.0, 3.0];
        let mut y = [0.0; 4];
        a.mult(&x, &mut y).unwrap();
        assert_eq!(y, [3.0, 7.0, 5.0, 7.0]);
        let mut yt = [0.0; 4];
        a.mult_transpose(&x, &mut yt).unwrap();
        // Aᵀ x with A rows [1 2 0 0; 3 4 0 0; 0 1 2 0; 1 0 0 2]
        assert_eq!(yt, [1.0 + 3.0 + 3.0, 2.0 + 4.0 + 2.0, 4.0, 6.0]);
        let mut d = [0.0; 4];
        a.diagonal(&mut d).unwrap();
        assert_abs_diff_eq!(d[1], 4.0);
        assert_abs_diff_eq!(d[3], 2.0);
    }
}
