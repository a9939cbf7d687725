//! Hash fast path for re-assembly with an unchanged nonzero pattern.
//!
//! Maps a `(block row, block column)` pair straight to a slot in a
//! [`BlockStore`](super::BlockStore) value array, skipping the per-row binary
//! search. The table never grows: a key that was not present when the index
//! was built is a [`HashLookup::Miss`] and the caller falls back to the
//! sorted-row path.

use std::collections::HashMap;

/// Default ratio of table capacity to nonzero blocks.
pub const DEFAULT_HASH_FACTOR: f64 = 1.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLookup {
    /// Slot index (in blocks) into the value array.
    Hit(usize),
    Miss,
}

#[derive(Debug, Clone)]
pub struct HashIndex {
    slots: HashMap<(usize, usize), usize>,
    factor: f64,
}

impl HashIndex {
    /// Build from `(block row, block column, slot)` triples.
    pub fn build(entries: impl IntoIterator<Item = (usize, usize, usize)>, nonzeros: usize, factor: f64) -> Self {
        let factor = if factor >= 1.0 { factor } else { DEFAULT_HASH_FACTOR };
        let mut slots = HashMap::with_capacity((factor * nonzeros as f64).ceil() as usize);
        for (row, col, slot) in entries {
            slots.insert((row, col), slot);
        }
        Self { slots, factor }
    }

    pub fn lookup(&self, row: usize, col: usize) -> HashLookup {
        match self.slots.get(&(row, col)) {
            Some(&slot) => HashLookup::Hit(slot),
            None => HashLookup::Miss,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hits_and_misses_without_growing() {
        let idx = HashIndex::build([(0, 0, 0), (0, 3, 1), (2, 1, 2)], 3, 2.0);
        assert_eq!(idx.lookup(0, 3), HashLookup::Hit(1));
        assert_eq!(idx.lookup(2, 1), HashLookup::Hit(2));
        assert_eq!(idx.lookup(1, 1), HashLookup::Miss);
        assert_eq!(idx.len(), 3);
        assert!(idx.capacity() >= 6);
    }

    #[test]
    fn factor_below_one_uses_default() {
        let idx = HashIndex::build(std::iter::empty(), 0, 0.5);
        assert_eq!(idx.factor(), DEFAULT_HASH_FACTOR);
        assert!(idx.is_empty());
    }
}
