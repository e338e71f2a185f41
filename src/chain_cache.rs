//! Chain cache (spec §4.9): a small bounded cache of "progress points" inside an
//! entry-array chain, so repeated bisections against the same chain (the common case —
//! callers usually step forward through one region of time) don't re-walk from the head
//! every time.
//!
//! One cache belongs to one open file (unlike the mmap window cache, which is process-wide
//! and shared).

use std::collections::HashMap;

/// A single remembered jump-in point: `(first, array_offset, begin_offset, total, last_index)`
/// in spec terms. `first` identifies which chain this progress point belongs to (the
/// global chain, or a specific Data object's per-value chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainProgress {
    /// Offset of the entry-array segment this progress point jumps directly into.
    pub array_offset: u64,
    /// The chain-relative logical index of that segment's first stored entry.
    pub begin_index: u64,
    /// Total entry count in the chain as of when this was published.
    pub total: u64,
    /// The last logical index a bisection through this chain landed on.
    pub last_index: u64,
}

const MAX_ENTRIES: usize = 128;

/// Bounded by simple FIFO eviction once `MAX_ENTRIES` distinct chains have been cached;
/// this is meant to bound memory, not to optimize cache-hit ratio (a single open file
/// rarely has anywhere near that many live per-data chains in active use at once).
#[derive(Debug, Default)]
pub struct ChainCache {
    entries: HashMap<u64, ChainProgress>,
    order: Vec<u64>,
}

impl ChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, first: u64) -> Option<ChainProgress> {
        self.entries.get(&first).copied()
    }

    /// Publish a progress point for the chain rooted at `first`, evicting the oldest entry
    /// first if the cache is full.
    pub fn publish(&mut self, first: u64, progress: ChainProgress) {
        if !self.entries.contains_key(&first) && self.entries.len() >= MAX_ENTRIES {
            if let Some(oldest) = self.order.first().copied() {
                self.entries.remove(&oldest);
                self.order.remove(0);
            }
        }
        if !self.entries.contains_key(&first) {
            self.order.push(first);
        }
        self.entries.insert(first, progress);
    }

    /// Drop a chain's cached progress point, e.g. because the chain was invalidated by a
    /// rewrite (not expected in this format, but cheap to offer).
    pub fn invalidate(&mut self, first: u64) {
        self.entries.remove(&first);
        self.order.retain(|&o| o != first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(last_index: u64) -> ChainProgress {
        ChainProgress {
            array_offset: 1000,
            begin_index: 0,
            total: 10,
            last_index,
        }
    }

    #[test]
    fn publish_then_get_round_trips() {
        let mut cache = ChainCache::new();
        cache.publish(42, sample(3));
        assert_eq!(cache.get(42), Some(sample(3)));
        assert_eq!(cache.get(99), None);
    }

    #[test]
    fn republish_overwrites_without_growing() {
        let mut cache = ChainCache::new();
        cache.publish(42, sample(3));
        cache.publish(42, sample(7));
        assert_eq!(cache.get(42).unwrap().last_index, 7);
        assert_eq!(cache.entries.len(), 1);
    }

    #[test]
    fn eviction_is_fifo_once_full() {
        let mut cache = ChainCache::new();
        for i in 0..(MAX_ENTRIES as u64) {
            cache.publish(i, sample(0));
        }
        assert_eq!(cache.entries.len(), MAX_ENTRIES);
        cache.publish(MAX_ENTRIES as u64, sample(0));
        assert_eq!(cache.entries.len(), MAX_ENTRIES);
        assert_eq!(cache.get(0), None, "oldest entry should have been evicted");
        assert_eq!(cache.get(MAX_ENTRIES as u64).unwrap().last_index, 0);
    }
}
