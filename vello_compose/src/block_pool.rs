// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Best-fit allocation of tile blocks in the shared block pool.

use std::collections::{BTreeMap, BTreeSet};

/// An allocator that tracks free runs of blocks and returns the best fit.
#[derive(Debug)]
pub struct BestFit {
    // map offset to length of free run
    free_by_offset: BTreeMap<u32, u32>,
    // length and offset
    free_by_len: BTreeSet<(u32, u32)>,
    available: u32,
}

impl BestFit {
    pub fn new(blocks: u32) -> Self {
        let mut pool = Self {
            free_by_offset: BTreeMap::new(),
            free_by_len: BTreeSet::new(),
            available: 0,
        };
        if blocks > 0 {
            pool.insert_run(0, blocks);
        }
        pool
    }

    /// Number of free blocks, not necessarily contiguous.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Length of the largest free run.
    pub fn largest(&self) -> u32 {
        self.free_by_len.last().map_or(0, |&(len, _)| len)
    }

    /// Allocate `len` contiguous blocks, returning the offset of the first.
    pub fn alloc(&mut self, len: u32) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let (run_len, offset) = *self.free_by_len.range((len, 0)..).next()?;
        self.remove_run(offset, run_len);
        if run_len > len {
            self.insert_run(offset + len, run_len - len);
        }
        Some(offset)
    }

    /// Return a run of blocks, merging it with free neighbors.
    pub fn free(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + len;
        if let Some((&prev, &prev_len)) = self.free_by_offset.range(..offset).next_back() {
            debug_assert!(prev + prev_len <= offset, "double free of blocks {offset}..{end}");
            if prev + prev_len == offset {
                self.remove_run(prev, prev_len);
                start = prev;
            }
        }
        if let Some(&next_len) = self.free_by_offset.get(&end) {
            self.remove_run(end, next_len);
            end += next_len;
        }
        self.insert_run(start, end - start);
    }

    fn insert_run(&mut self, offset: u32, len: u32) {
        self.free_by_offset.insert(offset, len);
        self.free_by_len.insert((len, offset));
        self.available += len;
    }

    fn remove_run(&mut self, offset: u32, len: u32) {
        self.free_by_offset.remove(&offset);
        self.free_by_len.remove(&(len, offset));
        self.available -= len;
    }
}

#[cfg(test)]
mod tests {
    use super::BestFit;

    #[test]
    fn picks_the_smallest_fitting_run() {
        let mut pool = BestFit::new(16);
        let a = pool.alloc(4).unwrap();
        let b = pool.alloc(2).unwrap();
        let _c = pool.alloc(4).unwrap();
        pool.free(a, 4);
        pool.free(b, 2);
        // a and b merged into one run of 6; the tail run is also 6 long.
        assert_eq!(pool.largest(), 6);
        let d = pool.alloc(6).unwrap();
        assert_eq!(d, 0);
    }

    #[test]
    fn frees_merge_both_neighbors() {
        let mut pool = BestFit::new(12);
        let a = pool.alloc(4).unwrap();
        let b = pool.alloc(4).unwrap();
        let c = pool.alloc(4).unwrap();
        assert_eq!(pool.alloc(1), None);
        pool.free(a, 4);
        pool.free(c, 4);
        pool.free(b, 4);
        assert_eq!(pool.available(), 12);
        assert_eq!(pool.largest(), 12);
    }

    #[test]
    fn fragmentation_limits_runs() {
        let mut pool = BestFit::new(8);
        let a = pool.alloc(2).unwrap();
        let _b = pool.alloc(2).unwrap();
        let c = pool.alloc(2).unwrap();
        let _d = pool.alloc(2).unwrap();
        pool.free(a, 2);
        pool.free(c, 2);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.alloc(3), None);
    }
}
