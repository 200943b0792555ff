// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::recording::{BufferProxy, SortParams};

/// Padding rules of the external hierarchical sort.
///
/// The sort works on slabs of `slab_keys` keys. Its input is padded to whole
/// slabs, and merging touches a power-of-two number of slabs, so the key
/// buffer must be large enough for the padded output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HotSort {
    pub slab_keys: u32,
}

impl HotSort {
    pub fn new(slab_keys: u32) -> Self {
        Self { slab_keys }
    }

    /// The padded input and output sizes for sorting `count` keys.
    pub fn pad(&self, count: u32) -> (u32, u32) {
        if count == 0 {
            return (0, 0);
        }
        let slabs = count.div_ceil(self.slab_keys);
        let padded_in = slabs * self.slab_keys;
        let padded_out = slabs.next_power_of_two() * self.slab_keys;
        (padded_in, padded_out)
    }

    pub(crate) fn params(&self, keys: BufferProxy, count: u32) -> SortParams {
        let (padded_in, padded_out) = self.pad(count);
        SortParams {
            keys,
            count,
            padded_in,
            padded_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HotSort;

    #[test]
    fn pads_to_whole_slabs() {
        let sort = HotSort::new(128);
        assert_eq!(sort.pad(0), (0, 0));
        assert_eq!(sort.pad(1), (128, 128));
        assert_eq!(sort.pad(128), (128, 128));
        assert_eq!(sort.pad(129), (256, 256));
        assert_eq!(sort.pad(300), (384, 512));
    }

    #[test]
    fn full_buffer_needs_no_more_room() {
        let sort = HotSort::new(128);
        let capacity = 128 * 16;
        assert_eq!(sort.pad(capacity), (capacity, capacity));
    }
}
