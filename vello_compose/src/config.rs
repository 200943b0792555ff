// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{Error, Result};

/// Options which are set at [`Context`][crate::Context] creation time.
///
/// Every buffer that the pipeline uses has a fixed size which is decided here,
/// as device-side allocation happens once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeConfig {
    /// Number of place commands each composition can batch before a snapshot
    /// is forced and further `place` calls wait for it to be consumed.
    pub ring_capacity: u32,
    /// Number of sort keys each composition can hold.
    ///
    /// This must be a power-of-two multiple of [`sort_slab_keys`](Self::sort_slab_keys),
    /// so that padding for the sort never exceeds the buffer.
    pub keys_capacity: u32,
    /// Number of tile start offsets each composition can hold.
    pub offsets_capacity: u32,
    /// Number of tile blocks in the shared block pool.
    pub block_pool_blocks: u32,
    /// Number of rasters which can be alive at the same time.
    pub raster_capacity: u32,
    /// Number of layers a styling can describe.
    pub layer_capacity: u32,
    /// Log2 of the tile width in pixels.
    pub tile_width_log2: u32,
    /// Log2 of the tile height in pixels.
    pub tile_height_log2: u32,
    /// Log2 of the number of sub-pixels per pixel used by placement translations.
    pub subpixel_log2: u32,
    /// Number of keys in a single slab of the hierarchical sort.
    pub sort_slab_keys: u32,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            keys_capacity: 1 << 16,
            offsets_capacity: 1 << 14,
            block_pool_blocks: 1 << 16,
            raster_capacity: 1 << 12,
            layer_capacity: 1 << 10,
            tile_width_log2: 3,
            tile_height_log2: 3,
            subpixel_log2: 5,
            sort_slab_keys: 128,
        }
    }
}

impl ComposeConfig {
    /// Check that the configuration describes buffers the pipeline can use.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(Error::InvalidConfig("ring_capacity must be non-zero"));
        }
        if self.offsets_capacity == 0 || self.block_pool_blocks == 0 {
            return Err(Error::InvalidConfig("buffer capacities must be non-zero"));
        }
        if self.raster_capacity == 0 || self.layer_capacity == 0 {
            return Err(Error::InvalidConfig("table capacities must be non-zero"));
        }
        if self.block_pool_blocks > crate::Ttck::MAX_ID + 1 {
            return Err(Error::InvalidConfig(
                "block_pool_blocks does not fit in a sort key",
            ));
        }
        if self.sort_slab_keys == 0 || self.keys_capacity % self.sort_slab_keys != 0 {
            return Err(Error::InvalidConfig(
                "keys_capacity must be a multiple of sort_slab_keys",
            ));
        }
        if !(self.keys_capacity / self.sort_slab_keys).is_power_of_two() {
            return Err(Error::InvalidConfig(
                "keys_capacity must be a power-of-two number of sort slabs",
            ));
        }
        if self.tile_width_log2 > 8 || self.tile_height_log2 > 8 || self.subpixel_log2 > 8 {
            return Err(Error::InvalidConfig("tile and sub-pixel shifts are limited to 8"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ComposeConfig;

    #[test]
    fn default_is_valid() {
        ComposeConfig::default().validate().unwrap();
    }

    #[test]
    fn key_capacity_must_pad_cleanly() {
        let config = ComposeConfig {
            keys_capacity: 3 * 128,
            ..ComposeConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ComposeConfig {
            keys_capacity: 100,
            ..ComposeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
