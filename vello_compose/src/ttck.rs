// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The tile/tile composition key.
//!
//! ```text
//!   0                                                      63
//!   | BLOCK ID | PREFIX | ESCAPE | LAYER |   X   |   Y   |
//!   +----------+--------+--------+-------+-------+-------+
//!   |    27    |   1    |   1    |  18   |   9   |   8   |
//! ```
//!
//! Tile Y is the most significant field and tile X the next, so sorting the
//! keys as plain integers groups fragments by tile in row-major order, and
//! then by layer within each tile. The segment and render kernels rely on
//! exactly that order.

use bytemuck::{Pod, Zeroable};

/// A packed tile/tile composition key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Zeroable, Pod)]
#[repr(transparent)]
pub struct Ttck(pub u64);

static_assertions::assert_eq_size!(Ttck, u64);

impl Ttck {
    pub const BITS_ID: u32 = 27;
    pub const BITS_PREFIX: u32 = 1;
    pub const BITS_ESCAPE: u32 = 1;
    pub const BITS_LAYER: u32 = 18;
    pub const BITS_X: u32 = 9;
    pub const BITS_Y: u32 = 8;

    const SHIFT_PREFIX: u32 = Self::BITS_ID;
    const SHIFT_ESCAPE: u32 = Self::SHIFT_PREFIX + Self::BITS_PREFIX;
    const SHIFT_LAYER: u32 = Self::SHIFT_ESCAPE + Self::BITS_ESCAPE;
    const SHIFT_X: u32 = Self::SHIFT_LAYER + Self::BITS_LAYER;
    const SHIFT_Y: u32 = Self::SHIFT_X + Self::BITS_X;

    pub const MAX_ID: u32 = (1 << Self::BITS_ID) - 1;
    pub const MAX_LAYER: u32 = (1 << Self::BITS_LAYER) - 1;
    pub const MAX_X: u32 = (1 << Self::BITS_X) - 1;
    pub const MAX_Y: u32 = (1 << Self::BITS_Y) - 1;

    /// Pack a key for a tile sub-key with neither the prefix nor escape bit set.
    ///
    /// Out of range fields are masked; callers are expected to have clipped
    /// tile coordinates and validated layer ids beforehand.
    pub const fn new(id: u32, layer: u32, x: u32, y: u32) -> Self {
        Self::with_flags(id, false, false, layer, x, y)
    }

    pub const fn with_flags(
        id: u32,
        prefix: bool,
        escape: bool,
        layer: u32,
        x: u32,
        y: u32,
    ) -> Self {
        let key = (id & Self::MAX_ID) as u64
            | (prefix as u64) << Self::SHIFT_PREFIX
            | (escape as u64) << Self::SHIFT_ESCAPE
            | ((layer & Self::MAX_LAYER) as u64) << Self::SHIFT_LAYER
            | ((x & Self::MAX_X) as u64) << Self::SHIFT_X
            | ((y & Self::MAX_Y) as u64) << Self::SHIFT_Y;
        Self(key)
    }

    pub const fn id(self) -> u32 {
        (self.0 as u32) & Self::MAX_ID
    }

    pub const fn is_prefix(self) -> bool {
        (self.0 >> Self::SHIFT_PREFIX) & 1 != 0
    }

    pub const fn is_escape(self) -> bool {
        (self.0 >> Self::SHIFT_ESCAPE) & 1 != 0
    }

    pub const fn layer(self) -> u32 {
        (self.0 >> Self::SHIFT_LAYER) as u32 & Self::MAX_LAYER
    }

    pub const fn x(self) -> u32 {
        (self.0 >> Self::SHIFT_X) as u32 & Self::MAX_X
    }

    pub const fn y(self) -> u32 {
        (self.0 >> Self::SHIFT_Y) as u32 & Self::MAX_Y
    }

    /// The combined tile coordinate, for comparing whether two keys land on the same tile.
    pub const fn yx(self) -> u32 {
        (self.0 >> Self::SHIFT_X) as u32
    }
}

impl std::fmt::Debug for Ttck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ttck")
            .field("y", &self.y())
            .field("x", &self.x())
            .field("layer", &self.layer())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Ttck;

    #[test]
    fn fields_fill_the_key() {
        assert_eq!(
            Ttck::BITS_ID
                + Ttck::BITS_PREFIX
                + Ttck::BITS_ESCAPE
                + Ttck::BITS_LAYER
                + Ttck::BITS_X
                + Ttck::BITS_Y,
            64
        );
    }

    #[test]
    fn fields_survive_packing() {
        let key = Ttck::with_flags(0x123_4567, true, false, 0x2_abcd, 300, 200);
        assert_eq!(key.id(), 0x123_4567);
        assert!(key.is_prefix());
        assert!(!key.is_escape());
        assert_eq!(key.layer(), 0x2_abcd);
        assert_eq!(key.x(), 300);
        assert_eq!(key.y(), 200);
    }

    #[test]
    fn orders_by_row_then_column_then_layer() {
        let a = Ttck::new(7, 3, 5, 0);
        let b = Ttck::new(1, 9, 5, 0);
        let c = Ttck::new(0, 0, 0, 1);
        assert!(a < b);
        assert!(b < c);
        // Block ids never outrank the layer.
        assert!(Ttck::new(Ttck::MAX_ID, 0, 5, 0) < Ttck::new(0, 1, 5, 0));
        // Columns outrank layers.
        assert!(Ttck::new(0, Ttck::MAX_LAYER, 4, 0) < Ttck::new(0, 0, 5, 0));
    }

    #[test]
    fn same_tile_shares_yx() {
        let a = Ttck::new(1, 2, 10, 11);
        let b = Ttck::new(9, 40, 10, 11);
        let c = Ttck::new(1, 2, 11, 11);
        assert_eq!(a.yx(), b.yx());
        assert_ne!(a.yx(), c.yx());
    }
}
