// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::Ttck;

/// A half-open rectangle of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl TileRect {
    /// Every tile coordinate which can be encoded in a [`Ttck`].
    pub const ADDRESSABLE: Self = Self {
        x0: 0,
        y0: 0,
        x1: Ttck::MAX_X as i32 + 1,
        y1: Ttck::MAX_Y as i32 + 1,
    };

    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Move the rectangle, saturating at the edges of the `i32` range.
    #[must_use]
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x0: self.x0.saturating_add(dx),
            y0: self.y0.saturating_add(dy),
            x1: self.x1.saturating_add(dx),
            y1: self.y1.saturating_add(dy),
        }
    }

    /// The smallest rectangle covering every point in `points`.
    pub(crate) fn covering(points: impl IntoIterator<Item = (i32, i32)>) -> Option<Self> {
        points.into_iter().fold(None, |acc, (x, y)| {
            let tile = Self::new(x, y, x.saturating_add(1), y.saturating_add(1));
            Some(acc.map_or(tile, |acc: Self| acc.union(&tile)))
        })
    }
}

/// Convert a translation in sub-pixels to whole tiles, rounding towards negative infinity.
pub(crate) fn subpixels_to_tiles(subpixels: i32, shift: u32) -> i32 {
    subpixels >> shift
}

#[cfg(test)]
mod tests {
    use super::{subpixels_to_tiles, TileRect};

    #[test]
    fn union_skips_empty() {
        let empty = TileRect::new(4, 4, 4, 4);
        let a = TileRect::new(0, 0, 2, 2);
        assert_eq!(empty.union(&a), a);
        assert_eq!(a.union(&empty), a);
        assert_eq!(
            a.union(&TileRect::new(5, 1, 6, 3)),
            TileRect::new(0, 0, 6, 3)
        );
    }

    #[test]
    fn covering_points() {
        assert_eq!(TileRect::covering(std::iter::empty()), None);
        assert_eq!(
            TileRect::covering([(1, 2), (3, 0)]),
            Some(TileRect::new(1, 0, 4, 3))
        );
    }

    #[test]
    fn translation_saturates_at_the_edges() {
        let edge = TileRect::covering([(i32::MAX - 1, 0)]).unwrap();
        assert_eq!(edge, TileRect::new(i32::MAX - 1, 0, i32::MAX, 1));
        assert_eq!(
            edge.translate(4, i32::MIN),
            TileRect::new(i32::MAX, i32::MIN, i32::MAX, i32::MIN + 1)
        );
        assert!(!TileRect::ADDRESSABLE.contains(edge.translate(4, 0).x0, 0));
    }

    #[test]
    fn negative_translation_floors() {
        assert_eq!(subpixels_to_tiles(-1, 8), -1);
        assert_eq!(subpixels_to_tiles(255, 8), 0);
        assert_eq!(subpixels_to_tiles(256, 8), 1);
    }
}
