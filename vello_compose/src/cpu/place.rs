// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::{binding, CpuBinding};
use crate::engine::DeviceError;
use crate::low_level::{PlaceConfig, RasterEntry, TileBlock};
use crate::tile::subpixels_to_tiles;
use crate::{PlaceAtomics, PlaceCmd, TileRect, Ttck};

fn place_main(
    config: &PlaceConfig,
    blocks: &[TileBlock],
    rasters: &[RasterEntry],
    atomics: &mut PlaceAtomics,
    keys: &mut [Ttck],
    cmds: &[PlaceCmd],
) -> Result<(), DeviceError> {
    let [x0, y0, x1, y1] = config.clip;
    let clip = TileRect::new(x0, y0, x1, y1).intersect(&TileRect::ADDRESSABLE);
    let capacity = (config.keys_capacity as usize).min(keys.len());
    let cmds = cmds
        .get(..config.cmd_count as usize)
        .ok_or(DeviceError::OutOfBounds("place_cmds", "place"))?;
    for cmd in cmds {
        let entry = rasters
            .get(cmd.raster as usize)
            .ok_or(DeviceError::OutOfBounds("raster_table", "place"))?;
        let dx = subpixels_to_tiles(cmd.tx, config.tile_shift_x);
        let dy = subpixels_to_tiles(cmd.ty, config.tile_shift_y);
        for block_id in entry.block_offset..entry.block_offset + entry.block_count {
            let block = blocks
                .get(block_id as usize)
                .ok_or(DeviceError::OutOfBounds("block_pool", "place"))?;
            let (x, y) = (block.x.saturating_add(dx), block.y.saturating_add(dy));
            if !clip.contains(x, y) {
                continue;
            }
            let ix = atomics.keys as usize;
            if ix < capacity {
                keys[ix] = Ttck::new(block_id, cmd.layer_id, x as u32, y as u32);
                atomics.keys += 1;
            } else {
                atomics.failed += 1;
            }
        }
    }
    Ok(())
}

pub fn place(_n: u32, resources: &[CpuBinding<'_>]) -> Result<(), DeviceError> {
    let blocks = binding(resources, 0)?.as_slice::<TileBlock>()?;
    let rasters = binding(resources, 1)?.as_slice::<RasterEntry>()?;
    let mut atomics = binding(resources, 2)?.as_typed_mut::<PlaceAtomics>()?;
    let mut keys = binding(resources, 3)?.as_slice_mut::<Ttck>()?;
    let cmds = binding(resources, 4)?.as_slice::<PlaceCmd>()?;
    let config = binding(resources, 5)?.as_typed::<PlaceConfig>()?;
    place_main(&config, &blocks, &rasters, &mut atomics, &mut keys, &cmds)
}

#[cfg(test)]
mod tests {
    use super::place_main;
    use crate::low_level::{PlaceConfig, RasterEntry, TileBlock};
    use crate::{PlaceAtomics, PlaceCmd, Ttck};

    fn block(x: i32, y: i32) -> TileBlock {
        TileBlock {
            x,
            y,
            coverage: 255,
            _pad: 0,
        }
    }

    fn config(keys_capacity: u32, cmd_count: u32) -> PlaceConfig {
        PlaceConfig {
            clip: [0, 0, i32::MAX, i32::MAX],
            cmd_count,
            keys_capacity,
            tile_shift_x: 8,
            tile_shift_y: 8,
        }
    }

    #[test]
    fn translated_blocks_become_keys() {
        let blocks = [block(0, 0), block(1, 0)];
        let rasters = [RasterEntry {
            block_offset: 0,
            block_count: 2,
        }];
        let cmds = [PlaceCmd {
            raster: 0,
            layer_id: 7,
            tx: 2 << 8,
            ty: 3 << 8,
        }];
        let mut atomics = PlaceAtomics::default();
        let mut keys = [Ttck::default(); 4];
        place_main(&config(4, 1), &blocks, &rasters, &mut atomics, &mut keys, &cmds).unwrap();
        assert_eq!(atomics.keys, 2);
        assert_eq!(keys[0], Ttck::new(0, 7, 2, 3));
        assert_eq!(keys[1], Ttck::new(1, 7, 3, 3));
    }

    #[test]
    fn clipped_and_overflowing_keys() {
        let blocks = [block(-1, 0), block(0, 0), block(1, 0), block(2, 0)];
        let rasters = [RasterEntry {
            block_offset: 0,
            block_count: 4,
        }];
        let cmds = [PlaceCmd {
            raster: 0,
            layer_id: 0,
            tx: 0,
            ty: 0,
        }];
        let mut atomics = PlaceAtomics::default();
        let mut keys = [Ttck::default(); 2];
        place_main(&config(2, 1), &blocks, &rasters, &mut atomics, &mut keys, &cmds).unwrap();
        // The block at x = -1 is outside of the addressable tiles.
        assert_eq!(atomics.keys, 2);
        assert_eq!(atomics.failed, 1);
    }

    #[test]
    fn edge_blocks_are_clipped_not_wrapped() {
        let blocks = [block(i32::MAX - 1, 0), block(i32::MIN, 0)];
        let rasters = [RasterEntry {
            block_offset: 0,
            block_count: 2,
        }];
        let cmds = [
            PlaceCmd {
                raster: 0,
                layer_id: 0,
                tx: 4 << 8,
                ty: 0,
            },
            PlaceCmd {
                raster: 0,
                layer_id: 0,
                tx: -(4 << 8),
                ty: 0,
            },
        ];
        let mut atomics = PlaceAtomics::default();
        let mut keys = [Ttck::default(); 4];
        place_main(&config(4, 2), &blocks, &rasters, &mut atomics, &mut keys, &cmds).unwrap();
        assert_eq!(atomics, PlaceAtomics::default());
    }

    #[test]
    fn unknown_raster_faults() {
        let cmds = [PlaceCmd {
            raster: 3,
            layer_id: 0,
            tx: 0,
            ty: 0,
        }];
        let mut atomics = PlaceAtomics::default();
        let err = place_main(&config(1, 1), &[], &[], &mut atomics, &mut [], &cmds).unwrap_err();
        assert_eq!(
            err,
            crate::DeviceError::OutOfBounds("raster_table", "place")
        );
    }
}
