// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::{binding, CpuBinding, CpuTexture};
use crate::engine::DeviceError;
use crate::low_level::{LayerStyle, RenderConfig, TileBlock};
use crate::{PlaceAtomics, Ttck};

/// A premultiplied color.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Premul([f32; 4]);

impl Premul {
    fn unpack(rgba: u32, scale: f32) -> Self {
        let [r, g, b, a] = rgba.to_be_bytes().map(|c| f32::from(c) / 255.0);
        let a = a * scale;
        Self([r * a, g * a, b * a, a])
    }

    fn over(self, dst: Self) -> Self {
        let inv = 1.0 - self.0[3];
        Self(std::array::from_fn(|i| self.0[i] + dst.0[i] * inv))
    }

    fn pack(self) -> u32 {
        let a = self.0[3];
        if a <= 0.0 {
            return 0;
        }
        let straight = [self.0[0] / a, self.0[1] / a, self.0[2] / a, a];
        u32::from_be_bytes(straight.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
    }
}

/// The pixels `[lo, hi)` covered by the tile at `index`, clipped to `[min, max)`.
fn tile_span(index: u32, size_log2: u32, translate: i32, min: i32, max: i32) -> (i32, i32) {
    let lo = (i64::from(index) << size_log2) + i64::from(translate);
    let hi = lo + (1_i64 << size_log2);
    let (min, max) = (i64::from(min.max(0)), i64::from(max));
    let max = max.max(min);
    (lo.clamp(min, max) as i32, hi.clamp(min, max) as i32)
}

#[allow(clippy::too_many_arguments)]
fn render_main(
    n: u32,
    config: &RenderConfig,
    layers: &[LayerStyle],
    keys: &[Ttck],
    atomics: &PlaceAtomics,
    offsets: &[u32],
    blocks: &[TileBlock],
    target: &mut CpuTexture,
) -> Result<(), DeviceError> {
    if !target.acquired {
        return Err(DeviceError::NotAcquired);
    }
    let [cx0, cy0, cx1, cy1] = config.clip;
    let x_max = cx1.min(target.width as i32);
    let y_max = cy1.min(target.height as i32);
    let key_count = (atomics.keys as usize).min(keys.len());
    let layers = &layers[..(config.layer_count as usize).min(layers.len())];
    let runs = n.min(atomics.offsets) as usize;
    for run in 0..runs {
        let start = *offsets
            .get(run)
            .ok_or(DeviceError::OutOfBounds("offsets", "render"))? as usize;
        let Some(first) = keys.get(start).filter(|_| start < key_count) else {
            continue;
        };
        // Keys are sorted, so the tile's run ends where the tile changes.
        let mut color = Premul::default();
        let mut ix = start;
        while ix < key_count && keys[ix].yx() == first.yx() {
            let key = keys[ix];
            ix += 1;
            let Some(style) = layers.get(key.layer() as usize).filter(|s| s.is_enabled()) else {
                continue;
            };
            let block = blocks
                .get(key.id() as usize)
                .ok_or(DeviceError::OutOfBounds("block_pool", "render"))?;
            let coverage = block.coverage.min(255) as f32 / 255.0;
            color = Premul::unpack(style.rgba, coverage).over(color);
        }
        if color.0[3] <= 0.0 {
            continue;
        }

        let (px0, px1) = tile_span(first.x(), config.tile_width_log2, config.translate[0], cx0, x_max);
        let (py0, py1) = tile_span(first.y(), config.tile_height_log2, config.translate[1], cy0, y_max);
        for y in py0..py1 {
            for x in px0..px1 {
                let pixel = &mut target.pixels[y as usize * target.width + x as usize];
                *pixel = color.over(Premul::unpack(*pixel, 1.0)).pack();
            }
        }
    }
    Ok(())
}

pub fn render(n: u32, resources: &[CpuBinding<'_>]) -> Result<(), DeviceError> {
    let layers = binding(resources, 0)?.as_slice::<LayerStyle>()?;
    let keys = binding(resources, 1)?.as_slice::<Ttck>()?;
    let atomics = binding(resources, 2)?.as_typed::<PlaceAtomics>()?;
    let offsets = binding(resources, 3)?.as_slice::<u32>()?;
    let blocks = binding(resources, 4)?.as_slice::<TileBlock>()?;
    let mut target = binding(resources, 5)?.as_tex_mut()?;
    let config = binding(resources, 6)?.as_typed::<RenderConfig>()?;
    render_main(
        n,
        &config,
        &layers,
        &keys,
        &atomics,
        &offsets,
        &blocks,
        &mut target,
    )
}

#[cfg(test)]
mod tests {
    use super::{render_main, tile_span, Premul};
    use crate::cpu::CpuTexture;
    use crate::engine::DeviceError;
    use crate::low_level::{LayerStyle, RenderConfig, TileBlock};
    use crate::{PlaceAtomics, Ttck};

    fn config(width: u32, height: u32) -> RenderConfig {
        RenderConfig {
            clip: [0, 0, width as i32, height as i32],
            translate: [0, 0],
            target_width: width,
            target_height: height,
            tile_width_log2: 1,
            tile_height_log2: 1,
            layer_count: 4,
            _pad: 0,
        }
    }

    fn target(width: usize, height: usize) -> CpuTexture {
        CpuTexture {
            width,
            height,
            pixels: vec![0; width * height],
            acquired: true,
        }
    }

    fn opaque() -> TileBlock {
        TileBlock {
            x: 0,
            y: 0,
            coverage: 255,
            _pad: 0,
        }
    }

    #[test]
    fn higher_layers_are_on_top() {
        let layers = [
            LayerStyle::solid(0xff_00_00_ff),
            LayerStyle::solid(0x00_00_ff_ff),
        ];
        // Tile (0, 0) has both layers, tile (1, 0) only the lower one.
        let keys = [
            Ttck::new(0, 0, 0, 0),
            Ttck::new(1, 1, 0, 0),
            Ttck::new(2, 0, 1, 0),
        ];
        let atomics = PlaceAtomics {
            keys: 3,
            offsets: 2,
            ..Default::default()
        };
        let blocks = [opaque(); 3];
        let mut target = target(4, 2);
        render_main(
            2,
            &config(4, 2),
            &layers,
            &keys,
            &atomics,
            &[0, 2],
            &blocks,
            &mut target,
        )
        .unwrap();
        assert_eq!(
            target.pixels,
            [
                0x00_00_ff_ff,
                0x00_00_ff_ff,
                0xff_00_00_ff,
                0xff_00_00_ff,
                0x00_00_ff_ff,
                0x00_00_ff_ff,
                0xff_00_00_ff,
                0xff_00_00_ff,
            ]
        );
    }

    #[test]
    fn disabled_layers_and_clip() {
        let layers = [LayerStyle::default(), LayerStyle::solid(0x00_ff_00_ff)];
        let keys = [Ttck::new(0, 0, 0, 0), Ttck::new(1, 1, 1, 0)];
        let atomics = PlaceAtomics {
            keys: 2,
            offsets: 2,
            ..Default::default()
        };
        let blocks = [opaque(); 2];
        let mut config = config(4, 2);
        config.clip = [0, 0, 3, 1];
        let mut target = target(4, 2);
        render_main(
            2,
            &config,
            &layers,
            &keys,
            &atomics,
            &[0, 1],
            &blocks,
            &mut target,
        )
        .unwrap();
        assert_eq!(target.pixels, [0, 0, 0x00_ff_00_ff, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn far_translations_draw_nothing() {
        let layers = [LayerStyle::solid(0xff_ff_ff_ff)];
        let keys = [Ttck::new(0, 0, Ttck::MAX_X, Ttck::MAX_Y)];
        let atomics = PlaceAtomics {
            keys: 1,
            offsets: 1,
            ..Default::default()
        };
        for translate in [[i32::MAX - 4, 0], [0, i32::MAX], [i32::MIN, i32::MIN]] {
            let mut config = config(4, 2);
            config.translate = translate;
            let mut target = target(4, 2);
            render_main(
                1,
                &config,
                &layers,
                &keys,
                &atomics,
                &[0],
                &[opaque()],
                &mut target,
            )
            .unwrap();
            assert_eq!(target.pixels, [0; 8]);
        }
        assert_eq!(tile_span(3, 1, -4, 0, 8), (2, 4));
        assert_eq!(tile_span(0, 1, 0, 3, 1), (3, 3));
    }

    #[test]
    fn layers_beyond_the_layer_count_are_skipped() {
        let layers = [LayerStyle::solid(0xff_00_00_ff), LayerStyle::solid(0x00_ff_00_ff)];
        let keys = [Ttck::new(0, 1, 0, 0)];
        let atomics = PlaceAtomics {
            keys: 1,
            offsets: 1,
            ..Default::default()
        };
        let mut config = config(2, 2);
        config.layer_count = 1;
        let mut target = target(2, 2);
        render_main(
            1,
            &config,
            &layers,
            &keys,
            &atomics,
            &[0],
            &[opaque()],
            &mut target,
        )
        .unwrap();
        assert_eq!(target.pixels, [0; 4]);
    }

    #[test]
    fn target_must_be_acquired() {
        let mut target = target(2, 2);
        target.acquired = false;
        let err = render_main(
            0,
            &config(2, 2),
            &[],
            &[],
            &PlaceAtomics::default(),
            &[],
            &[],
            &mut target,
        );
        assert_eq!(err, Err(DeviceError::NotAcquired));
    }

    #[test]
    fn partial_coverage_blends() {
        let half = Premul::unpack(0xff_ff_ff_ff, 0.5);
        assert_eq!(half.pack(), 0xff_ff_ff_80);
        assert_eq!(half.over(Premul::unpack(0x00_00_00_ff, 1.0)).pack(), 0x80_80_80_ff);
    }
}
