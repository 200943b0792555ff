// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::{binding, CpuBinding};
use crate::engine::DeviceError;
use crate::{PlaceAtomics, Ttck};

/// Record the index of the first key of every tile.
///
/// Runs beyond the capacity of `offsets` are dropped, but still counted.
fn segment_main(n: u32, keys: &[Ttck], atomics: &mut PlaceAtomics, offsets: &mut [u32]) {
    let count = (n.min(atomics.keys) as usize).min(keys.len());
    let mut runs = 0;
    for ix in 0..count {
        if ix == 0 || keys[ix].yx() != keys[ix - 1].yx() {
            if let Some(offset) = offsets.get_mut(runs) {
                *offset = ix as u32;
            }
            runs += 1;
        }
    }
    if runs > offsets.len() {
        log::warn!("{runs} tiles but only {} offsets", offsets.len());
    }
    atomics.offsets = runs.min(offsets.len()) as u32;
}

pub fn segment(n: u32, resources: &[CpuBinding<'_>]) -> Result<(), DeviceError> {
    let keys = binding(resources, 0)?.as_slice::<Ttck>()?;
    let mut atomics = binding(resources, 1)?.as_typed_mut::<PlaceAtomics>()?;
    let mut offsets = binding(resources, 2)?.as_slice_mut::<u32>()?;
    segment_main(n, &keys, &mut atomics, &mut offsets);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::segment_main;
    use crate::{PlaceAtomics, Ttck};

    #[test]
    fn runs_start_where_tiles_change() {
        let keys = [
            Ttck::new(0, 0, 0, 0),
            Ttck::new(1, 1, 0, 0),
            Ttck::new(2, 0, 5, 0),
            Ttck::new(3, 0, 0, 1),
            Ttck::new(4, 2, 0, 1),
        ];
        let mut atomics = PlaceAtomics {
            keys: 5,
            ..Default::default()
        };
        let mut offsets = [u32::MAX; 4];
        segment_main(5, &keys, &mut atomics, &mut offsets);
        assert_eq!(atomics.offsets, 3);
        assert_eq!(offsets[..3], [0, 2, 3]);
    }

    #[test]
    fn offsets_are_clamped() {
        let keys = [Ttck::new(0, 0, 0, 0), Ttck::new(0, 0, 1, 0)];
        let mut atomics = PlaceAtomics {
            keys: 2,
            ..Default::default()
        };
        let mut offsets = [0; 1];
        segment_main(2, &keys, &mut atomics, &mut offsets);
        assert_eq!(atomics.offsets, 1);
    }
}
