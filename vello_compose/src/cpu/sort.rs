// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::engine::DeviceError;
use crate::low_level::SortParams;
use crate::Ttck;

/// Sort the first `count` keys in place.
///
/// Like the device sort, this pads the input with maximal keys and requires
/// room for the padded output, so undersized key buffers fault here too.
pub fn hotsort(keys: &mut [Ttck], params: &SortParams) -> Result<(), DeviceError> {
    if params.padded_out as usize > keys.len() || params.count > params.padded_in {
        return Err(DeviceError::OutOfBounds(params.keys.name, "sort"));
    }
    let keys = &mut keys[..params.padded_in as usize];
    keys[params.count as usize..].fill(Ttck(u64::MAX));
    keys.sort_unstable();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::hotsort;
    use crate::low_level::BufferProxy;
    use crate::{HotSort, Ttck};

    #[test]
    fn sorts_by_tile_then_layer() {
        let proxy = BufferProxy::new(8 * 8, "keys");
        let mut keys = vec![Ttck::default(); 8];
        keys[..3].copy_from_slice(&[
            Ttck::new(0, 0, 0, 1),
            Ttck::new(1, 9, 5, 0),
            Ttck::new(2, 3, 5, 0),
        ]);
        hotsort(&mut keys, &HotSort::new(4).params(proxy, 3)).unwrap();
        assert_eq!(
            keys[..3],
            [
                Ttck::new(2, 3, 5, 0),
                Ttck::new(1, 9, 5, 0),
                Ttck::new(0, 0, 0, 1)
            ]
        );
        assert_eq!(keys[3], Ttck(u64::MAX));
    }

    #[test]
    fn undersized_buffer_faults() {
        let proxy = BufferProxy::new(8 * 4, "keys");
        let mut keys = vec![Ttck::default(); 4];
        assert!(hotsort(&mut keys, &HotSort::new(4).params(proxy, 5)).is_err());
    }
}
