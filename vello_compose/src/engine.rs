// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The contract between the pipeline and a device backend.

use std::collections::HashMap;

use bytemuck::Pod;
use thiserror::Error;

use crate::recording::{BufferProxy, ImageProxy, Recording, ResourceId};
use crate::{Completion, Result};

/// A device backend which executes [`Recording`]s.
///
/// Submission must not block on device work. When `on_complete` is given, the
/// engine posts it exactly once after every command of the recording has
/// executed, with the data of every `Download` and `DownloadImage` command.
/// Posting is the only thing an engine may do with a [`Completion`]: the
/// pipeline reacts to it on the host thread.
pub trait Engine {
    fn submit(&mut self, recording: Recording, on_complete: Option<Completion>) -> Result<()>;
}

/// A failure of the device or driver.
///
/// There is no recovery from these: the first one poisons the
/// [`Scheduler`][crate::Scheduler] of the context which observed it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    /// The device went away, or dropped a completion without posting it.
    #[error("device lost")]
    Lost,
    /// A command referred to a buffer or image the device does not hold.
    #[error("resource '{0}' is not resident on the device")]
    MissingResource(&'static str),
    /// A kernel or copy accessed memory outside of a buffer.
    #[error("'{0}' accessed out of bounds by {1}")]
    OutOfBounds(&'static str, &'static str),
    /// A kernel was bound to a resource it cannot use.
    #[error("binding '{0}' is invalid: {1}")]
    InvalidBinding(&'static str, String),
    /// An image was written without being acquired from the display system first.
    #[error("image written while not acquired")]
    NotAcquired,
}

/// Data read back by a submission.
#[derive(Default, Debug)]
pub struct Downloads {
    buffers: HashMap<ResourceId, Vec<u8>>,
    images: HashMap<ResourceId, Vec<u32>>,
}

impl Downloads {
    pub fn insert_buffer(&mut self, id: ResourceId, data: Vec<u8>) {
        self.buffers.insert(id, data);
    }

    pub fn insert_image(&mut self, id: ResourceId, pixels: Vec<u32>) {
        self.images.insert(id, pixels);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    pub fn buffer(&self, buf: &BufferProxy) -> Option<&[u8]> {
        self.buffers.get(&buf.id).map(Vec::as_slice)
    }

    /// Read a single value from the start of a downloaded buffer.
    pub fn read<T: Pod>(&self, buf: &BufferProxy) -> Result<T> {
        let bytes = self
            .buffer(buf)
            .ok_or(crate::Error::UnavailableBuffer(buf.name, "download"))?;
        let size = size_of::<T>();
        if bytes.len() < size {
            return Err(crate::Error::UnavailableBuffer(buf.name, "read"));
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Read `count` values from the start of a downloaded buffer.
    pub fn read_slice<T: Pod>(&self, buf: &BufferProxy, count: usize) -> Result<Vec<T>> {
        let bytes = self
            .buffer(buf)
            .ok_or(crate::Error::UnavailableBuffer(buf.name, "download"))?;
        let size = size_of::<T>();
        if bytes.len() < size * count {
            return Err(crate::Error::UnavailableBuffer(buf.name, "read"));
        }
        Ok(bytes[..size * count]
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Take the pixels of a downloaded image, packed as RGBA8 in `u32`s.
    pub fn take_image(&mut self, image: &ImageProxy) -> Result<Vec<u32>> {
        self.images
            .remove(&image.id)
            .ok_or(crate::Error::UnavailableBuffer("target", "image download"))
    }
}

#[cfg(test)]
mod tests {
    use super::Downloads;
    use crate::recording::BufferProxy;
    use crate::Error;

    #[test]
    fn read_typed_values() {
        let buf = BufferProxy::new(12, "atomics");
        let mut downloads = Downloads::default();
        downloads.insert_buffer(buf.id, bytemuck::cast_slice(&[3_u32, 4, 5]).to_vec());
        assert_eq!(downloads.read::<u32>(&buf).unwrap(), 3);
        assert_eq!(downloads.read_slice::<u32>(&buf, 3).unwrap(), [3, 4, 5]);
        assert_eq!(
            downloads.read_slice::<u32>(&buf, 4),
            Err(Error::UnavailableBuffer("atomics", "read"))
        );
    }

    #[test]
    fn missing_download_is_an_error() {
        let buf = BufferProxy::new(4, "keys");
        assert_eq!(
            Downloads::default().read::<u32>(&buf),
            Err(Error::UnavailableBuffer("keys", "download"))
        );
    }
}
