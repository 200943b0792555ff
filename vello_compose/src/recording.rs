// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(NonZeroU64::MIN.saturating_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed)))
    }
}

/// The compute kernels of the compositing pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Kernel {
    /// Expand place commands into sort keys.
    ///
    /// Bindings: block pool, raster table, atomics, keys, commands, [`PlaceConfig`][crate::low_level::PlaceConfig].
    Place,
    /// Find the start of each tile's run of sorted keys.
    ///
    /// Bindings: keys, atomics, offsets.
    Segment,
    /// Composite each tile's keys into the target.
    ///
    /// Bindings: layer table, keys, atomics, offsets, block pool, target, [`RenderConfig`][crate::low_level::RenderConfig].
    Render,
}

impl Kernel {
    pub fn name(self) -> &'static str {
        match self {
            Self::Place => "place",
            Self::Segment => "segment",
            Self::Render => "render",
        }
    }
}

/// List of [`Command`]s for an engine to execute in order.
#[derive(Default)]
pub struct Recording {
    pub commands: Vec<Command>,
}

/// Proxy used as a handle to a buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferProxy {
    pub size: u64,
    pub id: ResourceId,
    pub name: &'static str,
}

/// Proxy used as a handle to an RGBA8 image.
#[derive(Clone, Copy, Debug)]
pub struct ImageProxy {
    pub width: u32,
    pub height: u32,
    pub id: ResourceId,
}

#[derive(Clone, Copy, Debug)]
pub enum ResourceProxy {
    Buffer(BufferProxy),
    Image(ImageProxy),
}

/// Parameters of the external hierarchical sort.
#[derive(Clone, Copy, Debug)]
pub struct SortParams {
    /// Buffer of [`Ttck`][crate::Ttck] keys, sorted in place.
    pub keys: BufferProxy,
    /// Number of valid keys at the start of the buffer.
    pub count: u32,
    /// Number of keys after padding the input up to whole slabs.
    pub padded_in: u32,
    /// Number of keys the sort touches while merging.
    pub padded_out: u32,
}

/// Single command inside a [`Recording`] to get executed by an engine.
pub enum Command {
    /// Commands the data to be uploaded to a new buffer.
    Upload(BufferProxy, Vec<u8>),
    /// Commands the data to be written into a buffer at a byte offset.
    ///
    /// The buffer is created zeroed if the engine has not seen it yet.
    Write(BufferProxy, u64, Vec<u8>),
    /// Commands to clear the buffer from an offset on for a length of the given size.
    /// If the size is [None], it clears until the end.
    Clear(BufferProxy, u64, Option<u64>),
    /// Run a kernel over the given number of work items.
    Dispatch(Kernel, u32, Vec<ResourceProxy>),
    /// Run the external sort.
    Sort(SortParams),
    /// Read back the buffer once the recording has executed.
    Download(BufferProxy),
    /// Read back the image once the recording has executed.
    DownloadImage(ImageProxy),
    /// Take the image from the display system for device writes.
    Acquire(ImageProxy),
    /// Hand the image back to the display system.
    Release(ImageProxy),
    /// Commands to free the buffer.
    FreeBuffer(BufferProxy),
    /// Commands to free the image.
    FreeImage(ImageProxy),
}

impl Recording {
    /// Appends a [`Command`] to the back of the [`Recording`].
    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands to upload the given data to a new buffer with the given name.
    /// Returns a [`BufferProxy`] to the buffer.
    pub fn upload(&mut self, name: &'static str, data: impl Into<Vec<u8>>) -> BufferProxy {
        let data = data.into();
        let buf_proxy = BufferProxy::new(data.len() as u64, name);
        self.push(Command::Upload(buf_proxy, data));
        buf_proxy
    }

    pub fn write(&mut self, buf: BufferProxy, offset: u64, data: impl Into<Vec<u8>>) {
        self.push(Command::Write(buf, offset, data.into()));
    }

    pub fn dispatch<R>(&mut self, kernel: Kernel, work_items: u32, resources: R)
    where
        R: IntoIterator,
        R::Item: Into<ResourceProxy>,
    {
        let r = resources.into_iter().map(|r| r.into()).collect();
        self.push(Command::Dispatch(kernel, work_items, r));
    }

    pub fn sort(&mut self, params: SortParams) {
        self.push(Command::Sort(params));
    }

    /// Prepare a buffer for downloading.
    ///
    /// The contents are captured at this point of the recording, so the
    /// buffer can be freed or overwritten by later commands.
    pub fn download(&mut self, buf: BufferProxy) {
        self.push(Command::Download(buf));
    }

    pub fn download_image(&mut self, image: ImageProxy) {
        self.push(Command::DownloadImage(image));
    }

    /// Commands to clear the whole buffer.
    pub fn clear_all(&mut self, buf: BufferProxy) {
        self.push(Command::Clear(buf, 0, None));
    }

    /// Commands to clear `size` bytes of the buffer, starting at `offset`.
    pub fn clear(&mut self, buf: BufferProxy, offset: u64, size: u64) {
        self.push(Command::Clear(buf, offset, Some(size)));
    }

    pub fn acquire(&mut self, image: ImageProxy) {
        self.push(Command::Acquire(image));
    }

    pub fn release(&mut self, image: ImageProxy) {
        self.push(Command::Release(image));
    }

    /// Commands to free the given buffer.
    pub fn free_buffer(&mut self, buf: BufferProxy) {
        self.push(Command::FreeBuffer(buf));
    }

    /// Commands to free the given image.
    pub fn free_image(&mut self, image: ImageProxy) {
        self.push(Command::FreeImage(image));
    }

    /// Returns a [`Vec`] containing all the [`Command`]s in order.
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

impl BufferProxy {
    pub fn new(size: u64, name: &'static str) -> Self {
        let id = ResourceId::next();
        debug_assert!(size > 0);
        Self { id, size, name }
    }
}

impl ImageProxy {
    pub fn new(width: u32, height: u32) -> Self {
        let id = ResourceId::next();
        Self { width, height, id }
    }
}

impl ResourceProxy {
    pub fn as_buf(&self) -> Option<&BufferProxy> {
        match self {
            Self::Buffer(proxy) => Some(proxy),
            Self::Image(_) => None,
        }
    }
}

impl From<BufferProxy> for ResourceProxy {
    fn from(value: BufferProxy) -> Self {
        Self::Buffer(value)
    }
}

impl From<ImageProxy> for ResourceProxy {
    fn from(value: ImageProxy) -> Self {
        Self::Image(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferProxy, Command, Kernel, Recording, ResourceId};

    #[test]
    fn ids_are_unique() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn dispatch_collects_resources() {
        let mut recording = Recording::default();
        let keys = BufferProxy::new(64, "keys");
        let cmds = recording.upload("cmds", vec![0_u8; 16]);
        recording.dispatch(Kernel::Place, 1, [keys, cmds]);
        let commands = recording.into_commands();
        assert_eq!(commands.len(), 2);
        match &commands[1] {
            Command::Dispatch(Kernel::Place, 1, resources) => {
                assert_eq!(resources.len(), 2);
                assert_eq!(resources[0].as_buf().unwrap().id, keys.id);
            }
            _ => panic!("expected a place dispatch"),
        }
    }
}
