// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A reference [`Engine`] which runs the pipeline's kernels on the CPU.
//!
//! Recordings execute in submission order on a dedicated driver thread, which
//! posts each submission's [`Completion`] when it is done. This is useful for
//! testing and debugging; it is not intended to be fast.

mod place;
mod render;
mod segment;
mod sort;

pub use place::place;
pub use render::render;
pub use segment::segment;
pub use sort::hotsort;

use std::any::type_name;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytemuck::Pod;

use crate::engine::{DeviceError, Downloads};
use crate::recording::{BufferProxy, Command, ImageProxy, Kernel, Recording, ResourceId, ResourceProxy};
use crate::{Completion, Engine, Error, Result, Ttck};

#[derive(Clone, Copy)]
pub enum CpuBinding<'a> {
    Buffer(&'a RefCell<CpuBuffer>),
    Texture(&'a RefCell<CpuTexture>),
}

impl<'a> CpuBinding<'a> {
    fn buffer(self) -> Result<&'a RefCell<CpuBuffer>, DeviceError> {
        match self {
            CpuBinding::Buffer(b) => Ok(b),
            CpuBinding::Texture(_) => Err(DeviceError::InvalidBinding(
                "texture",
                "expected a buffer".into(),
            )),
        }
    }

    pub fn as_typed<T: Pod>(self) -> Result<Ref<'a, T>, DeviceError> {
        let buf = self.buffer()?.borrow();
        let name = buf.name;
        Ref::filter_map(buf, |b| b.value::<T>()).map_err(|_| mismatch::<T>(name))
    }

    pub fn as_typed_mut<T: Pod>(self) -> Result<RefMut<'a, T>, DeviceError> {
        let buf = self.buffer()?.borrow_mut();
        let name = buf.name;
        RefMut::filter_map(buf, |b| b.value_mut::<T>()).map_err(|_| mismatch::<T>(name))
    }

    pub fn as_slice<T: Pod>(self) -> Result<Ref<'a, [T]>, DeviceError> {
        let buf = self.buffer()?.borrow();
        let name = buf.name;
        Ref::filter_map(buf, |b| b.slice::<T>()).map_err(|_| mismatch::<T>(name))
    }

    pub fn as_slice_mut<T: Pod>(self) -> Result<RefMut<'a, [T]>, DeviceError> {
        let buf = self.buffer()?.borrow_mut();
        let name = buf.name;
        RefMut::filter_map(buf, |b| b.slice_mut::<T>()).map_err(|_| mismatch::<T>(name))
    }

    pub fn as_tex_mut(self) -> Result<RefMut<'a, CpuTexture>, DeviceError> {
        match self {
            CpuBinding::Texture(t) => Ok(t.borrow_mut()),
            CpuBinding::Buffer(b) => Err(DeviceError::InvalidBinding(
                b.borrow().name,
                "expected a texture".into(),
            )),
        }
    }
}

fn mismatch<T>(name: &'static str) -> DeviceError {
    DeviceError::InvalidBinding(name, format!("cannot be viewed as {}", type_name::<T>()))
}

/// The binding at `index`, which kernels require to be present.
fn binding<'a, 'b>(
    resources: &'b [CpuBinding<'a>],
    index: usize,
) -> Result<&'b CpuBinding<'a>, DeviceError> {
    resources.get(index).ok_or_else(|| {
        DeviceError::InvalidBinding("missing", format!("no resource bound at {index}"))
    })
}

/// Storage for a buffer, kept in `u64` words so that any [`Pod`] view is aligned.
pub struct CpuBuffer {
    name: &'static str,
    words: Vec<u64>,
    len: usize,
}

impl CpuBuffer {
    fn zeroed(name: &'static str, len: usize) -> Self {
        Self {
            name,
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    fn from_bytes(name: &'static str, data: &[u8]) -> Self {
        let mut buf = Self::zeroed(name, data.len());
        buf.bytes_mut().copy_from_slice(data);
        buf
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    fn value<T: Pod>(&self) -> Option<&T> {
        bytemuck::try_from_bytes(self.bytes().get(..size_of::<T>())?).ok()
    }

    fn value_mut<T: Pod>(&mut self) -> Option<&mut T> {
        bytemuck::try_from_bytes_mut(self.bytes_mut().get_mut(..size_of::<T>())?).ok()
    }

    fn slice<T: Pod>(&self) -> Option<&[T]> {
        let bytes = self.bytes();
        let len = bytes.len() / size_of::<T>() * size_of::<T>();
        bytemuck::try_cast_slice(&bytes[..len]).ok()
    }

    fn slice_mut<T: Pod>(&mut self) -> Option<&mut [T]> {
        let bytes = self.bytes_mut();
        let len = bytes.len() / size_of::<T>() * size_of::<T>();
        bytemuck::try_cast_slice_mut(&mut bytes[..len]).ok()
    }

    fn range(&mut self, offset: u64, len: usize, op: &'static str) -> Result<&mut [u8], DeviceError> {
        let name = self.name;
        let start = usize::try_from(offset).map_err(|_| DeviceError::OutOfBounds(name, op))?;
        self.bytes_mut()
            .get_mut(start..start.saturating_add(len))
            .ok_or(DeviceError::OutOfBounds(name, op))
    }
}

/// An RGBA8 image, one `0xRRGGBBAA` value per pixel.
pub struct CpuTexture {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u32>,
    /// Whether the device currently owns the image.
    pub acquired: bool,
}

impl CpuTexture {
    fn new(proxy: ImageProxy) -> Self {
        let (width, height) = (proxy.width as usize, proxy.height as usize);
        Self {
            width,
            height,
            pixels: vec![0; width * height],
            acquired: false,
        }
    }
}

/// Counters of the work submitted to a [`CpuEngine`].
///
/// These are counted at submission, so they are exact once the scheduler is idle.
#[derive(Clone, Default, Debug)]
pub struct EngineStats {
    inner: Arc<StatsInner>,
}

#[derive(Default, Debug)]
struct StatsInner {
    submissions: AtomicU64,
    place: AtomicU64,
    segment: AtomicU64,
    render: AtomicU64,
    sorts: AtomicU64,
}

impl EngineStats {
    pub fn submissions(&self) -> u64 {
        self.inner.submissions.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self, kernel: Kernel) -> u64 {
        self.counter(kernel).load(Ordering::Relaxed)
    }

    /// Number of kernel launches, including sorts.
    pub fn kernel_launches(&self) -> u64 {
        self.dispatches(Kernel::Place)
            + self.dispatches(Kernel::Segment)
            + self.dispatches(Kernel::Render)
            + self.sorts()
    }

    pub fn sorts(&self) -> u64 {
        self.inner.sorts.load(Ordering::Relaxed)
    }

    fn counter(&self, kernel: Kernel) -> &AtomicU64 {
        match kernel {
            Kernel::Place => &self.inner.place,
            Kernel::Segment => &self.inner.segment,
            Kernel::Render => &self.inner.render,
        }
    }

    fn count(&self, recording: &Recording) {
        self.inner.submissions.fetch_add(1, Ordering::Relaxed);
        for command in &recording.commands {
            match command {
                Command::Dispatch(kernel, _, _) => {
                    self.counter(*kernel).fetch_add(1, Ordering::Relaxed);
                }
                Command::Sort(_) => {
                    self.inner.sorts.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }
}

struct Submission {
    recording: Recording,
    on_complete: Option<Completion>,
}

/// The reference CPU engine.
pub struct CpuEngine {
    queue: Option<Sender<Submission>>,
    driver: Option<JoinHandle<()>>,
    stats: EngineStats,
}

impl CpuEngine {
    pub fn new() -> Self {
        let (queue, submissions) = mpsc::channel();
        let driver = std::thread::Builder::new()
            .name("vello_compose cpu driver".into())
            .spawn(move || drive(submissions));
        let driver = match driver {
            Ok(driver) => Some(driver),
            Err(err) => {
                // Every submission will report a lost device.
                log::error!("failed to spawn cpu driver thread: {err}");
                None
            }
        };
        Self {
            queue: driver.is_some().then_some(queue),
            driver,
            stats: EngineStats::default(),
        }
    }

    /// A handle to the counters of this engine, which stays valid after the
    /// engine has moved into a [`Context`][crate::Context].
    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CpuEngine {
    fn submit(&mut self, recording: Recording, on_complete: Option<Completion>) -> Result<()> {
        self.stats.count(&recording);
        let queue = self.queue.as_ref().ok_or(DeviceError::Lost)?;
        queue
            .send(Submission {
                recording,
                on_complete,
            })
            .map_err(|_| Error::Device(DeviceError::Lost))
    }
}

impl Drop for CpuEngine {
    fn drop(&mut self) {
        // Closing the queue stops the driver once it has drained.
        self.queue = None;
        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                log::error!("cpu driver thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for CpuEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuEngine")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Device {
    buffers: HashMap<ResourceId, RefCell<CpuBuffer>>,
    images: HashMap<ResourceId, RefCell<CpuTexture>>,
}

fn drive(submissions: Receiver<Submission>) {
    let mut device = Device::default();
    while let Ok(Submission {
        recording,
        on_complete,
    }) = submissions.recv()
    {
        let result = device.run(recording);
        if let Err(err) = &result {
            log::error!("cpu device fault: {err}");
        }
        if let Some(on_complete) = on_complete {
            on_complete.post(result);
        }
    }
}

impl Device {
    fn run(&mut self, recording: Recording) -> Result<Downloads, DeviceError> {
        let mut downloads = Downloads::default();
        for command in recording.into_commands() {
            match command {
                Command::Upload(proxy, data) => {
                    self.buffers
                        .insert(proxy.id, RefCell::new(CpuBuffer::from_bytes(proxy.name, &data)));
                }
                Command::Write(proxy, offset, data) => {
                    let buf = self.buffer(&proxy).get_mut();
                    buf.range(offset, data.len(), "write")?.copy_from_slice(&data);
                }
                Command::Clear(proxy, offset, size) => {
                    let buf = self.buffer(&proxy).get_mut();
                    let size = match size {
                        Some(size) => size as usize,
                        None => buf.len.saturating_sub(offset as usize),
                    };
                    buf.range(offset, size, "clear")?.fill(0);
                }
                Command::Dispatch(kernel, n, resources) => self.dispatch(kernel, n, &resources)?,
                Command::Sort(params) => {
                    let keys = self.buffer(&params.keys);
                    let mut keys = CpuBinding::Buffer(keys).as_slice_mut::<Ttck>()?;
                    hotsort(&mut keys, &params)?;
                }
                Command::Download(proxy) => {
                    let data = self.buffer(&proxy).get_mut().bytes().to_vec();
                    downloads.insert_buffer(proxy.id, data);
                }
                Command::DownloadImage(proxy) => {
                    let pixels = self.image(proxy).get_mut().pixels.clone();
                    downloads.insert_image(proxy.id, pixels);
                }
                Command::Acquire(proxy) => {
                    let image = self.image(proxy).get_mut();
                    if image.acquired {
                        return Err(DeviceError::InvalidBinding(
                            "target",
                            "acquired twice".into(),
                        ));
                    }
                    image.acquired = true;
                }
                Command::Release(proxy) => {
                    self.image(proxy).get_mut().acquired = false;
                }
                Command::FreeBuffer(proxy) => {
                    self.buffers.remove(&proxy.id);
                }
                Command::FreeImage(proxy) => {
                    self.images.remove(&proxy.id);
                }
            }
        }
        Ok(downloads)
    }

    /// The buffer behind `proxy`, created zeroed on first use.
    fn buffer(&mut self, proxy: &BufferProxy) -> &mut RefCell<CpuBuffer> {
        self.buffers
            .entry(proxy.id)
            .or_insert_with(|| RefCell::new(CpuBuffer::zeroed(proxy.name, proxy.size as usize)))
    }

    /// The image behind `proxy`, created transparent on first use.
    fn image(&mut self, proxy: ImageProxy) -> &mut RefCell<CpuTexture> {
        self.images
            .entry(proxy.id)
            .or_insert_with(|| RefCell::new(CpuTexture::new(proxy)))
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        n: u32,
        resources: &[ResourceProxy],
    ) -> Result<(), DeviceError> {
        for resource in resources {
            match resource {
                ResourceProxy::Buffer(proxy) => {
                    self.buffer(proxy);
                }
                ResourceProxy::Image(proxy) => {
                    self.image(*proxy);
                }
            }
        }
        let mut bindings = Vec::with_capacity(resources.len());
        for resource in resources {
            let binding = match resource {
                ResourceProxy::Buffer(proxy) => self
                    .buffers
                    .get(&proxy.id)
                    .map(CpuBinding::Buffer)
                    .ok_or(DeviceError::MissingResource(proxy.name))?,
                ResourceProxy::Image(proxy) => self
                    .images
                    .get(&proxy.id)
                    .map(CpuBinding::Texture)
                    .ok_or(DeviceError::MissingResource("target"))?,
            };
            bindings.push(binding);
        }
        log::trace!("cpu dispatch {} over {n} items", kernel.name());
        let shader: fn(u32, &[CpuBinding<'_>]) -> Result<(), DeviceError> = match kernel {
            Kernel::Place => place,
            Kernel::Segment => segment,
            Kernel::Render => render,
        };
        shader(n, &bindings)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::{CpuBinding, CpuBuffer};
    use crate::engine::DeviceError;

    #[test]
    fn typed_views_are_checked() {
        let buf = RefCell::new(CpuBuffer::zeroed("atomics", 12));
        let binding = CpuBinding::Buffer(&buf);
        assert_eq!(binding.as_slice::<u32>().unwrap().len(), 3);
        // Whole elements only.
        assert_eq!(binding.as_slice::<u64>().unwrap().len(), 1);
        assert!(matches!(
            binding.as_typed::<[u64; 2]>(),
            Err(DeviceError::InvalidBinding("atomics", _))
        ));
    }

    #[test]
    fn ranges_are_bounds_checked() {
        let mut buf = CpuBuffer::zeroed("keys", 16);
        assert!(buf.range(8, 8, "write").is_ok());
        assert_eq!(
            buf.range(12, 8, "write").unwrap_err(),
            DeviceError::OutOfBounds("keys", "write")
        );
    }
}
