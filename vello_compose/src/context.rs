// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::raster::{RasterEntry, RasterPool, TileBlock};
use crate::recording::{BufferProxy, ImageProxy, Recording};
use crate::{
    Completion, ComposeConfig, Composition, Engine, Error, Raster, RasterTile, Result, Scheduler,
    Styling, Target,
};

/// The root object which everything else is created from.
///
/// A context owns the scheduler, the device engine, and the buffers shared by
/// every composition: the tile block pool and the raster table.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Rc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) id: u64,
    pub(crate) config: ComposeConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) rasters: Rc<RasterPool>,
    pub(crate) block_pool: BufferProxy,
    pub(crate) raster_table: BufferProxy,
    engine: RefCell<Box<dyn Engine>>,
}

impl ContextInner {
    pub(crate) fn submit(&self, recording: Recording, on_complete: Option<Completion>) -> Result<()> {
        if recording.is_empty() && on_complete.is_none() {
            return Ok(());
        }
        log::trace!("submitting {} commands", recording.commands.len());
        self.engine.borrow_mut().submit(recording, on_complete)
    }

    pub(crate) fn check_owned(&self, context: u64, what: &'static str) -> Result<()> {
        if context == self.id {
            Ok(())
        } else {
            Err(Error::ForeignResource(what))
        }
    }
}

impl Context {
    /// Create a context which submits its device work to `engine`.
    pub fn new(engine: impl Engine + 'static, config: ComposeConfig) -> Result<Self> {
        config.validate()?;
        static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);
        let id = CONTEXT_IDS.fetch_add(1, Ordering::Relaxed);
        let scheduler = Scheduler::new();
        let rasters = Rc::new(RasterPool::new(
            id,
            config.raster_capacity,
            config.block_pool_blocks,
            scheduler.clone(),
        ));
        let block_pool = BufferProxy::new(
            u64::from(config.block_pool_blocks) * size_of::<TileBlock>() as u64,
            "block_pool",
        );
        let raster_table = BufferProxy::new(
            u64::from(config.raster_capacity) * size_of::<RasterEntry>() as u64,
            "raster_table",
        );
        log::debug!("created context {id} with {config:?}");
        Ok(Self {
            inner: Rc::new(ContextInner {
                id,
                config,
                scheduler,
                rasters,
                block_pool,
                raster_table,
                engine: RefCell::new(Box::new(engine)),
            }),
        })
    }

    /// Create a context backed by the reference [`CpuEngine`][crate::cpu::CpuEngine].
    #[cfg(feature = "cpu")]
    pub fn new_cpu(config: ComposeConfig) -> Result<Self> {
        Self::new(crate::cpu::CpuEngine::new(), config)
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Create a raster covering the given tiles.
    ///
    /// The tiles are uploaded lazily, the first time a composition that
    /// places the raster is sealed.
    pub fn create_raster(&self, tiles: &[RasterTile]) -> Result<Raster> {
        Raster::create(&self.inner, tiles)
    }

    pub fn create_composition(&self) -> Result<Composition> {
        Composition::new(&self.inner)
    }

    pub fn create_styling(&self) -> Styling {
        Styling::new(&self.inner)
    }

    /// Create a display target of the given size in pixels.
    pub fn create_target(&self, width: u32, height: u32) -> Result<Target> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidConfig("target size must be non-zero"));
        }
        Ok(Target::new(&self.inner, ImageProxy::new(width, height)))
    }

    /// Read back the pixels of a target, blocking until they arrive.
    ///
    /// Pixels are RGBA8 packed into `u32`s, row by row. Only renders whose
    /// notification has already fired are guaranteed to be visible.
    pub fn read_target(&self, target: &Target) -> Result<Vec<u32>> {
        self.inner.check_owned(target.context, "target")?;
        let pixels = Rc::new(RefCell::new(None));
        let mut recording = Recording::default();
        recording.download_image(target.proxy);
        let proxy = target.proxy;
        let result = pixels.clone();
        let done = self.inner.scheduler.completion(move |_, mut downloads| {
            *result.borrow_mut() = Some(downloads.take_image(&proxy));
        });
        self.inner.submit(recording, Some(done))?;
        self.inner
            .scheduler
            .wait_while("target readback", || pixels.borrow().is_none())?;
        pixels
            .take()
            .unwrap_or(Err(Error::Stalled("target readback")))
    }

    /// Run everything which is ready without blocking.
    pub fn yield_now(&self) -> Result<()> {
        self.inner.scheduler.yield_now()
    }

    /// Block until all forced work has finished.
    pub fn wait(&self) -> Result<()> {
        self.inner.scheduler.wait()
    }

    /// Number of rasters which are still referenced.
    pub fn live_rasters(&self) -> usize {
        self.inner.rasters.live()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let mut recording = Recording::default();
        recording.free_buffer(self.block_pool);
        recording.free_buffer(self.raster_table);
        // Nothing can observe a failure at this point.
        let _ = self.engine.get_mut().submit(recording, None);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}
