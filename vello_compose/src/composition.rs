// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compositions: placed rasters, sorted into per-tile runs of keys.

mod place;
mod seal;
mod state;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::context::ContextInner;
use crate::recording::{BufferProxy, Recording};
use crate::ring::{CommandRing, Snapshot};
use crate::{Raster, Result, TaskId, TaskSlot, TileRect, Ttck};

pub use place::PlaceConfig;
pub use state::CompositionState;

/// Counters maintained by the place and segment kernels.
///
/// This must be kept in sync with the kernels which update it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PlaceAtomics {
    /// Number of keys written by the place kernel.
    pub keys: u32,
    /// Number of tile runs found by the segment kernel.
    pub offsets: u32,
    /// Number of keys dropped because the key buffer was full.
    pub failed: u32,
    pub _pad: u32,
}

impl PlaceAtomics {
    pub(crate) const OFFSETS_BYTE_OFFSET: u64 = 4;
}

/// A set of placed rasters, sorted by tile and layer once sealed.
///
/// Placing rasters requires the composition to be unsealed, and rendering it
/// requires it to be sealed; both transitions happen implicitly where needed.
pub struct Composition {
    inner: Rc<CompositionInner>,
}

pub(crate) struct CompositionInner {
    ctx: Rc<ContextInner>,
    state: Cell<CompositionState>,
    ring: RefCell<CommandRing>,
    atomics: Cell<PlaceAtomics>,
    saved: RefCell<Vec<Raster>>,
    lock_count: AtomicU32,
    /// The lazy place task accepting new commands, if any.
    place: TaskSlot,
    /// The snapshot handed to a place task which has not executed yet.
    handoff: RefCell<Option<(TaskId, Snapshot)>>,
    places_in_flight: Cell<u32>,
    sort: Cell<Option<TaskId>>,
    clip: Cell<TileRect>,
    bounds: Cell<Option<TileRect>>,
    pub(crate) keys: BufferProxy,
    pub(crate) atomics_buf: BufferProxy,
    pub(crate) offsets: BufferProxy,
}

impl Composition {
    pub(crate) fn new(ctx: &Rc<ContextInner>) -> Result<Self> {
        let config = &ctx.config;
        let keys = BufferProxy::new(
            u64::from(config.keys_capacity) * size_of::<Ttck>() as u64,
            "keys",
        );
        let atomics_buf = BufferProxy::new(size_of::<PlaceAtomics>() as u64, "place_atomics");
        let offsets = BufferProxy::new(u64::from(config.offsets_capacity) * 4, "offsets");
        let mut recording = Recording::default();
        recording.clear_all(atomics_buf);
        ctx.submit(recording, None)?;

        let inner = Rc::new(CompositionInner {
            ctx: ctx.clone(),
            state: Cell::new(CompositionState::Unsealed),
            ring: RefCell::new(CommandRing::new(config.ring_capacity)),
            atomics: Cell::new(PlaceAtomics::default()),
            saved: RefCell::default(),
            lock_count: AtomicU32::new(0),
            place: TaskSlot::default(),
            handoff: RefCell::new(None),
            places_in_flight: Cell::new(0),
            sort: Cell::new(None),
            clip: Cell::new(TileRect::ADDRESSABLE),
            bounds: Cell::new(None),
            keys,
            atomics_buf,
            offsets,
        });
        inner.sort.set(Some(CompositionInner::create_sort_task(&inner)));
        Ok(Self { inner })
    }

    /// Place each raster on the corresponding layer, translated by `tx` and
    /// `ty` sub-pixels.
    ///
    /// A sealed composition is unsealed first, which waits for renders still
    /// reading it. When the command ring is full, this pumps the scheduler
    /// until a place task has consumed the batched commands.
    ///
    /// On error nothing has been placed or retained.
    pub fn place(
        &self,
        rasters: &[Raster],
        layer_ids: &[u32],
        tx: Option<&[i32]>,
        ty: Option<&[i32]>,
    ) -> Result<()> {
        CompositionInner::place(&self.inner, rasters, layer_ids, tx, ty)
    }

    /// Flush batched commands and start sorting them.
    ///
    /// This does not wait for the composition to become [`Sealed`]; renders
    /// and other blocking calls wait as needed. Sealing a composition which is
    /// sealing or sealed does nothing.
    ///
    /// [`Sealed`]: CompositionState::Sealed
    pub fn seal(&self) -> Result<()> {
        CompositionInner::seal(&self.inner)
    }

    /// Reopen the composition for placing, waiting for renders which read it.
    ///
    /// With `reset`, every placed raster is released and the counters are
    /// cleared, as if the composition had just been created.
    pub fn unseal(&self, reset: bool) -> Result<()> {
        CompositionInner::unseal(&self.inner, reset)
    }

    /// The tiles covered by placed rasters, or `None` if nothing is placed.
    pub fn bounds(&self) -> Option<TileRect> {
        self.inner.bounds.get()
    }

    /// Restrict keys produced by place tasks which have not executed yet to `clip`.
    pub fn set_clip(&self, clip: TileRect) {
        self.inner.clip.set(clip.intersect(&TileRect::ADDRESSABLE));
    }

    pub fn state(&self) -> CompositionState {
        self.inner.state.get()
    }

    /// The counters as of the most recent readback.
    pub fn atomics(&self) -> PlaceAtomics {
        self.inner.atomics.get()
    }

    /// Number of renders which currently read this composition.
    pub fn lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::Acquire)
    }

    /// Read back the sorted keys, sealing and waiting as needed.
    pub fn fragments(&self) -> Result<Vec<Ttck>> {
        CompositionInner::fragments(&self.inner)
    }

    /// Release the composition once no render reads it any more.
    ///
    /// Dropping a composition releases it without waiting.
    pub fn release(self) -> Result<()> {
        self.inner.unseal(true)
    }

    pub(crate) fn inner(&self) -> &Rc<CompositionInner> {
        &self.inner
    }
}

impl CompositionInner {
    pub(crate) fn context_id(&self) -> u64 {
        self.ctx.id
    }

    pub(crate) fn state(&self) -> CompositionState {
        self.state.get()
    }

    pub(crate) fn atomics(&self) -> PlaceAtomics {
        self.atomics.get()
    }

    pub(crate) fn sort_task(&self) -> Option<TaskId> {
        self.sort.get()
    }

    /// Lock the composition against unsealing, sealing it first if needed.
    pub(crate) fn lock(self: &Rc<Self>) -> Result<()> {
        if self.state.get() == CompositionState::Unsealed {
            Self::seal(self)?;
        }
        self.lock_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn unlock(&self) {
        let prev = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced composition unlock");
    }

    fn fragments(self: &Rc<Self>) -> Result<Vec<Ttck>> {
        Self::seal(self)?;
        let sched = &self.ctx.scheduler;
        sched.wait_while("composition seal", || {
            self.state.get() != CompositionState::Sealed
        })?;
        let count = self.atomics.get().keys as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        let keys = self.keys;
        let mut recording = Recording::default();
        recording.download(keys);
        let done = sched.completion(move |_, downloads| {
            *sink.borrow_mut() = Some(downloads.read_slice::<Ttck>(&keys, count));
        });
        self.ctx.submit(recording, Some(done))?;
        sched.wait_while("key readback", || result.borrow().is_none())?;
        result
            .take()
            .unwrap_or(Err(crate::Error::Stalled("key readback")))
    }
}

impl Drop for CompositionInner {
    fn drop(&mut self) {
        let sched = &self.ctx.scheduler;
        if let Some(place) = self.place.take() {
            sched.retire(place);
        }
        if let Some(sort) = self.sort.take() {
            sched.retire(sort);
        }
        let mut recording = Recording::default();
        recording.free_buffer(self.keys);
        recording.free_buffer(self.atomics_buf);
        recording.free_buffer(self.offsets);
        if let Err(err) = self.ctx.submit(recording, None) {
            log::warn!("failed to free composition buffers: {err}");
        }
    }
}

impl std::fmt::Debug for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composition")
            .field("state", &self.state())
            .field("atomics", &self.atomics())
            .field("lock_count", &self.lock_count())
            .finish_non_exhaustive()
    }
}
