// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The layer table read by the render kernel.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::context::ContextInner;
use crate::recording::{BufferProxy, Recording};
use crate::{Error, Result, Scheduler, TaskId};

/// How a layer is composited.
///
/// This must be kept in sync with the render kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct LayerStyle {
    /// Solid color, packed as `0xRRGGBBAA`.
    pub rgba: u32,
    pub flags: u32,
}

impl LayerStyle {
    /// The layer is drawn. Layers without this flag are skipped.
    pub const ENABLED: u32 = 1;

    pub fn solid(rgba: u32) -> Self {
        Self {
            rgba,
            flags: Self::ENABLED,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flags & Self::ENABLED != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StylingState {
    Unsealed,
    /// The layer table is being uploaded.
    Sealing,
    Sealed,
}

impl StylingState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unsealed => "unsealed",
            Self::Sealing => "sealing",
            Self::Sealed => "sealed",
        }
    }
}

/// Per-layer styles for rendering a composition.
pub struct Styling {
    inner: Rc<StylingInner>,
}

pub(crate) struct StylingInner {
    ctx: Rc<ContextInner>,
    state: Cell<StylingState>,
    layers: RefCell<Vec<LayerStyle>>,
    lock_count: AtomicU32,
    build: Cell<Option<TaskId>>,
    pub(crate) table: BufferProxy,
}

impl Styling {
    pub(crate) fn new(ctx: &Rc<ContextInner>) -> Self {
        let capacity = ctx.config.layer_capacity;
        Self {
            inner: Rc::new(StylingInner {
                ctx: ctx.clone(),
                state: Cell::new(StylingState::Unsealed),
                layers: RefCell::new(vec![LayerStyle::default(); capacity as usize]),
                lock_count: AtomicU32::new(0),
                build: Cell::new(None),
                table: BufferProxy::new(
                    u64::from(capacity) * size_of::<LayerStyle>() as u64,
                    "layer_table",
                ),
            }),
        }
    }

    /// Draw `layer` with a solid color, unsealing the styling if needed.
    pub fn set_layer(&self, layer: u32, rgba: u32) -> Result<()> {
        self.inner.set(layer, LayerStyle::solid(rgba))
    }

    /// Stop drawing `layer`, unsealing the styling if needed.
    pub fn clear_layer(&self, layer: u32) -> Result<()> {
        self.inner.set(layer, LayerStyle::default())
    }

    pub fn layer(&self, layer: u32) -> Option<LayerStyle> {
        self.inner.layers.borrow().get(layer as usize).copied()
    }

    /// Upload the layer table. Sealing a styling which is sealing or sealed does nothing.
    pub fn seal(&self) -> Result<()> {
        StylingInner::seal(&self.inner)
    }

    /// Reopen the styling for changes, waiting for renders which read it.
    pub fn unseal(&self) -> Result<()> {
        self.inner.unseal()
    }

    pub fn state(&self) -> StylingState {
        self.inner.state.get()
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &Rc<StylingInner> {
        &self.inner
    }
}

impl StylingInner {
    pub(crate) fn context_id(&self) -> u64 {
        self.ctx.id
    }

    pub(crate) fn state(&self) -> StylingState {
        self.state.get()
    }

    pub(crate) fn build_task(&self) -> Option<TaskId> {
        self.build.get()
    }

    fn set(&self, layer: u32, style: LayerStyle) -> Result<()> {
        let capacity = self.layers.borrow().len() as u32;
        if layer >= capacity {
            return Err(Error::LayerOutOfRange {
                layer,
                max: capacity - 1,
            });
        }
        self.unseal()?;
        self.layers.borrow_mut()[layer as usize] = style;
        Ok(())
    }

    fn transition(&self, to: StylingState) -> Result<()> {
        let from = self.state.get();
        let legal = matches!(
            (from, to),
            (StylingState::Unsealed, StylingState::Sealing)
                | (StylingState::Sealing, StylingState::Sealed)
                | (StylingState::Sealed, StylingState::Unsealed)
        );
        if !legal {
            log::error!(
                "illegal styling transition from {} to {}",
                from.name(),
                to.name()
            );
            return Err(Error::IllegalTransition {
                object: "styling",
                from: from.name(),
                to: to.name(),
            });
        }
        log::debug!("styling {} -> {}", from.name(), to.name());
        self.state.set(to);
        Ok(())
    }

    pub(crate) fn seal(self: &Rc<Self>) -> Result<()> {
        if self.state.get() != StylingState::Unsealed {
            return Ok(());
        }
        self.transition(StylingState::Sealing)?;
        let weak = Rc::downgrade(self);
        let sched = &self.ctx.scheduler;
        let task = sched
            .task("styling")
            .execute(move |sched, task| execute_build(&weak, sched, task))
            .build();
        self.build.set(Some(task));
        sched.force(task);
        sched.yield_now()
    }

    fn unseal(&self) -> Result<()> {
        let sched = &self.ctx.scheduler;
        match self.state.get() {
            StylingState::Unsealed => Ok(()),
            StylingState::Sealing | StylingState::Sealed => {
                sched.wait_while("styling seal", || {
                    self.state.get() == StylingState::Sealing
                })?;
                sched.wait_while("renders of the styling", || {
                    self.lock_count.load(Ordering::Acquire) > 0
                })?;
                self.transition(StylingState::Unsealed)
            }
        }
    }

    /// Lock the styling against changes, sealing it first if needed.
    pub(crate) fn lock(self: &Rc<Self>) -> Result<()> {
        Self::seal(self)?;
        self.lock_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn unlock(&self) {
        let prev = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced styling unlock");
    }
}

fn execute_build(weak: &Weak<StylingInner>, sched: &Scheduler, task: TaskId) {
    let Some(styling) = weak.upgrade() else {
        sched.complete(task);
        return;
    };
    let table = bytemuck::cast_slice::<LayerStyle, u8>(&styling.layers.borrow()).to_vec();
    let mut recording = Recording::default();
    recording.write(styling.table, 0, table);
    let weak = weak.clone();
    let done = sched.completion(move |sched, _| {
        if let Some(styling) = weak.upgrade() {
            styling.build.set(None);
            if let Err(err) = styling.transition(StylingState::Sealed) {
                log::error!("styling build finished while not sealing: {err}");
            }
        }
        sched.complete(task);
    });
    if let Err(err) = styling.ctx.submit(recording, Some(done)) {
        log::error!("failed to submit styling upload: {err}");
    }
}

impl Drop for StylingInner {
    fn drop(&mut self) {
        if let Some(build) = self.build.take() {
            self.ctx.scheduler.retire(build);
        }
        let mut recording = Recording::default();
        recording.free_buffer(self.table);
        if let Err(err) = self.ctx.submit(recording, None) {
            log::warn!("failed to free layer table: {err}");
        }
    }
}

impl std::fmt::Debug for Styling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Styling")
            .field("state", &self.state())
            .field("lock_count", &self.lock_count())
            .finish_non_exhaustive()
    }
}
