// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sealing, unsealing and the sort task.

use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;

use super::state::transition;
use super::{CompositionInner, CompositionState, PlaceAtomics};
use crate::recording::{Kernel, Recording};
use crate::{Error, HotSort, Result, Scheduler, TaskId};

impl CompositionInner {
    pub(super) fn seal(self: &Rc<Self>) -> Result<()> {
        let sched = &self.ctx.scheduler;
        match self.state.get() {
            CompositionState::Sealing | CompositionState::Sealed => return Ok(()),
            CompositionState::Unsealing => {
                sched.wait_while("composition unseal", || {
                    self.state.get() == CompositionState::Unsealing
                })?;
                return Self::seal(self);
            }
            CompositionState::Unsealed => transition(&self.state, CompositionState::Sealing)?,
        }
        self.flush()?;
        match self.sort.get() {
            Some(sort) => sched.force(sort),
            None => log::error!("sealing a composition without a sort task"),
        }
        sched.yield_now()
    }

    pub(super) fn unseal(self: &Rc<Self>, reset: bool) -> Result<()> {
        let sched = &self.ctx.scheduler;
        if self.state.get() == CompositionState::Sealing {
            sched.wait_while("composition seal", || {
                self.state.get() == CompositionState::Sealing
            })?;
        }
        match self.state.get() {
            CompositionState::Sealed => {
                transition(&self.state, CompositionState::Unsealing)?;
                sched.wait_while("renders of the composition", || {
                    self.lock_count.load(Ordering::Acquire) > 0
                })?;
                transition(&self.state, CompositionState::Unsealed)?;
                self.sort.set(Some(Self::create_sort_task(self)));
            }
            CompositionState::Unsealing => {
                sched.wait_while("composition unseal", || {
                    self.state.get() == CompositionState::Unsealing
                })?;
            }
            CompositionState::Unsealed | CompositionState::Sealing => {}
        }
        if reset {
            self.reset()?;
        }
        Ok(())
    }

    /// Drop every placed raster and clear the counters. Only legal while unsealed.
    fn reset(self: &Rc<Self>) -> Result<()> {
        require_unsealed(self.state.get())?;
        let sched = &self.ctx.scheduler;
        sched.wait_while("place tasks", || {
            self.places_in_flight.get() > 0 || self.ring.borrow().has_outstanding_snapshot()
        })?;
        let dropped = self.ring.borrow_mut().discard_wip();
        if let Some(place) = self.place.take() {
            sched.retire(place);
        }
        let mut recording = Recording::default();
        recording.clear_all(self.atomics_buf);
        self.ctx.submit(recording, None)?;
        self.atomics.set(PlaceAtomics::default());
        self.bounds.set(None);
        let released = std::mem::take(&mut *self.saved.borrow_mut());
        log::debug!(
            "reset composition: released {} rasters, discarded {dropped} commands",
            released.len()
        );
        drop(released);
        Ok(())
    }

    pub(super) fn create_sort_task(self: &Rc<Self>) -> TaskId {
        let weak = Rc::downgrade(self);
        self.ctx
            .scheduler
            .task("sort")
            .execute(move |sched, task| execute_sort(&weak, sched, task))
            .build()
    }
}

fn require_unsealed(state: CompositionState) -> Result<()> {
    if state == CompositionState::Unsealed {
        Ok(())
    } else {
        Err(Error::IllegalTransition {
            object: "composition",
            from: state.name(),
            to: "reset",
        })
    }
}

fn execute_sort(weak: &Weak<CompositionInner>, sched: &Scheduler, task: TaskId) {
    let Some(comp) = weak.upgrade() else {
        sched.complete(task);
        return;
    };
    let keys = comp.atomics.get().keys;
    if keys == 0 {
        log::debug!("nothing to sort");
        seal_done(&comp);
        sched.complete(task);
        return;
    }

    let ctx = &comp.ctx;
    let sort = HotSort::new(ctx.config.sort_slab_keys);
    let mut recording = Recording::default();
    recording.sort(sort.params(comp.keys, keys));
    recording.clear(comp.atomics_buf, PlaceAtomics::OFFSETS_BYTE_OFFSET, 4);
    recording.dispatch(
        Kernel::Segment,
        keys,
        [comp.keys, comp.atomics_buf, comp.offsets],
    );
    recording.download(comp.atomics_buf);

    let atomics_buf = comp.atomics_buf;
    let weak = weak.clone();
    let done = sched.completion(move |sched, downloads| {
        if let Some(comp) = weak.upgrade() {
            match downloads.read::<PlaceAtomics>(&atomics_buf) {
                Ok(atomics) => comp.atomics.set(atomics),
                Err(err) => log::error!("segment atomics readback failed: {err}"),
            }
            seal_done(&comp);
        }
        sched.complete(task);
    });
    if let Err(err) = ctx.submit(recording, Some(done)) {
        log::error!("failed to submit sort task: {err}");
    }
}

fn seal_done(comp: &CompositionInner) {
    comp.sort.set(None);
    if let Err(err) = transition(&comp.state, CompositionState::Sealed) {
        log::error!("sort task finished on a composition which is not sealing: {err}");
    }
}
