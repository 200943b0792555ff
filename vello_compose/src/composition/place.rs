// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Batching place commands and the place task.

use std::rc::{Rc, Weak};

use bytemuck::{Pod, Zeroable};

use super::{CompositionInner, CompositionState, PlaceAtomics};
use crate::recording::{Kernel, Recording};
use crate::tile::subpixels_to_tiles;
use crate::{Error, PlaceCmd, Raster, Result, Scheduler, TaskId, TileRect, Ttck};

/// Uniforms of the place kernel.
///
/// This must be kept in sync with the place kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PlaceConfig {
    /// Tiles outside of `[x0, y0, x1, y1)` produce no keys.
    pub clip: [i32; 4],
    /// Number of commands in the batch.
    pub cmd_count: u32,
    /// Number of keys the key buffer can hold.
    pub keys_capacity: u32,
    /// Shift from horizontal sub-pixels to tiles.
    pub tile_shift_x: u32,
    /// Shift from vertical sub-pixels to tiles.
    pub tile_shift_y: u32,
}

impl CompositionInner {
    pub(super) fn place(
        self: &Rc<Self>,
        rasters: &[Raster],
        layer_ids: &[u32],
        tx: Option<&[i32]>,
        ty: Option<&[i32]>,
    ) -> Result<()> {
        let count = rasters.len();
        check_len("layer_ids", count, layer_ids.len())?;
        if let Some(tx) = tx {
            check_len("tx", count, tx.len())?;
        }
        if let Some(ty) = ty {
            check_len("ty", count, ty.len())?;
        }
        for raster in rasters {
            self.ctx.check_owned(raster.context_id(), "raster")?;
        }
        if let Some(&layer) = layer_ids.iter().find(|&&l| l > Ttck::MAX_LAYER) {
            return Err(Error::LayerOutOfRange {
                layer,
                max: Ttck::MAX_LAYER,
            });
        }
        if count == 0 {
            return Ok(());
        }

        self.ensure_unsealed()?;

        let config = &self.ctx.config;
        let shift_x = config.subpixel_log2 + config.tile_width_log2;
        let shift_y = config.subpixel_log2 + config.tile_height_log2;
        let cmds: Vec<PlaceCmd> = (0..count)
            .map(|i| PlaceCmd {
                raster: rasters[i].id().index(),
                layer_id: layer_ids[i],
                tx: tx.map_or(0, |tx| tx[i]),
                ty: ty.map_or(0, |ty| ty[i]),
            })
            .collect();

        let mut bounds = self.bounds.get().unwrap_or(TileRect::new(0, 0, 0, 0));
        for (raster, cmd) in rasters.iter().zip(&cmds) {
            let placed = raster.bounds().translate(
                subpixels_to_tiles(cmd.tx, shift_x),
                subpixels_to_tiles(cmd.ty, shift_y),
            );
            bounds = bounds.union(&placed);
        }
        self.bounds.set(Some(bounds));
        self.saved.borrow_mut().extend(rasters.iter().cloned());

        let sched = &self.ctx.scheduler;
        let mut written = 0;
        while written < count {
            let reserved = self.ring.borrow().try_reserve((count - written) as u32);
            let Some(span) = reserved else {
                // Wake once a place task has consumed a whole snapshot.
                self.flush()?;
                sched.wait_while("command ring space", || self.ring.borrow().is_full())?;
                continue;
            };
            let len = span.len() as usize;
            let task = self.active_place_task();
            for raster in &rasters[written..written + len] {
                sched.happens_after(task, raster.external());
            }
            self.ring
                .borrow_mut()
                .commit(span, &cmds[written..written + len]);
            written += len;
            if self.ring.borrow().is_full() {
                self.flush()?;
            }
        }
        sched.yield_now()
    }

    /// Wait until the composition accepts commands, unsealing it if needed.
    fn ensure_unsealed(self: &Rc<Self>) -> Result<()> {
        loop {
            match self.state.get() {
                CompositionState::Unsealed => return Ok(()),
                CompositionState::Sealed => self.unseal(false)?,
                CompositionState::Sealing | CompositionState::Unsealing => {
                    let state = self.state.get();
                    self.ctx
                        .scheduler
                        .wait_while("composition state change", || self.state.get() == state)?;
                }
            }
        }
    }

    /// The lazy place task for new commands, creating it if needed.
    fn active_place_task(self: &Rc<Self>) -> TaskId {
        if let Some(task) = self.place.get() {
            return task;
        }
        let weak = Rc::downgrade(self);
        let task = self
            .ctx
            .scheduler
            .task("place")
            .invalidates(&self.place)
            .execute(move |sched, task| execute_place(&weak, sched, task))
            .build();
        if let Some(sort) = self.sort.get() {
            self.ctx.scheduler.happens_after(sort, task);
        }
        task
    }

    /// Snapshot the commands written since the last snapshot and force their
    /// place task to run.
    pub(super) fn flush(self: &Rc<Self>) -> Result<()> {
        if self.ring.borrow().wip() == 0 {
            return Ok(());
        }
        let sched = &self.ctx.scheduler;
        sched.wait_while("previous snapshot", || {
            self.ring.borrow().has_outstanding_snapshot()
        })?;
        let Some(task) = self.place.take() else {
            log::error!("commands were written without a place task");
            return Ok(());
        };
        if let Some(snapshot) = self.ring.borrow_mut().checkpoint_and_snapshot() {
            log::trace!("handing {} commands to {task:?}", snapshot.len());
            *self.handoff.borrow_mut() = Some((task, snapshot));
        }
        sched.force(task);
        Ok(())
    }

    fn take_snapshot(&self, task: TaskId) -> Option<crate::ring::Snapshot> {
        let mut handoff = self.handoff.borrow_mut();
        match handoff.take() {
            Some((owner, snapshot)) if owner == task => Some(snapshot),
            other => {
                *handoff = other;
                None
            }
        }
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::LengthMismatch {
            what,
            expected,
            actual,
        })
    }
}

fn execute_place(weak: &Weak<CompositionInner>, sched: &Scheduler, task: TaskId) {
    let Some(comp) = weak.upgrade() else {
        sched.complete(task);
        return;
    };
    let Some(snapshot) = comp.take_snapshot(task) else {
        sched.complete(task);
        return;
    };
    let ctx = &comp.ctx;
    let config = &ctx.config;
    let cmds: Vec<PlaceCmd> = {
        let ring = comp.ring.borrow();
        let (lo, hi) = ring.snapshot_cmds(&snapshot);
        lo.iter().chain(hi).copied().collect()
    };
    let clip = comp.clip.get();
    let uniforms = PlaceConfig {
        clip: [clip.x0, clip.y0, clip.x1, clip.y1],
        cmd_count: cmds.len() as u32,
        keys_capacity: config.keys_capacity,
        tile_shift_x: config.subpixel_log2 + config.tile_width_log2,
        tile_shift_y: config.subpixel_log2 + config.tile_height_log2,
    };

    let mut recording = Recording::default();
    let cmd_buf = recording.upload("place_cmds", bytemuck::cast_slice::<_, u8>(&cmds));
    let config_buf = recording.upload("place_config", bytemuck::bytes_of(&uniforms));
    recording.dispatch(
        Kernel::Place,
        uniforms.cmd_count,
        [
            ctx.block_pool,
            ctx.raster_table,
            comp.atomics_buf,
            comp.keys,
            cmd_buf,
            config_buf,
        ],
    );
    recording.download(comp.atomics_buf);
    recording.free_buffer(cmd_buf);
    recording.free_buffer(config_buf);
    // The commands now live in the recording.
    comp.ring.borrow_mut().release(snapshot);
    comp.places_in_flight.set(comp.places_in_flight.get() + 1);

    let atomics_buf = comp.atomics_buf;
    let weak = weak.clone();
    let done = sched.completion(move |sched, downloads| {
        if let Some(comp) = weak.upgrade() {
            comp.places_in_flight.set(comp.places_in_flight.get() - 1);
            match downloads.read::<PlaceAtomics>(&atomics_buf) {
                Ok(atomics) => {
                    if atomics.failed > comp.atomics.get().failed {
                        log::warn!(
                            "key buffer full: {} keys dropped so far",
                            atomics.failed
                        );
                    }
                    comp.atomics.set(atomics);
                }
                Err(err) => log::error!("place atomics readback failed: {err}"),
            }
        }
        sched.complete(task);
    });
    if let Err(err) = ctx.submit(recording, Some(done)) {
        log::error!("failed to submit place task: {err}");
    }
}
