// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rasters: counted handles to tile blocks resident in the shared block pool.
//!
//! Each raster owns a contiguous run of [`TileBlock`]s and one [`RasterEntry`]
//! in the raster table. Both are written by a lazy producer task, which is
//! registered with the scheduler as the producer of the raster's
//! [`ExternalId`] so that anything reading the raster can happen after it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytemuck::{Pod, Zeroable};

use crate::block_pool::BestFit;
use crate::context::ContextInner;
use crate::grid::ExternalId;
use crate::recording::Recording;
use crate::{Error, Result, Scheduler, TaskId, TileRect};

/// One tile of coverage, as produced by rasterization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RasterTile {
    /// Tile column.
    pub x: i32,
    /// Tile row.
    pub y: i32,
    /// Coverage of the tile, from 0 to 255.
    pub coverage: u8,
}

impl RasterTile {
    pub fn new(x: i32, y: i32, coverage: u8) -> Self {
        Self { x, y, coverage }
    }
}

/// A tile block as stored in the block pool.
///
/// This must be kept in sync with the kernels which read the block pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct TileBlock {
    pub x: i32,
    pub y: i32,
    pub coverage: u32,
    pub _pad: u32,
}

/// The raster table entry locating a raster's blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RasterEntry {
    pub block_offset: u32,
    pub block_count: u32,
}

/// An arena index of a raster. Stale ids never alias a newer raster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterId {
    index: u32,
    generation: u32,
}

impl RasterId {
    /// The index of the raster in the raster table.
    pub fn index(self) -> u32 {
        self.index
    }
}

/// A counted reference to a raster.
///
/// Cloning retains the raster and dropping releases it. Once the last handle
/// is gone, the raster's blocks and table entry are returned to the pool.
pub struct Raster {
    pool: Rc<RasterPool>,
    id: RasterId,
}

struct RasterState {
    refs: u32,
    block_offset: u32,
    block_count: u32,
    bounds: TileRect,
    external: ExternalId,
    producer: Option<TaskId>,
}

struct Slot {
    generation: u32,
    raster: Option<RasterState>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub(crate) struct RasterPool {
    context: u64,
    capacity: u32,
    scheduler: Scheduler,
    blocks: RefCell<BestFit>,
    slots: RefCell<Slots>,
}

impl RasterPool {
    pub(crate) fn new(context: u64, capacity: u32, blocks: u32, scheduler: Scheduler) -> Self {
        Self {
            context,
            capacity,
            scheduler,
            blocks: RefCell::new(BestFit::new(blocks)),
            slots: RefCell::default(),
        }
    }

    /// Number of rasters alive in the pool.
    pub(crate) fn live(&self) -> usize {
        let slots = self.slots.borrow();
        slots.slots.len() - slots.free.len()
    }

    pub(crate) fn available_blocks(&self) -> u32 {
        self.blocks.borrow().available()
    }

    fn alloc(&self, blocks: u32, bounds: TileRect) -> Result<(RasterId, u32)> {
        let mut slots = self.slots.borrow_mut();
        if slots.free.is_empty() && slots.slots.len() as u32 >= self.capacity {
            return Err(Error::RasterTableFull {
                capacity: self.capacity,
            });
        }
        let block_offset = self
            .blocks
            .borrow_mut()
            .alloc(blocks)
            .ok_or(Error::BlockPoolExhausted { requested: blocks })?;
        let state = RasterState {
            refs: 1,
            block_offset,
            block_count: blocks,
            bounds,
            external: ExternalId::next(),
            producer: None,
        };
        let id = if let Some(index) = slots.free.pop() {
            let slot = &mut slots.slots[index as usize];
            slot.raster = Some(state);
            RasterId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = slots.slots.len() as u32;
            slots.slots.push(Slot {
                generation: 0,
                raster: Some(state),
            });
            RasterId {
                index,
                generation: 0,
            }
        };
        Ok((id, block_offset))
    }

    fn with<R>(&self, id: RasterId, f: impl FnOnce(&mut RasterState) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.raster.as_mut().map(f)
    }

    fn retain(&self, id: RasterId) {
        self.with(id, |raster| raster.refs += 1);
    }

    fn release(&self, id: RasterId) {
        let freed = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.slots.get_mut(id.index as usize) else {
                return;
            };
            if slot.generation != id.generation {
                return;
            }
            let Some(raster) = slot.raster.as_mut() else {
                return;
            };
            raster.refs -= 1;
            if raster.refs > 0 {
                return;
            }
            let raster = slot.raster.take();
            slot.generation = slot.generation.wrapping_add(1);
            slots.free.push(id.index);
            raster
        };
        if let Some(raster) = freed {
            log::trace!("freeing raster {id:?}");
            self.blocks
                .borrow_mut()
                .free(raster.block_offset, raster.block_count);
            if let Some(producer) = raster.producer {
                self.scheduler.retire(producer);
            }
            self.scheduler.unmap_external(raster.external);
        }
    }
}

impl Raster {
    /// Create a raster from its tiles and register its producer task.
    pub(crate) fn create(ctx: &Rc<ContextInner>, tiles: &[RasterTile]) -> Result<Self> {
        let bounds =
            TileRect::covering(tiles.iter().map(|t| (t.x, t.y))).ok_or(Error::EmptyRaster)?;
        let count = tiles.len() as u32;
        let pool = ctx.rasters.clone();
        let (id, block_offset) = pool.alloc(count, bounds)?;
        let raster = Self { pool, id };

        let blocks: Vec<TileBlock> = tiles
            .iter()
            .map(|t| TileBlock {
                x: t.x,
                y: t.y,
                coverage: u32::from(t.coverage),
                _pad: 0,
            })
            .collect();
        let entry = RasterEntry {
            block_offset,
            block_count: count,
        };
        let weak: Weak<ContextInner> = Rc::downgrade(ctx);
        let external = raster.external();
        let producer = ctx
            .scheduler
            .task("raster")
            .execute(move |sched, task| {
                let Some(ctx) = weak.upgrade() else {
                    sched.complete(task);
                    return;
                };
                let mut recording = Recording::default();
                recording.write(
                    ctx.block_pool,
                    u64::from(block_offset) * size_of::<TileBlock>() as u64,
                    bytemuck::cast_slice::<_, u8>(&blocks),
                );
                recording.write(
                    ctx.raster_table,
                    u64::from(id.index) * size_of::<RasterEntry>() as u64,
                    bytemuck::bytes_of(&entry),
                );
                let done = sched.completion(move |sched, _| sched.complete(task));
                if let Err(err) = ctx.submit(recording, Some(done)) {
                    log::error!("failed to submit raster upload: {err}");
                }
            })
            .dispose(move |sched| sched.unmap_external(external))
            .build();
        raster.pool.with(id, |state| state.producer = Some(producer));
        ctx.scheduler.map_external(external, producer);
        log::debug!("created raster {id:?} with {count} blocks at {block_offset}");
        Ok(raster)
    }

    pub fn id(&self) -> RasterId {
        self.id
    }

    /// Number of live references to this raster, including this one.
    pub fn ref_count(&self) -> u32 {
        self.pool.with(self.id, |r| r.refs).unwrap_or(0)
    }

    /// The tiles covered by this raster, before any translation.
    pub fn bounds(&self) -> TileRect {
        self.pool
            .with(self.id, |r| r.bounds)
            .unwrap_or(TileRect::new(0, 0, 0, 0))
    }

    /// The node which place tasks reading this raster happen after.
    pub fn external(&self) -> ExternalId {
        self.pool
            .with(self.id, |r| r.external)
            .unwrap_or_else(ExternalId::next)
    }

    pub(crate) fn context_id(&self) -> u64 {
        self.pool.context
    }
}

impl Clone for Raster {
    fn clone(&self) -> Self {
        self.pool.retain(self.id);
        Self {
            pool: self.pool.clone(),
            id: self.id,
        }
    }
}

impl Drop for Raster {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl std::fmt::Debug for Raster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raster")
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::RasterPool;
    use crate::{Error, Scheduler, TileRect};

    fn pool(capacity: u32, blocks: u32) -> RasterPool {
        RasterPool::new(0, capacity, blocks, Scheduler::new())
    }

    #[test]
    fn table_slots_are_reused_with_new_generations() {
        let pool = pool(1, 16);
        let (a, _) = pool.alloc(4, TileRect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(
            pool.alloc(4, TileRect::new(0, 0, 1, 1)).unwrap_err(),
            Error::RasterTableFull { capacity: 1 }
        );
        pool.release(a);
        let (b, _) = pool.alloc(4, TileRect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        // Releasing through the stale id must not touch the new raster.
        pool.release(a);
        assert_eq!(pool.live(), 1);
    }

    #[test]
    fn blocks_return_on_last_release() {
        let pool = pool(4, 8);
        let (a, _) = pool.alloc(8, TileRect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(
            pool.alloc(1, TileRect::new(0, 0, 1, 1)).unwrap_err(),
            Error::BlockPoolExhausted { requested: 1 }
        );
        pool.retain(a);
        pool.release(a);
        assert_eq!(pool.available_blocks(), 0);
        pool.release(a);
        assert_eq!(pool.available_blocks(), 8);
    }
}
