// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The place command ring.
//!
//! ```text
//!   reads        checkpoint      writes
//!     |  snapshot  |     wip       |        free        |
//! ```
//!
//! Commands are written at `writes` and published immediately. A snapshot
//! takes everything between the checkpoint and `writes` and moves the
//! checkpoint forward. The slots of a snapshot only become free again once
//! the snapshot is released by the task that consumed it, so a full ring is
//! the backpressure signal for the producer.
//!
//! All three cursors are monotonic; slot indices are taken modulo the capacity.

use bytemuck::{Pod, Zeroable};

/// A single "place raster on layer at offset" command.
///
/// This must be kept in sync with the command layout read by the place kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PlaceCmd {
    /// Index of the raster in the raster table.
    pub raster: u32,
    pub layer_id: u32,
    /// Horizontal translation in sub-pixels.
    pub tx: i32,
    /// Vertical translation in sub-pixels.
    pub ty: i32,
}

static_assertions::const_assert_eq!(size_of::<PlaceCmd>(), 16);

/// A contiguous run of writable slots returned by [`CommandRing::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Span {
    start: u64,
    len: u32,
}

impl Span {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An immutable view over committed commands which were checkpointed together.
///
/// This is handed to exactly one task, which must give it back with
/// [`CommandRing::release`] once it no longer reads the commands.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    start: u64,
    len: u32,
}

impl Snapshot {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A single-producer ring of [`PlaceCmd`]s with checkpoint and snapshot support.
pub struct CommandRing {
    cmds: Box<[PlaceCmd]>,
    reads: u64,
    checkpoint: u64,
    writes: u64,
    outstanding: bool,
}

impl CommandRing {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "a command ring needs at least one slot");
        Self {
            cmds: vec![PlaceCmd::default(); capacity as usize].into_boxed_slice(),
            reads: 0,
            checkpoint: 0,
            writes: 0,
            outstanding: false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.cmds.len() as u32
    }

    /// Number of slots currently in use, by a snapshot or as work in progress.
    pub fn len(&self) -> u32 {
        (self.writes - self.reads) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.writes == self.reads
    }

    /// Number of committed commands which have not been snapshotted yet.
    pub fn wip(&self) -> u32 {
        (self.writes - self.checkpoint) as u32
    }

    pub fn free(&self) -> u32 {
        self.capacity() - self.len()
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Whether a snapshot has been taken and not yet released.
    pub fn has_outstanding_snapshot(&self) -> bool {
        self.outstanding
    }

    /// Reserve up to `n` contiguous slots without blocking.
    ///
    /// The span can be shorter than requested when the free region wraps
    /// around the end of the ring. Returns `None` when the ring is full.
    pub fn try_reserve(&self, n: u32) -> Option<Span> {
        let free = self.free();
        if free == 0 || n == 0 {
            return None;
        }
        let index = (self.writes % self.cmds.len() as u64) as u32;
        let to_end = self.capacity() - index;
        Some(Span {
            start: self.writes,
            len: n.min(free).min(to_end),
        })
    }

    /// Write `cmds` into a span returned by [`try_reserve`](Self::try_reserve) and publish them.
    ///
    /// Only the first `cmds.len()` slots of the span are used; the rest is returned to the ring.
    ///
    /// # Panics
    ///
    /// If the span is stale or `cmds` does not fit in it.
    pub fn commit(&mut self, span: Span, cmds: &[PlaceCmd]) {
        assert_eq!(span.start, self.writes, "span was reserved before another commit");
        assert!(cmds.len() <= span.len as usize, "commit exceeds reserved span");
        let index = (span.start % self.cmds.len() as u64) as usize;
        self.cmds[index..index + cmds.len()].copy_from_slice(cmds);
        self.writes += cmds.len() as u64;
    }

    /// Move the checkpoint to the write cursor and return the commands it passed over.
    ///
    /// Returns `None` if there is nothing new to snapshot, or if the previous
    /// snapshot has not been released yet.
    pub fn checkpoint_and_snapshot(&mut self) -> Option<Snapshot> {
        if self.outstanding || self.checkpoint == self.writes {
            return None;
        }
        let snapshot = Snapshot {
            start: self.checkpoint,
            len: (self.writes - self.checkpoint) as u32,
        };
        self.checkpoint = self.writes;
        self.outstanding = true;
        Some(snapshot)
    }

    /// The commands of a snapshot, as the part before and the part after the wrap point.
    pub fn snapshot_cmds(&self, snapshot: &Snapshot) -> (&[PlaceCmd], &[PlaceCmd]) {
        let capacity = self.cmds.len();
        let index = (snapshot.start % capacity as u64) as usize;
        let len = snapshot.len as usize;
        if index + len <= capacity {
            (&self.cmds[index..index + len], &[])
        } else {
            (&self.cmds[index..], &self.cmds[..index + len - capacity])
        }
    }

    /// Retire a snapshot, making its slots available to the producer again.
    ///
    /// # Panics
    ///
    /// If `snapshot` is not the outstanding snapshot of this ring.
    pub fn release(&mut self, snapshot: Snapshot) {
        assert!(
            self.outstanding && snapshot.start == self.reads,
            "released a snapshot which is not outstanding"
        );
        self.reads += u64::from(snapshot.len);
        self.outstanding = false;
    }

    /// Drop every command which has been committed but not snapshotted.
    pub fn discard_wip(&mut self) -> u32 {
        let dropped = self.wip();
        self.writes = self.checkpoint;
        dropped
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing")
            .field("capacity", &self.capacity())
            .field("reads", &self.reads)
            .field("checkpoint", &self.checkpoint)
            .field("writes", &self.writes)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandRing, PlaceCmd};

    fn cmd(raster: u32) -> PlaceCmd {
        PlaceCmd {
            raster,
            ..PlaceCmd::default()
        }
    }

    fn fill(ring: &mut CommandRing, rasters: std::ops::Range<u32>) {
        let cmds: Vec<_> = rasters.map(cmd).collect();
        let mut written = 0;
        while written < cmds.len() {
            let span = ring.try_reserve((cmds.len() - written) as u32).unwrap();
            let n = span.len() as usize;
            ring.commit(span, &cmds[written..written + n]);
            written += n;
        }
    }

    #[test]
    fn full_ring_refuses_reservations() {
        let mut ring = CommandRing::new(4);
        fill(&mut ring, 0..4);
        assert!(ring.is_full());
        assert_eq!(ring.try_reserve(1), None);
    }

    #[test]
    fn snapshot_owns_slots_until_released() {
        let mut ring = CommandRing::new(4);
        fill(&mut ring, 0..4);
        let snapshot = ring.checkpoint_and_snapshot().unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(ring.wip(), 0);
        // Taking the snapshot alone frees nothing.
        assert!(ring.is_full());
        ring.release(snapshot);
        assert_eq!(ring.free(), 4);
    }

    #[test]
    fn only_one_snapshot_outstanding() {
        let mut ring = CommandRing::new(8);
        fill(&mut ring, 0..2);
        let first = ring.checkpoint_and_snapshot().unwrap();
        fill(&mut ring, 2..3);
        assert_eq!(ring.checkpoint_and_snapshot(), None);
        ring.release(first);
        let second = ring.checkpoint_and_snapshot().unwrap();
        assert_eq!(ring.snapshot_cmds(&second).0, &[cmd(2)]);
    }

    #[test]
    fn empty_region_has_no_snapshot() {
        let mut ring = CommandRing::new(4);
        assert_eq!(ring.checkpoint_and_snapshot(), None);
    }

    #[test]
    fn reservations_stop_at_the_wrap_point() {
        let mut ring = CommandRing::new(4);
        fill(&mut ring, 0..3);
        let snapshot = ring.checkpoint_and_snapshot().unwrap();
        ring.release(snapshot);
        // Three slots are free, but only one is before the end of the buffer.
        assert_eq!(ring.try_reserve(3).unwrap().len(), 1);
    }

    #[test]
    fn wrapped_snapshot_keeps_order() {
        let mut ring = CommandRing::new(4);
        fill(&mut ring, 0..3);
        let snapshot = ring.checkpoint_and_snapshot().unwrap();
        ring.release(snapshot);
        fill(&mut ring, 10..14);
        let snapshot = ring.checkpoint_and_snapshot().unwrap();
        let (lo, hi) = ring.snapshot_cmds(&snapshot);
        let rasters: Vec<_> = lo.iter().chain(hi).map(|c| c.raster).collect();
        assert_eq!(rasters, [10, 11, 12, 13]);
    }

    #[test]
    fn discard_drops_only_wip() {
        let mut ring = CommandRing::new(8);
        fill(&mut ring, 0..2);
        let snapshot = ring.checkpoint_and_snapshot().unwrap();
        fill(&mut ring, 2..5);
        assert_eq!(ring.discard_wip(), 3);
        assert_eq!(ring.len(), 2);
        ring.release(snapshot);
        assert!(ring.is_empty());
    }
}
