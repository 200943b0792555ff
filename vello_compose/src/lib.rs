// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vello Compose is the execution engine behind tile-based GPU compositing.
//!
//! It turns a stream of host-issued "place this raster at (x, y) on layer L"
//! commands into a correctly ordered sequence of device kernel launches:
//!
//! 1. **place**: expand each placed raster into one sort key per covered tile.
//! 2. **sort**: order those keys with an external hierarchical sort.
//! 3. **segment**: find where each tile's run of keys begins.
//! 4. **render**: composite every tile's keys, in layer order, into a target.
//!
//! The host side of that pipeline is where the interesting work happens:
//! commands are batched through a bounded [`CommandRing`] with backpressure,
//! a [`Composition`] gates flushing and consumption behind a seal/unseal state
//! machine, and all device work is ordered by a small dependency graph driven
//! by the [`Scheduler`].
//!
//! ## Getting started
//!
//! ```ignore
//! use vello_compose::{ComposeConfig, Context, RasterTile, Surface, TileRect};
//!
//! let ctx = Context::new_cpu(ComposeConfig::default())?;
//! let raster = ctx.create_raster(&[RasterTile::new(0, 0, 255)])?;
//!
//! let styling = ctx.create_styling();
//! styling.set_layer(0, 0xff_00_00_ff)?;
//! styling.seal()?;
//!
//! let composition = ctx.create_composition()?;
//! composition.place(&[raster], &[0], None, None)?;
//! composition.seal()?;
//!
//! let target = ctx.create_target(64, 64)?;
//! let surface = Surface::new(&ctx);
//! surface.render(&styling, &composition, &target, None, [0, 0], |outcome| {
//!     log::info!("composited {} tiles", outcome.tiles);
//! })?;
//! ctx.wait()?;
//! ```
//!
//! ## Threading
//!
//! A [`Context`] and everything created from it live on one host thread.
//! Device completion notifications arrive on the engine's driver thread, and
//! the only thing that thread ever does with them is post a message back to
//! the scheduler's run queue. Pipeline logic then runs on the host thread the
//! next time the scheduler is pumped, either explicitly through
//! [`Context::yield_now`]/[`Context::wait`] or implicitly by a blocking call.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    missing_debug_implementations,
    unnameable_types,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    reason = "Deferred"
)]

mod block_pool;
mod composition;
mod config;
mod context;
mod engine;
mod grid;
mod raster;
mod recording;
mod ring;
mod sort;
mod styling;
mod surface;
mod tile;
mod ttck;

#[cfg(feature = "cpu")]
pub mod cpu;

pub mod low_level {
    //! Building blocks used to implement an alternative [`Engine`][crate::Engine].
    //!
    //! These are what a device backend consumes; most users only need the
    //! types re-exported at the crate root.

    pub use crate::block_pool::BestFit;
    pub use crate::composition::PlaceConfig;
    pub use crate::raster::{RasterEntry, TileBlock};
    pub use crate::recording::{
        BufferProxy, Command, ImageProxy, Kernel, Recording, ResourceId, ResourceProxy,
        SortParams,
    };
    pub use crate::ring::{Span, Snapshot};
    pub use crate::styling::LayerStyle;
    pub use crate::surface::RenderConfig;
}

pub use composition::{Composition, CompositionState, PlaceAtomics};
pub use config::ComposeConfig;
pub use context::Context;
pub use engine::{DeviceError, Downloads, Engine};
pub use grid::{Completion, ExternalId, Node, Scheduler, TaskBuilder, TaskId, TaskSlot};
pub use raster::{Raster, RasterId, RasterTile};
pub use ring::{CommandRing, PlaceCmd};
pub use sort::HotSort;
pub use styling::{Styling, StylingState};
pub use surface::{RenderOutcome, Surface, Target};
pub use tile::TileRect;
pub use ttck::Ttck;

use thiserror::Error;

/// Errors that can occur in Vello Compose.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A raster, styling, composition or target was created by a different [`Context`].
    #[error("{0} belongs to a different context")]
    ForeignResource(&'static str),
    /// Parallel argument slices passed to an operation have different lengths.
    #[error("`{what}` has {actual} entries but {expected} were expected")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A layer id does not fit in the sort key.
    #[error("layer id {layer} is out of range (maximum is {max})")]
    LayerOutOfRange { layer: u32, max: u32 },
    /// A raster must cover at least one tile.
    #[error("a raster must cover at least one tile")]
    EmptyRaster,
    /// The device block pool has no contiguous run large enough for a raster.
    #[error("block pool exhausted: requested {requested} blocks")]
    BlockPoolExhausted { requested: u32 },
    /// Every slot of the device raster table is in use.
    #[error("raster table is full ({capacity} rasters)")]
    RasterTableFull { capacity: u32 },
    /// A state transition outside of the composition or styling state table was attempted.
    #[error("illegal {object} state transition from {from} to {to}")]
    IllegalTransition {
        object: &'static str,
        from: &'static str,
        to: &'static str,
    },
    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An engine was asked to use a buffer or image it does not hold.
    #[error("buffer '{0}' is not available but used for {1}")]
    UnavailableBuffer(&'static str, &'static str),
    /// The device failed. This is fatal for the owning [`Context`].
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// A blocking operation is waiting on work that can never make progress.
    #[error("stalled while waiting for {0}")]
    Stalled(&'static str),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_convert() {
        let err: Error = DeviceError::Lost.into();
        assert!(err.to_string().starts_with("device error:"));
    }
}
