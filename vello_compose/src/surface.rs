// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rendering sealed compositions into display targets.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytemuck::{Pod, Zeroable};

use crate::composition::CompositionInner;
use crate::context::ContextInner;
use crate::recording::{ImageProxy, Kernel, Recording, ResourceProxy};
use crate::styling::StylingInner;
use crate::{
    Composition, CompositionState, Context, Result, Scheduler, Styling, StylingState, TaskId,
};

/// A display resource which renders write into.
pub struct Target {
    pub(crate) proxy: ImageProxy,
    pub(crate) context: u64,
    ctx: Weak<ContextInner>,
}

impl Target {
    pub(crate) fn new(ctx: &Rc<ContextInner>, proxy: ImageProxy) -> Self {
        Self {
            proxy,
            context: ctx.id,
            ctx: Rc::downgrade(ctx),
        }
    }

    pub fn width(&self) -> u32 {
        self.proxy.width
    }

    pub fn height(&self) -> u32 {
        self.proxy.height
    }

    pub fn proxy(&self) -> ImageProxy {
        self.proxy
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            let mut recording = Recording::default();
            recording.free_image(self.proxy);
            if let Err(err) = ctx.submit(recording, None) {
                log::warn!("failed to free target: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

/// Uniforms of the render kernel.
///
/// This must be kept in sync with the render kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RenderConfig {
    /// Pixels outside of `[x0, y0, x1, y1)` are left untouched.
    pub clip: [i32; 4],
    /// Translation of the composition in pixels.
    pub translate: [i32; 2],
    pub target_width: u32,
    pub target_height: u32,
    pub tile_width_log2: u32,
    pub tile_height_log2: u32,
    pub layer_count: u32,
    pub _pad: u32,
}

/// What a render did, passed to its notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderOutcome {
    /// Number of sorted keys in the composition.
    pub fragments: u32,
    /// Number of tiles with at least one key.
    pub tiles: u32,
    /// Whether the render kernel was skipped because there was nothing to draw.
    pub skipped: bool,
}

type Presenter = Box<dyn FnMut(ImageProxy)>;

/// Renders compositions into targets.
pub struct Surface {
    ctx: Rc<ContextInner>,
    presenter: Rc<RefCell<Option<Presenter>>>,
}

impl Surface {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.inner.clone(),
            presenter: Rc::default(),
        }
    }

    /// Set a hook which runs after each render has handed its target back to
    /// the display system, for example to present it.
    pub fn set_presenter(&self, presenter: impl FnMut(ImageProxy) + 'static) {
        *self.presenter.borrow_mut() = Some(Box::new(presenter));
    }

    /// Render `composition` with `styling` into `target`.
    ///
    /// Both are sealed if needed, and locked until the render completes so
    /// that neither can be unsealed while the render reads it. `clip` is in
    /// target pixels and defaults to the whole target; `translate` moves the
    /// composition by whole pixels.
    ///
    /// This never waits for device work. `notify` runs on the host thread once
    /// the render has finished, from whichever call next pumps the scheduler.
    pub fn render(
        &self,
        styling: &Styling,
        composition: &Composition,
        target: &Target,
        clip: Option<[i32; 4]>,
        translate: [i32; 2],
        notify: impl FnOnce(&RenderOutcome) + 'static,
    ) -> Result<()> {
        let sty = styling.inner().clone();
        let comp = composition.inner().clone();
        self.ctx.check_owned(sty.context_id(), "styling")?;
        self.ctx.check_owned(comp.context_id(), "composition")?;
        self.ctx.check_owned(target.context, "target")?;

        sty.lock()?;
        if let Err(err) = comp.lock() {
            sty.unlock();
            return Err(err);
        }

        let [width, height] = [target.width() as i32, target.height() as i32];
        let clip = clip.unwrap_or([0, 0, width, height]);
        let config = &self.ctx.config;
        let uniforms = RenderConfig {
            clip: [
                clip[0].max(0),
                clip[1].max(0),
                clip[2].min(width),
                clip[3].min(height),
            ],
            translate,
            target_width: target.width(),
            target_height: target.height(),
            tile_width_log2: config.tile_width_log2,
            tile_height_log2: config.tile_height_log2,
            layer_count: config.layer_capacity,
            _pad: 0,
        };
        let render = Render {
            ctx: Rc::downgrade(&self.ctx),
            styling: sty.clone(),
            composition: comp.clone(),
            target: target.proxy,
            uniforms,
            presenter: self.presenter.clone(),
            notify: Box::new(notify),
        };

        let sched = &self.ctx.scheduler;
        let task = sched
            .task("render")
            .execute(move |sched, task| render.execute(sched, task))
            .build();
        if comp.state() != CompositionState::Sealed {
            if let Some(sort) = comp.sort_task() {
                sched.happens_after(task, sort);
            }
        }
        if sty.state() != StylingState::Sealed {
            if let Some(build) = sty.build_task() {
                sched.happens_after(task, build);
            }
        }
        sched.force(task);
        sched.yield_now()
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface").finish_non_exhaustive()
    }
}

/// A render request, alive until its task completes.
struct Render {
    ctx: Weak<ContextInner>,
    styling: Rc<StylingInner>,
    composition: Rc<CompositionInner>,
    target: ImageProxy,
    uniforms: RenderConfig,
    presenter: Rc<RefCell<Option<Presenter>>>,
    notify: Box<dyn FnOnce(&RenderOutcome)>,
}

impl Render {
    fn execute(self, sched: &Scheduler, task: TaskId) {
        let atomics = self.composition.atomics();
        let outcome = RenderOutcome {
            fragments: atomics.keys,
            tiles: atomics.offsets,
            skipped: atomics.offsets == 0,
        };
        let ctx = match self.ctx.upgrade() {
            Some(ctx) if !outcome.skipped => ctx,
            _ => {
                log::debug!("nothing to render");
                self.finish(sched, task, &outcome);
                return;
            }
        };

        let mut recording = Recording::default();
        recording.acquire(self.target);
        let config_buf = recording.upload("render_config", bytemuck::bytes_of(&self.uniforms));
        let resources: Vec<ResourceProxy> = vec![
            self.styling.table.into(),
            self.composition.keys.into(),
            self.composition.atomics_buf.into(),
            self.composition.offsets.into(),
            ctx.block_pool.into(),
            self.target.into(),
            config_buf.into(),
        ];
        recording.dispatch(Kernel::Render, outcome.tiles, resources);
        recording.release(self.target);
        recording.free_buffer(config_buf);

        let done = sched.completion(move |sched, _| {
            if let Some(present) = self.presenter.borrow_mut().as_mut() {
                present(self.target);
            }
            self.finish(sched, task, &outcome);
        });
        if let Err(err) = ctx.submit(recording, Some(done)) {
            log::error!("failed to submit render: {err}");
        }
    }

    fn finish(self, sched: &Scheduler, task: TaskId, outcome: &RenderOutcome) {
        self.composition.unlock();
        self.styling.unlock();
        (self.notify)(outcome);
        sched.complete(task);
    }
}
