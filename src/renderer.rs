//! The batch renderer: one [`Renderer::render`] call runs the whole frame.
//!
//! Queued scene changes are applied to the shadow tree, the updater walks
//! the dirty parts, render lists and batches are rebuilt only where needed,
//! changed batches are uploaded and finally everything is drawn.

use std::cmp::Reverse;

use crate::backend::{FrameSetup, GpuBackend, ScissorRect};
use crate::batch;
use crate::config::{DebugFlags, RendererConfig};
use crate::context::{BatchContext, RebuildFlags};
use crate::debug::{self, BatchSummary};
use crate::error::RenderError;
use crate::executor::{Executor, FrameTarget};
use crate::geometry::Rect;
use crate::render_stats::{self, FrameStats};
use crate::scene::SceneGraph;
use crate::shader::ShaderCache;
use crate::transform::Transform;
use crate::updater::Updater;
use crate::upload::Uploader;

/// Called after each frame with the opaque and alpha batch summaries.
pub type PostRenderHook = Box<dyn FnMut(&[BatchSummary], &[BatchSummary])>;

pub struct Renderer {
    ctx: BatchContext,
    updater: Updater,
    uploader: Uploader,
    device_size: (u32, u32),
    viewport: ScissorRect,
    projection: Transform,
    hook: Option<PostRenderHook>,
    last_stats: FrameStats,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        log::debug!(
            target: "tessera::render",
            "renderer created: depth buffer {}, node threshold {}, vertex threshold {}",
            config.use_depth_buffer,
            config.batch_node_threshold,
            config.batch_vertex_threshold
        );
        Self {
            ctx: BatchContext::new(config),
            updater: Updater::default(),
            uploader: Uploader::default(),
            device_size: (1, 1),
            viewport: ScissorRect::new(0, 0, 1, 1),
            projection: Transform::IDENTITY,
            hook: None,
            last_stats: FrameStats::default(),
        }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.ctx.config
    }

    /// Render target size in pixels. Also resets the viewport to cover it
    /// and the projection to map it with a top-left origin.
    pub fn set_device_size(&mut self, width: u32, height: u32) {
        self.device_size = (width, height);
        self.viewport = ScissorRect::new(0, 0, width as i32, height as i32);
        self.set_projection_to_rect(Rect::new(0.0, 0.0, width as f32, height as f32));
    }

    pub fn set_viewport(&mut self, viewport: ScissorRect) {
        self.viewport = viewport;
    }

    pub fn set_projection(&mut self, projection: Transform) {
        self.projection = projection;
    }

    /// Orthographic projection showing `rect` of scene coordinates.
    pub fn set_projection_to_rect(&mut self, rect: Rect) {
        self.projection = Transform::ortho(rect.left(), rect.right(), rect.bottom(), rect.top(), 1.0, -1.0);
    }

    pub fn projection(&self) -> &Transform {
        &self.projection
    }

    pub fn set_post_render_hook(&mut self, hook: impl FnMut(&[BatchSummary], &[BatchSummary]) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn clear_post_render_hook(&mut self) {
        self.hook = None;
    }

    /// Opaque and alpha batches as they were drawn in the last frame.
    pub fn batch_summaries(&self) -> (Vec<BatchSummary>, Vec<BatchSummary>) {
        (
            debug::summarize(&self.ctx, &self.ctx.opaque_batches),
            debug::summarize(&self.ctx, &self.ctx.alpha_batches),
        )
    }

    pub fn last_frame_stats(&self) -> &FrameStats {
        &self.last_stats
    }

    /// Render one frame of `scene`.
    ///
    /// On a material error the frame is abandoned after the error has been
    /// logged; the batches stay intact and the next call draws again.
    pub fn render(
        &mut self,
        scene: &mut SceneGraph,
        shaders: &mut ShaderCache,
        backend: &mut dyn GpuBackend,
    ) -> Result<(), RenderError> {
        self.ctx.stats = FrameStats::default();

        let changes = scene.take_changes();
        for (node, state) in changes {
            self.ctx.node_changed(scene, node, state);
        }
        self.updater.update_states(&mut self.ctx, scene);

        let flags = self.ctx.config.debug;
        if flags.contains(DebugFlags::DUMP) {
            log::debug!(target: "tessera::render", "scene:\n{}", debug::dump_scene(scene));
        }

        let ctx = &mut self.ctx;
        if ctx.rebuild.contains(RebuildFlags::BUILD_RENDER_LISTS) {
            ctx.build_render_lists_from_scratch(scene);
            ctx.rebuild |= RebuildFlags::BUILD_BATCHES;
        } else if ctx.rebuild.contains(RebuildFlags::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS) {
            ctx.build_render_lists_for_tagged_roots(scene);
            ctx.rebuild |= RebuildFlags::BUILD_BATCHES;
        }

        if flags.contains(DebugFlags::ROOTS) {
            log::debug!(target: "tessera::roots", "{}", debug::dump_shadow_roots(ctx));
        }

        for i in 0..ctx.opaque_batches.len() {
            let b = ctx.opaque_batches[i];
            batch::cleanup_removed_elements(&mut ctx.batches[b], &mut ctx.elements);
        }
        for i in 0..ctx.alpha_batches.len() {
            let b = ctx.alpha_batches[i];
            batch::cleanup_removed_elements(&mut ctx.batches[b], &mut ctx.elements);
        }
        ctx.delete_removed_elements();

        ctx.cleanup_batches(true);
        ctx.cleanup_batches(false);

        if ctx.rebuild.contains(RebuildFlags::BUILD_BATCHES) {
            ctx.prepare_opaque_batches(scene);
            ctx.prepare_alpha_batches(scene);
            if flags.contains(DebugFlags::BUILD) {
                log::debug!(
                    target: "tessera::build",
                    "batches: {} opaque, {} alpha",
                    ctx.opaque_batches.len(),
                    ctx.alpha_batches.len()
                );
            }
        }
        ctx.delete_removed_elements();

        if !ctx.rebuild.is_empty() {
            // Opaque front to back, alpha back to front.
            let mut opaque = std::mem::take(&mut ctx.opaque_batches);
            opaque.sort_by_key(|&b| Reverse(ctx.batch_first_order(b)));
            ctx.opaque_batches = opaque;
            let mut alpha = std::mem::take(&mut ctx.alpha_batches);
            alpha.sort_by_key(|&b| ctx.batch_first_order(b));
            ctx.alpha_batches = alpha;
            ctx.z_range = if ctx.next_render_order != 0 {
                1.0 / ctx.next_render_order as f32
            } else {
                0.0
            };
        }

        self.uploader.begin_frame();
        for i in 0..ctx.opaque_batches.len() {
            let b = ctx.opaque_batches[i];
            self.uploader.upload_batch(ctx, scene, backend, b);
        }
        for i in 0..ctx.alpha_batches.len() {
            let b = ctx.alpha_batches[i];
            self.uploader.upload_batch(ctx, scene, backend, b);
        }
        self.uploader.shrink_pools();

        backend.begin_frame(&FrameSetup {
            device_size: self.device_size,
            viewport: self.viewport,
            clear_color: ctx.config.clear_color,
            use_depth_buffer: ctx.use_depth_buffer,
        });
        let target = FrameTarget {
            projection: self.projection,
            device_size: self.device_size,
        };
        let mut executor = Executor::new(&self.ctx, scene, shaders, backend, target);
        let result = executor.render_batches();
        let draw_calls = executor.draw_calls;
        backend.end_frame();

        let ctx = &mut self.ctx;
        ctx.rebuild = RebuildFlags::empty();
        ctx.rebuild_lower = -1;
        ctx.rebuild_upper = -1;

        ctx.stats.elements = ctx.opaque_list.len() + ctx.alpha_list.len();
        ctx.stats.opaque_batches = ctx.opaque_batches.len();
        ctx.stats.alpha_batches = ctx.alpha_batches.len();
        ctx.stats.merged_batches = ctx
            .opaque_batches
            .iter()
            .chain(ctx.alpha_batches.iter())
            .filter(|&&b| ctx.batches[b].merged)
            .count();
        ctx.stats.draw_calls = draw_calls;
        self.last_stats = ctx.stats.clone();
        render_stats::end_frame(&self.last_stats);
        result?;

        if let Some(hook) = self.hook.as_mut() {
            let opaque = debug::summarize(&self.ctx, &self.ctx.opaque_batches);
            let alpha = debug::summarize(&self.ctx, &self.ctx.alpha_batches);
            hook(&opaque, &alpha);
        }
        Ok(())
    }

    /// Destroy every GPU buffer the renderer owns. The next frame rebuilds
    /// and re-uploads everything.
    pub fn release_resources(&mut self, backend: &mut dyn GpuBackend) {
        let ctx = &mut self.ctx;
        let ids: Vec<_> = ctx
            .opaque_batches
            .drain(..)
            .chain(ctx.alpha_batches.drain(..))
            .collect();
        for b in ids {
            ctx.invalidate_and_recycle_batch(b);
        }
        let mut released = 0;
        for &b in &ctx.batch_pool {
            let batch = &mut ctx.batches[b];
            for buffer in [&mut batch.vbo, &mut batch.ibo] {
                if let Some(id) = buffer.id.take() {
                    backend.destroy_buffer(id);
                    buffer.size = 0;
                    released += 1;
                }
            }
        }
        ctx.rebuild = RebuildFlags::FULL_REBUILD;
        log::debug!(target: "tessera::render", "released {} buffers", released);
    }
}
