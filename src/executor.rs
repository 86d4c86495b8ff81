//! Executor: replays the prepared batches through the backend.
//!
//! Opaque batches go first, front to back with depth writes on. Alpha
//! batches follow back to front with blending. Program binds and clip
//! updates are skipped when consecutive batches share them.

use std::rc::Rc;

use crate::backend::{DrawCall, GpuBackend, IndexRange, ProgramId, VertexStream};
use crate::batch::{batch_elements, BatchId};
use crate::clip::{self, ClipState, ClipType};
use crate::config::DebugFlags;
use crate::context::BatchContext;
use crate::debug;
use crate::element::Element;
use crate::error::{MaterialError, RenderError};
use crate::geometry::{DrawMode, Geometry, IndexFormat};
use crate::material::Material;
use crate::render_node::{RenderNodeState, StateFlags};
use crate::scene::{NodeId, NodeType, SceneGraph};
use crate::shader::{MaterialState, ShaderCache, ShaderKey, StateDirty};
use crate::shadow::ShadowId;
use crate::transform::Transform;

/// Per-frame render target description.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameTarget {
    pub(crate) projection: Transform,
    pub(crate) device_size: (u32, u32),
}

fn update_line_width(backend: &mut dyn GpuBackend, g: &Geometry) {
    if matches!(
        g.mode(),
        DrawMode::Lines | DrawMode::LineStrip | DrawMode::LineLoop | DrawMode::Points
    ) {
        backend.set_line_width(g.line_width());
    }
}

pub(crate) struct Executor<'a> {
    ctx: &'a BatchContext,
    scene: &'a mut SceneGraph,
    shaders: &'a mut ShaderCache,
    backend: &'a mut dyn GpuBackend,
    target: FrameTarget,
    current_shader: Option<ShaderKey>,
    current_material: Option<Rc<dyn Material>>,
    current_clip: Option<ShadowId>,
    clip: ClipState,
    pub(crate) draw_calls: usize,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        ctx: &'a BatchContext,
        scene: &'a mut SceneGraph,
        shaders: &'a mut ShaderCache,
        backend: &'a mut dyn GpuBackend,
        target: FrameTarget,
    ) -> Self {
        Self {
            ctx,
            scene,
            shaders,
            backend,
            target,
            current_shader: None,
            current_material: None,
            current_clip: None,
            clip: ClipState::default(),
            draw_calls: 0,
        }
    }

    fn debug(&self, flag: DebugFlags) -> bool {
        self.ctx.config.debug.contains(flag)
    }

    pub(crate) fn render_batches(&mut self) -> Result<(), RenderError> {
        let ctx = self.ctx;
        let use_depth = ctx.use_depth_buffer;
        if self.debug(DebugFlags::RENDER) {
            log::debug!(
                target: "tessera::render",
                "rendering {} opaque and {} alpha batches",
                ctx.opaque_batches.len(),
                ctx.alpha_batches.len()
            );
        }

        self.backend.set_depth_state(use_depth, use_depth);
        self.backend.set_blending(false);

        if !self.debug(DebugFlags::NO_OPAQUE) {
            for &b in &ctx.opaque_batches {
                if ctx.batches[b].merged {
                    self.render_merged_batch(b)?;
                } else {
                    self.render_unmerged_batch(b)?;
                }
            }
        }

        self.backend.set_blending(true);
        if use_depth {
            self.backend.set_depth_state(true, false);
        }

        if !self.debug(DebugFlags::NO_ALPHA) {
            for &b in &ctx.alpha_batches {
                let batch = &ctx.batches[b];
                if batch.merged {
                    self.render_merged_batch(b)?;
                } else if batch.is_render_node {
                    self.render_render_node(b);
                } else {
                    self.render_unmerged_batch(b)?;
                }
            }
        }

        if self.current_shader.is_some() {
            self.set_active_shader(None);
        }
        self.clip = clip::update_stencil_clip(
            None,
            &ctx.shadows,
            self.scene,
            &self.target.projection,
            self.target.device_size,
            self.backend,
        );
        self.current_clip = None;
        Ok(())
    }

    fn set_active_shader(&mut self, shader: Option<(ShaderKey, ProgramId)>) {
        self.current_shader = shader.map(|(key, _)| key);
        self.current_material = None;
        self.backend.bind_program(shader.map(|(_, program)| program));
    }

    fn update_clip(&mut self, clip_list: Option<ShadowId>, opaque: bool) {
        if clip_list == self.current_clip || self.debug(DebugFlags::NO_CLIP) {
            return;
        }
        self.current_clip = clip_list;
        if self.current_shader.is_some() {
            self.set_active_shader(None);
        }
        let depth = opaque && self.ctx.use_depth_buffer;
        if depth {
            self.backend.set_depth_state(false, false);
        }
        self.clip = clip::update_stencil_clip(
            clip_list,
            &self.ctx.shadows,
            self.scene,
            &self.target.projection,
            self.target.device_size,
            self.backend,
        );
        if depth {
            self.backend.set_depth_state(true, true);
        }
    }

    /// Push material state, turning a material failure into a frame error.
    fn update_state(
        &mut self,
        key: ShaderKey,
        state: &MaterialState,
        material: &Rc<dyn Material>,
        element: &Element,
    ) -> Result<(), RenderError> {
        let previous = self.current_material.as_deref();
        if let Err(source) = self.shaders.update_state(key, state, material.as_ref(), previous) {
            self.report_material_error(element.node, &source);
            return Err(RenderError::Material {
                node: element.node,
                source,
            });
        }
        self.current_material = Some(Rc::clone(material));
        Ok(())
    }

    fn report_material_error(&self, node: NodeId, error: &MaterialError) {
        log::error!(target: "tessera::render", "material update failed for {:?}: {}", node, error);
        log::error!(target: "tessera::render", "batch roots:\n{}", debug::dump_shadow_roots(self.ctx));
        log::error!(target: "tessera::render", "scene:\n{}", debug::dump_scene(self.scene));
    }

    fn render_merged_batch(&mut self, id: BatchId) -> Result<(), RenderError> {
        let ctx = self.ctx;
        let batch = &ctx.batches[id];
        if batch.vertex_count == 0 || batch.index_count == 0 {
            return Ok(());
        }
        let (Some(first), Some(vbo), Some(ibo)) = (batch.first, batch.vbo.id, batch.ibo.id) else {
            return Ok(());
        };
        let element = &ctx.elements[first];
        if self.debug(DebugFlags::RENDER) {
            log::debug!(
                target: "tessera::render",
                " - {:?} [{}] [merged] elements={} vertices={} indices={} sets={}",
                id,
                if batch.is_opaque { "opaque" } else { "alpha" },
                batch_elements(batch, &ctx.elements).count(),
                batch.vertex_count,
                batch.index_count,
                batch.draw_sets.len()
            );
        }

        let model_view = ctx.root_matrix(batch.root);
        self.update_clip(element.clip_list, batch.is_opaque);

        let Some(gn) = self.scene.geometry_node(element.node) else {
            return Ok(());
        };
        let material = Rc::clone(gn.active_material(element.inherited_opacity));
        let prepared = if ctx.use_depth_buffer {
            self.shaders.prepare_material(material.as_ref())
        } else {
            self.shaders.prepare_material_no_rewrite(material.as_ref())
        };
        let Some((key, shader)) = prepared else {
            return Ok(());
        };
        if self.current_shader != Some(key) {
            self.set_active_shader(Some((key, shader.program)));
        }

        let opacity = element.inherited_opacity;
        let mut dirty = StateDirty::MATRIX;
        if shader.last_opacity != opacity {
            dirty |= StateDirty::OPACITY;
        }
        let state = MaterialState::new(self.target.projection, model_view, opacity, dirty);
        self.update_state(key, &state, &material, element)?;

        let Some(gn) = self.scene.geometry_node(element.node) else {
            return Ok(());
        };
        let g = &gn.geometry;
        update_line_width(self.backend, g);
        let stride = g.stride();
        for set in &batch.draw_sets {
            self.backend.draw(&DrawCall {
                mode: g.mode(),
                vertices: VertexStream {
                    buffer: vbo,
                    offset: set.vertices,
                    stride,
                },
                attributes: g.attributes().attributes(),
                zorder: ctx.use_depth_buffer.then_some(VertexStream {
                    buffer: vbo,
                    offset: set.zorders,
                    stride: 4,
                }),
                indices: Some(IndexRange {
                    buffer: ibo,
                    offset: set.indices,
                    count: set.index_count,
                    format: IndexFormat::U16,
                }),
                vertex_count: batch.vertex_count,
            });
            self.draw_calls += 1;
        }
        Ok(())
    }

    fn render_unmerged_batch(&mut self, id: BatchId) -> Result<(), RenderError> {
        let ctx = self.ctx;
        let batch = &ctx.batches[id];
        if batch.vertex_count == 0 {
            return Ok(());
        }
        let (Some(first), Some(vbo)) = (batch.first, batch.vbo.id) else {
            return Ok(());
        };
        let element = &ctx.elements[first];
        if self.debug(DebugFlags::RENDER) {
            log::debug!(
                target: "tessera::render",
                " - {:?} [{}] [unmerged] elements={} vertices={} indices={}",
                id,
                if batch.is_opaque { "opaque" } else { "alpha" },
                batch_elements(batch, &ctx.elements).count(),
                batch.vertex_count,
                batch.index_count
            );
        }

        self.update_clip(element.clip_list, batch.is_opaque);

        let Some(gn) = self.scene.geometry_node(element.node) else {
            return Ok(());
        };
        // Members compare equal, so the first one's material stands for all.
        let material = Rc::clone(gn.active_material(element.inherited_opacity));
        let Some((key, shader)) = self.shaders.prepare_material_no_rewrite(material.as_ref()) else {
            return Ok(());
        };
        if self.current_shader != Some(key) {
            self.set_active_shader(Some((key, shader.program)));
        }

        let mut dirty = StateDirty::MATRIX;
        if shader.last_opacity != element.inherited_opacity {
            dirty |= StateDirty::OPACITY;
        }

        let root_matrix = ctx.root_matrix(batch.root);
        let mut vertex_offset = 0;
        let mut index_offset = 0;
        for (_, e) in batch_elements(batch, &ctx.elements) {
            let model_view = root_matrix.then(&e.matrix);
            let mut projection = self.target.projection;
            if ctx.use_depth_buffer {
                projection.set(2, 2, ctx.z_range);
                projection.set(2, 3, 1.0 - e.order as f32 * ctx.z_range);
            }
            let state = MaterialState::new(projection, model_view, e.inherited_opacity, dirty);
            self.update_state(key, &state, &material, e)?;

            let Some(gn) = self.scene.geometry_node(e.node) else {
                continue;
            };
            let g = &gn.geometry;
            let indices = match (g.index_format(), batch.ibo.id) {
                (Some(format), Some(ibo)) if g.index_count() > 0 => Some(IndexRange {
                    buffer: ibo,
                    offset: index_offset,
                    count: g.index_count(),
                    format,
                }),
                _ => None,
            };
            update_line_width(self.backend, g);
            self.backend.draw(&DrawCall {
                mode: g.mode(),
                vertices: VertexStream {
                    buffer: vbo,
                    offset: vertex_offset,
                    stride: g.stride(),
                },
                attributes: g.attributes().attributes(),
                zorder: None,
                indices,
                vertex_count: g.vertex_count(),
            });
            self.draw_calls += 1;

            vertex_offset += g.vertex_count() * g.stride();
            index_offset += g.indices().as_bytes().len();
            // Only the first element needs the opacity pushed.
            dirty.remove(StateDirty::OPACITY);
        }
        Ok(())
    }

    /// Walk the client ancestors of `node`, up to but excluding `stop`, for
    /// the first node of type `ty`.
    fn nearest_ancestor(&self, node: NodeId, ty: NodeType, stop: Option<NodeId>) -> Option<NodeId> {
        let mut at = self.scene.parent(node);
        while let Some(n) = at {
            if Some(n) == stop {
                return None;
            }
            if self.scene.node_type(n) == Some(ty) {
                return Some(n);
            }
            at = self.scene.parent(n);
        }
        None
    }

    fn render_render_node(&mut self, id: BatchId) {
        let ctx = self.ctx;
        let batch = &ctx.batches[id];
        let Some(first) = batch.first else {
            return;
        };
        let element = &ctx.elements[first];
        let node = element.node;
        if self.debug(DebugFlags::RENDER) {
            log::debug!(target: "tessera::render", " - {:?} render node {:?}", id, node);
        }

        self.set_active_shader(None);

        let clip_list = self
            .nearest_ancestor(node, NodeType::Clip, None)
            .and_then(|c| ctx.shadows.lookup(c));
        self.update_clip(clip_list, batch.is_opaque);

        let root_node = element.root.and_then(|r| ctx.shadows.get(r)).map(|s| s.node);
        let mut matrix = ctx.root_matrix(element.root);
        if let Some(t) = self
            .nearest_ancestor(node, NodeType::Transform, root_node)
            .and_then(|t| ctx.shadows.lookup(t))
        {
            matrix = matrix.then(&ctx.shadows[t].combined_matrix);
        }
        let opacity = self
            .nearest_ancestor(node, NodeType::Opacity, None)
            .and_then(|o| ctx.shadows.lookup(o))
            .map_or(1.0, |o| ctx.shadows[o].combined_opacity);

        let state = RenderNodeState {
            projection: self.target.projection,
            matrix,
            opacity,
            scissor: self
                .clip
                .clip_type
                .contains(ClipType::SCISSOR)
                .then_some(self.clip.scissor)
                .flatten(),
            stencil_reference: self
                .clip
                .clip_type
                .contains(ClipType::STENCIL)
                .then_some(self.clip.stencil_value),
        };

        let use_depth = ctx.use_depth_buffer;
        if use_depth {
            self.backend.set_depth_state(false, false);
        }
        let Some(render_node) = self.scene.render_node_mut(node) else {
            return;
        };
        let changes = render_node.changed_states();
        render_node.render(&state, self.backend);
        self.draw_calls += 1;

        if changes.intersects(StateFlags::STENCIL | StateFlags::SCISSOR) {
            self.backend.disable_stencil();
            self.backend.set_scissor(None);
            self.current_clip = None;
            self.clip = ClipState::default();
        }
        if changes.contains(StateFlags::BLEND) {
            self.backend.set_blending(true);
        }
        if use_depth {
            self.backend.set_depth_state(true, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::{GpuCommand, RecordingBackend};
    use crate::config::RendererConfig;
    use crate::geometry::Rect;
    use crate::material::test_materials::FlatColor;
    use crate::render_node::RenderNode;
    use crate::scene::{GeometryNode, NodeKind};
    use crate::shader::test_compiler::CountingCompiler;
    use crate::updater::Updater;
    use crate::upload::Uploader;

    fn blended_rect(x: f32, color: [u8; 4]) -> NodeKind {
        NodeKind::Geometry(GeometryNode::new(
            Geometry::rect(Rect::new(x, 0.0, 10.0, 10.0)),
            Rc::new(FlatColor::blended(color)),
        ))
    }

    fn prepare(scene: &mut SceneGraph, backend: &mut RecordingBackend) -> BatchContext {
        let mut ctx = BatchContext::new(RendererConfig::default());
        for (node, state) in scene.take_changes() {
            ctx.node_changed(scene, node, state);
        }
        Updater::default().update_states(&mut ctx, scene);
        ctx.build_render_lists_from_scratch(scene);
        ctx.prepare_opaque_batches(scene);
        ctx.prepare_alpha_batches(scene);
        ctx.z_range = 1.0 / ctx.next_render_order.max(1) as f32;
        let mut uploader = Uploader::default();
        for b in ctx.opaque_batches.clone().into_iter().chain(ctx.alpha_batches.clone()) {
            uploader.upload_batch(&mut ctx, scene, backend, b);
        }
        backend.clear_commands();
        ctx
    }

    fn target() -> FrameTarget {
        FrameTarget {
            projection: Transform::ortho(0.0, 100.0, 100.0, 0.0, 1.0, -1.0),
            device_size: (100, 100),
        }
    }

    #[test]
    fn test_alpha_batches_draw_in_order_with_blending() {
        let mut scene = SceneGraph::new();
        scene.append_child(scene.root(), blended_rect(0.0, [1, 0, 0, 128]));
        scene.append_child(scene.root(), blended_rect(5.0, [2, 0, 0, 128]));
        let mut backend = RecordingBackend::new();
        let ctx = prepare(&mut scene, &mut backend);
        let compiler = CountingCompiler::default();
        let log = compiler.log.clone();
        let mut shaders = ShaderCache::new(compiler);

        let mut exec = Executor::new(&ctx, &mut scene, &mut shaders, &mut backend, target());
        exec.render_batches().unwrap();
        assert_eq!(exec.draw_calls, 2);

        let draws = backend.draws();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|d| d.blending));
        assert!(draws[0].zorder_offset.is_some());
        // One program for both batches, state pushed per batch.
        assert_eq!(log.borrow().compiles, vec![true]);
        assert_eq!(log.borrow().updates.len(), 2);
    }

    #[test]
    fn test_material_error_aborts_frame() {
        let mut scene = SceneGraph::new();
        let g = scene.append_child(scene.root(), blended_rect(0.0, [1, 0, 0, 128]));
        let mut backend = RecordingBackend::new();
        let ctx = prepare(&mut scene, &mut backend);
        let compiler = CountingCompiler::default();
        compiler.log.borrow_mut().fail_update = true;
        let mut shaders = ShaderCache::new(compiler);

        let mut exec = Executor::new(&ctx, &mut scene, &mut shaders, &mut backend, target());
        match exec.render_batches() {
            Err(RenderError::Material { node, .. }) => assert_eq!(node, g),
            other => panic!("expected material error, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_compile_skips_batch() {
        let mut scene = SceneGraph::new();
        scene.append_child(scene.root(), blended_rect(0.0, [1, 0, 0, 128]));
        let mut backend = RecordingBackend::new();
        let ctx = prepare(&mut scene, &mut backend);
        let compiler = CountingCompiler::default();
        compiler.log.borrow_mut().fail_compile = true;
        let mut shaders = ShaderCache::new(compiler);

        let mut exec = Executor::new(&ctx, &mut scene, &mut shaders, &mut backend, target());
        exec.render_batches().unwrap();
        assert!(backend.draws().is_empty());
    }

    #[test]
    fn test_debug_switches_skip_passes() {
        let mut scene = SceneGraph::new();
        scene.append_child(scene.root(), blended_rect(0.0, [1, 0, 0, 128]));
        let mut backend = RecordingBackend::new();
        let mut ctx = prepare(&mut scene, &mut backend);
        ctx.config.debug = DebugFlags::NO_ALPHA;
        let mut shaders = ShaderCache::new(CountingCompiler::default());

        let mut exec = Executor::new(&ctx, &mut scene, &mut shaders, &mut backend, target());
        exec.render_batches().unwrap();
        assert!(backend.draws().is_empty());
    }

    struct Probe {
        seen: Rc<RefCell<Option<RenderNodeState>>>,
    }

    impl RenderNode for Probe {
        fn render(&mut self, state: &RenderNodeState, _backend: &mut dyn GpuBackend) {
            *self.seen.borrow_mut() = Some(state.clone());
        }

        fn changed_states(&self) -> StateFlags {
            StateFlags::SCISSOR | StateFlags::BLEND
        }
    }

    #[test]
    fn test_render_node_gets_resolved_state() {
        let seen = Rc::new(RefCell::new(None));
        let mut scene = SceneGraph::new();
        let o = scene.append_child(scene.root(), NodeKind::Opacity(0.5));
        let t = scene.append_child(o, NodeKind::Transform(Transform::translate(3.0, 4.0)));
        scene.append_child(t, NodeKind::RenderNode(Box::new(Probe { seen: seen.clone() })));
        let mut backend = RecordingBackend::new();
        let ctx = prepare(&mut scene, &mut backend);
        let mut shaders = ShaderCache::new(CountingCompiler::default());

        let mut exec = Executor::new(&ctx, &mut scene, &mut shaders, &mut backend, target());
        exec.render_batches().unwrap();

        let state = seen.borrow().clone().unwrap();
        assert_eq!(state.matrix.translation(), (3.0, 4.0));
        assert!((state.opacity - 0.5).abs() < 1e-6);
        assert!(state.scissor.is_none());
        assert!(backend.commands().contains(&GpuCommand::SetScissor(None)));
    }
}
