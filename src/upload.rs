//! Batch upload: flattens a batch's geometry into GPU buffers.
//!
//! A merged batch is one vertex buffer holding every member's vertices,
//! pre-transformed into root space, followed by one f32 depth per vertex
//! when the depth buffer is in use. Its 16-bit indices are rebased per
//! member and split into draw sets small enough to address with u16.
//!
//! An unmerged batch keeps each member's vertex and index bytes verbatim;
//! the executor draws them one by one with the member's own matrix.

use crate::backend::{BufferKind, GpuBackend};
use crate::batch::{self, BatchId, DrawSet};
use crate::config::DebugFlags;
use crate::context::BatchContext;
use crate::element::{Element, ElementId};
use crate::geometry::{DrawMode, Geometry, IndexFormat, Indices};
use crate::material::MaterialFlags;
use crate::scene::SceneGraph;

/// Largest vertex count one draw set may address. 0xffff is left free
/// because strip topologies reserve it for primitive restart.
pub(crate) const MAX_VERTICES_PER_DRAW_SET: usize = 0xfffe;

/// Members with more vertices than this keep a batch unmerged.
const MAX_VERTICES_PER_MERGED_ELEMENT: usize = 0xffff;

/// Index count a member contributes to a merged batch.
pub(crate) fn fix_index_count(count: usize, mode: DrawMode) -> usize {
    match mode {
        // Leading and trailing degenerate index
        DrawMode::TriangleStrip => count + 2,
        DrawMode::Lines => count - count % 2,
        DrawMode::Triangles => count - count % 3,
        _ => count,
    }
}

fn element_geometry<'a>(scene: &'a SceneGraph, element: &Element) -> Option<&'a Geometry> {
    scene.geometry_node(element.node).map(|gn| &gn.geometry)
}

/// Whether the batch can be drawn as one pre-transformed vertex stream.
pub(crate) fn is_mergeable(ctx: &BatchContext, scene: &SceneGraph, id: BatchId) -> bool {
    let Some(batch) = ctx.batches.get(id) else {
        return false;
    };
    let Some(first) = batch.first.and_then(|e| ctx.elements.get(e)) else {
        return false;
    };
    let Some(gn) = scene.geometry_node(first.node) else {
        return false;
    };
    let g = &gn.geometry;
    let flags = gn.active_material(first.inherited_opacity).flags();

    let mode_ok = matches!(
        g.mode(),
        DrawMode::Triangles | DrawMode::TriangleStrip | DrawMode::Lines | DrawMode::Points
    );
    let indices_ok = matches!(g.index_format(), None | Some(IndexFormat::U16));
    let small_enough = batch::batch_elements(batch, &ctx.elements).all(|(_, e)| {
        element_geometry(scene, e).map_or(false, |g| g.vertex_count() <= MAX_VERTICES_PER_MERGED_ELEMENT)
    });

    mode_ok
        && batch.position_attribute.is_some()
        && indices_ok
        && small_enough
        && !flags.contains(MaterialFlags::CUSTOM_COMPILE_STEP)
        && !flags.contains(MaterialFlags::REQUIRES_FULL_MATRIX)
        && (!flags.contains(MaterialFlags::REQUIRES_FULL_MATRIX_EXCEPT_TRANSLATE)
            || batch::is_translate_only_to_root(batch, &ctx.elements))
        && batch::is_safe_to_batch(batch, &ctx.elements)
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_f32(buf: &mut [u8], at: usize, value: f32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Write cursors into the scratch pools for a merged upload.
struct MergeCursor {
    vertex: usize,
    zorder: usize,
    index: usize,
    base: u16,
}

/// Scratch memory reused across uploads.
#[derive(Default)]
pub(crate) struct Uploader {
    vertex_pool: Vec<u8>,
    index_pool: Vec<u8>,
    largest_vertex_upload: usize,
    largest_index_upload: usize,
}

impl Uploader {
    pub(crate) fn begin_frame(&mut self) {
        self.largest_vertex_upload = 0;
        self.largest_index_upload = 0;
    }

    /// Give memory back when this frame's uploads used less than half of it.
    pub(crate) fn shrink_pools(&mut self) {
        if self.largest_vertex_upload * 2 < self.vertex_pool.capacity() {
            self.vertex_pool.clear();
            self.vertex_pool.shrink_to(self.largest_vertex_upload * 2);
        }
        if self.largest_index_upload * 2 < self.index_pool.capacity() {
            self.index_pool.clear();
            self.index_pool.shrink_to(self.largest_index_upload * 2);
        }
    }

    pub(crate) fn pool_capacity(&self) -> (usize, usize) {
        (self.vertex_pool.capacity(), self.index_pool.capacity())
    }

    pub(crate) fn upload_batch(
        &mut self,
        ctx: &mut BatchContext,
        scene: &SceneGraph,
        backend: &mut dyn GpuBackend,
        id: BatchId,
    ) {
        let Some(batch) = ctx.batches.get(id) else {
            return;
        };
        if !batch.needs_upload || !batch.is_valid() || batch.is_render_node {
            return;
        }
        let members: Vec<ElementId> = batch::batch_elements(batch, &ctx.elements).map(|(e, _)| e).collect();
        let Some(g) = members
            .first()
            .and_then(|&e| element_geometry(scene, &ctx.elements[e]))
        else {
            return;
        };
        let mode = g.mode();
        let stride = g.stride();
        let merged = is_mergeable(ctx, scene, id);

        let mut vertex_count = 0;
        let mut index_count = 0;
        let mut unmerged_index_bytes = 0;
        for &e in &members {
            let Some(eg) = element_geometry(scene, &ctx.elements[e]) else {
                continue;
            };
            vertex_count += eg.vertex_count();
            if merged {
                let count = if eg.index_count() == 0 { eg.vertex_count() } else { eg.index_count() };
                index_count += fix_index_count(count, mode);
            } else {
                index_count += eg.index_count();
                unmerged_index_bytes += eg.indices().as_bytes().len();
            }
        }

        {
            let batch = &mut ctx.batches[id];
            batch.merged = merged;
            batch.vertex_count = vertex_count;
            batch.index_count = index_count;
        }
        if vertex_count == 0 || (merged && index_count == 0) {
            return;
        }

        let use_depth = merged && ctx.use_depth_buffer;
        let vertex_bytes = vertex_count * stride + if use_depth { vertex_count * 4 } else { 0 };
        let index_bytes = if merged { index_count * 2 } else { unmerged_index_bytes };

        self.vertex_pool.clear();
        self.vertex_pool.resize(vertex_bytes, 0);
        self.index_pool.clear();
        self.index_pool.resize(index_bytes, 0);

        if merged {
            let position = ctx.batches[id].position_attribute.unwrap_or(0);
            let draw_sets = self.fill_merged(ctx, scene, &members, mode, stride, position, use_depth);
            ctx.batches[id].draw_sets = draw_sets;
        } else {
            self.fill_unmerged(ctx, scene, &members);
        }

        if ctx.config.debug.contains(DebugFlags::UPLOAD) {
            log::debug!(
                target: "tessera::upload",
                "batch {:?}: {} elements, merged={}, {} vertices, {} indices, {} draw sets",
                id,
                members.len(),
                merged,
                vertex_count,
                index_count,
                ctx.batches[id].draw_sets.len()
            );
        }

        let usage = ctx.config.buffer_usage;
        let batch = &mut ctx.batches[id];
        let vbo = *batch.vbo.id.get_or_insert_with(|| backend.create_buffer(BufferKind::Vertex));
        backend.upload_buffer(vbo, &self.vertex_pool, usage);
        batch.vbo.size = vertex_bytes;
        if index_bytes > 0 {
            let ibo = *batch.ibo.id.get_or_insert_with(|| backend.create_buffer(BufferKind::Index));
            backend.upload_buffer(ibo, &self.index_pool, usage);
        }
        batch.ibo.size = index_bytes;
        batch.needs_upload = false;
        batch.uploaded_this_frame = true;

        self.largest_vertex_upload = self.largest_vertex_upload.max(vertex_bytes);
        self.largest_index_upload = self.largest_index_upload.max(index_bytes);
        ctx.stats.batches_uploaded += 1;
        ctx.stats.bytes_uploaded += vertex_bytes + index_bytes;
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_merged(
        &mut self,
        ctx: &BatchContext,
        scene: &SceneGraph,
        members: &[ElementId],
        mode: DrawMode,
        stride: usize,
        position: usize,
        use_depth: bool,
    ) -> Vec<DrawSet> {
        let total_vertices: usize = members
            .iter()
            .filter_map(|&e| element_geometry(scene, &ctx.elements[e]))
            .map(Geometry::vertex_count)
            .sum();
        let mut cursor = MergeCursor {
            vertex: 0,
            zorder: total_vertices * stride,
            index: 0,
            base: 0,
        };
        let strip = mode == DrawMode::TriangleStrip;
        let close = |set: &mut DrawSet, count: usize| {
            set.index_count = count;
            // The first leading and last trailing degenerate are not needed,
            // and the leading one would flip the winding of the first strip.
            if strip {
                set.indices += 2;
                set.index_count = set.index_count.saturating_sub(2);
            }
        };

        let mut sets = vec![DrawSet::new(0, cursor.zorder, 0)];
        let mut vertices_in_set = 0;
        let mut indices_in_set = 0;
        for &e in members {
            let element = &ctx.elements[e];
            let Some(g) = element_geometry(scene, element) else {
                continue;
            };
            vertices_in_set += g.vertex_count();
            if vertices_in_set > MAX_VERTICES_PER_DRAW_SET {
                if indices_in_set > 0 {
                    if let Some(set) = sets.last_mut() {
                        close(set, indices_in_set);
                    }
                    sets.push(DrawSet::new(cursor.vertex, cursor.zorder, cursor.index));
                } else if let Some(set) = sets.last_mut() {
                    // Nothing drawn from this set yet, so restart it here.
                    *set = DrawSet::new(cursor.vertex, cursor.zorder, cursor.index);
                }
                cursor.base = 0;
                vertices_in_set = g.vertex_count();
                indices_in_set = 0;
            }
            let z = use_depth.then(|| 1.0 - element.order as f32 * ctx.z_range);
            indices_in_set += self.upload_merged_element(element, g, position, z, &mut cursor);
        }
        if let Some(set) = sets.last_mut() {
            close(set, indices_in_set);
        }
        sets
    }

    /// Copy one member into the merged buffers and return the number of
    /// indices written.
    fn upload_merged_element(
        &mut self,
        element: &Element,
        g: &Geometry,
        position: usize,
        z: Option<f32>,
        cursor: &mut MergeCursor,
    ) -> usize {
        let stride = g.stride();
        let vertex_count = g.vertex_count();
        let size = vertex_count * stride;
        let dst = &mut self.vertex_pool[cursor.vertex..cursor.vertex + size];
        dst.copy_from_slice(&g.vertex_data()[..size]);

        let m = &element.matrix;
        if !m.is_identity() {
            let translate_only = m.is_translate_only();
            let (tx, ty) = m.translation();
            for vertex in dst.chunks_exact_mut(stride) {
                let p = &mut vertex[position..position + 8];
                let [x, y]: [f32; 2] = bytemuck::pod_read_unaligned(p);
                let (x, y) = if translate_only { (x + tx, y + ty) } else { m.transform_point(x, y) };
                p.copy_from_slice(bytemuck::bytes_of(&[x, y]));
            }
        }
        cursor.vertex += size;

        if let Some(z) = z {
            for _ in 0..vertex_count {
                put_f32(&mut self.vertex_pool, cursor.zorder, z);
                cursor.zorder += 4;
            }
        }

        let mode = g.mode();
        let strip = mode == DrawMode::TriangleStrip;
        let source_count = if g.index_count() == 0 { vertex_count } else { g.index_count() };
        let count = if strip { source_count } else { fix_index_count(source_count, mode) };
        let index_at = |i: usize| -> u16 {
            match g.indices() {
                Indices::None => i as u16,
                Indices::U16(v) => v[i],
                Indices::U32(v) => v[i] as u16,
            }
        };

        let base = cursor.base;
        let mut written = 0;
        let mut push = |pool: &mut Vec<u8>, value: u16| {
            put_u16(pool, cursor.index + written * 2, value);
            written += 1;
        };
        if strip && count > 0 {
            push(&mut self.index_pool, base + index_at(0));
        }
        for i in 0..count {
            push(&mut self.index_pool, base + index_at(i));
        }
        if strip && count > 0 {
            push(&mut self.index_pool, base + index_at(count - 1));
        }

        cursor.index += written * 2;
        cursor.base += vertex_count as u16;
        written
    }

    fn fill_unmerged(&mut self, ctx: &BatchContext, scene: &SceneGraph, members: &[ElementId]) {
        let mut vertex_at = 0;
        let mut index_at = 0;
        for &e in members {
            let Some(g) = element_geometry(scene, &ctx.elements[e]) else {
                continue;
            };
            let size = g.vertex_count() * g.stride();
            self.vertex_pool[vertex_at..vertex_at + size].copy_from_slice(&g.vertex_data()[..size]);
            vertex_at += size;

            let indices = g.indices().as_bytes();
            self.index_pool[index_at..index_at + indices.len()].copy_from_slice(indices);
            index_at += indices.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::backend::RecordingBackend;
    use crate::config::RendererConfig;
    use crate::geometry::{AttributeSet, Point2D, Rect};
    use crate::material::test_materials::FlatColor;
    use crate::scene::{GeometryNode, NodeKind};
    use crate::transform::Transform;
    use crate::updater::Updater;

    fn prepare(scene: &mut SceneGraph, use_depth_buffer: bool) -> BatchContext {
        let config = RendererConfig {
            use_depth_buffer,
            ..RendererConfig::default()
        };
        let mut ctx = BatchContext::new(config);
        for (node, state) in scene.take_changes() {
            ctx.node_changed(scene, node, state);
        }
        Updater::default().update_states(&mut ctx, scene);
        ctx.build_render_lists_from_scratch(scene);
        ctx.prepare_opaque_batches(scene);
        ctx.prepare_alpha_batches(scene);
        ctx.z_range = 1.0 / ctx.next_render_order as f32;
        ctx
    }

    fn blended_rect(x: f32) -> NodeKind {
        NodeKind::Geometry(GeometryNode::new(
            Geometry::rect(Rect::new(x, 0.0, 10.0, 10.0)),
            Rc::new(FlatColor::blended([0, 0, 0, 128])),
        ))
    }

    fn indices(backend: &RecordingBackend, ctx: &BatchContext, id: BatchId) -> Vec<u16> {
        let ibo = ctx.batches[id].ibo.id.unwrap();
        bytemuck::pod_collect_to_vec(backend.buffer_data(ibo).unwrap())
    }

    #[test]
    fn test_fix_index_count() {
        assert_eq!(fix_index_count(4, DrawMode::TriangleStrip), 6);
        assert_eq!(fix_index_count(5, DrawMode::Lines), 4);
        assert_eq!(fix_index_count(7, DrawMode::Triangles), 6);
        assert_eq!(fix_index_count(5, DrawMode::Points), 5);
    }

    #[test]
    fn test_merged_strips_get_degenerates() {
        let mut scene = SceneGraph::new();
        scene.append_child(scene.root(), blended_rect(0.0));
        scene.append_child(scene.root(), blended_rect(20.0));
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let mut uploader = Uploader::default();
        let id = ctx.alpha_batches[0];
        uploader.upload_batch(&mut ctx, &scene, &mut backend, id);

        let batch = &ctx.batches[id];
        assert!(batch.merged);
        assert_eq!(batch.index_count, 12);
        assert_eq!(indices(&backend, &ctx, id), vec![0, 0, 1, 2, 3, 3, 4, 4, 5, 6, 7, 7]);
        assert_eq!(batch.draw_sets.len(), 1);
        assert_eq!(batch.draw_sets[0].indices, 2);
        assert_eq!(batch.draw_sets[0].index_count, 10);
        assert!(!batch.needs_upload);
        assert_eq!(ctx.stats.batches_uploaded, 1);
    }

    #[test]
    fn test_merged_vertices_are_pre_transformed() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::translate(5.0, 7.0)));
        scene.append_child(t, blended_rect(0.0));
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let id = ctx.alpha_batches[0];
        Uploader::default().upload_batch(&mut ctx, &scene, &mut backend, id);

        let vbo = ctx.batches[id].vbo.id.unwrap();
        let points: Vec<Point2D> = bytemuck::pod_collect_to_vec(backend.buffer_data(vbo).unwrap());
        assert_eq!((points[0].x, points[0].y), (5.0, 7.0));
        assert_eq!((points[3].x, points[3].y), (15.0, 17.0));
    }

    #[test]
    fn test_depth_stream_follows_vertices() {
        let mut scene = SceneGraph::new();
        scene.append_child(
            scene.root(),
            NodeKind::Geometry(GeometryNode::new(
                Geometry::rect(Rect::new(0.0, 0.0, 10.0, 10.0)),
                Rc::new(FlatColor::opaque([255; 4])),
            )),
        );
        scene.append_child(scene.root(), blended_rect(20.0));
        let mut ctx = prepare(&mut scene, true);
        let mut backend = RecordingBackend::new();
        let id = ctx.opaque_batches[0];
        Uploader::default().upload_batch(&mut ctx, &scene, &mut backend, id);

        let vbo = ctx.batches[id].vbo.id.unwrap();
        let data = backend.buffer_data(vbo).unwrap();
        assert_eq!(data.len(), 4 * 8 + 4 * 4);
        let z: Vec<f32> = bytemuck::pod_collect_to_vec(&data[32..]);
        assert_eq!(z, vec![1.0; 4]);
        assert_eq!(ctx.batches[id].draw_sets[0].zorders, 32);
    }

    #[test]
    fn test_unmerged_copies_verbatim() {
        let mut scene = SceneGraph::new();
        let geometry = Geometry::rect(Rect::new(0.0, 0.0, 10.0, 10.0)).with_indices_u32(vec![0, 1, 2, 3]);
        scene.append_child(
            scene.root(),
            NodeKind::Geometry(GeometryNode::new(geometry, Rc::new(FlatColor::blended([1; 4])))),
        );
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let id = ctx.alpha_batches[0];
        Uploader::default().upload_batch(&mut ctx, &scene, &mut backend, id);

        assert!(!ctx.batches[id].merged);
        let ibo = ctx.batches[id].ibo.id.unwrap();
        let raw: Vec<u32> = bytemuck::pod_collect_to_vec(backend.buffer_data(ibo).unwrap());
        assert_eq!(raw, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_draw_sets_split_past_u16_range() {
        let mut scene = SceneGraph::new();
        for _ in 0..3 {
            let g = Geometry::new(AttributeSet::point_2d(), 30_000, DrawMode::Points);
            scene.append_child(
                scene.root(),
                NodeKind::Geometry(GeometryNode::new(g, Rc::new(FlatColor::blended([2; 4])))),
            );
        }
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let id = ctx.alpha_batches[0];
        Uploader::default().upload_batch(&mut ctx, &scene, &mut backend, id);

        let sets = &ctx.batches[id].draw_sets;
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].index_count, 60_000);
        assert_eq!(sets[1].index_count, 30_000);
        assert_eq!(sets[1].vertices, 60_000 * 8);
        assert_eq!(sets[1].indices, 60_000 * 2);
        // The second set restarts at index 0.
        assert_eq!(indices(&backend, &ctx, id)[60_000], 0);
    }

    #[test]
    fn test_members_without_indices_still_split_draw_sets() {
        let mut scene = SceneGraph::new();
        let material = Rc::new(FlatColor::blended([3; 4]));
        // Two indices cannot form a triangle, so these members draw nothing.
        for _ in 0..2 {
            let g = Geometry::new(AttributeSet::point_2d(), 30_000, DrawMode::Triangles).with_indices_u16(vec![0, 1]);
            scene.append_child(scene.root(), NodeKind::Geometry(GeometryNode::new(g, material.clone())));
        }
        let g = Geometry::new(AttributeSet::point_2d(), 30_000, DrawMode::Triangles)
            .with_indices_u16((0..30_000).map(|i| i as u16).collect());
        scene.append_child(scene.root(), NodeKind::Geometry(GeometryNode::new(g, material)));
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let id = ctx.alpha_batches[0];
        assert_eq!(ctx.alpha_batches.len(), 1);
        Uploader::default().upload_batch(&mut ctx, &scene, &mut backend, id);

        let sets = &ctx.batches[id].draw_sets;
        assert!(ctx.batches[id].merged);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].vertices, 60_000 * 8);
        assert_eq!(sets[0].index_count, 30_000);
        let written = indices(&backend, &ctx, id);
        assert_eq!(written[sets[0].indices / 2], 0);
        assert_eq!(written[sets[0].indices / 2 + 29_999], 29_999);
    }

    #[test]
    fn test_clean_batches_are_not_reuploaded() {
        let mut scene = SceneGraph::new();
        scene.append_child(scene.root(), blended_rect(0.0));
        let mut ctx = prepare(&mut scene, false);
        let mut backend = RecordingBackend::new();
        let mut uploader = Uploader::default();
        let id = ctx.alpha_batches[0];
        uploader.upload_batch(&mut ctx, &scene, &mut backend, id);
        backend.clear_commands();
        uploader.upload_batch(&mut ctx, &scene, &mut backend, id);
        assert!(backend.uploaded_buffers().is_empty());
    }

    #[test]
    fn test_shrink_pools() {
        let mut uploader = Uploader::default();
        uploader.vertex_pool.reserve(4096);
        uploader.begin_frame();
        uploader.largest_vertex_upload = 100;
        uploader.shrink_pools();
        assert!(uploader.pool_capacity().0 < 4096);
    }
}
