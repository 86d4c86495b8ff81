//! Change processing: client notifications into shadow-tree edits.
//!
//! Each `(node, state)` notification drained from the scene graph lands
//! in [`BatchContext::node_changed`]. Structural changes create or tear
//! down shadow nodes, matrix changes may promote a transform to a batch
//! root, and geometry/material changes decide how much of the existing
//! batching survives. Everything that cannot be decided locally becomes a
//! [`RebuildFlags`] request for the next render.

use crate::batch::{self, BatchCompatibility};
use crate::context::{BatchContext, RebuildFlags};
use crate::element::{Element, ElementFlags};
use crate::render_node::RenderNodeFlags;
use crate::roots::ClipBatchRootInfo;
use crate::scene::{DirtyState, GeometryNode, NodeId, NodeKind, NodeType, SceneGraph};
use crate::shadow::{ShadowId, ShadowPayload};

/// Blending classification used to pick the render list.
pub(crate) fn has_material_with_blending(node: &GeometryNode) -> bool {
    let material = node.opaque_material.as_ref().unwrap_or(&node.material);
    material.flags().contains(crate::material::MaterialFlags::BLENDING)
}

impl BatchContext {
    pub(crate) fn node_changed(&mut self, scene: &SceneGraph, node: NodeId, state: DirtyState) {
        // Nodes destroyed since the notification was queued only matter for removal.
        if !scene.contains(node) && !state.contains(DirtyState::NODE_REMOVED) {
            return;
        }
        log::debug!(target: "tessera::change", "{:?} {:?}", node, state);

        if state.contains(DirtyState::SUBTREE_BLOCKED) {
            if state.contains(DirtyState::OPACITY) {
                self.rebuild |= RebuildFlags::FULL_REBUILD;
            }
            let blocked = scene.is_subtree_blocked(node);
            let has_shadow = self.shadows.lookup(node).is_some();
            if blocked && has_shadow {
                self.node_changed(scene, node, DirtyState::NODE_REMOVED);
            } else if !blocked && !has_shadow {
                self.node_changed(scene, node, DirtyState::NODE_ADDED);
            }
            return;
        }

        if state.contains(DirtyState::NODE_ADDED) {
            if scene.is_node_blocked(node) {
                return;
            }
            // Already mirrored when added along with an ancestor.
            if self.shadows.lookup(node).is_none() {
                if node == scene.root() {
                    self.node_was_added(scene, node, None);
                } else {
                    let Some(parent) = scene.parent(node).and_then(|p| self.shadows.lookup(p)) else {
                        return;
                    };
                    self.node_was_added(scene, node, Some(parent));
                }
            }
        }

        let Some(shadow) = self.shadows.lookup(node) else {
            return;
        };
        self.shadows[shadow].dirty |= state;

        let node_type = self.shadows[shadow].node_type;

        if state.contains(DirtyState::MATRIX) && node_type == NodeType::Transform && !self.shadows[shadow].is_batch_root {
            if scene.subtree_renderable_count(node) > self.config.batch_node_threshold {
                self.turn_node_into_batch_root(shadow);
            } else {
                let mut vertices = 0;
                self.node_was_transformed(scene, shadow, &mut vertices);
                if vertices > self.config.batch_vertex_threshold as usize {
                    self.turn_node_into_batch_root(shadow);
                }
            }
        }

        if state.contains(DirtyState::GEOMETRY) && node_type == NodeType::Geometry {
            if let Some(e) = self.shadows[shadow].element() {
                self.elements[e].invalidate_bounds();
                if let Some(b) = self.elements[e].batch {
                    let compatible = batch::geometry_was_changed(&mut self.batches[b], &self.elements, scene, node);
                    if !compatible || !self.batches[b].is_opaque {
                        self.invalidate_batch_and_overlapping_render_orders(b);
                    }
                }
            }
        }

        if state.contains(DirtyState::MATERIAL) && node_type == NodeType::Geometry {
            if let (Some(e), Some(gn)) = (self.shadows[shadow].element(), scene.geometry_node(node)) {
                let blended = has_material_with_blending(gn);
                let element = &mut self.elements[e];
                if element.flags.contains(ElementFlags::MATERIAL_BLENDED) != blended {
                    element.flags.set(ElementFlags::MATERIAL_BLENDED, blended);
                    self.rebuild |= RebuildFlags::FULL_REBUILD;
                } else if let Some(b) = element.batch {
                    let compatibility = batch::is_material_compatible(&self.batches[b], &self.elements, scene, &self.elements[e]);
                    if compatibility == BatchCompatibility::BreaksOnCompare {
                        self.invalidate_batch_and_overlapping_render_orders(b);
                    }
                } else {
                    self.rebuild |= RebuildFlags::BUILD_BATCHES;
                }
            }
        }

        self.shadows.propagate_dirty(shadow, state);

        // Last, since it frees the shadow node.
        if state.contains(DirtyState::NODE_REMOVED) {
            self.node_was_removed(shadow);
        }
    }

    /// Create shadows for `node` and its visible subtree.
    pub(crate) fn node_was_added(&mut self, scene: &SceneGraph, node: NodeId, parent: Option<ShadowId>) {
        if scene.is_subtree_blocked(node) {
            return;
        }
        let Some(kind) = scene.kind(node) else {
            return;
        };
        let shadow = self.shadows.insert(node, kind.node_type(), parent);

        match kind {
            NodeKind::Geometry(gn) => {
                let e = self.elements.insert(Element::new(node, has_material_with_blending(gn)));
                self.shadows[shadow].payload = ShadowPayload::Element(e);
            }
            NodeKind::Clip(_) => {
                self.shadows[shadow].payload = ShadowPayload::ClipBatchRoot(ClipBatchRootInfo::default());
                self.rebuild |= RebuildFlags::FULL_REBUILD;
            }
            NodeKind::RenderNode(rn) => {
                let e = self.elements.insert(Element::new_render_node(node));
                self.shadows[shadow].payload = ShadowPayload::RenderNodeElement(e);
                self.render_node_elements.insert(e);
                if !rn.flags().contains(RenderNodeFlags::DEPTH_AWARE) {
                    self.use_depth_buffer = false;
                }
                self.rebuild |= RebuildFlags::FULL_REBUILD;
            }
            NodeKind::Basic | NodeKind::Transform(_) | NodeKind::Opacity(_) => {}
        }

        for child in scene.children(node) {
            self.node_was_added(scene, child, Some(shadow));
        }
    }

    /// Tear down a shadow subtree, children first.
    pub(crate) fn node_was_removed(&mut self, shadow: ShadowId) {
        while let Some(child) = self.shadows.first_child(shadow) {
            self.node_was_removed(child);
        }

        let node_type = self.shadows[shadow].node_type;
        let is_batch_root = self.shadows[shadow].is_batch_root;

        match node_type {
            NodeType::Geometry => {
                if let Some(e) = self.shadows[shadow].element() {
                    let element = &mut self.elements[e];
                    element.flags.insert(ElementFlags::REMOVED);
                    let (root, batch) = (element.root, element.batch);
                    self.elements_to_delete.push(e);
                    let mut at = root;
                    while let Some(r) = at {
                        let Some(info) = self.shadows.root_info_mut(r) else {
                            break;
                        };
                        info.available_orders += 1;
                        at = info.parent_root;
                    }
                    if let Some(b) = batch {
                        self.batches[b].needs_upload = true;
                    }
                }
            }
            NodeType::RenderNode => {
                if let Some(e) = self.shadows[shadow].element() {
                    self.elements[e].flags.insert(ElementFlags::REMOVED);
                    self.elements_to_delete.push(e);
                    self.render_node_elements.remove(&e);
                    if self.render_node_elements.is_empty() {
                        self.use_depth_buffer = self.config.use_depth_buffer;
                    }
                }
            }
            _ if node_type == NodeType::Clip || is_batch_root => {
                self.shadows.remove_batch_root_from_parent(shadow);
                self.rebuild |= RebuildFlags::FULL_REBUILD;
                self.tagged_roots.remove(&shadow);
            }
            _ => {}
        }

        self.shadows.remove(shadow);
    }

    /// Invalidate bounds below a moved transform and count its vertices.
    pub(crate) fn node_was_transformed(&mut self, scene: &SceneGraph, shadow: ShadowId, vertex_count: &mut usize) {
        if self.shadows[shadow].node_type == NodeType::Geometry {
            if let Some(gn) = scene.geometry_node(self.shadows[shadow].node) {
                *vertex_count += gn.geometry.vertex_count();
            }
            if let Some(e) = self.shadows[shadow].element() {
                self.elements[e].invalidate_bounds();
                if let Some(b) = self.elements[e].batch {
                    if !self.batches[b].is_opaque {
                        self.invalidate_batch_and_overlapping_render_orders(b);
                    } else if self.batches[b].merged {
                        self.batches[b].needs_upload = true;
                    }
                }
            }
        }
        for child in self.shadows.children(shadow) {
            self.node_was_transformed(scene, child, vertex_count);
        }
    }

    pub(crate) fn turn_node_into_batch_root(&mut self, shadow: ShadowId) {
        log::debug!(target: "tessera::roots", "new batch root {:?}", self.shadows[shadow].node);
        self.rebuild |= RebuildFlags::FULL_REBUILD;
        self.shadows[shadow].is_batch_root = true;
        self.shadows[shadow].became_batch_root = true;

        let mut parent_root = None;
        let mut at = self.shadows.parent(shadow);
        while let Some(p) = at {
            if self.is_order_root(p) {
                parent_root = Some(p);
                break;
            }
            at = self.shadows.parent(p);
        }
        self.shadows.register_batch_root(shadow, parent_root);

        for child in self.shadows.children(shadow) {
            self.node_changed_batch_root(child, shadow);
        }
    }

    /// Re-home the subtree under `root`. Nested roots only move themselves.
    pub(crate) fn node_changed_batch_root(&mut self, shadow: ShadowId, root: ShadowId) {
        if self.is_order_root(shadow) {
            self.shadows.change_batch_root(shadow, root);
            return;
        }
        match self.shadows[shadow].node_type {
            NodeType::Geometry => {
                if let Some(e) = self.shadows[shadow].element() {
                    self.elements[e].root = Some(root);
                    self.elements[e].invalidate_bounds();
                }
            }
            NodeType::RenderNode => {
                if let Some(e) = self.shadows[shadow].element() {
                    self.elements[e].root = Some(root);
                }
            }
            _ => {}
        }
        for child in self.shadows.children(shadow) {
            self.node_changed_batch_root(child, root);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::config::RendererConfig;
    use crate::geometry::{Geometry, Rect};
    use crate::material::test_materials::FlatColor;
    use crate::scene::ClipNode;
    use crate::transform::Transform;

    fn rect_node(color: [u8; 4]) -> NodeKind {
        NodeKind::Geometry(GeometryNode::new(
            Geometry::rect(Rect::new(0.0, 0.0, 10.0, 10.0)),
            Rc::new(FlatColor::opaque(color)),
        ))
    }

    fn drain(ctx: &mut BatchContext, scene: &mut SceneGraph) {
        for (node, state) in scene.take_changes() {
            ctx.node_changed(scene, node, state);
        }
    }

    #[test]
    fn test_added_subtree_creates_shadows_and_elements() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        let g = scene.append_child(t, rect_node([255, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);

        assert_eq!(ctx.shadows.len(), 3);
        let sg = ctx.shadows.lookup(g).unwrap();
        assert!(ctx.shadows[sg].element().is_some());
        assert_eq!(ctx.elements.len(), 1);
    }

    #[test]
    fn test_child_added_with_its_parent_is_still_marked_dirty() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        let g = scene.append_child(t, rect_node([255, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);

        // The shadow for `g` already exists when its own notification arrives.
        let sg = ctx.shadows.lookup(g).unwrap();
        let st = ctx.shadows.lookup(t).unwrap();
        assert!(ctx.shadows[sg].dirty.contains(DirtyState::NODE_ADDED));
        assert!(ctx.shadows[st].subtree_dirty.contains(DirtyState::NODE_ADDED));
        assert_eq!(ctx.shadows.len(), 3);
    }

    #[test]
    fn test_removed_subtree_flags_elements_for_deletion() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        scene.append_child(t, rect_node([255, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);

        scene.remove(t);
        drain(&mut ctx, &mut scene);
        assert_eq!(ctx.shadows.len(), 1);
        assert_eq!(ctx.elements_to_delete.len(), 1);
        let e = ctx.elements_to_delete[0];
        assert!(ctx.elements[e].is_removed());
    }

    #[test]
    fn test_blocked_subtree_is_not_mirrored() {
        let mut scene = SceneGraph::new();
        let o = scene.append_child(scene.root(), NodeKind::Opacity(1.0));
        scene.append_child(o, rect_node([0, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);
        assert_eq!(ctx.shadows.len(), 3);

        scene.set_opacity(o, 0.0);
        drain(&mut ctx, &mut scene);
        assert!(ctx.shadows.lookup(o).is_none());
        assert_eq!(ctx.shadows.len(), 1);

        scene.set_opacity(o, 0.5);
        drain(&mut ctx, &mut scene);
        assert!(ctx.shadows.lookup(o).is_some());
        assert_eq!(ctx.shadows.len(), 3);
    }

    #[test]
    fn test_matrix_change_promotes_large_subtree() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        for _ in 0..4 {
            scene.append_child(t, rect_node([0, 0, 0, 255]));
        }
        let config = RendererConfig {
            batch_node_threshold: 3,
            ..RendererConfig::default()
        };
        let mut ctx = BatchContext::new(config);
        drain(&mut ctx, &mut scene);
        ctx.rebuild = RebuildFlags::empty();

        scene.set_matrix(t, Transform::translate(5.0, 0.0));
        drain(&mut ctx, &mut scene);
        let st = ctx.shadows.lookup(t).unwrap();
        assert!(ctx.shadows[st].is_batch_root);
        assert!(ctx.shadows[st].became_batch_root);
        assert_eq!(ctx.rebuild, RebuildFlags::FULL_REBUILD);
        for (_, e) in ctx.elements.iter() {
            assert_eq!(e.root, Some(st));
        }
    }

    #[test]
    fn test_vertex_threshold_promotes_small_subtree() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        scene.append_child(t, rect_node([0, 0, 0, 255]));
        let config = RendererConfig {
            batch_vertex_threshold: 3,
            ..RendererConfig::default()
        };
        let mut ctx = BatchContext::new(config);
        drain(&mut ctx, &mut scene);

        scene.set_matrix(t, Transform::translate(1.0, 1.0));
        drain(&mut ctx, &mut scene);
        let st = ctx.shadows.lookup(t).unwrap();
        assert!(ctx.shadows[st].is_batch_root);
    }

    #[test]
    fn test_promotion_registers_under_enclosing_clip() {
        let mut scene = SceneGraph::new();
        let c = scene.append_child(scene.root(), NodeKind::Clip(ClipNode::rect(Rect::new(0.0, 0.0, 50.0, 50.0))));
        let t = scene.append_child(c, NodeKind::Transform(Transform::IDENTITY));
        scene.append_child(t, rect_node([0, 0, 0, 255]));
        let config = RendererConfig {
            batch_node_threshold: 0,
            ..RendererConfig::default()
        };
        let mut ctx = BatchContext::new(config);
        drain(&mut ctx, &mut scene);

        scene.set_matrix(t, Transform::translate(1.0, 0.0));
        drain(&mut ctx, &mut scene);
        let (sc, st) = (ctx.shadows.lookup(c).unwrap(), ctx.shadows.lookup(t).unwrap());
        assert_eq!(ctx.shadows.root_info(st).and_then(|i| i.parent_root()), Some(sc));
    }

    #[test]
    fn test_material_blend_flip_forces_full_rebuild() {
        let mut scene = SceneGraph::new();
        let g = scene.append_child(scene.root(), rect_node([0, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);
        ctx.rebuild = RebuildFlags::empty();

        scene.set_material(g, Rc::new(FlatColor::blended([0, 0, 0, 128])));
        drain(&mut ctx, &mut scene);
        assert_eq!(ctx.rebuild, RebuildFlags::FULL_REBUILD);
        let e = ctx.shadows[ctx.shadows.lookup(g).unwrap()].element().unwrap();
        assert!(ctx.elements[e].flags.contains(ElementFlags::MATERIAL_BLENDED));
    }

    #[test]
    fn test_unbatched_material_change_rebuilds_batches() {
        let mut scene = SceneGraph::new();
        let g = scene.append_child(scene.root(), rect_node([0, 0, 0, 255]));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);
        ctx.rebuild = RebuildFlags::empty();

        scene.set_material(g, Rc::new(FlatColor::opaque([9, 9, 9, 255])));
        drain(&mut ctx, &mut scene);
        assert_eq!(ctx.rebuild, RebuildFlags::BUILD_BATCHES);
    }

    #[test]
    fn test_dirty_bits_propagate_to_ancestors() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::IDENTITY));
        let inner = scene.append_child(t, NodeKind::Transform(Transform::IDENTITY));
        let mut ctx = BatchContext::new(RendererConfig::default());
        drain(&mut ctx, &mut scene);
        let root = ctx.shadows.lookup(scene.root()).unwrap();
        assert!(ctx.shadows[root].dirty.contains(DirtyState::NODE_ADDED));

        scene.set_matrix(inner, Transform::translate(1.0, 0.0));
        drain(&mut ctx, &mut scene);
        let st = ctx.shadows.lookup(t).unwrap();
        assert!(ctx.shadows[st].subtree_dirty.contains(DirtyState::MATRIX));
    }
}
