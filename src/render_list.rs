//! Render lists: every visible element in paint order, split by pass.
//!
//! A full build walks the whole client tree and numbers elements from 0.
//! Batch roots reserve a quarter of their size as spare orders so later
//! additions can be numbered in place by rebuilding just the tagged roots.

use std::collections::HashSet;

use crate::context::BatchContext;
use crate::element::{ElementFlags, ElementId};
use crate::render_stats::RebuildKind;
use crate::scene::{NodeId, NodeType, SceneGraph};
use crate::shadow::ShadowId;

impl BatchContext {
    pub(crate) fn build_render_lists_from_scratch(&mut self, scene: &SceneGraph) {
        log::debug!(target: "tessera::build", "building render lists from scratch");
        self.opaque_list.clear();
        self.alpha_list.clear();

        let batches: Vec<_> = self.opaque_batches.drain(..).chain(self.alpha_batches.drain(..)).collect();
        for b in batches {
            self.invalidate_and_recycle_batch(b);
        }

        self.next_render_order = 0;
        self.build_render_lists(scene, scene.root());
        self.opaque_list.reverse();
        self.stats.rebuild = RebuildKind::Full;
    }

    pub(crate) fn build_render_lists_for_tagged_roots(&mut self, scene: &SceneGraph) {
        log::debug!(target: "tessera::build", "rebuilding {} tagged roots", self.tagged_roots.len());

        // Every listed element is an orphan until the walk below reaches it.
        // Whatever lies outside the tagged roots is re-appended afterwards.
        let mut orphans = Vec::new();
        for &e in self.opaque_list.iter().chain(self.alpha_list.iter()) {
            if let Some(element) = self.elements.get_mut(e) {
                if !element.is_removed() {
                    element.flags.insert(ElementFlags::ORPHANED);
                    orphans.push(e);
                }
            }
        }

        let mut tagged: HashSet<ShadowId> = self.tagged_roots.clone();
        for &root in &self.tagged_roots {
            self.shadows.tag_sub_roots(root, &mut tagged);
        }
        self.tagged_roots = tagged;

        for b in self.opaque_batches.clone().into_iter().chain(self.alpha_batches.clone()) {
            let root = self.batches[b].root;
            if root.is_some_and(|r| self.tagged_roots.contains(&r)) {
                self.invalidate_and_recycle_batch(b);
            }
        }

        self.opaque_list.clear();
        self.alpha_list.clear();
        let max_render_order = self.next_render_order;
        self.partial_rebuild = true;

        let roots: Vec<ShadowId> = self.tagged_roots.iter().copied().collect();
        for root in roots {
            let Some(info) = self.shadows.root_info(root) else {
                continue;
            };
            let (parent_root, first_order) = (info.parent_root, info.first_order);
            let top_most = parent_root.map_or(true, |p| !self.tagged_roots.contains(&p));
            let node = self.shadows[root].node;
            if top_most && !scene.is_node_blocked(node) {
                self.next_render_order = first_order;
                self.partial_rebuild_root = Some(root);
                self.build_render_lists(scene, node);
            }
        }

        self.partial_rebuild = false;
        self.partial_rebuild_root = None;
        self.tagged_roots.clear();
        self.next_render_order = self.next_render_order.max(max_render_order);

        for e in orphans {
            let Some(element) = self.elements.get_mut(e) else {
                continue;
            };
            if !element.flags.contains(ElementFlags::ORPHANED) || element.is_removed() {
                continue;
            }
            element.flags.remove(ElementFlags::ORPHANED);
            let opaque = self.is_opaque_element(scene, e);
            if opaque {
                self.opaque_list.push(e);
            } else {
                self.alpha_list.push(e);
            }
        }

        let elements = &self.elements;
        let order = |e: &ElementId| elements.get(*e).map_or(0, |e| e.order);
        self.opaque_list.sort_by_key(|e| std::cmp::Reverse(order(e)));
        self.alpha_list.sort_by_key(order);
        self.stats.rebuild = RebuildKind::Partial;
    }

    /// Whether a geometry element draws in the opaque pass.
    fn is_opaque_element(&self, scene: &SceneGraph, e: ElementId) -> bool {
        let Some(element) = self.elements.get(e) else {
            return false;
        };
        if element.is_render_node() || !self.use_depth_buffer {
            return false;
        }
        let Some(gn) = scene.geometry_node(element.node) else {
            return false;
        };
        element.inherited_opacity > crate::OPAQUE_LIMIT
            && !gn
                .active_material(element.inherited_opacity)
                .flags()
                .contains(crate::material::MaterialFlags::BLENDING)
    }

    fn build_render_lists(&mut self, scene: &SceneGraph, node: NodeId) {
        if scene.is_subtree_blocked(node) {
            return;
        }
        let Some(shadow) = self.shadows.lookup(node) else {
            return;
        };

        match self.shadows[shadow].node_type {
            NodeType::Geometry => {
                if let Some(e) = self.shadows[shadow].element() {
                    if self.is_opaque_element(scene, e) {
                        self.opaque_list.push(e);
                    } else {
                        self.alpha_list.push(e);
                    }
                    let element = &mut self.elements[e];
                    element.order = self.next_render_order;
                    self.next_render_order += 1;
                    if self.partial_rebuild {
                        element.flags.remove(ElementFlags::ORPHANED);
                    }
                }
            }
            _ if self.is_order_root(shadow) => {
                if self.partial_rebuild_root == Some(shadow) {
                    let (first, last) = self.shadows.root_info(shadow).map_or((0, 0), |i| (i.first_order, i.last_order));
                    self.next_render_order = first;
                    for child in scene.children(node) {
                        self.build_render_lists(scene, child);
                    }
                    self.next_render_order = last;
                } else {
                    let current = self.next_render_order;
                    for child in scene.children(node) {
                        self.build_render_lists(scene, child);
                    }
                    let next = self.next_render_order;
                    let padding = (next - current) >> 2;
                    if let Some(info) = self.shadows.ensure_root_info(shadow) {
                        info.first_order = current;
                        info.available_orders = padding;
                        info.last_order = next + padding;
                    }
                    self.next_render_order = next + padding;
                }
                return;
            }
            NodeType::RenderNode => {
                if let Some(e) = self.shadows[shadow].element() {
                    self.alpha_list.push(e);
                    self.elements[e].order = self.next_render_order;
                    self.next_render_order += 1;
                }
            }
            _ => {}
        }

        for child in scene.children(node) {
            self.build_render_lists(scene, child);
        }
    }

    /// Drop removed elements from the lists and free them.
    pub(crate) fn delete_removed_elements(&mut self) {
        if self.elements_to_delete.is_empty() {
            return;
        }
        let elements = &self.elements;
        let alive = |e: &ElementId| elements.get(*e).is_some_and(|e| !e.is_removed());
        self.opaque_list.retain(alive);
        self.alpha_list.retain(alive);
        for e in self.elements_to_delete.drain(..) {
            self.elements.remove(e);
        }
    }
}
