//! Shadow tree: the renderer's private mirror of the client scene graph.
//!
//! One shadow node exists per visible client node. Shadow nodes hold the
//! renderer-side state (dirty bits, batch-root bookkeeping, combined matrices)
//! so the client tree stays free of renderer data. This module is pure
//! storage; the traversals live in the updater and the change processor.

use std::collections::HashMap;

use crate::arena::{Arena, Handle};
use crate::element::ElementId;
use crate::roots::{BatchRootInfo, ClipBatchRootInfo};
use crate::scene::{DirtyState, NodeId, NodeType};
use crate::transform::Transform;

pub type ShadowId = Handle<ShadowNode>;

/// Renderer data attached to a shadow node, chosen by the node kind.
#[derive(Debug)]
pub enum ShadowPayload {
    None,
    Element(ElementId),
    RenderNodeElement(ElementId),
    BatchRoot(BatchRootInfo),
    ClipBatchRoot(ClipBatchRootInfo),
}

#[derive(Debug)]
pub struct ShadowNode {
    pub(crate) node: NodeId,
    pub(crate) node_type: NodeType,
    pub(crate) parent: Option<ShadowId>,
    pub(crate) first_child: Option<ShadowId>,
    pub(crate) last_child: Option<ShadowId>,
    pub(crate) next_sibling: Option<ShadowId>,
    pub(crate) prev_sibling: Option<ShadowId>,
    /// Changes on this node since the last frame
    pub(crate) dirty: DirtyState,
    /// Changes somewhere below this node since the last frame
    pub(crate) subtree_dirty: DirtyState,
    pub(crate) is_batch_root: bool,
    /// Set on promotion, cleared by the next update pass
    pub(crate) became_batch_root: bool,
    /// Last opaque classification of an opacity node
    pub(crate) is_opaque: bool,
    /// Transform nodes: matrix relative to the batch root, or absolute for roots
    pub(crate) combined_matrix: Transform,
    /// Opacity nodes: product of all opacities down to this node
    pub(crate) combined_opacity: f32,
    pub(crate) payload: ShadowPayload,
}

impl ShadowNode {
    fn new(node: NodeId, node_type: NodeType) -> Self {
        Self {
            node,
            node_type,
            parent: None,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            dirty: DirtyState::empty(),
            subtree_dirty: DirtyState::empty(),
            is_batch_root: false,
            became_batch_root: false,
            is_opaque: true,
            combined_matrix: Transform::IDENTITY,
            combined_opacity: 1.0,
            payload: ShadowPayload::None,
        }
    }

    /// Element of a geometry node or render node.
    pub fn element(&self) -> Option<ElementId> {
        match self.payload {
            ShadowPayload::Element(e) | ShadowPayload::RenderNodeElement(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.subtree_dirty.is_empty()
    }
}

/// Arena of shadow nodes plus the client-to-shadow lookup.
#[derive(Default)]
pub struct ShadowStore {
    nodes: Arena<ShadowNode>,
    by_node: HashMap<NodeId, ShadowId>,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, node: NodeId) -> Option<ShadowId> {
        self.by_node.get(&node).copied()
    }

    pub fn get(&self, id: ShadowId) -> Option<&ShadowNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: ShadowId) -> Option<&mut ShadowNode> {
        self.nodes.get_mut(id)
    }

    /// Create the shadow for `node` as the last child of `parent`.
    pub fn insert(&mut self, node: NodeId, node_type: NodeType, parent: Option<ShadowId>) -> ShadowId {
        let mut shadow = ShadowNode::new(node, node_type);
        shadow.parent = parent;
        if let Some(p) = parent {
            shadow.prev_sibling = self.nodes[p].last_child;
        }
        let prev = shadow.prev_sibling;
        let id = self.nodes.insert(shadow);

        if let Some(p) = parent {
            match prev {
                Some(prev) => self.nodes[prev].next_sibling = Some(id),
                None => self.nodes[p].first_child = Some(id),
            }
            self.nodes[p].last_child = Some(id);
        }
        self.by_node.insert(node, id);
        id
    }

    /// Unlink and free a shadow node. Its children must already be gone.
    pub fn remove(&mut self, id: ShadowId) -> Option<ShadowNode> {
        let shadow = self.nodes.get(id)?;
        debug_assert!(shadow.first_child.is_none(), "children are removed before their parent");
        let (parent, prev, next) = (shadow.parent, shadow.prev_sibling, shadow.next_sibling);

        if let Some(p) = parent {
            match prev {
                Some(prev) => self.nodes[prev].next_sibling = next,
                None => self.nodes[p].first_child = next,
            }
            match next {
                Some(next) => self.nodes[next].prev_sibling = prev,
                None => self.nodes[p].last_child = prev,
            }
        }

        let removed = self.nodes.remove(id)?;
        if self.by_node.get(&removed.node) == Some(&id) {
            self.by_node.remove(&removed.node);
        }
        Some(removed)
    }

    pub fn parent(&self, id: ShadowId) -> Option<ShadowId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn first_child(&self, id: ShadowId) -> Option<ShadowId> {
        self.nodes.get(id).and_then(|n| n.first_child)
    }

    pub fn next_sibling(&self, id: ShadowId) -> Option<ShadowId> {
        self.nodes.get(id).and_then(|n| n.next_sibling)
    }

    /// Children in shadow order, collected so callers may mutate the store.
    pub fn children(&self, id: ShadowId) -> Vec<ShadowId> {
        let mut out = Vec::new();
        let mut child = self.first_child(id);
        while let Some(c) = child {
            out.push(c);
            child = self.next_sibling(c);
        }
        out
    }

    /// Record `state` on every ancestor of `id` as a descendant change.
    pub fn propagate_dirty(&mut self, id: ShadowId, state: DirtyState) {
        let chain = state & DirtyState::PROPAGATION_MASK;
        if chain.is_empty() {
            return;
        }
        let mut at = self.parent(id);
        while let Some(p) = at {
            let node = &mut self.nodes[p];
            node.subtree_dirty |= chain;
            at = node.parent;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShadowId, &ShadowNode)> {
        self.nodes.iter()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_node.clear();
    }
}

impl std::ops::Index<ShadowId> for ShadowStore {
    type Output = ShadowNode;

    fn index(&self, id: ShadowId) -> &ShadowNode {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<ShadowId> for ShadowStore {
    fn index_mut(&mut self, id: ShadowId) -> &mut ShadowNode {
        &mut self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{NodeKind, SceneGraph};

    fn scene_with_children(n: usize) -> (SceneGraph, Vec<NodeId>) {
        let mut scene = SceneGraph::new();
        let root = scene.root();
        let ids = (0..n).map(|_| scene.append_child(root, NodeKind::Basic)).collect();
        (scene, ids)
    }

    #[test]
    fn test_shadow_insert_links_children_in_order() {
        let (scene, ids) = scene_with_children(3);
        let mut store = ShadowStore::new();
        let root = store.insert(scene.root(), NodeType::Basic, None);
        let shadows: Vec<_> = ids
            .iter()
            .map(|&n| store.insert(n, NodeType::Basic, Some(root)))
            .collect();

        assert_eq!(store.children(root), shadows);
        assert_eq!(store.lookup(ids[1]), Some(shadows[1]));
        assert_eq!(store.parent(shadows[2]), Some(root));
    }

    #[test]
    fn test_shadow_remove_relinks_siblings() {
        let (scene, ids) = scene_with_children(3);
        let mut store = ShadowStore::new();
        let root = store.insert(scene.root(), NodeType::Basic, None);
        let s: Vec<_> = ids
            .iter()
            .map(|&n| store.insert(n, NodeType::Basic, Some(root)))
            .collect();

        store.remove(s[1]);
        assert_eq!(store.children(root), vec![s[0], s[2]]);
        assert_eq!(store.lookup(ids[1]), None);

        store.remove(s[2]);
        assert_eq!(store.children(root), vec![s[0]]);
        let s3 = store.insert(ids[2], NodeType::Basic, Some(root));
        assert_eq!(store.children(root), vec![s[0], s3]);
    }

    #[test]
    fn test_shadow_propagate_dirty_marks_ancestors_only() {
        let (scene, ids) = scene_with_children(1);
        let mut store = ShadowStore::new();
        let root = store.insert(scene.root(), NodeType::Basic, None);
        let child = store.insert(ids[0], NodeType::Transform, Some(root));

        store.propagate_dirty(child, DirtyState::MATRIX | DirtyState::GEOMETRY);
        assert_eq!(store[root].subtree_dirty, DirtyState::MATRIX);
        assert!(store[child].subtree_dirty.is_empty());
    }
}
