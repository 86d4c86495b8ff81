//! Batch-root registry.
//!
//! Clip nodes and promoted transform nodes are batch roots: each owns a
//! window of render orders and is rebuilt independently. Roots form their
//! own tree (parent root + sub-roots) on top of the shadow tree so a partial
//! rebuild can find every nested root of a changed subtree.

use std::collections::HashSet;

use crate::shadow::{ShadowId, ShadowPayload, ShadowStore};
use crate::transform::Transform;

#[derive(Debug, Clone, Default)]
pub struct BatchRootInfo {
    pub(crate) parent_root: Option<ShadowId>,
    pub(crate) sub_roots: HashSet<ShadowId>,
    /// First render order reserved for this root's subtree
    pub(crate) first_order: i32,
    /// One past the last reserved render order
    pub(crate) last_order: i32,
    /// Unused orders left in the window; negative forces a full rebuild
    pub(crate) available_orders: i32,
}

impl BatchRootInfo {
    pub fn parent_root(&self) -> Option<ShadowId> {
        self.parent_root
    }

    pub fn sub_roots(&self) -> impl Iterator<Item = ShadowId> + '_ {
        self.sub_roots.iter().copied()
    }

    pub fn order_range(&self) -> (i32, i32) {
        (self.first_order, self.last_order)
    }

    pub fn available_orders(&self) -> i32 {
        self.available_orders
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClipBatchRootInfo {
    pub(crate) root: BatchRootInfo,
    /// Absolute matrix of the clip geometry
    pub(crate) matrix: Transform,
    /// Enclosing clip, forming the clip list chain
    pub(crate) clip_list: Option<ShadowId>,
}

impl ShadowStore {
    pub fn root_info(&self, id: ShadowId) -> Option<&BatchRootInfo> {
        match &self.get(id)?.payload {
            ShadowPayload::BatchRoot(info) => Some(info),
            ShadowPayload::ClipBatchRoot(clip) => Some(&clip.root),
            _ => None,
        }
    }

    pub fn root_info_mut(&mut self, id: ShadowId) -> Option<&mut BatchRootInfo> {
        match &mut self.get_mut(id)?.payload {
            ShadowPayload::BatchRoot(info) => Some(info),
            ShadowPayload::ClipBatchRoot(clip) => Some(&mut clip.root),
            _ => None,
        }
    }

    pub fn clip_info(&self, id: ShadowId) -> Option<&ClipBatchRootInfo> {
        match &self.get(id)?.payload {
            ShadowPayload::ClipBatchRoot(clip) => Some(clip),
            _ => None,
        }
    }

    pub fn clip_info_mut(&mut self, id: ShadowId) -> Option<&mut ClipBatchRootInfo> {
        match &mut self.get_mut(id)?.payload {
            ShadowPayload::ClipBatchRoot(clip) => Some(clip),
            _ => None,
        }
    }

    /// Root info of `id`, attaching a fresh one to nodes that have none yet.
    pub fn ensure_root_info(&mut self, id: ShadowId) -> Option<&mut BatchRootInfo> {
        let node = self.get_mut(id)?;
        if matches!(node.payload, ShadowPayload::None) {
            node.payload = ShadowPayload::BatchRoot(BatchRootInfo::default());
        }
        self.root_info_mut(id)
    }

    /// Make `sub_root` a child root of `parent_root`.
    pub fn register_batch_root(&mut self, sub_root: ShadowId, parent_root: Option<ShadowId>) {
        if let Some(info) = self.ensure_root_info(sub_root) {
            info.parent_root = parent_root;
        }
        if let Some(parent) = parent_root {
            if let Some(info) = self.ensure_root_info(parent) {
                info.sub_roots.insert(sub_root);
            }
        }
    }

    /// Move `node` under `root`. Returns false if it already was there.
    pub fn change_batch_root(&mut self, node: ShadowId, root: ShadowId) -> bool {
        let old = match self.ensure_root_info(node) {
            Some(info) if info.parent_root == Some(root) => return false,
            Some(info) => info.parent_root,
            None => return false,
        };
        if let Some(old_info) = old.and_then(|o| self.root_info_mut(o)) {
            old_info.sub_roots.remove(&node);
        }
        self.register_batch_root(node, Some(root));
        true
    }

    pub fn remove_batch_root_from_parent(&mut self, child: ShadowId) {
        let Some(parent) = self.root_info(child).and_then(|info| info.parent_root) else {
            return;
        };
        if let Some(info) = self.root_info_mut(parent) {
            info.sub_roots.remove(&child);
        }
        if let Some(info) = self.root_info_mut(child) {
            info.parent_root = None;
        }
    }

    /// Add every registered sub-root below `root`, recursively, to `tagged`.
    pub fn tag_sub_roots(&self, root: ShadowId, tagged: &mut HashSet<ShadowId>) {
        let Some(info) = self.root_info(root) else {
            return;
        };
        for sub in info.sub_roots() {
            tagged.insert(sub);
            self.tag_sub_roots(sub, tagged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{NodeKind, NodeType, SceneGraph};

    fn store_with_chain() -> (ShadowStore, ShadowId, ShadowId, ShadowId) {
        let mut scene = SceneGraph::new();
        let root = scene.root();
        let a = scene.append_child(root, NodeKind::Basic);
        let b = scene.append_child(a, NodeKind::Basic);

        let mut store = ShadowStore::new();
        let sr = store.insert(root, NodeType::Basic, None);
        let sa = store.insert(a, NodeType::Transform, Some(sr));
        let sb = store.insert(b, NodeType::Transform, Some(sa));
        (store, sr, sa, sb)
    }

    #[test]
    fn test_register_and_tag_sub_roots() {
        let (mut store, _, a, b) = store_with_chain();
        store.register_batch_root(a, None);
        store.register_batch_root(b, Some(a));

        assert_eq!(store.root_info(b).and_then(|i| i.parent_root()), Some(a));

        let mut tagged = HashSet::new();
        store.tag_sub_roots(a, &mut tagged);
        assert_eq!(tagged.len(), 1);
        assert!(tagged.contains(&b));
    }

    #[test]
    fn test_change_batch_root_moves_sub_root() {
        let (mut store, r, a, b) = store_with_chain();
        store.register_batch_root(r, None);
        store.register_batch_root(b, Some(r));

        assert!(store.change_batch_root(b, a));
        assert!(!store.change_batch_root(b, a));
        assert!(!store.root_info(r).map_or(false, |i| i.sub_roots.contains(&b)));
        assert!(store.root_info(a).map_or(false, |i| i.sub_roots.contains(&b)));
    }

    #[test]
    fn test_remove_batch_root_from_parent() {
        let (mut store, _, a, b) = store_with_chain();
        store.register_batch_root(b, Some(a));
        store.remove_batch_root_from_parent(b);

        assert!(store.root_info(a).map_or(false, |i| i.sub_roots.is_empty()));
        assert_eq!(store.root_info(b).and_then(|i| i.parent_root()), None);
    }
}
