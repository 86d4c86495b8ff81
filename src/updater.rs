//! Per-frame dirty-state walk over the shadow tree.
//!
//! Carries the combined matrix, opacity, clip and batch-root context down
//! the tree, refreshing element state on the way. Clean subtrees with no
//! inherited change are skipped entirely, and a moved batch root only
//! refreshes the absolute matrices of its sub-roots.

use crate::context::{BatchContext, RebuildFlags};
use crate::element::ElementFlags;
use crate::scene::{DirtyState, NodeType, SceneGraph};
use crate::shadow::ShadowId;
use crate::transform::Transform;

/// Traversal stacks, kept between frames to reuse their allocations.
#[derive(Default)]
pub(crate) struct Updater {
    roots: Vec<Option<ShadowId>>,
    root_matrices: Vec<Transform>,
    combined_matrices: Vec<Transform>,
    opacities: Vec<f32>,
    current_clip: Option<ShadowId>,
    added: u32,
    force_update: u32,
    transform_change: u32,
    opacity_change: u32,
}

impl Updater {
    pub(crate) fn update_states(&mut self, ctx: &mut BatchContext, scene: &SceneGraph) {
        self.roots.clear();
        self.roots.push(None);
        self.root_matrices.clear();
        self.root_matrices.push(Transform::IDENTITY);
        self.combined_matrices.clear();
        self.combined_matrices.push(Transform::IDENTITY);
        self.opacities.clear();
        self.opacities.push(1.0);
        self.current_clip = None;
        self.added = 0;
        self.force_update = 0;
        self.transform_change = 0;
        self.opacity_change = 0;

        if let Some(root) = ctx.shadows.lookup(scene.root()) {
            self.visit_node(ctx, scene, root);
        }
    }

    fn visit_children(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        let node = ctx.shadows[shadow].node;
        for child in scene.children(node) {
            if let Some(s) = ctx.shadows.lookup(child) {
                self.visit_node(ctx, scene, s);
            }
        }
    }

    fn visit_node(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        let (dirty, subtree_dirty) = (ctx.shadows[shadow].dirty, ctx.shadows[shadow].subtree_dirty);
        if self.added == 0
            && dirty.is_empty()
            && subtree_dirty.is_empty()
            && self.force_update == 0
            && self.transform_change == 0
            && self.opacity_change == 0
        {
            return;
        }

        let (added, force) = (self.added, self.force_update);
        if dirty.contains(DirtyState::NODE_ADDED) {
            self.added += 1;
        }
        if dirty.contains(DirtyState::FORCE_UPDATE) {
            self.force_update += 1;
        }

        match ctx.shadows[shadow].node_type {
            NodeType::Opacity => self.visit_opacity_node(ctx, scene, shadow),
            NodeType::Transform => self.visit_transform_node(ctx, scene, shadow),
            NodeType::Geometry => self.visit_geometry_node(ctx, scene, shadow),
            NodeType::Clip => self.visit_clip_node(ctx, scene, shadow),
            NodeType::RenderNode => {
                if self.added > 0 {
                    if let Some(e) = ctx.shadows[shadow].element() {
                        ctx.elements[e].root = self.current_root();
                    }
                }
                self.visit_children(ctx, scene, shadow);
            }
            NodeType::Basic => self.visit_children(ctx, scene, shadow),
        }

        self.added = added;
        self.force_update = force;
        if let Some(s) = ctx.shadows.get_mut(shadow) {
            s.dirty = DirtyState::empty();
            s.subtree_dirty = DirtyState::empty();
        }
    }

    fn current_root(&self) -> Option<ShadowId> {
        self.roots.last().copied().flatten()
    }

    fn combined(&self) -> Transform {
        self.combined_matrices.last().copied().unwrap_or(Transform::IDENTITY)
    }

    fn root_matrix(&self) -> Transform {
        self.root_matrices.last().copied().unwrap_or(Transform::IDENTITY)
    }

    fn visit_opacity_node(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        let own = scene.opacity(ctx.shadows[shadow].node).unwrap_or(1.0);
        let combined = self.opacities.last().copied().unwrap_or(1.0) * own;
        ctx.shadows[shadow].combined_opacity = combined;
        self.opacities.push(combined);

        let is_opaque = own > crate::OPAQUE_LIMIT;
        if self.added == 0 && ctx.shadows[shadow].dirty.contains(DirtyState::OPACITY) {
            if ctx.shadows[shadow].is_opaque != is_opaque {
                ctx.rebuild = RebuildFlags::FULL_REBUILD;
                ctx.shadows[shadow].is_opaque = is_opaque;
            }
            self.opacity_change += 1;
            self.visit_children(ctx, scene, shadow);
            self.opacity_change -= 1;
        } else {
            if self.added > 0 {
                ctx.shadows[shadow].is_opaque = is_opaque;
            }
            self.visit_children(ctx, scene, shadow);
        }

        self.opacities.pop();
    }

    fn visit_transform_node(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        let own = scene.matrix(ctx.shadows[shadow].node).copied().unwrap_or(Transform::IDENTITY);
        let dirty = ctx.shadows[shadow].dirty;
        let matrix_changed = dirty.contains(DirtyState::MATRIX);

        if ctx.shadows[shadow].is_batch_root {
            if self.added > 0 {
                if let Some(parent) = self.current_root() {
                    ctx.shadows.register_batch_root(shadow, Some(parent));
                }
            }
            let absolute = self.root_matrix().then(&self.combined()).then(&own);
            ctx.shadows[shadow].combined_matrix = absolute;

            let only_moved = dirty == DirtyState::MATRIX && ctx.shadows[shadow].subtree_dirty.is_empty();
            if !ctx.shadows[shadow].became_batch_root
                && self.added == 0
                && self.force_update == 0
                && self.opacity_change == 0
                && only_moved
            {
                let sub_roots: Vec<ShadowId> = ctx
                    .shadows
                    .root_info(shadow)
                    .map(|info| info.sub_roots().collect())
                    .unwrap_or_default();
                for sub in sub_roots {
                    update_root_transforms(ctx, scene, sub, shadow, &absolute);
                }
                log::trace!(target: "tessera::roots", "moved root {:?} without visiting its subtree", shadow);
                return;
            }

            ctx.shadows[shadow].became_batch_root = false;

            self.combined_matrices.push(Transform::IDENTITY);
            self.roots.push(Some(shadow));
            self.root_matrices.push(absolute);
            if matrix_changed {
                self.transform_change += 1;
            }

            self.visit_children(ctx, scene, shadow);

            if matrix_changed {
                self.transform_change -= 1;
            }
            self.combined_matrices.pop();
            self.root_matrices.pop();
            self.roots.pop();
        } else {
            let combined = self.combined().then(&own);
            ctx.shadows[shadow].combined_matrix = combined;
            self.combined_matrices.push(combined);

            if matrix_changed {
                self.transform_change += 1;
            }
            self.visit_children(ctx, scene, shadow);
            if matrix_changed {
                self.transform_change -= 1;
            }

            self.combined_matrices.pop();
        }
    }

    fn visit_clip_node(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        if self.added > 0 {
            if let Some(parent) = self.current_root() {
                ctx.shadows.register_batch_root(shadow, Some(parent));
            }
        }

        let absolute = self.root_matrix().then(&self.combined());
        let enclosing = self.current_clip;
        if let Some(info) = ctx.shadows.clip_info_mut(shadow) {
            info.clip_list = enclosing;
            info.matrix = absolute;
        }
        self.current_clip = Some(shadow);
        self.roots.push(Some(shadow));
        self.root_matrices.push(absolute);
        self.combined_matrices.push(Transform::IDENTITY);

        self.visit_children(ctx, scene, shadow);

        self.current_clip = enclosing;
        self.root_matrices.pop();
        self.combined_matrices.pop();
        self.roots.pop();
    }

    fn visit_geometry_node(&mut self, ctx: &mut BatchContext, scene: &SceneGraph, shadow: ShadowId) {
        if let Some(e) = ctx.shadows[shadow].element() {
            let matrix = self.combined();
            let element = &mut ctx.elements[e];
            if element.matrix != matrix {
                element.matrix = matrix;
                element.invalidate_bounds();
            }
            element.clip_list = self.current_clip;
            element.inherited_opacity = self.opacities.last().copied().unwrap_or(1.0);

            if self.added > 0 {
                let root = self.current_root();
                element.root = root;
                element.flags.set(ElementFlags::TRANSLATE_ONLY_TO_ROOT, matrix.is_translate_only());

                if root.is_none() {
                    ctx.rebuild |= RebuildFlags::FULL_REBUILD;
                }
                let mut at = root;
                while let Some(r) = at {
                    let Some(info) = ctx.shadows.root_info_mut(r) else {
                        break;
                    };
                    info.available_orders -= 1;
                    let parent = info.parent_root;
                    if info.available_orders < 0 {
                        log::debug!(target: "tessera::build", "order budget of {:?} exhausted", r);
                        ctx.rebuild |= RebuildFlags::BUILD_RENDER_LISTS;
                    } else {
                        ctx.rebuild |= RebuildFlags::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS;
                        if let Some(root) = root {
                            ctx.tagged_roots.insert(root);
                        }
                    }
                    at = parent;
                }
            } else {
                if self.transform_change > 0 {
                    element.flags.set(ElementFlags::TRANSLATE_ONLY_TO_ROOT, matrix.is_translate_only());
                }
                if self.opacity_change > 0 {
                    if let Some(b) = element.batch {
                        ctx.invalidate_batch_and_overlapping_render_orders(b);
                    }
                }
            }
        }
        self.visit_children(ctx, scene, shadow);
    }
}

/// Recompute the absolute matrix of `node`, a sub-root of `root`, and recurse.
fn update_root_transforms(
    ctx: &mut BatchContext,
    scene: &SceneGraph,
    node: ShadowId,
    root: ShadowId,
    root_combined: &Transform,
) {
    let mut m = Transform::IDENTITY;
    let mut at = Some(node);
    while let Some(n) = at {
        if n == root {
            break;
        }
        if ctx.shadows[n].node_type == NodeType::Transform {
            if let Some(own) = scene.matrix(ctx.shadows[n].node) {
                m = own.then(&m);
            }
        }
        at = ctx.shadows.parent(n);
    }
    let m = root_combined.then(&m);

    if ctx.shadows[node].node_type == NodeType::Clip {
        if let Some(info) = ctx.shadows.clip_info_mut(node) {
            info.matrix = m;
        }
    } else {
        ctx.shadows[node].combined_matrix = m;
    }

    let sub_roots: Vec<ShadowId> = ctx
        .shadows
        .root_info(node)
        .map(|info| info.sub_roots().collect())
        .unwrap_or_default();
    for sub in sub_roots {
        update_root_transforms(ctx, scene, sub, node, &m);
    }
}
