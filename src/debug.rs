//! Introspection: tree dumps for diagnostics and per-batch summaries for
//! the post-render hook.

use std::fmt::Write;

use crate::batch::{batch_elements, BatchId};
use crate::context::BatchContext;
use crate::scene::{NodeId, SceneGraph};
use crate::shadow::ShadowId;

/// What one batch drew in the last frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchSummary {
    pub first_order: i32,
    pub last_order: i32,
    pub element_count: usize,
    pub merged: bool,
    pub opaque: bool,
    pub render_node: bool,
    pub draw_sets: usize,
    /// Client node of the batch root, `None` for the scene root
    pub root: Option<NodeId>,
}

pub(crate) fn summarize(ctx: &BatchContext, batches: &[BatchId]) -> Vec<BatchSummary> {
    batches
        .iter()
        .filter_map(|&id| {
            let batch = ctx.batches.get(id)?;
            Some(BatchSummary {
                first_order: ctx.batch_first_order(id),
                last_order: batch.last_order_in_batch,
                element_count: batch_elements(batch, &ctx.elements).count(),
                merged: batch.merged,
                opaque: batch.is_opaque,
                render_node: batch.is_render_node,
                draw_sets: batch.draw_sets.len(),
                root: batch.root.and_then(|r| ctx.shadows.get(r)).map(|s| s.node),
            })
        })
        .collect()
}

/// Indented dump of the client tree.
pub fn dump_scene(scene: &SceneGraph) -> String {
    fn visit(scene: &SceneGraph, node: NodeId, depth: usize, out: &mut String) {
        let blocked = if scene.is_node_blocked(node) { " [blocked]" } else { "" };
        if let Some(kind) = scene.kind(node) {
            let _ = writeln!(out, "{:indent$}{:?} {:?}{}", "", node, kind, blocked, indent = depth * 2);
        }
        for child in scene.children(node) {
            visit(scene, child, depth + 1, out);
        }
    }

    let mut out = String::new();
    visit(scene, scene.root(), 0, &mut out);
    out
}

/// Indented dump of the batch-root hierarchy with each root's order window.
pub(crate) fn dump_shadow_roots(ctx: &BatchContext) -> String {
    fn visit(ctx: &BatchContext, root: ShadowId, depth: usize, out: &mut String) {
        let Some(info) = ctx.shadows.root_info(root) else {
            return;
        };
        let node = ctx.shadows[root].node;
        let _ = writeln!(
            out,
            "{:indent$}{:?} {:?} orders {}..{} available {}",
            "",
            node,
            ctx.shadows[root].node_type,
            info.first_order,
            info.last_order,
            info.available_orders,
            indent = depth * 2
        );
        let mut subs: Vec<ShadowId> = info.sub_roots().collect();
        subs.sort_by_key(|s| ctx.shadows.root_info(*s).map_or(0, |i| i.first_order));
        for sub in subs {
            visit(ctx, sub, depth + 1, out);
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "roots (next order {}):", ctx.next_render_order);
    let mut top: Vec<ShadowId> = ctx
        .shadows
        .iter()
        .filter(|(id, _)| ctx.is_order_root(*id))
        .filter(|(id, _)| ctx.shadows.root_info(*id).is_some_and(|i| i.parent_root.is_none()))
        .map(|(id, _)| id)
        .collect();
    top.sort_by_key(|s| ctx.shadows.root_info(*s).map_or(0, |i| i.first_order));
    for root in top {
        visit(ctx, root, 1, &mut out);
    }
    out
}
