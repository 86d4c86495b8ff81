//! State shared by every stage of the batch renderer.
//!
//! Change processing, the updater, the render-list builder, the batch
//! former and the uploader all read and write the same pools. They live
//! here as plain fields so each stage can borrow exactly what it needs.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::arena::Arena;
use crate::batch::{self, Batch, BatchId};
use crate::config::RendererConfig;
use crate::element::{Element, ElementId};
use crate::render_stats::FrameStats;
use crate::scene::NodeType;
use crate::shadow::{ShadowId, ShadowStore};
use crate::transform::Transform;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RebuildFlags: u32 {
        const BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS = 1 << 0;
        const BUILD_RENDER_LISTS = 1 << 1;
        const BUILD_BATCHES = 1 << 2;
        const FULL_REBUILD = Self::BUILD_RENDER_LISTS_FOR_TAGGED_ROOTS.bits()
            | Self::BUILD_RENDER_LISTS.bits()
            | Self::BUILD_BATCHES.bits();
    }
}

pub(crate) struct BatchContext {
    pub(crate) shadows: ShadowStore,
    pub(crate) elements: Arena<Element>,
    pub(crate) batches: Arena<Batch>,
    /// Live opaque batches, drawn in this order
    pub(crate) opaque_batches: Vec<BatchId>,
    /// Live alpha batches, drawn in this order
    pub(crate) alpha_batches: Vec<BatchId>,
    /// Invalid batches waiting for reuse; they keep their GPU buffers
    pub(crate) batch_pool: Vec<BatchId>,
    /// Sorted by descending render order
    pub(crate) opaque_list: Vec<ElementId>,
    /// Sorted by ascending render order
    pub(crate) alpha_list: Vec<ElementId>,
    pub(crate) rebuild: RebuildFlags,
    pub(crate) tagged_roots: HashSet<ShadowId>,
    pub(crate) next_render_order: i32,
    pub(crate) z_range: f32,
    pub(crate) partial_rebuild: bool,
    pub(crate) partial_rebuild_root: Option<ShadowId>,
    /// Order range invalidated this frame by overlap invalidation; -1 when unset
    pub(crate) rebuild_lower: i32,
    pub(crate) rebuild_upper: i32,
    pub(crate) elements_to_delete: Vec<ElementId>,
    pub(crate) render_node_elements: HashSet<ElementId>,
    pub(crate) use_depth_buffer: bool,
    pub(crate) config: RendererConfig,
    pub(crate) stats: FrameStats,
}

impl BatchContext {
    pub(crate) fn new(config: RendererConfig) -> Self {
        Self {
            shadows: ShadowStore::new(),
            elements: Arena::new(),
            batches: Arena::new(),
            opaque_batches: Vec::new(),
            alpha_batches: Vec::new(),
            batch_pool: Vec::new(),
            opaque_list: Vec::new(),
            alpha_list: Vec::new(),
            rebuild: RebuildFlags::FULL_REBUILD,
            tagged_roots: HashSet::new(),
            next_render_order: 0,
            z_range: 0.0,
            partial_rebuild: false,
            partial_rebuild_root: None,
            rebuild_lower: -1,
            rebuild_upper: -1,
            elements_to_delete: Vec::new(),
            render_node_elements: HashSet::new(),
            use_depth_buffer: config.use_depth_buffer,
            config,
            stats: FrameStats::default(),
        }
    }

    /// Clip nodes and promoted transforms own a window of render orders.
    pub(crate) fn is_order_root(&self, id: ShadowId) -> bool {
        self.shadows
            .get(id)
            .is_some_and(|s| s.node_type == NodeType::Clip || s.is_batch_root)
    }

    /// Absolute matrix of a batch root; identity for elements without one.
    pub(crate) fn root_matrix(&self, root: Option<ShadowId>) -> Transform {
        let Some(root) = root else {
            return Transform::IDENTITY;
        };
        match self.shadows.get(root) {
            Some(s) if s.node_type == NodeType::Clip => self
                .shadows
                .clip_info(root)
                .map_or(Transform::IDENTITY, |c| c.matrix),
            Some(s) => s.combined_matrix,
            None => Transform::IDENTITY,
        }
    }

    /// Take a batch from the pool, or allocate one.
    pub(crate) fn new_batch(&mut self) -> BatchId {
        match self.batch_pool.pop() {
            Some(id) => {
                self.batches[id].reset();
                id
            }
            None => {
                let mut batch = Batch::default();
                batch.reset();
                self.batches.insert(batch)
            }
        }
    }

    pub(crate) fn invalidate_and_recycle_batch(&mut self, id: BatchId) {
        batch::invalidate(&mut self.batches[id], &mut self.elements);
        if !self.batch_pool.contains(&id) {
            self.batch_pool.push(id);
        }
    }

    /// Invalidate `id` and every alpha batch whose order range overlaps the
    /// orders invalidated so far this frame. Re-batching one alpha batch can
    /// change which elements may merge around it, so the neighbours go too.
    pub(crate) fn invalidate_batch_and_overlapping_render_orders(&mut self, id: BatchId) {
        self.rebuild |= RebuildFlags::BUILD_BATCHES;
        let Some(first) = self.batches.get(id).and_then(|b| b.first) else {
            return;
        };
        let first_order = self.elements.get(first).map_or(0, |e| e.order);
        let last_order = self.batches[id].last_order_in_batch;

        if self.rebuild_lower < 0 || first_order < self.rebuild_lower {
            self.rebuild_lower = first_order;
        }
        if self.rebuild_upper < 0 || last_order > self.rebuild_upper {
            self.rebuild_upper = last_order;
        }

        batch::invalidate(&mut self.batches[id], &mut self.elements);

        let (lower, upper) = (self.rebuild_lower, self.rebuild_upper);
        for &b in &self.alpha_batches {
            let Some(first) = self.batches[b].first else {
                continue;
            };
            let bf = self.elements.get(first).map_or(0, |e| e.order);
            let bl = self.batches[b].last_order_in_batch;
            if bl > lower && bf < upper {
                batch::invalidate(&mut self.batches[b], &mut self.elements);
            }
        }
        log::trace!(target: "tessera::build", "invalidated orders {}..{}", lower, upper);
    }

    /// Move invalid batches to the pool, keeping the survivors in order.
    pub(crate) fn cleanup_batches(&mut self, opaque: bool) {
        let list = if opaque {
            std::mem::take(&mut self.opaque_batches)
        } else {
            std::mem::take(&mut self.alpha_batches)
        };
        let (valid, invalid): (Vec<_>, Vec<_>) = list.into_iter().partition(|&b| self.batches[b].is_valid());
        for b in invalid {
            self.invalidate_and_recycle_batch(b);
        }
        if opaque {
            self.opaque_batches = valid;
        } else {
            self.alpha_batches = valid;
        }
    }

    /// Render order of a batch's first element.
    pub(crate) fn batch_first_order(&self, id: BatchId) -> i32 {
        self.batches
            .get(id)
            .and_then(|b| b.first)
            .and_then(|e| self.elements.get(e))
            .map_or(0, |e| e.order)
    }
}
