//! Batches: runs of render-compatible elements drawn together.
//!
//! A batch does not own its elements. It points at the first one and the
//! rest follow through `Element::next_in_batch`. It does own its GPU
//! buffers, and those survive recycling through the batch pool.

use crate::arena::{Arena, Handle};
use crate::backend::BufferId;
use crate::element::{Element, ElementFlags, ElementId};
use crate::material::materials_equal;
use crate::scene::{NodeId, SceneGraph};
use crate::shadow::ShadowId;

pub type BatchId = Handle<Batch>;

/// One contiguous indexed draw inside a merged batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawSet {
    /// Byte offset of the first vertex in the vertex buffer
    pub vertices: usize,
    /// Byte offset of the first depth value in the vertex buffer
    pub zorders: usize,
    /// Byte offset of the first index in the index buffer
    pub indices: usize,
    pub index_count: usize,
}

impl DrawSet {
    pub fn new(vertices: usize, zorders: usize, indices: usize) -> Self {
        Self {
            vertices,
            zorders,
            indices,
            index_count: 0,
        }
    }
}

/// A GPU buffer owned by a batch, created lazily on first upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuBuffer {
    pub id: Option<BufferId>,
    pub size: usize,
}

/// Outcome of re-checking a material change against the rest of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchCompatibility {
    Compatible,
    BreaksOnCompare,
}

#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) first: Option<ElementId>,
    pub(crate) root: Option<ShadowId>,
    /// Byte offset of the position attribute, for merged batches
    pub(crate) position_attribute: Option<usize>,
    pub(crate) last_order_in_batch: i32,
    pub(crate) is_opaque: bool,
    pub(crate) needs_upload: bool,
    pub(crate) merged: bool,
    pub(crate) is_render_node: bool,
    pub(crate) uploaded_this_frame: bool,
    pub(crate) vertex_count: usize,
    pub(crate) index_count: usize,
    pub(crate) draw_sets: Vec<DrawSet>,
    pub(crate) vbo: GpuBuffer,
    pub(crate) ibo: GpuBuffer,
}

impl Batch {
    /// Reset per-build state, keeping the GPU buffers for reuse.
    pub(crate) fn reset(&mut self) {
        self.first = None;
        self.root = None;
        self.position_attribute = None;
        self.last_order_in_batch = 0;
        self.is_opaque = false;
        self.needs_upload = true;
        self.merged = false;
        self.is_render_node = false;
        self.uploaded_this_frame = false;
        self.vertex_count = 0;
        self.index_count = 0;
        self.draw_sets.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.first.is_some()
    }
}

/// Iterator over a batch's element chain.
pub struct BatchElements<'a> {
    elements: &'a Arena<Element>,
    next: Option<ElementId>,
}

impl<'a> Iterator for BatchElements<'a> {
    type Item = (ElementId, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let e = self.elements.get(id)?;
        self.next = e.next_in_batch;
        Some((id, e))
    }
}

pub fn batch_elements<'a>(batch: &Batch, elements: &'a Arena<Element>) -> BatchElements<'a> {
    BatchElements {
        elements,
        next: batch.first,
    }
}

/// Detach every member element from the batch.
pub fn invalidate(batch: &mut Batch, elements: &mut Arena<Element>) {
    let mut next = batch.first.take();
    while let Some(id) = next {
        let Some(e) = elements.get_mut(id) else {
            break;
        };
        next = e.next_in_batch.take();
        e.batch = None;
    }
    batch.root = None;
}

/// Unlink removed elements from the chain.
pub fn cleanup_removed_elements(batch: &mut Batch, elements: &mut Arena<Element>) {
    let is_removed = |id: ElementId, elements: &Arena<Element>| elements.get(id).map_or(true, Element::is_removed);

    while let Some(first) = batch.first {
        if !is_removed(first, elements) {
            break;
        }
        batch.first = elements.get(first).and_then(|e| e.next_in_batch);
    }

    let Some(mut at) = batch.first else {
        return;
    };
    loop {
        let Some(next) = elements[at].next_in_batch else {
            break;
        };
        if is_removed(next, elements) {
            let after = elements.get(next).and_then(|e| e.next_in_batch);
            elements[at].next_in_batch = after;
        } else {
            at = next;
        }
    }
}

pub fn is_translate_only_to_root(batch: &Batch, elements: &Arena<Element>) -> bool {
    batch_elements(batch, elements).all(|(_, e)| e.flags.contains(ElementFlags::TRANSLATE_ONLY_TO_ROOT))
}

/// Every member can be transformed on the CPU without precision loss.
pub fn is_safe_to_batch(batch: &Batch, elements: &Arena<Element>) -> bool {
    batch_elements(batch, elements).all(|(_, e)| {
        !e.flags.contains(ElementFlags::BOUNDS_OUTSIDE_FLOAT_RANGE) && e.matrix.is_2d_safe()
    })
}

/// First live member other than `skip`.
fn other_member(batch: &Batch, elements: &Arena<Element>, skip: NodeId) -> Option<NodeId> {
    batch_elements(batch, elements)
        .find(|(_, e)| e.node != skip && !e.is_removed())
        .map(|(_, e)| e.node)
}

/// Geometry of `node` changed. Returns false when its attribute layout no
/// longer matches the rest of the batch; otherwise marks the batch for upload.
pub fn geometry_was_changed(batch: &mut Batch, elements: &Arena<Element>, scene: &SceneGraph, node: NodeId) -> bool {
    let compatible = match other_member(batch, elements, node) {
        None => true,
        Some(other) => match (scene.geometry_node(other), scene.geometry_node(node)) {
            (Some(a), Some(b)) => a.geometry.attributes() == b.geometry.attributes(),
            _ => false,
        },
    };
    if compatible {
        batch.needs_upload = true;
    }
    compatible
}

/// Material of `element` changed. Check it still matches the rest of the batch.
pub fn is_material_compatible(
    batch: &Batch,
    elements: &Arena<Element>,
    scene: &SceneGraph,
    element: &Element,
) -> BatchCompatibility {
    let Some(other_id) = batch_elements(batch, elements)
        .find(|(_, e)| e.node != element.node && !e.is_removed())
        .map(|(id, _)| id)
    else {
        return BatchCompatibility::Compatible;
    };
    let other = &elements[other_id];
    let (Some(a), Some(b)) = (scene.geometry_node(element.node), scene.geometry_node(other.node)) else {
        return BatchCompatibility::BreaksOnCompare;
    };
    let m = a.active_material(element.inherited_opacity);
    let nm = b.active_material(other.inherited_opacity);
    if materials_equal(nm.as_ref(), m.as_ref()) {
        BatchCompatibility::Compatible
    } else {
        BatchCompatibility::BreaksOnCompare
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneGraph;
    use crate::transform::Transform;

    fn chain(elements: &mut Arena<Element>, batch: &mut Batch, count: usize) -> Vec<ElementId> {
        let scene = SceneGraph::new();
        let ids: Vec<_> = (0..count)
            .map(|_| elements.insert(Element::new(scene.root(), false)))
            .collect();
        for pair in ids.windows(2) {
            elements[pair[0]].next_in_batch = Some(pair[1]);
        }
        let owner = dummy_batch_id();
        for &id in &ids {
            elements[id].batch = Some(owner);
        }
        batch.first = ids.first().copied();
        ids
    }

    fn dummy_batch_id() -> BatchId {
        let mut arena = Arena::new();
        arena.insert(Batch::default())
    }

    #[test]
    fn test_invalidate_detaches_members() {
        let mut elements = Arena::new();
        let mut batch = Batch::default();
        let ids = chain(&mut elements, &mut batch, 3);

        invalidate(&mut batch, &mut elements);
        assert!(!batch.is_valid());
        for id in ids {
            assert!(elements[id].batch.is_none());
            assert!(elements[id].next_in_batch.is_none());
        }
    }

    #[test]
    fn test_cleanup_removed_elements() {
        let mut elements = Arena::new();
        let mut batch = Batch::default();
        let ids = chain(&mut elements, &mut batch, 4);
        elements[ids[0]].flags.insert(ElementFlags::REMOVED);
        elements[ids[2]].flags.insert(ElementFlags::REMOVED);

        cleanup_removed_elements(&mut batch, &mut elements);
        let remaining: Vec<_> = batch_elements(&batch, &elements).map(|(id, _)| id).collect();
        assert_eq!(remaining, vec![ids[1], ids[3]]);
    }

    #[test]
    fn test_cleanup_all_removed_invalidates() {
        let mut elements = Arena::new();
        let mut batch = Batch::default();
        let ids = chain(&mut elements, &mut batch, 2);
        for id in &ids {
            elements[*id].flags.insert(ElementFlags::REMOVED);
        }
        cleanup_removed_elements(&mut batch, &mut elements);
        assert!(!batch.is_valid());
    }

    #[test]
    fn test_safe_to_batch_rejects_perspective() {
        let mut elements = Arena::new();
        let mut batch = Batch::default();
        let ids = chain(&mut elements, &mut batch, 2);
        assert!(is_safe_to_batch(&batch, &elements));

        let mut m = Transform::IDENTITY;
        m.set(3, 1, 0.5);
        elements[ids[1]].matrix = m;
        assert!(!is_safe_to_batch(&batch, &elements));
    }

    #[test]
    fn test_translate_only_to_root() {
        let mut elements = Arena::new();
        let mut batch = Batch::default();
        let ids = chain(&mut elements, &mut batch, 2);
        for id in &ids {
            elements[*id].flags.insert(ElementFlags::TRANSLATE_ONLY_TO_ROOT);
        }
        assert!(is_translate_only_to_root(&batch, &elements));
        elements[ids[0]].flags.remove(ElementFlags::TRANSLATE_ONLY_TO_ROOT);
        assert!(!is_translate_only_to_root(&batch, &elements));
    }
}
