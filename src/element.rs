//! Elements: the renderer's per-drawable records.

use bitflags::bitflags;

use crate::arena::Handle;
use crate::batch::BatchId;
use crate::geometry::{Bounds, Geometry};
use crate::scene::NodeId;
use crate::shadow::ShadowId;
use crate::transform::Transform;

pub type ElementId = Handle<Element>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ElementFlags: u16 {
        /// The node is gone; the element is freed once batches drop it
        const REMOVED = 1 << 0;
        /// Pulled out of the lists during a partial rebuild
        const ORPHANED = 1 << 1;
        const BOUNDS_COMPUTED = 1 << 2;
        const BOUNDS_OUTSIDE_FLOAT_RANGE = 1 << 3;
        const TRANSLATE_ONLY_TO_ROOT = 1 << 4;
        const MATERIAL_BLENDED = 1 << 5;
        const RENDER_NODE = 1 << 6;
    }
}

#[derive(Debug, Clone)]
pub struct Element {
    pub(crate) node: NodeId,
    pub(crate) batch: Option<BatchId>,
    pub(crate) next_in_batch: Option<ElementId>,
    pub(crate) root: Option<ShadowId>,
    pub(crate) order: i32,
    /// Bounds in batch-root space
    pub(crate) bounds: Bounds,
    pub(crate) flags: ElementFlags,
    /// Matrix from the node to its batch root
    pub(crate) matrix: Transform,
    /// Innermost enclosing clip node
    pub(crate) clip_list: Option<ShadowId>,
    pub(crate) inherited_opacity: f32,
}

impl Element {
    pub fn new(node: NodeId, material_blended: bool) -> Self {
        let mut flags = ElementFlags::empty();
        flags.set(ElementFlags::MATERIAL_BLENDED, material_blended);
        Self {
            node,
            batch: None,
            next_in_batch: None,
            root: None,
            order: 0,
            bounds: Bounds::EMPTY,
            flags,
            matrix: Transform::IDENTITY,
            clip_list: None,
            inherited_opacity: 1.0,
        }
    }

    pub fn new_render_node(node: NodeId) -> Self {
        let mut e = Self::new(node, false);
        e.flags.insert(ElementFlags::RENDER_NODE);
        e
    }

    pub fn is_render_node(&self) -> bool {
        self.flags.contains(ElementFlags::RENDER_NODE)
    }

    pub fn is_removed(&self) -> bool {
        self.flags.contains(ElementFlags::REMOVED)
    }

    pub fn bounds_computed(&self) -> bool {
        self.flags.contains(ElementFlags::BOUNDS_COMPUTED)
    }

    pub(crate) fn invalidate_bounds(&mut self) {
        self.flags.remove(ElementFlags::BOUNDS_COMPUTED);
    }

    /// Compute bounds in root space. Geometry without a position attribute
    /// overlaps everything.
    pub(crate) fn compute_bounds(&mut self, geometry: &Geometry) {
        self.flags.insert(ElementFlags::BOUNDS_COMPUTED);
        let Some(local) = geometry.local_bounds() else {
            self.bounds = Bounds::EVERYTHING;
            self.flags.remove(ElementFlags::BOUNDS_OUTSIDE_FLOAT_RANGE);
            return;
        };
        self.bounds = local.map(&self.matrix).sanitized();
        let outside = self.bounds.is_outside_float_range();
        self.flags.set(ElementFlags::BOUNDS_OUTSIDE_FLOAT_RANGE, outside);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{AttributeSet, DrawMode, Rect};
    use crate::scene::SceneGraph;

    #[test]
    fn test_compute_bounds_applies_matrix() {
        let scene = SceneGraph::new();
        let mut e = Element::new(scene.root(), false);
        e.matrix = Transform::translate(100.0, 50.0);
        e.compute_bounds(&Geometry::rect(Rect::new(0.0, 0.0, 10.0, 20.0)));

        assert!(e.bounds_computed());
        assert_eq!(e.bounds, Bounds::new(100.0, 50.0, 110.0, 70.0));
        assert!(!e.flags.contains(ElementFlags::BOUNDS_OUTSIDE_FLOAT_RANGE));
    }

    #[test]
    fn test_compute_bounds_without_position_overlaps_everything() {
        let scene = SceneGraph::new();
        let mut e = Element::new(scene.root(), false);
        let g = Geometry::new(AttributeSet::new(vec![]), 3, DrawMode::Triangles);
        e.compute_bounds(&g);
        assert_eq!(e.bounds, Bounds::EVERYTHING);
    }

    #[test]
    fn test_compute_bounds_flags_huge_coordinates() {
        let scene = SceneGraph::new();
        let mut e = Element::new(scene.root(), false);
        e.compute_bounds(&Geometry::rect(Rect::new(0.0, 0.0, 1.0e7, 10.0)));
        assert!(e.flags.contains(ElementFlags::BOUNDS_OUTSIDE_FLOAT_RANGE));
    }

    #[test]
    fn test_empty_geometry_bounds_are_sanitized() {
        let scene = SceneGraph::new();
        let mut e = Element::new(scene.root(), false);
        let g = Geometry::new(AttributeSet::point_2d(), 0, DrawMode::Triangles);
        e.compute_bounds(&g);
        assert_eq!(e.bounds, Bounds::EVERYTHING);
    }
}
