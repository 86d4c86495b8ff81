//! The client scene graph.
//!
//! The client owns this tree and mutates it between frames. Every mutator
//! records a `(NodeId, DirtyState)` notification; the renderer drains them
//! at the start of [`Renderer::render`](crate::Renderer::render) and mirrors
//! the changes into its shadow tree.
//!
//! Nodes are stored in an [`Arena`] and linked as an intrusive
//! first-child/next-sibling tree, so sibling order is explicit and
//! insertion or removal is O(1).

use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::arena::{Arena, Handle};
use crate::geometry::{Geometry, Rect};
use crate::material::Material;
use crate::render_node::RenderNode;
use crate::transform::Transform;

pub type NodeId = Handle<Node>;

/// Opacity below which an opacity node hides its whole subtree.
pub const BLOCKING_OPACITY: f32 = 0.001;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DirtyState: u32 {
        const SUBTREE_BLOCKED = 1 << 0;
        const MATRIX = 1 << 1;
        const NODE_ADDED = 1 << 2;
        const NODE_REMOVED = 1 << 3;
        const GEOMETRY = 1 << 4;
        const MATERIAL = 1 << 5;
        const OPACITY = 1 << 6;
        const FORCE_UPDATE = 1 << 7;

        /// Bits that mark every ancestor as having a dirty descendant
        const PROPAGATION_MASK = Self::NODE_ADDED.bits()
            | Self::OPACITY.bits()
            | Self::MATRIX.bits()
            | Self::SUBTREE_BLOCKED.bits()
            | Self::FORCE_UPDATE.bits();
    }
}

/// Kind tag of a node, without its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Basic,
    Geometry,
    Transform,
    Clip,
    Opacity,
    RenderNode,
}

/// A drawable: geometry plus material.
#[derive(Clone)]
pub struct GeometryNode {
    pub geometry: Geometry,
    pub material: Rc<dyn Material>,
    /// Used instead of `material` while the inherited opacity is fully opaque
    pub opaque_material: Option<Rc<dyn Material>>,
}

impl GeometryNode {
    pub fn new(geometry: Geometry, material: Rc<dyn Material>) -> Self {
        Self {
            geometry,
            material,
            opaque_material: None,
        }
    }

    /// Material in effect for the given inherited opacity.
    pub fn active_material(&self, inherited_opacity: f32) -> &Rc<dyn Material> {
        match &self.opaque_material {
            Some(opaque) if inherited_opacity > crate::OPAQUE_LIMIT => opaque,
            _ => &self.material,
        }
    }
}

impl fmt::Debug for GeometryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeometryNode")
            .field("vertices", &self.geometry.vertex_count())
            .field("indices", &self.geometry.index_count())
            .field("mode", &self.geometry.mode())
            .field("material", &self.material)
            .finish()
    }
}

/// A clip: rectangular clips can become a scissor, anything else is
/// stenciled using `geometry`.
#[derive(Clone, Debug)]
pub struct ClipNode {
    pub geometry: Geometry,
    pub clip_rect: Rect,
    pub is_rectangular: bool,
}

impl ClipNode {
    pub fn rect(rect: Rect) -> Self {
        Self {
            geometry: Geometry::rect(rect),
            clip_rect: rect,
            is_rectangular: true,
        }
    }

    /// Arbitrary clip shape; `clip_rect` is its bounding box.
    pub fn shaped(geometry: Geometry) -> Self {
        let clip_rect = geometry
            .local_bounds()
            .map(|b| Rect::new(b.min_x, b.min_y, b.max_x - b.min_x, b.max_y - b.min_y))
            .unwrap_or_default();
        Self {
            geometry,
            clip_rect,
            is_rectangular: false,
        }
    }
}

pub enum NodeKind {
    Basic,
    Geometry(GeometryNode),
    Transform(Transform),
    Clip(ClipNode),
    Opacity(f32),
    RenderNode(Box<dyn RenderNode>),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Basic => NodeType::Basic,
            NodeKind::Geometry(_) => NodeType::Geometry,
            NodeKind::Transform(_) => NodeType::Transform,
            NodeKind::Clip(_) => NodeType::Clip,
            NodeKind::Opacity(_) => NodeType::Opacity,
            NodeKind::RenderNode(_) => NodeType::RenderNode,
        }
    }

    fn is_renderable(&self) -> bool {
        matches!(self, NodeKind::Geometry(_) | NodeKind::RenderNode(_))
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Basic => write!(f, "Basic"),
            NodeKind::Geometry(g) => g.fmt(f),
            NodeKind::Transform(m) => write!(f, "Transform({:?})", m.kind()),
            NodeKind::Clip(c) => write!(f, "Clip(rect={:?}, rectangular={})", c.clip_rect, c.is_rectangular),
            NodeKind::Opacity(o) => write!(f, "Opacity({o})"),
            NodeKind::RenderNode(_) => write!(f, "RenderNode"),
        }
    }
}

pub struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
    prev_sibling: Option<NodeId>,
    /// Explicitly hidden by the client
    blocked: bool,
    /// Geometry and render nodes in this subtree, including the node itself
    renderable_count: u32,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let renderable_count = u32::from(kind.is_renderable());
        Self {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            blocked: false,
            renderable_count,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn first_child(&self) -> Option<NodeId> {
        self.first_child
    }

    pub fn next_sibling(&self) -> Option<NodeId> {
        self.next_sibling
    }
}

/// Client-owned retained tree with a change queue.
pub struct SceneGraph {
    nodes: Arena<Node>,
    root: NodeId,
    changes: Vec<(NodeId, DirtyState)>,
}

impl SceneGraph {
    /// Create a graph holding only a basic root node.
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let root = nodes.insert(Node::new(NodeKind::Basic));
        Self {
            nodes,
            root,
            changes: vec![(root, DirtyState::NODE_ADDED)],
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id).map(|n| &n.kind)
    }

    pub fn node_type(&self, id: NodeId) -> Option<NodeType> {
        self.kind(id).map(NodeKind::node_type)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Children in sibling order.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            graph: self,
            next: self.nodes.get(id).and_then(|n| n.first_child),
        }
    }

    /// Append a new node as the last child of `parent`.
    ///
    /// Panics if `parent` is not a live node.
    pub fn append_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let prev = self.nodes[parent].last_child;
        self.link(parent, prev, None, kind)
    }

    /// Insert a new node under `parent`, just before the existing child `before`.
    ///
    /// Panics if `parent` is not a live node.
    pub fn insert_child_before(&mut self, parent: NodeId, before: NodeId, kind: NodeKind) -> NodeId {
        let before_is_child = self.nodes.get(before).is_some_and(|n| n.parent == Some(parent));
        if !before_is_child {
            return self.append_child(parent, kind);
        }
        let prev = self.nodes[before].prev_sibling;
        self.link(parent, prev, Some(before), kind)
    }

    fn link(&mut self, parent: NodeId, prev: Option<NodeId>, next: Option<NodeId>, kind: NodeKind) -> NodeId {
        let mut node = Node::new(kind);
        node.parent = Some(parent);
        node.prev_sibling = prev;
        node.next_sibling = next;
        let count = node.renderable_count;
        let id = self.nodes.insert(node);

        match prev {
            Some(p) => self.nodes[p].next_sibling = Some(id),
            None => self.nodes[parent].first_child = Some(id),
        }
        match next {
            Some(n) => self.nodes[n].prev_sibling = Some(id),
            None => self.nodes[parent].last_child = Some(id),
        }

        self.adjust_renderable_count(Some(parent), count as i64);
        self.changes.push((id, DirtyState::NODE_ADDED));
        id
    }

    /// Detach and destroy `id` with its whole subtree. The root cannot be removed.
    pub fn remove(&mut self, id: NodeId) {
        if id == self.root {
            log::warn!("attempt to remove the scene root ignored");
            return;
        }
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let (parent, prev, next, count) = (node.parent, node.prev_sibling, node.next_sibling, node.renderable_count);

        if let Some(parent) = parent {
            match prev {
                Some(p) => self.nodes[p].next_sibling = next,
                None => self.nodes[parent].first_child = next,
            }
            match next {
                Some(n) => self.nodes[n].prev_sibling = prev,
                None => self.nodes[parent].last_child = prev,
            }
        }
        self.adjust_renderable_count(parent, -(count as i64));
        self.changes.push((id, DirtyState::NODE_REMOVED));

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let mut child = self.nodes.get(current).and_then(|n| n.first_child);
            while let Some(c) = child {
                stack.push(c);
                child = self.nodes.get(c).and_then(|n| n.next_sibling);
            }
            self.nodes.remove(current);
        }
    }

    fn adjust_renderable_count(&mut self, mut at: Option<NodeId>, delta: i64) {
        if delta == 0 {
            return;
        }
        while let Some(id) = at {
            let node = &mut self.nodes[id];
            node.renderable_count = (node.renderable_count as i64 + delta).max(0) as u32;
            at = node.parent;
        }
    }

    /// Renderable nodes in the subtree rooted at `id`, including `id`.
    pub fn subtree_renderable_count(&self, id: NodeId) -> u32 {
        self.nodes.get(id).map_or(0, |n| n.renderable_count)
    }

    pub fn matrix(&self, id: NodeId) -> Option<&Transform> {
        match self.kind(id) {
            Some(NodeKind::Transform(m)) => Some(m),
            _ => None,
        }
    }

    pub fn opacity(&self, id: NodeId) -> Option<f32> {
        match self.kind(id) {
            Some(NodeKind::Opacity(o)) => Some(*o),
            _ => None,
        }
    }

    pub fn geometry_node(&self, id: NodeId) -> Option<&GeometryNode> {
        match self.kind(id) {
            Some(NodeKind::Geometry(g)) => Some(g),
            _ => None,
        }
    }

    pub fn clip_node(&self, id: NodeId) -> Option<&ClipNode> {
        match self.kind(id) {
            Some(NodeKind::Clip(c)) => Some(c),
            _ => None,
        }
    }

    pub fn render_node(&self, id: NodeId) -> Option<&dyn RenderNode> {
        match self.kind(id) {
            Some(NodeKind::RenderNode(r)) => Some(r.as_ref()),
            _ => None,
        }
    }

    pub fn render_node_mut(&mut self, id: NodeId) -> Option<&mut (dyn RenderNode + 'static)> {
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::RenderNode(r)) => Some(r.as_mut()),
            _ => None,
        }
    }

    pub fn set_matrix(&mut self, id: NodeId, matrix: Transform) {
        if let Some(NodeKind::Transform(m)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            *m = matrix;
            self.changes.push((id, DirtyState::MATRIX));
        }
    }

    /// Set an opacity node's opacity. Crossing [`BLOCKING_OPACITY`] also
    /// blocks or unblocks the subtree.
    pub fn set_opacity(&mut self, id: NodeId, opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        if let Some(NodeKind::Opacity(o)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            if *o == opacity {
                return;
            }
            let was_blocked = *o < BLOCKING_OPACITY;
            *o = opacity;
            let mut state = DirtyState::OPACITY;
            if was_blocked != (opacity < BLOCKING_OPACITY) {
                state |= DirtyState::SUBTREE_BLOCKED;
            }
            self.changes.push((id, state));
        }
    }

    pub fn set_geometry(&mut self, id: NodeId, geometry: Geometry) {
        if let Some(NodeKind::Geometry(g)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            g.geometry = geometry;
            self.changes.push((id, DirtyState::GEOMETRY));
        }
    }

    pub fn set_material(&mut self, id: NodeId, material: Rc<dyn Material>) {
        if let Some(NodeKind::Geometry(g)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            g.material = material;
            self.changes.push((id, DirtyState::MATERIAL));
        }
    }

    pub fn set_opaque_material(&mut self, id: NodeId, material: Option<Rc<dyn Material>>) {
        if let Some(NodeKind::Geometry(g)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            g.opaque_material = material;
            self.changes.push((id, DirtyState::MATERIAL));
        }
    }

    pub fn set_clip(&mut self, id: NodeId, clip: ClipNode) {
        if let Some(NodeKind::Clip(c)) = self.nodes.get_mut(id).map(|n| &mut n.kind) {
            *c = clip;
            self.changes.push((id, DirtyState::GEOMETRY));
        }
    }

    pub fn set_subtree_blocked(&mut self, id: NodeId, blocked: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.blocked != blocked {
                node.blocked = blocked;
                self.changes.push((id, DirtyState::SUBTREE_BLOCKED));
            }
        }
    }

    /// Queue an arbitrary notification, e.g. [`DirtyState::FORCE_UPDATE`].
    pub fn mark_dirty(&mut self, id: NodeId, state: DirtyState) {
        if self.nodes.contains(id) {
            self.changes.push((id, state));
        }
    }

    /// Whether this node hides its own subtree.
    pub fn is_subtree_blocked(&self, id: NodeId) -> bool {
        match self.nodes.get(id) {
            Some(node) => {
                node.blocked || matches!(node.kind, NodeKind::Opacity(o) if o < BLOCKING_OPACITY)
            }
            None => false,
        }
    }

    /// Whether this node or any ancestor hides it.
    pub fn is_node_blocked(&self, id: NodeId) -> bool {
        let mut at = Some(id);
        while let Some(current) = at {
            if self.is_subtree_blocked(current) {
                return true;
            }
            at = self.parent(current);
        }
        false
    }

    pub fn take_changes(&mut self) -> Vec<(NodeId, DirtyState)> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a node's children in sibling order.
pub struct Children<'a> {
    graph: &'a SceneGraph,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.graph.nodes.get(current).and_then(|n| n.next_sibling);
        Some(current)
    }
}
