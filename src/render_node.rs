//! Custom draw callbacks embedded in the scene graph.
//!
//! A render node draws itself through the backend with whatever state it
//! likes. The renderer hands it a state snapshot and afterwards resets
//! every piece of state the node reports as changed.

use bitflags::bitflags;

use crate::backend::{GpuBackend, ScissorRect};
use crate::transform::Transform;

bitflags! {
    /// GPU state a render node may leave modified.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const DEPTH = 1 << 0;
        const STENCIL = 1 << 1;
        const SCISSOR = 1 << 2;
        const COLOR = 1 << 3;
        const BLEND = 1 << 4;
        const CULL = 1 << 5;
        const VIEWPORT = 1 << 6;
        const RENDER_TARGET = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RenderNodeFlags: u32 {
        /// Output stays inside the node's bounding rectangle
        const BOUNDED_RECTANGLE = 1 << 0;
        /// The node writes sensible depth values, so the depth buffer can stay on
        const DEPTH_AWARE = 1 << 1;
        const OPAQUE = 1 << 2;
    }
}

/// Snapshot passed to [`RenderNode::render`].
#[derive(Clone, Debug, PartialEq)]
pub struct RenderNodeState {
    pub projection: Transform,
    /// Model-view matrix of the render node
    pub matrix: Transform,
    pub opacity: f32,
    /// Active scissor rectangle, if scissor clipping is on
    pub scissor: Option<ScissorRect>,
    /// Stencil reference the node must test against, if stencil clipping is on
    pub stencil_reference: Option<u32>,
}

pub trait RenderNode {
    fn render(&mut self, state: &RenderNodeState, backend: &mut dyn GpuBackend);

    /// State the node modifies; the renderer resets these afterwards.
    fn changed_states(&self) -> StateFlags {
        StateFlags::all()
    }

    fn flags(&self) -> RenderNodeFlags {
        RenderNodeFlags::empty()
    }
}
