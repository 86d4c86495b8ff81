//! Thin device abstraction used by the renderer.
//!
//! The renderer never talks to a graphics API directly. It creates and
//! uploads batch buffers, toggles clip/blend/depth state and issues draws
//! through [`GpuBackend`]. Two implementations ship with the crate:
//!
//! - [`RecordingBackend`]: keeps buffers in memory and records every call;
//!   used headless and by the tests
//! - [`WgpuBackend`]: owns `wgpu` buffers and replays the recorded draws
//!   into a `wgpu::RenderPass`

mod recording;
mod wgpu_backend;

pub use recording::{GpuCommand, RecordedDraw, RecordingBackend};
pub use wgpu_backend::{PipelineKey, StencilMode, WgpuBackend};

use crate::geometry::{Attribute, DrawMode, Geometry, IndexFormat};
use crate::transform::Transform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Compiled program handle returned by the shader compiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// Upload frequency hint for batch buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    #[default]
    Static,
    Dynamic,
    Stream,
}

/// Scissor rectangle in device pixels, origin at the top-left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl ScissorRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection; empty results have zero size.
    pub fn intersect(&self, other: &ScissorRect) -> ScissorRect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        ScissorRect::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
    }
}

/// Per-frame target description handed to [`GpuBackend::begin_frame`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSetup {
    /// Full render target size in pixels
    pub device_size: (u32, u32),
    pub viewport: ScissorRect,
    pub clear_color: [f32; 4],
    pub use_depth_buffer: bool,
}

/// A vertex stream: a buffer plus the byte offset of its first element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexStream {
    pub buffer: BufferId,
    pub offset: usize,
    pub stride: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRange {
    pub buffer: BufferId,
    pub offset: usize,
    pub count: usize,
    pub format: IndexFormat,
}

/// One draw call.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub mode: DrawMode,
    pub vertices: VertexStream,
    pub attributes: &'a [Attribute],
    /// Per-vertex f32 depth, bound after the regular attributes
    pub zorder: Option<VertexStream>,
    pub indices: Option<IndexRange>,
    pub vertex_count: usize,
}

pub trait GpuBackend {
    fn create_buffer(&mut self, kind: BufferKind) -> BufferId;
    /// Replace the buffer's contents with `data`.
    fn upload_buffer(&mut self, buffer: BufferId, data: &[u8], usage: BufferUsage);
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn begin_frame(&mut self, setup: &FrameSetup);
    fn end_frame(&mut self) {}

    fn set_blending(&mut self, enabled: bool);
    fn set_depth_state(&mut self, test: bool, write: bool);
    fn set_scissor(&mut self, rect: Option<ScissorRect>);

    /// Clear the stencil buffer and start writing clip shapes into it.
    fn begin_stencil_clip(&mut self);
    /// Increment the stencil where the clip covers pixels currently equal
    /// to `reference`. `matrix` maps clip vertices to device coordinates.
    fn draw_stencil_clip(&mut self, geometry: &Geometry, matrix: &Transform, reference: u32);
    /// Restore color writes and test subsequent draws against `reference`.
    fn end_stencil_clip(&mut self, reference: u32);
    fn disable_stencil(&mut self);

    fn bind_program(&mut self, program: Option<ProgramId>);
    fn set_line_width(&mut self, _width: f32) {}
    fn draw(&mut self, call: &DrawCall<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scissor_intersect() {
        let a = ScissorRect::new(0, 0, 100, 100);
        let b = ScissorRect::new(50, 25, 100, 100);
        assert_eq!(a.intersect(&b), ScissorRect::new(50, 25, 50, 75));

        let disjoint = ScissorRect::new(200, 200, 10, 10);
        let empty = a.intersect(&disjoint);
        assert_eq!((empty.width, empty.height), (0, 0));
    }
}
