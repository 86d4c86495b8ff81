use std::collections::HashMap;

use super::{
    BufferId, BufferKind, BufferUsage, DrawCall, FrameSetup, GpuBackend, IndexRange, ProgramId, ScissorRect,
};
use crate::geometry::{DrawMode, Geometry};
use crate::transform::Transform;

/// Owned copy of a [`DrawCall`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDraw {
    pub mode: DrawMode,
    pub program: Option<ProgramId>,
    pub vertex_buffer: BufferId,
    pub vertex_offset: usize,
    pub stride: usize,
    pub zorder_offset: Option<usize>,
    pub indices: Option<IndexRange>,
    pub vertex_count: usize,
    pub scissor: Option<ScissorRect>,
    pub stencil_reference: Option<u32>,
    pub blending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    CreateBuffer(BufferId, BufferKind),
    Upload { buffer: BufferId, bytes: usize, usage: BufferUsage },
    DestroyBuffer(BufferId),
    BeginFrame(FrameSetup),
    EndFrame,
    SetBlending(bool),
    SetDepthState { test: bool, write: bool },
    SetScissor(Option<ScissorRect>),
    BeginStencilClip,
    DrawStencilClip { reference: u32, vertex_count: usize },
    EndStencilClip(u32),
    DisableStencil,
    BindProgram(Option<ProgramId>),
    SetLineWidth(f32),
    Draw(RecordedDraw),
}

/// In-memory backend that records every call.
#[derive(Default)]
pub struct RecordingBackend {
    commands: Vec<GpuCommand>,
    buffers: HashMap<BufferId, (BufferKind, Vec<u8>)>,
    next_id: u32,
    program: Option<ProgramId>,
    scissor: Option<ScissorRect>,
    stencil: Option<u32>,
    blending: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn draws(&self) -> Vec<&RecordedDraw> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Draw(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Buffers uploaded since the last [`RecordingBackend::clear_commands`].
    pub fn uploaded_buffers(&self) -> Vec<BufferId> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Upload { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .collect()
    }

    pub fn buffer_data(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(&id).map(|(_, data)| data.as_slice())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl GpuBackend for RecordingBackend {
    fn create_buffer(&mut self, kind: BufferKind) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, (kind, Vec::new()));
        self.commands.push(GpuCommand::CreateBuffer(id, kind));
        id
    }

    fn upload_buffer(&mut self, buffer: BufferId, data: &[u8], usage: BufferUsage) {
        if let Some((_, contents)) = self.buffers.get_mut(&buffer) {
            contents.clear();
            contents.extend_from_slice(data);
        }
        self.commands.push(GpuCommand::Upload {
            buffer,
            bytes: data.len(),
            usage,
        });
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.commands.push(GpuCommand::DestroyBuffer(buffer));
    }

    fn begin_frame(&mut self, setup: &FrameSetup) {
        self.program = None;
        self.scissor = None;
        self.stencil = None;
        self.blending = false;
        self.commands.push(GpuCommand::BeginFrame(*setup));
    }

    fn end_frame(&mut self) {
        self.commands.push(GpuCommand::EndFrame);
    }

    fn set_blending(&mut self, enabled: bool) {
        self.blending = enabled;
        self.commands.push(GpuCommand::SetBlending(enabled));
    }

    fn set_depth_state(&mut self, test: bool, write: bool) {
        self.commands.push(GpuCommand::SetDepthState { test, write });
    }

    fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        self.scissor = rect;
        self.commands.push(GpuCommand::SetScissor(rect));
    }

    fn begin_stencil_clip(&mut self) {
        self.commands.push(GpuCommand::BeginStencilClip);
    }

    fn draw_stencil_clip(&mut self, geometry: &Geometry, _matrix: &Transform, reference: u32) {
        self.commands.push(GpuCommand::DrawStencilClip {
            reference,
            vertex_count: geometry.vertex_count(),
        });
    }

    fn end_stencil_clip(&mut self, reference: u32) {
        self.stencil = Some(reference);
        self.commands.push(GpuCommand::EndStencilClip(reference));
    }

    fn disable_stencil(&mut self) {
        self.stencil = None;
        self.commands.push(GpuCommand::DisableStencil);
    }

    fn bind_program(&mut self, program: Option<ProgramId>) {
        self.program = program;
        self.commands.push(GpuCommand::BindProgram(program));
    }

    fn set_line_width(&mut self, width: f32) {
        self.commands.push(GpuCommand::SetLineWidth(width));
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        self.commands.push(GpuCommand::Draw(RecordedDraw {
            mode: call.mode,
            program: self.program,
            vertex_buffer: call.vertices.buffer,
            vertex_offset: call.vertices.offset,
            stride: call.vertices.stride,
            zorder_offset: call.zorder.map(|z| z.offset),
            indices: call.indices,
            vertex_count: call.vertex_count,
            scissor: self.scissor,
            stencil_reference: self.stencil,
            blending: self.blending,
        }));
    }
}
