use std::collections::HashMap;
use std::sync::Arc;

use wgpu::{BindGroup, Buffer, BufferUsages, Device, Queue, RenderPipeline};

use super::{
    BufferId, BufferKind, BufferUsage, DrawCall, FrameSetup, GpuBackend, ProgramId, ScissorRect,
};
use crate::geometry::{DrawMode, Geometry, IndexFormat, Indices};
use crate::transform::Transform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilMode {
    Disabled,
    /// Clip-fill: compare equal, increment on pass, no color writes
    Write,
    /// Compare equal against the reference, keep
    Test,
}

/// Everything wgpu bakes into a pipeline. The host registers one pipeline
/// per key it expects to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// `None` selects the clip-fill pipeline
    pub program: Option<ProgramId>,
    pub topology: wgpu::PrimitiveTopology,
    pub blending: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub stencil: StencilMode,
    /// A per-vertex depth stream is bound at vertex slot 1
    pub depth_stream: bool,
}

struct WgpuBuffer {
    buffer: Buffer,
    capacity: u64,
}

enum PassCommand {
    Scissor(Option<ScissorRect>),
    StencilReference(u32),
    ClipFill {
        key: PipelineKey,
        reference: u32,
        first: u32,
        count: u32,
    },
    Draw {
        key: PipelineKey,
        vertices: (BufferId, u64),
        zorder: Option<(BufferId, u64)>,
        indices: Option<(BufferId, u64, u32, wgpu::IndexFormat)>,
        vertex_count: u32,
    },
}

/// `wgpu` implementation of [`GpuBackend`].
///
/// Buffers are real device buffers, written through the queue as the
/// renderer uploads them. Draw state is recorded and replayed with
/// [`WgpuBackend::encode`] into a render pass the host owns, since wgpu
/// bakes blend/depth/stencil state into pipelines.
pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    buffers: HashMap<BufferId, WgpuBuffer>,
    next_id: u32,
    pipelines: HashMap<PipelineKey, RenderPipeline>,
    bind_groups: HashMap<ProgramId, BindGroup>,
    commands: Vec<PassCommand>,
    frame: Option<FrameSetup>,
    // Current state
    program: Option<ProgramId>,
    blending: bool,
    depth_test: bool,
    depth_write: bool,
    stencil: StencilMode,
    // Clip geometry, pre-transformed to device coordinates
    clip_vertices: Vec<[f32; 2]>,
    clip_buffer: Option<WgpuBuffer>,
}

impl WgpuBackend {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            device,
            queue,
            buffers: HashMap::new(),
            next_id: 0,
            pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            commands: Vec::new(),
            frame: None,
            program: None,
            blending: false,
            depth_test: false,
            depth_write: false,
            stencil: StencilMode::Disabled,
            clip_vertices: Vec::new(),
            clip_buffer: None,
        }
    }

    pub fn register_pipeline(&mut self, key: PipelineKey, pipeline: RenderPipeline) {
        self.pipelines.insert(key, pipeline);
    }

    /// Bind group set at slot 0 whenever `program` draws.
    pub fn register_bind_group(&mut self, program: ProgramId, bind_group: BindGroup) {
        self.bind_groups.insert(program, bind_group);
    }

    /// Target description of the last frame, for configuring the render pass.
    pub fn frame_setup(&self) -> Option<&FrameSetup> {
        self.frame.as_ref()
    }

    fn topology(mode: DrawMode) -> Option<wgpu::PrimitiveTopology> {
        match mode {
            DrawMode::Points => Some(wgpu::PrimitiveTopology::PointList),
            DrawMode::Lines => Some(wgpu::PrimitiveTopology::LineList),
            DrawMode::LineStrip => Some(wgpu::PrimitiveTopology::LineStrip),
            DrawMode::Triangles => Some(wgpu::PrimitiveTopology::TriangleList),
            DrawMode::TriangleStrip => Some(wgpu::PrimitiveTopology::TriangleStrip),
            DrawMode::LineLoop | DrawMode::TriangleFan => None,
        }
    }

    fn key(&self, topology: wgpu::PrimitiveTopology, depth_stream: bool) -> PipelineKey {
        PipelineKey {
            program: self.program,
            topology,
            blending: self.blending,
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            stencil: self.stencil,
            depth_stream,
        }
    }

    /// Write `data` into `target`, growing it when needed.
    fn write(device: &Device, queue: &Queue, target: &mut Option<WgpuBuffer>, usage: BufferUsages, data: &[u8]) {
        // write_buffer requires 4-byte aligned sizes
        let padded = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if padded == 0 {
            return;
        }
        let capacity = target.as_ref().map_or(0, |b| b.capacity);
        if padded > capacity {
            let new_capacity = (capacity * 2).max(padded);
            *target = Some(WgpuBuffer {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("tessera batch buffer"),
                    size: new_capacity,
                    usage: usage | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                capacity: new_capacity,
            });
        }
        let Some(buffer) = target.as_ref() else {
            return;
        };
        if padded as usize == data.len() {
            queue.write_buffer(&buffer.buffer, 0, data);
        } else {
            let mut aligned = data.to_vec();
            aligned.resize(padded as usize, 0);
            queue.write_buffer(&buffer.buffer, 0, &aligned);
        }
    }

    /// Replay the frame's draws into `pass`.
    pub fn encode(&self, pass: &mut wgpu::RenderPass<'_>) {
        let (width, height) = self.frame.map_or((0, 0), |f| f.device_size);
        for command in &self.commands {
            match command {
                PassCommand::Scissor(rect) => {
                    let full = ScissorRect::new(0, 0, width as i32, height as i32);
                    let r = rect.map_or(full, |r| r.intersect(&full));
                    pass.set_scissor_rect(r.x as u32, r.y as u32, r.width as u32, r.height as u32);
                }
                PassCommand::StencilReference(reference) => pass.set_stencil_reference(*reference),
                PassCommand::ClipFill {
                    key,
                    reference,
                    first,
                    count,
                } => {
                    let (Some(pipeline), Some(clip)) = (self.pipelines.get(key), self.clip_buffer.as_ref()) else {
                        log::debug!("no clip-fill pipeline registered for {:?}", key);
                        continue;
                    };
                    pass.set_pipeline(pipeline);
                    pass.set_stencil_reference(*reference);
                    pass.set_vertex_buffer(0, clip.buffer.slice(..));
                    pass.draw(*first..*first + *count, 0..1);
                }
                PassCommand::Draw {
                    key,
                    vertices,
                    zorder,
                    indices,
                    vertex_count,
                } => {
                    let Some(pipeline) = self.pipelines.get(key) else {
                        log::debug!("no pipeline registered for {:?}", key);
                        continue;
                    };
                    let Some(vbo) = self.buffers.get(&vertices.0) else {
                        continue;
                    };
                    pass.set_pipeline(pipeline);
                    if let Some(bind_group) = key.program.and_then(|p| self.bind_groups.get(&p)) {
                        pass.set_bind_group(0, bind_group, &[]);
                    }
                    pass.set_vertex_buffer(0, vbo.buffer.slice(vertices.1..));
                    if let Some((z_buffer, z_offset)) = zorder {
                        if let Some(z) = self.buffers.get(z_buffer) {
                            pass.set_vertex_buffer(1, z.buffer.slice(*z_offset..));
                        }
                    }
                    match indices {
                        Some((buffer, offset, count, format)) => {
                            let Some(ibo) = self.buffers.get(buffer) else {
                                continue;
                            };
                            pass.set_index_buffer(ibo.buffer.slice(*offset..), *format);
                            pass.draw_indexed(0..*count, 0, 0..1);
                        }
                        None => pass.draw(0..*vertex_count, 0..1),
                    }
                }
            }
        }
    }
}

/// Expand any triangle mode into a triangle-list vertex sequence.
fn triangle_list(mode: DrawMode, vertex_count: usize, indices: &Indices) -> Option<Vec<u32>> {
    let seq: Vec<u32> = match indices {
        Indices::None => (0..vertex_count as u32).collect(),
        Indices::U16(v) => v.iter().map(|&i| i as u32).collect(),
        Indices::U32(v) => v.clone(),
    };
    match mode {
        DrawMode::Triangles => Some(seq),
        DrawMode::TriangleStrip => Some(seq.windows(3).flatten().copied().collect()),
        DrawMode::TriangleFan => {
            let (&hub, rest) = seq.split_first()?;
            Some(rest.windows(2).flat_map(|w| [hub, w[0], w[1]]).collect())
        }
        _ => None,
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, kind: BufferKind) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        let usage = match kind {
            BufferKind::Vertex => BufferUsages::VERTEX,
            BufferKind::Index => BufferUsages::INDEX,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera batch buffer"),
            size: wgpu::COPY_BUFFER_ALIGNMENT,
            usage: usage | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.buffers.insert(
            id,
            WgpuBuffer {
                buffer,
                capacity: wgpu::COPY_BUFFER_ALIGNMENT,
            },
        );
        id
    }

    fn upload_buffer(&mut self, buffer: BufferId, data: &[u8], _usage: BufferUsage) {
        let Some(existing) = self.buffers.remove(&buffer) else {
            log::warn!("upload to unknown buffer {:?}", buffer);
            return;
        };
        let usage = existing.buffer.usage() - BufferUsages::COPY_DST;
        let mut slot = Some(existing);
        Self::write(&self.device, &self.queue, &mut slot, usage, data);
        if let Some(written) = slot {
            self.buffers.insert(buffer, written);
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(b) = self.buffers.remove(&buffer) {
            b.buffer.destroy();
        }
    }

    fn begin_frame(&mut self, setup: &FrameSetup) {
        self.frame = Some(*setup);
        self.commands.clear();
        self.clip_vertices.clear();
        self.program = None;
        self.blending = false;
        self.depth_test = setup.use_depth_buffer;
        self.depth_write = setup.use_depth_buffer;
        self.stencil = StencilMode::Disabled;
        self.commands.push(PassCommand::Scissor(Some(setup.viewport)));
    }

    fn end_frame(&mut self) {
        let data: &[u8] = bytemuck::cast_slice(&self.clip_vertices);
        Self::write(&self.device, &self.queue, &mut self.clip_buffer, BufferUsages::VERTEX, data);
    }

    fn set_blending(&mut self, enabled: bool) {
        self.blending = enabled;
    }

    fn set_depth_state(&mut self, test: bool, write: bool) {
        self.depth_test = test;
        self.depth_write = write;
    }

    fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        let rect = rect.or_else(|| self.frame.map(|f| f.viewport));
        self.commands.push(PassCommand::Scissor(rect));
    }

    fn begin_stencil_clip(&mut self) {
        // The host clears stencil at pass start; nested frames restart from zero.
        self.stencil = StencilMode::Write;
    }

    fn draw_stencil_clip(&mut self, geometry: &Geometry, matrix: &Transform, reference: u32) {
        let Some(offset) = geometry.attributes().position_offset() else {
            return;
        };
        let Some(sequence) = triangle_list(geometry.mode(), geometry.vertex_count(), geometry.indices()) else {
            log::warn!("clip geometry with mode {:?} cannot be stenciled", geometry.mode());
            return;
        };
        let first = self.clip_vertices.len() as u32;
        for i in sequence {
            let (x, y) = geometry.position_at(i as usize, offset);
            let (nx, ny) = matrix.project_point(x, y);
            self.clip_vertices.push([nx, ny]);
        }
        let count = self.clip_vertices.len() as u32 - first;
        let key = PipelineKey {
            program: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
            blending: false,
            depth_test: false,
            depth_write: false,
            stencil: StencilMode::Write,
            depth_stream: false,
        };
        self.commands.push(PassCommand::ClipFill {
            key,
            reference,
            first,
            count,
        });
    }

    fn end_stencil_clip(&mut self, reference: u32) {
        self.stencil = StencilMode::Test;
        self.commands.push(PassCommand::StencilReference(reference));
    }

    fn disable_stencil(&mut self) {
        self.stencil = StencilMode::Disabled;
    }

    fn bind_program(&mut self, program: Option<ProgramId>) {
        self.program = program;
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        let Some(topology) = Self::topology(call.mode) else {
            log::warn!("draw mode {:?} is not supported by wgpu", call.mode);
            return;
        };
        let key = self.key(topology, call.zorder.is_some());
        self.commands.push(PassCommand::Draw {
            key,
            vertices: (call.vertices.buffer, call.vertices.offset as u64),
            zorder: call.zorder.map(|z| (z.buffer, z.offset as u64)),
            indices: call.indices.map(|i| {
                let format = match i.format {
                    IndexFormat::U16 => wgpu::IndexFormat::Uint16,
                    IndexFormat::U32 => wgpu::IndexFormat::Uint32,
                };
                (i.buffer, i.offset as u64, i.count as u32, format)
            }),
            vertex_count: call.vertex_count as u32,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_list_from_strip() {
        let list = triangle_list(DrawMode::TriangleStrip, 4, &Indices::None);
        assert_eq!(list, Some(vec![0, 1, 2, 1, 2, 3]));
    }

    #[test]
    fn test_triangle_list_from_fan_with_indices() {
        let list = triangle_list(DrawMode::TriangleFan, 0, &Indices::U16(vec![4, 5, 6, 7]));
        assert_eq!(list, Some(vec![4, 5, 6, 4, 6, 7]));
    }

    #[test]
    fn test_triangle_list_rejects_lines() {
        assert_eq!(triangle_list(DrawMode::Lines, 2, &Indices::None), None);
    }
}
