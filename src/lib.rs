//! Retained-mode scene-graph batching renderer.
//!
//! The client builds a [`SceneGraph`] of geometry, transform, clip and
//! opacity nodes and mutates it between frames. Each [`Renderer::render`]
//! call turns the changed parts of the tree into as few draw calls as
//! possible, reusing batches and GPU buffers for everything that did not
//! change.

pub mod arena;
pub mod backend;
pub mod clip;
pub mod config;
pub mod debug;
pub mod error;
pub mod geometry;
pub mod material;
pub mod render_node;
pub mod render_stats;
pub mod scene;
pub mod shader;
pub mod transform;

mod batch;
mod batcher;
mod changes;
mod context;
mod element;
mod executor;
mod render_list;
mod renderer;
mod roots;
mod shadow;
mod updater;
mod upload;

/// Inherited opacity above which a node counts as fully opaque.
pub const OPAQUE_LIMIT: f32 = 0.999;

pub use backend::{GpuBackend, RecordingBackend, WgpuBackend};
pub use clip::ClipType;
pub use config::{DebugFlags, RendererConfig};
pub use debug::{dump_scene, BatchSummary};
pub use error::{MaterialError, RenderError, ShaderError};
pub use geometry::{Attribute, AttributeSet, DrawMode, Geometry, Rect};
pub use material::{Material, MaterialFlags};
pub use render_node::{RenderNode, RenderNodeFlags, RenderNodeState, StateFlags};
pub use render_stats::{FrameStats, RebuildKind};
pub use renderer::{PostRenderHook, Renderer};
pub use scene::{ClipNode, DirtyState, GeometryNode, NodeId, NodeKind, NodeType, SceneGraph};
pub use shader::{CompiledProgram, MaterialState, ShaderCache, ShaderCompiler, StateDirty};
pub use transform::Transform;
