//! Renderer configuration.
//!
//! Every knob has a default. [`RendererConfig::from_env`] starts from the
//! defaults and applies the `TESSERA_*` environment variables on top.

use bitflags::bitflags;

use crate::backend::BufferUsage;

pub const DEFAULT_BATCH_NODE_THRESHOLD: u32 = 64;
pub const DEFAULT_BATCH_VERTEX_THRESHOLD: u32 = 1024;

bitflags! {
    /// Debug switches, from `TESSERA_RENDERER_DEBUG`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Per-frame timing and pass summary
        const RENDER = 1 << 0;
        /// Render list and batch construction
        const BUILD = 1 << 1;
        /// Change notifications
        const CHANGE = 1 << 2;
        const UPLOAD = 1 << 3;
        /// Batch root promotion and order budgets
        const ROOTS = 1 << 4;
        /// Dump shadow roots and the scene on material errors
        const DUMP = 1 << 5;
        const NO_ALPHA = 1 << 6;
        const NO_OPAQUE = 1 << 7;
        const NO_CLIP = 1 << 8;
    }
}

impl DebugFlags {
    /// Parse a comma separated switch list. Unknown names are logged and ignored.
    pub fn parse(list: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "render" => flags |= DebugFlags::RENDER,
                "build" => flags |= DebugFlags::BUILD,
                "change" => flags |= DebugFlags::CHANGE,
                "upload" => flags |= DebugFlags::UPLOAD,
                "roots" => flags |= DebugFlags::ROOTS,
                "dump" => flags |= DebugFlags::DUMP,
                "noalpha" => flags |= DebugFlags::NO_ALPHA,
                "noopaque" => flags |= DebugFlags::NO_OPAQUE,
                "noclip" => flags |= DebugFlags::NO_CLIP,
                other => log::warn!("unknown renderer debug switch '{}'", other),
            }
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Renderable descendants above which a transform becomes a batch root
    pub batch_node_threshold: u32,
    /// Descendant vertices above which a transform becomes a batch root
    pub batch_vertex_threshold: u32,
    pub use_depth_buffer: bool,
    pub buffer_usage: BufferUsage,
    pub clear_color: [f32; 4],
    pub debug: DebugFlags,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            batch_node_threshold: DEFAULT_BATCH_NODE_THRESHOLD,
            batch_vertex_threshold: DEFAULT_BATCH_VERTEX_THRESHOLD,
            use_depth_buffer: true,
            buffer_usage: BufferUsage::Static,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            debug: DebugFlags::empty(),
        }
    }
}

impl RendererConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` on top of the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = lookup("TESSERA_RENDERER_BATCH_NODE_THRESHOLD").and_then(|v| parse_threshold(&v)) {
            config.batch_node_threshold = n;
        }
        if let Some(n) = lookup("TESSERA_RENDERER_BATCH_VERTEX_THRESHOLD").and_then(|v| parse_threshold(&v)) {
            config.batch_vertex_threshold = n;
        }
        if lookup("TESSERA_NO_DEPTH_BUFFER").is_some() {
            config.use_depth_buffer = false;
        }
        if let Some(strategy) = lookup("TESSERA_RENDERER_BUFFER_STRATEGY") {
            match strategy.trim() {
                "static" => config.buffer_usage = BufferUsage::Static,
                "dynamic" => config.buffer_usage = BufferUsage::Dynamic,
                "stream" => config.buffer_usage = BufferUsage::Stream,
                other => log::warn!("unknown buffer strategy '{}', keeping static", other),
            }
        }
        if let Some(list) = lookup("TESSERA_RENDERER_DEBUG") {
            config.debug = DebugFlags::parse(&list);
        }
        config
    }
}

fn parse_threshold(value: &str) -> Option<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!("ignoring invalid batch threshold '{}'", value);
            None
        }
    }
}
