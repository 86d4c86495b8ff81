//! Render statistics tracking for debugging and performance analysis.
//!
//! Every frame fills a [`FrameStats`], returned by
//! `Renderer::last_frame_stats()`. With the `render-stats` feature the
//! frames are also accumulated and summarized once per second:
//! ```bash
//! cargo test --features render-stats
//! ```

/// What the render-list builder did this frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    #[default]
    None,
    /// Only tagged batch roots were rebuilt
    Partial,
    Full,
}

/// Counters for one frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameStats {
    pub rebuild: RebuildKind,
    pub elements: usize,
    pub opaque_batches: usize,
    pub alpha_batches: usize,
    pub merged_batches: usize,
    pub batches_uploaded: usize,
    pub bytes_uploaded: usize,
    pub bounds_computed: usize,
    pub draw_calls: usize,
}

#[cfg(feature = "render-stats")]
mod inner {
    use super::{FrameStats, RebuildKind};
    use std::cell::RefCell;
    use std::time::Instant;

    thread_local! {
        static STATS: RefCell<RenderStats> = RefCell::new(RenderStats::new());
    }

    struct RenderStats {
        frames: u64,
        full_rebuilds: u64,
        partial_rebuilds: u64,
        batches_uploaded: u64,
        bytes_uploaded: u64,
        draw_calls: u64,
        bounds_computed: u64,
        // Timing
        last_print: Instant,
    }

    impl RenderStats {
        fn new() -> Self {
            Self {
                frames: 0,
                full_rebuilds: 0,
                partial_rebuilds: 0,
                batches_uploaded: 0,
                bytes_uploaded: 0,
                draw_calls: 0,
                bounds_computed: 0,
                last_print: Instant::now(),
            }
        }

        fn reset(&mut self) {
            *self = Self::new();
        }
    }

    /// Accumulate a finished frame and log a summary once per second.
    pub fn end_frame(frame: &FrameStats) {
        STATS.with(|s| {
            let mut stats = s.borrow_mut();
            stats.frames += 1;
            match frame.rebuild {
                RebuildKind::Full => stats.full_rebuilds += 1,
                RebuildKind::Partial => stats.partial_rebuilds += 1,
                RebuildKind::None => {}
            }
            stats.batches_uploaded += frame.batches_uploaded as u64;
            stats.bytes_uploaded += frame.bytes_uploaded as u64;
            stats.draw_calls += frame.draw_calls as u64;
            stats.bounds_computed += frame.bounds_computed as u64;

            if stats.last_print.elapsed().as_secs() >= 1 {
                let draws_per_frame = stats.draw_calls as f64 / stats.frames as f64;
                log::info!(
                    target: "tessera::render",
                    "[Render Stats] frames={} rebuilds full={} partial={} uploads={} ({} bytes) draws/frame={:.1} bounds={}",
                    stats.frames,
                    stats.full_rebuilds,
                    stats.partial_rebuilds,
                    stats.batches_uploaded,
                    stats.bytes_uploaded,
                    draws_per_frame,
                    stats.bounds_computed
                );
                stats.reset();
            }
        });
    }

    /// Frames accumulated since the last summary (for testing).
    pub fn frames_since_summary() -> u64 {
        STATS.with(|s| s.borrow().frames)
    }

    /// Reset all stats to zero (for test isolation).
    pub fn reset_stats() {
        STATS.with(|s| s.borrow_mut().reset());
    }
}

#[cfg(feature = "render-stats")]
pub use inner::*;

// No-op implementations when feature is disabled - these get completely inlined away

#[cfg(not(feature = "render-stats"))]
#[inline(always)]
pub fn end_frame(_frame: &FrameStats) {}

#[cfg(not(feature = "render-stats"))]
#[inline(always)]
pub fn frames_since_summary() -> u64 {
    0
}

#[cfg(not(feature = "render-stats"))]
#[inline(always)]
pub fn reset_stats() {}
