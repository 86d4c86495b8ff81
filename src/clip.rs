//! Clip state: rectangular clips become a scissor, the rest go through the
//! stencil buffer.

use bitflags::bitflags;

use crate::backend::{GpuBackend, ScissorRect};
use crate::scene::SceneGraph;
use crate::shadow::{ShadowId, ShadowStore};
use crate::transform::Transform;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ClipType: u8 {
        const SCISSOR = 1 << 0;
        const STENCIL = 1 << 1;
    }
}

/// Clip state left on the backend by [`update_stencil_clip`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ClipState {
    pub(crate) clip_type: ClipType,
    pub(crate) scissor: Option<ScissorRect>,
    /// Stencil reference draws are tested against
    pub(crate) stencil_value: u32,
}

fn fuzzy_null(v: f32) -> bool {
    v.abs() <= 1e-5
}

/// Device-pixel scissor for a rectangular clip under `m`, or `None` when
/// the mapped rectangle is not axis aligned.
fn scissor_for(m: &Transform, rect: &crate::geometry::Rect, device_size: (u32, u32)) -> Option<ScissorRect> {
    if !fuzzy_null(m.at(3, 0)) || !fuzzy_null(m.at(3, 1)) {
        return None;
    }
    let no_rotate = fuzzy_null(m.at(0, 1)) && fuzzy_null(m.at(1, 0));
    let rotate_90 = fuzzy_null(m.at(0, 0)) && fuzzy_null(m.at(1, 1));
    let inv_w = 1.0 / m.at(3, 3);

    let (mut x1, mut y1, mut x2, mut y2) = if no_rotate {
        (
            (rect.left() * m.at(0, 0) + m.at(0, 3)) * inv_w,
            (rect.bottom() * m.at(1, 1) + m.at(1, 3)) * inv_w,
            (rect.right() * m.at(0, 0) + m.at(0, 3)) * inv_w,
            (rect.top() * m.at(1, 1) + m.at(1, 3)) * inv_w,
        )
    } else if rotate_90 {
        (
            (rect.bottom() * m.at(0, 1) + m.at(0, 3)) * inv_w,
            (rect.left() * m.at(1, 0) + m.at(1, 3)) * inv_w,
            (rect.top() * m.at(0, 1) + m.at(0, 3)) * inv_w,
            (rect.right() * m.at(1, 0) + m.at(1, 3)) * inv_w,
        )
    } else {
        return None;
    };
    if x1 > x2 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y1 > y2 {
        std::mem::swap(&mut y1, &mut y2);
    }

    // NDC y points up, device rows grow downwards.
    let (w, h) = (device_size.0 as f32, device_size.1 as f32);
    let left = ((x1 + 1.0) * w * 0.5).round() as i32;
    let right = ((x2 + 1.0) * w * 0.5).round() as i32;
    let top = ((1.0 - y2) * h * 0.5).round() as i32;
    let bottom = ((1.0 - y1) * h * 0.5).round() as i32;
    Some(ScissorRect::new(left, top, right - left, bottom - top))
}

/// Configure scissor and stencil for the clip chain starting at `clip`.
pub(crate) fn update_stencil_clip(
    clip: Option<ShadowId>,
    shadows: &ShadowStore,
    scene: &SceneGraph,
    projection: &Transform,
    device_size: (u32, u32),
    backend: &mut dyn GpuBackend,
) -> ClipState {
    let mut state = ClipState::default();
    if clip.is_none() {
        backend.disable_stencil();
        backend.set_scissor(None);
        return state;
    }

    let mut next = clip;
    while let Some(c) = next {
        let Some(info) = shadows.clip_info(c) else {
            break;
        };
        next = info.clip_list;
        let Some(node) = shadows.get(c).and_then(|s| scene.clip_node(s.node)) else {
            continue;
        };

        let m = projection.then(&info.matrix);
        let scissor = node
            .is_rectangular
            .then(|| scissor_for(&m, &node.clip_rect, device_size))
            .flatten();
        match scissor {
            Some(rect) => {
                state.clip_type |= ClipType::SCISSOR;
                state.scissor = Some(match state.scissor {
                    Some(current) => current.intersect(&rect),
                    None => rect,
                });
            }
            None => {
                if !state.clip_type.contains(ClipType::STENCIL) {
                    backend.begin_stencil_clip();
                    state.clip_type |= ClipType::STENCIL;
                }
                backend.draw_stencil_clip(&node.geometry, &m, state.stencil_value);
                state.stencil_value += 1;
            }
        }
    }

    backend.set_scissor(state.scissor);
    if state.clip_type.contains(ClipType::STENCIL) {
        backend.end_stencil_clip(state.stencil_value);
    } else {
        backend.disable_stencil();
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuCommand, RecordingBackend};
    use crate::config::RendererConfig;
    use crate::context::BatchContext;
    use crate::geometry::{Geometry, Rect};
    use crate::scene::{ClipNode, NodeKind};
    use crate::updater::Updater;

    fn projection() -> Transform {
        Transform::ortho(0.0, 100.0, 100.0, 0.0, 1.0, -1.0)
    }

    fn setup(scene: &mut SceneGraph) -> BatchContext {
        let mut ctx = BatchContext::new(RendererConfig::default());
        for (node, state) in scene.take_changes() {
            ctx.node_changed(scene, node, state);
        }
        Updater::default().update_states(&mut ctx, scene);
        ctx
    }

    #[test]
    fn test_rect_clip_uses_scissor() {
        let mut scene = SceneGraph::new();
        let c = scene.append_child(scene.root(), NodeKind::Clip(ClipNode::rect(Rect::new(10.0, 20.0, 30.0, 40.0))));
        let ctx = setup(&mut scene);
        let mut backend = RecordingBackend::new();
        let sc = ctx.shadows.lookup(c);

        let state = update_stencil_clip(sc, &ctx.shadows, &scene, &projection(), (100, 100), &mut backend);
        assert_eq!(state.clip_type, ClipType::SCISSOR);
        assert_eq!(state.scissor, Some(ScissorRect::new(10, 20, 30, 40)));
        assert!(backend.commands().contains(&GpuCommand::DisableStencil));
    }

    #[test]
    fn test_nested_rect_clips_intersect() {
        let mut scene = SceneGraph::new();
        let outer = scene.append_child(scene.root(), NodeKind::Clip(ClipNode::rect(Rect::new(0.0, 0.0, 50.0, 50.0))));
        let inner = scene.append_child(outer, NodeKind::Clip(ClipNode::rect(Rect::new(25.0, 25.0, 50.0, 50.0))));
        let ctx = setup(&mut scene);
        let mut backend = RecordingBackend::new();

        let state = update_stencil_clip(
            ctx.shadows.lookup(inner),
            &ctx.shadows,
            &scene,
            &projection(),
            (100, 100),
            &mut backend,
        );
        assert_eq!(state.scissor, Some(ScissorRect::new(25, 25, 25, 25)));
    }

    #[test]
    fn test_rotated_clip_uses_stencil() {
        let mut scene = SceneGraph::new();
        let t = scene.append_child(scene.root(), NodeKind::Transform(Transform::rotate_degrees(30.0)));
        let c = scene.append_child(t, NodeKind::Clip(ClipNode::rect(Rect::new(0.0, 0.0, 10.0, 10.0))));
        let ctx = setup(&mut scene);
        let mut backend = RecordingBackend::new();

        let state = update_stencil_clip(ctx.shadows.lookup(c), &ctx.shadows, &scene, &projection(), (100, 100), &mut backend);
        assert_eq!(state.clip_type, ClipType::STENCIL);
        assert_eq!(state.stencil_value, 1);
        assert_eq!(
            backend.commands(),
            &[
                GpuCommand::BeginStencilClip,
                GpuCommand::DrawStencilClip {
                    reference: 0,
                    vertex_count: 4
                },
                GpuCommand::SetScissor(None),
                GpuCommand::EndStencilClip(1),
            ]
        );
    }

    #[test]
    fn test_shaped_clip_under_scissor_combines_both() {
        let mut scene = SceneGraph::new();
        let outer = scene.append_child(scene.root(), NodeKind::Clip(ClipNode::rect(Rect::new(0.0, 0.0, 50.0, 50.0))));
        let shape = Geometry::rect(Rect::new(0.0, 0.0, 20.0, 20.0));
        let inner = scene.append_child(outer, NodeKind::Clip(ClipNode::shaped(shape)));
        let ctx = setup(&mut scene);
        let mut backend = RecordingBackend::new();

        let state = update_stencil_clip(
            ctx.shadows.lookup(inner),
            &ctx.shadows,
            &scene,
            &projection(),
            (100, 100),
            &mut backend,
        );
        assert_eq!(state.clip_type, ClipType::SCISSOR | ClipType::STENCIL);
        assert_eq!(state.scissor, Some(ScissorRect::new(0, 0, 50, 50)));
        assert_eq!(state.stencil_value, 1);
    }

    #[test]
    fn test_no_clip_disables_everything() {
        let scene = SceneGraph::new();
        let ctx = BatchContext::new(RendererConfig::default());
        let mut backend = RecordingBackend::new();
        let state = update_stencil_clip(None, &ctx.shadows, &scene, &projection(), (100, 100), &mut backend);
        assert!(state.clip_type.is_empty());
        assert_eq!(
            backend.commands(),
            &[GpuCommand::DisableStencil, GpuCommand::SetScissor(None)]
        );
    }
}
