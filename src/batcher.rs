//! Batch former: groups render-list elements into batches.

use crate::context::BatchContext;
use crate::element::ElementId;
use crate::geometry::{Bounds, DrawMode};
use crate::material::{material_type, materials_equal};
use crate::scene::SceneGraph;

impl BatchContext {
    /// Whether two geometry elements can share one batch.
    pub(crate) fn elements_compatible(&self, scene: &SceneGraph, a: ElementId, b: ElementId) -> bool {
        let (Some(ea), Some(eb)) = (self.elements.get(a), self.elements.get(b)) else {
            return false;
        };
        let (Some(ga), Some(gb)) = (scene.geometry_node(ea.node), scene.geometry_node(eb.node)) else {
            return false;
        };
        let (geo_a, geo_b) = (&ga.geometry, &gb.geometry);
        let ma = ga.active_material(ea.inherited_opacity);
        let mb = gb.active_material(eb.inherited_opacity);

        ea.clip_list == eb.clip_list
            && geo_a.mode() == geo_b.mode()
            && (geo_a.mode() != DrawMode::Lines || geo_a.line_width() == geo_b.line_width())
            && geo_a.attributes() == geo_b.attributes()
            && ea.inherited_opacity == eb.inherited_opacity
            && material_type(ma.as_ref()) == material_type(mb.as_ref())
            && materials_equal(ma.as_ref(), mb.as_ref())
    }

    fn vertex_count(&self, scene: &SceneGraph, e: ElementId) -> usize {
        self.elements
            .get(e)
            .and_then(|e| scene.geometry_node(e.node))
            .map_or(0, |gn| gn.geometry.vertex_count())
    }

    /// Start a batch at `first` and register it in the given pass.
    fn start_batch(&mut self, scene: &SceneGraph, first: ElementId, opaque: bool) -> crate::batch::BatchId {
        let id = self.new_batch();
        let root = self.elements[first].root;
        let position = scene
            .geometry_node(self.elements[first].node)
            .and_then(|gn| gn.geometry.attributes().position_offset());
        let batch = &mut self.batches[id];
        batch.first = Some(first);
        batch.root = root;
        batch.is_opaque = opaque;
        batch.needs_upload = true;
        batch.position_attribute = position;
        self.elements[first].batch = Some(id);
        if opaque {
            self.opaque_batches.push(id);
        } else {
            self.alpha_batches.push(id);
        }
        id
    }

    pub(crate) fn prepare_opaque_batches(&mut self, scene: &SceneGraph) {
        // The list is sorted by descending order, so walk it backwards to
        // keep each batch's members in ascending order.
        let list = self.opaque_list.clone();
        for i in (0..list.len()).rev() {
            let ei = list[i];
            if self.elements[ei].batch.is_some() || self.vertex_count(scene, ei) == 0 {
                continue;
            }
            let batch = self.start_batch(scene, ei, true);
            let root = self.elements[ei].root;
            let mut last = ei;

            for &ej in list[..i].iter().rev() {
                if self.elements[ej].root != root {
                    break;
                }
                if self.elements[ej].batch.is_some() || self.vertex_count(scene, ej) == 0 {
                    continue;
                }
                if self.elements_compatible(scene, ei, ej) {
                    self.elements[ej].batch = Some(batch);
                    self.elements[last].next_in_batch = Some(ej);
                    last = ej;
                }
            }
            self.batches[batch].last_order_in_batch = self.elements[last].order;
        }
    }

    /// True when an unbatched element in `list[first..last]` overlaps `bounds`.
    fn check_overlap(&self, list: &[ElementId], first: usize, last: usize, bounds: &Bounds) -> bool {
        list[first..last].iter().any(|&e| {
            let e = &self.elements[e];
            e.batch.is_none() && e.bounds.intersects(bounds)
        })
    }

    pub(crate) fn prepare_alpha_batches(&mut self, scene: &SceneGraph) {
        let list = self.alpha_list.clone();
        for &e in &list {
            let element = &mut self.elements[e];
            if element.is_render_node() || element.bounds_computed() {
                continue;
            }
            if let Some(gn) = scene.geometry_node(element.node) {
                element.compute_bounds(&gn.geometry);
                self.stats.bounds_computed += 1;
            }
        }

        for i in 0..list.len() {
            let ei = list[i];
            if self.elements[ei].batch.is_some() {
                continue;
            }
            if self.elements[ei].is_render_node() {
                let id = self.new_batch();
                let batch = &mut self.batches[id];
                batch.first = Some(ei);
                batch.root = self.elements[ei].root;
                batch.is_render_node = true;
                batch.last_order_in_batch = self.elements[ei].order;
                self.elements[ei].batch = Some(id);
                self.alpha_batches.push(id);
                continue;
            }
            if self.vertex_count(scene, ei) == 0 {
                continue;
            }

            let batch = self.start_batch(scene, ei, false);
            let root = self.elements[ei].root;
            let mut skipped = Bounds::EMPTY;
            let mut last = ei;

            for j in i + 1..list.len() {
                let ej = list[j];
                let candidate = &self.elements[ej];
                if candidate.root != root || candidate.is_render_node() {
                    break;
                }
                if candidate.batch.is_some() || self.vertex_count(scene, ej) == 0 {
                    continue;
                }
                let bounds = candidate.bounds;
                if self.elements_compatible(scene, ei, ej) {
                    if !skipped.intersects(&bounds) || !self.check_overlap(&list, i + 1, j, &bounds) {
                        self.elements[ej].batch = Some(batch);
                        self.elements[last].next_in_batch = Some(ej);
                        last = ej;
                    } else {
                        // Anything merged after this point would draw before `ej`.
                        break;
                    }
                } else {
                    skipped = skipped.union(&bounds);
                }
            }
            self.batches[batch].last_order_in_batch = self.elements[last].order;
        }
    }
}
