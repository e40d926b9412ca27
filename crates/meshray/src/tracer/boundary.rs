//! Boundary collection and hook application.

use smallvec::SmallVec;
use tracing::debug;

use crate::error::Result;
use crate::extrema::ElemExtrema;
use crate::geom::{points_fuzzy_eq, Point, TRACE_TOL};
use crate::hooks::{AcquireCtx, BoundaryCtx};
use crate::mesh::{BoundaryId, ElemId};
use crate::ray::Ray;

use super::tools::within_extrema_on_side;
use super::Tracer;

/// A boundary element that needs hooks applied: the element, its side on
/// the boundary, the boundary id, and the extrema at the hit point.
#[derive(Clone, Debug)]
pub struct BndElement {
    pub elem: ElemId,
    pub side: u16,
    pub bnd_id: BoundaryId,
    pub extrema: ElemExtrema,
}

impl Tracer<'_> {
    /// Collects and applies external boundary hooks at the intersection
    /// point. At a vertex or edge, outward boundary sides of the extrema
    /// neighbors participate in addition to the current side.
    pub(crate) fn apply_on_external_boundary(&mut self, ray: &mut Ray) -> Result<()> {
        self.boundary_elems.clear();
        let point = self.intersection_point.unwrap_or(self.incoming_point);
        let Some(direction) = ray.direction() else {
            return self.fail_hard(ray, "applying boundary hooks to a ray with no direction");
        };

        // Boundary hooks never see an incoming side; a redirect sets a
        // fresh one afterwards
        ray.set_current_incoming_side(None);

        if self.dim != 1 && self.intersected_extrema.at_extrema() {
            let extrema = self.intersected_extrema;
            let neighbors = self.get_neighbors(self.current_elem, &extrema, &point);
            debug!(count = neighbors.len(), "external boundary neighbors (including self)");

            for info in &neighbors {
                if !info.valid {
                    continue;
                }
                for (i, &side) in info.sides.iter().enumerate() {
                    // A boundary side that holds our point and that the
                    // ray exits
                    if self.mesh.elem(info.elem).neighbors[side as usize].is_none()
                        && info.side_normals[i].dot(&direction) > TRACE_TOL
                    {
                        let extrema =
                            within_extrema_on_side(self.mesh, info.elem, &point, side, self.dim);
                        let ids: SmallVec<[BoundaryId; 2]> =
                            self.mesh.boundary_ids(info.elem, side).iter().copied().collect();
                        self.possibly_add_to_boundary_elems(info.elem, side, &ids, extrema);
                    }
                }
            }
        } else if let Some(side) = self.intersected_side {
            let ids: SmallVec<[BoundaryId; 2]> = self
                .mesh
                .boundary_ids(self.current_elem, side)
                .iter()
                .copied()
                .collect();
            let extrema = self.intersected_extrema;
            self.possibly_add_to_boundary_elems(self.current_elem, side, &ids, extrema);
        }

        debug!(count = self.boundary_elems.len(), "applying external boundary hooks");
        self.on_boundary(ray, true)
    }

    /// Collects and applies internal boundary hooks when leaving an
    /// element across an internal sideset. At an extrema, all touching
    /// elements with internal sidesets at the point participate.
    pub(crate) fn apply_on_internal_boundary(&mut self, ray: &mut Ray) -> Result<()> {
        debug_assert!(self.study.has_internal_sidesets());
        self.boundary_elems.clear();

        let point = self.intersection_point.unwrap_or(self.incoming_point);
        let Some(direction) = ray.direction() else {
            return self.fail_hard(ray, "applying boundary hooks to a ray with no direction");
        };
        let Some(last_elem) = self.last_elem else {
            return self.fail_hard(ray, "internal boundary with no previous element");
        };

        if self.dim != 1 && self.intersected_extrema.at_extrema() {
            let extrema = self.intersected_extrema;
            let neighbors = self.get_neighbors(last_elem, &extrema, &point);

            for info in &neighbors {
                if !info.valid {
                    continue;
                }
                let sidesets = self.study.get_internal_sidesets(info.elem);
                if sidesets.is_empty() {
                    continue;
                }
                let sidesets: Vec<Vec<BoundaryId>> = sidesets.to_vec();
                for (i, &side) in info.sides.iter().enumerate() {
                    // Side carries internal sidesets and is not tangent
                    if !sidesets[side as usize].is_empty()
                        && info.side_normals[i].dot(&direction).abs() > TRACE_TOL
                    {
                        let extrema =
                            within_extrema_on_side(self.mesh, info.elem, &point, side, self.dim);
                        let ids: SmallVec<[BoundaryId; 2]> =
                            sidesets[side as usize].iter().copied().collect();
                        self.possibly_add_to_boundary_elems(info.elem, side, &ids, extrema);
                    }
                }
            }
        } else {
            // Only the crossed side matters: the current element on its
            // incoming side and the previous element on the intersected
            // side
            if let Some(incoming_side) = self.incoming_side {
                let sidesets = self.study.get_internal_sidesets(self.current_elem);
                if !sidesets.is_empty() && !sidesets[incoming_side as usize].is_empty() {
                    if !self.study.has_same_level_active_elems() {
                        return self.fail_hard(
                            ray,
                            "internal sidesets are not supported with refinement in tracing",
                        );
                    }
                    let mut extrema = self.intersected_extrema;
                    if self.dim == 1 {
                        if let Some(v) = self.mesh.at_vertex(self.current_elem, &point) {
                            extrema = ElemExtrema::Vertex(v);
                        }
                    }
                    let ids: SmallVec<[BoundaryId; 2]> =
                        sidesets[incoming_side as usize].iter().copied().collect();
                    self.possibly_add_to_boundary_elems(
                        self.current_elem,
                        incoming_side,
                        &ids,
                        extrema,
                    );
                }
            }

            if let Some(intersected_side) = self.intersected_side {
                let sidesets = self.study.get_internal_sidesets(last_elem);
                if !sidesets.is_empty() && !sidesets[intersected_side as usize].is_empty() {
                    let ids: SmallVec<[BoundaryId; 2]> =
                        sidesets[intersected_side as usize].iter().copied().collect();
                    let extrema = self.intersected_extrema;
                    self.possibly_add_to_boundary_elems(last_elem, intersected_side, &ids, extrema);
                }
            }
        }

        if !self.boundary_elems.is_empty() {
            debug!(count = self.boundary_elems.len(), "applying internal boundary hooks");
            self.on_boundary(ray, false)?;
        }
        Ok(())
    }

    /// Adds one entry per distinct boundary id; an id already collected
    /// at this point is not collected again.
    fn possibly_add_to_boundary_elems(
        &mut self,
        elem: ElemId,
        side: u16,
        bnd_ids: &[BoundaryId],
        extrema: ElemExtrema,
    ) {
        for &bnd_id in bnd_ids {
            if self.boundary_elems.iter().any(|be| be.bnd_id == bnd_id) {
                continue;
            }
            self.boundary_elems.push(BndElement {
                elem,
                side,
                bnd_id,
                extrema,
            });
        }
    }

    /// Finds a boundary side that is outgoing at the intersection point
    /// on the intersected extrema. Needed when a ray hits a point that
    /// is on the domain boundary but not on a boundary side of the
    /// current element.
    pub(crate) fn find_external_boundary_side(
        &mut self,
        direction: &Point,
    ) -> Option<(ElemId, u16, ElemExtrema)> {
        debug_assert!(self.intersected_extrema.at_extrema());
        let point = self.intersection_point?;
        let intersected_side = self.intersected_side?;
        let extrema = self.intersected_extrema;
        let at_edge = extrema.at_edge();
        let elem = self.current_elem;
        let etype = self.mesh.elem(elem).etype;

        // First, other boundary sides of the current element touching
        // the vertex/edge that the ray exits
        let (first_v, second_v) = match extrema {
            ElemExtrema::Vertex(v) => (v, None),
            ElemExtrema::Edge(v1, v2) => (v1, Some(v2)),
            ElemExtrema::None => return None,
        };
        for s in 0..etype.n_sides() {
            if self.mesh.elem(elem).neighbors[s as usize].is_none()
                && s != intersected_side
                && etype.is_node_on_side(first_v, s)
                && (!at_edge || second_v.is_some_and(|v| etype.is_node_on_side(v, s)))
                && !self.study.side_is_incoming(elem, s, direction, self.tid)
            {
                return Some((elem, s, extrema));
            }
        }

        // No luck on our element: try the neighbors at the vertex/edge
        let neighbors = self.get_neighbors(elem, &extrema, &point);
        for info in &neighbors {
            // False for edge neighbors that do not cover this point
            if !info.valid || info.elem == elem {
                continue;
            }
            for (i, &side) in info.sides.iter().enumerate() {
                if info.side_normals[i].dot(direction) > TRACE_TOL
                    && self.mesh.elem(info.elem).neighbors[side as usize].is_none()
                {
                    let boundary_extrema =
                        within_extrema_on_side(self.mesh, info.elem, &point, side, self.dim);
                    return Some((info.elem, side, boundary_extrema));
                }
            }
        }
        None
    }

    /// Applies the hooks registered for the collected boundary elements.
    /// Each hook sees `num_applying`, the number of collected boundaries
    /// it applies to at this point. On an external boundary the ray must
    /// end up killed or redirected.
    pub(crate) fn on_boundary(&mut self, ray: &mut Ray, external: bool) -> Result<()> {
        debug_assert!(ray
            .current_point()
            .is_none_or(|p| points_fuzzy_eq(
                &p,
                &self.intersection_point.unwrap_or(self.incoming_point),
                crate::geom::LOOSE_TRACE_TOL * self.current_subdomain_hmax.max(1.0)
            )));

        let bnd_ids: Vec<BoundaryId> = self.boundary_elems.iter().map(|be| be.bnd_id).collect();
        let ray_filter = self.study.cfg().use_ray_registration.then(|| ray.id());
        let bcs = self.study.get_ray_bcs(&bnd_ids, ray_filter);

        let point = self.intersection_point.unwrap_or(self.incoming_point);

        for bc in &bcs {
            // Find up front which collected boundaries this hook covers,
            // so it can be told how many it is being applied to at once
            // (a corner reflection needs every one to fully turn around)
            let apply_index: Vec<usize> = self
                .boundary_elems
                .iter()
                .enumerate()
                .filter(|(_, be)| bc.boundaries().contains(&be.bnd_id))
                .map(|(i, _)| i)
                .collect();

            for &i in &apply_index {
                let be = self.boundary_elems[i].clone();
                let normal = self.study.get_side_normal(be.elem, be.side, self.tid);
                {
                    let mut ctx = BoundaryCtx {
                        ray: &mut *ray,
                        mesh: self.mesh,
                        elem: be.elem,
                        intersected_side: be.side,
                        intersected_extrema: be.extrema,
                        intersection_point: point,
                        boundary_id: be.bnd_id,
                        side_normal: normal,
                        acquire: AcquireCtx {
                            next_id: self.study.unique_id_slot(self.tid),
                            stride: self.study.id_stride(),
                            data_size: self.study.ray_data_size(),
                            aux_data_size: self.study.ray_aux_data_size(),
                            study_tag: self.study.tag(),
                        },
                        spawned: &mut self.spawned,
                    };
                    bc.on_boundary(&mut ctx, apply_index.len())?;
                }
                self.post_hook(ray, bc.name())?;
            }
        }

        // On an external boundary the ray must have been killed or
        // redirected; otherwise there is nothing left to do with it
        if external && !ray.trajectory_changed() && ray.should_continue() {
            let mut reason = String::from(
                "a ray hit an external boundary and was neither killed nor redirected; \
                 it must be killed or have its trajectory changed by at least one boundary hook.",
            );
            if bcs.is_empty() {
                reason.push_str(" No boundary hooks were registered for the hit boundaries: ");
                reason.push_str(&format!("{bnd_ids:?}"));
            }
            return self.fail_boundary(ray, reason);
        }
        Ok(())
    }

    fn fail_boundary(&mut self, ray: &mut Ray, reason: String) -> Result<()> {
        if self.study.cfg().tolerate_failure {
            self.results[super::TraceResult::FailedTraces as usize] += 1;
            tracing::warn!(ray = ray.id().0, %reason, "tolerated an unresolved boundary");
            ray.kill();
            self.should_continue = false;
            return Ok(());
        }
        self.fail_hard(ray, &reason)
    }
}
