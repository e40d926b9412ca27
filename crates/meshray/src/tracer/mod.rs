//! The per-thread tracer: walks a single ray through local elements,
//! invoking segment kernels on every traversed segment and boundary
//! hooks on every boundary touch, until the ray terminates or must be
//! handed to another rank.
//!
//! The loop per step: search for the exit of the current element (with
//! backface culling and farthest-hit selection); if the last step ended
//! at a vertex or edge, move through the extrema neighbors instead,
//! keeping the candidate that yields the longest continuing segment.
//! Segment hooks may kill or redirect the ray; boundary hooks fire on
//! internal sidesets and on the external boundary, where the ray must be
//! killed or redirected.

mod boundary;
mod exit;
mod tools;

#[cfg(test)]
mod tests;

pub use boundary::BndElement;
pub use tools::{at_vertex_on_side, within_edge, within_edge_on_side, within_extrema_on_side};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{RayTracingError, Result};
use crate::extrema::ElemExtrema;
use crate::geom::{on_bounding_box_boundary, Point, LOOSE_TRACE_TOL, TRACE_TOL};
use crate::hooks::{AcquireCtx, RayKernel, SegmentCtx};
use crate::mesh::{ElemId, Mesh, NodeId, SubdomainId};
use crate::neighbors::{NeighborInfo, NeighborScratch};
use crate::quadrature::SegmentQuadrature;
use crate::ray::Ray;
use crate::study::{RayStudy, TraceData};

/// Sentinel for "no intersection distance yet".
pub(crate) const INVALID_DISTANCE: f64 = f64::MAX;

/// Index into the tracer's result counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum TraceResult {
    Intersections = 0,
    FaceHits,
    VertexHits,
    EdgeHits,
    MovedThroughNeighbors,
    BackfaceCullingSuccesses,
    BackfaceCullingFailures,
    IntersectionCalls,
    VertexNeighborBuilds,
    VertexNeighborLookups,
    EdgeNeighborBuilds,
    EdgeNeighborLookups,
    PointNeighborBuilds,
    FailedTraces,
    EndedStationary,
}

impl TraceResult {
    pub const COUNT: usize = Self::EndedStationary as usize + 1;
}

/// How a single trace ended on this rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOutcome {
    /// The ray terminated here.
    Completed,
    /// The ray advanced into an element owned by another rank.
    OffRank(u32),
}

/// A face hit found by the exit search.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExitHit {
    pub point: Point,
    pub side: u16,
    pub extrema: ElemExtrema,
    pub distance: f64,
}

pub struct Tracer<'a> {
    study: &'a RayStudy,
    mesh: &'a Mesh,
    tid: usize,
    rank: u32,
    dim: u32,
    backface_culling: bool,
    has_ray_kernels: bool,
    is_rectangular_domain: bool,

    results: Vec<u64>,

    // Per-trace state
    current_elem: ElemId,
    last_elem: Option<ElemId>,
    current_subdomain: SubdomainId,
    current_subdomain_hmax: f64,
    incoming_point: Point,
    incoming_side: Option<u16>,
    should_continue: bool,
    exits_elem_flag: bool,

    // Per-step intersection outputs
    intersection_point: Option<Point>,
    intersected_side: Option<u16>,
    intersected_extrema: ElemExtrema,
    /// Carried one step to inform the next step's neighbor traversal.
    last_intersected_extrema: ElemExtrema,
    intersection_distance: f64,

    pub(crate) boundary_elems: Vec<BndElement>,

    // Neighbor caches, valid for the whole propagation
    vertex_neighbors: HashMap<NodeId, Vec<NeighborInfo>>,
    edge_neighbors: HashMap<(NodeId, NodeId), (bool, Vec<NeighborInfo>)>,
    scratch: NeighborScratch,

    current_kernels: Vec<Arc<dyn RayKernel>>,
    /// Kernels that already ran `pre_trace` for the current ray.
    old_kernels: HashSet<usize>,

    segment_quadrature: SegmentQuadrature,

    /// Child rays produced by hooks, drained by the executor.
    spawned: Vec<Ray>,

    current_trace: Option<TraceData>,
    cached_traces: Vec<TraceData>,
}

impl<'a> Tracer<'a> {
    pub fn new(study: &'a RayStudy, tid: usize) -> Self {
        Self {
            mesh: study.mesh(),
            tid,
            rank: study.rank(),
            dim: study.mesh().dim(),
            backface_culling: study.cfg().backface_culling,
            has_ray_kernels: study.has_ray_kernels(),
            is_rectangular_domain: study.is_rectangular_domain(),
            results: vec![0; TraceResult::COUNT],
            current_elem: ElemId(usize::MAX),
            last_elem: None,
            current_subdomain: u32::MAX,
            current_subdomain_hmax: 1.0,
            incoming_point: Point::zeros(),
            incoming_side: None,
            should_continue: true,
            exits_elem_flag: false,
            intersection_point: None,
            intersected_side: None,
            intersected_extrema: ElemExtrema::None,
            last_intersected_extrema: ElemExtrema::None,
            intersection_distance: INVALID_DISTANCE,
            boundary_elems: Vec::new(),
            vertex_neighbors: HashMap::new(),
            edge_neighbors: HashMap::new(),
            scratch: NeighborScratch::default(),
            current_kernels: Vec::new(),
            old_kernels: HashSet::new(),
            segment_quadrature: SegmentQuadrature::default(),
            spawned: Vec::new(),
            current_trace: None,
            cached_traces: Vec::new(),
            study,
        }
    }

    /// Result counters indexed by [`TraceResult`].
    pub fn results(&self) -> &[u64] {
        &self.results
    }

    /// Invalidates the neighbor caches; call on mesh change.
    pub fn mesh_changed(&mut self) {
        self.vertex_neighbors.clear();
        self.edge_neighbors.clear();
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<Ray> {
        std::mem::take(&mut self.spawned)
    }

    pub(crate) fn take_cached_traces(&mut self) -> Vec<TraceData> {
        std::mem::take(&mut self.cached_traces)
    }

    /// Traces a ray until it terminates or leaves this rank.
    pub fn trace(&mut self, ray: &mut Ray) -> Result<TraceOutcome> {
        let Some(elem) = ray.current_elem() else {
            return Err(ray.contract("tracing a ray with no current element"));
        };
        let Some(point) = ray.current_point() else {
            return Err(ray.contract("tracing a ray with no current point"));
        };
        if !ray.should_continue() {
            return Err(ray.contract("tracing a ray that should not continue"));
        }
        if !self.mesh.elem(elem).active() {
            return Err(ray.contract("tracing a ray on an inactive element"));
        }

        self.current_elem = elem;
        self.last_elem = None;
        self.incoming_point = point;
        self.incoming_side = ray.current_incoming_side();
        self.should_continue = true;
        self.intersected_extrema.invalidate();

        debug!(ray = ray.id().0, elem = elem.0, "starting trace");

        self.current_trace = if self.study.cfg().cache_traces {
            let mut td = TraceData::start(ray);
            let tp = td.add_point(point);
            if self.study.cfg().data_on_cache_traces {
                tp.data = ray.data().to_vec();
            }
            if self.study.cfg().aux_data_on_cache_traces {
                tp.aux_data = ray.aux_data().to_vec();
            }
            Some(td)
        } else {
            None
        };

        // Subdomain setup, also refreshing the active kernel set
        if self.mesh.elem(elem).subdomain != self.current_subdomain
            || self.study.cfg().ray_dependent_subdomain_setup
        {
            self.on_subdomain_changed(ray, false);
        } else {
            self.old_kernels.clear();
            for k in &self.current_kernels {
                self.old_kernels.insert(kernel_addr(k));
                k.pre_trace();
            }
        }

        // A stationary ray reports at its start point without tracing
        if ray.stationary() {
            self.results[TraceResult::EndedStationary as usize] += 1;
            self.intersection_point = Some(point);
            self.intersected_side = None;
            self.intersected_extrema.invalidate();
            self.intersection_distance = 0.0;
            if !self.current_kernels.is_empty() {
                self.on_segment(ray)?;
            }
            ray.kill();
            self.should_continue = false;
            self.on_complete_trace(ray);
            return Ok(TraceOutcome::Completed);
        }

        let Some(direction) = ray.direction() else {
            return Err(ray.contract("tracing a ray with no direction"));
        };
        if self.study.cfg().verify_rays {
            if let Some(inc) = self.incoming_side {
                if !self.study.side_is_non_planar(elem, inc)
                    && !self.study.side_is_incoming(elem, inc, &direction, self.tid)
                {
                    return self.fail_hard(ray, "the ray's incoming side is not incoming");
                }
            }
        }

        loop {
            // Carry the previous extrema; reset per-step outputs
            self.last_intersected_extrema = self.intersected_extrema;
            self.exits_elem_flag = false;
            self.intersection_point = None;
            self.intersected_side = None;
            self.intersected_extrema.invalidate();
            self.intersection_distance = INVALID_DISTANCE;

            let direction = match ray.direction() {
                Some(d) => d,
                None => return self.fail_hard(ray, "the ray lost its direction mid-trace"),
            };

            // If the previous step did not end at a vertex/edge, the
            // plain exit search applies. A handoff at an extrema leaves
            // the extrema intact so the receiver goes straight to the
            // neighbor move.
            if !self.last_intersected_extrema.at_extrema() {
                if let Some(hit) = self.exits_elem(self.current_elem, self.incoming_side, &direction)
                {
                    self.store_exit_result(&hit.extrema);
                    self.exits_elem_flag = true;
                    self.intersection_point = Some(hit.point);
                    self.intersected_side = Some(hit.side);
                    self.intersected_extrema = hit.extrema;
                    self.intersection_distance = hit.distance;
                    ray.set_current_point(hit.point);
                }
            }

            if !self.exits_elem_flag {
                // The exit is unreachable through the faces: move through
                // the neighbors at the extrema, or find one at the
                // incoming point
                let (neighbors, move_last) = if self.last_intersected_extrema.at_extrema() {
                    let seed = self.last_elem.unwrap_or(self.current_elem);
                    let extrema = self.last_intersected_extrema;
                    let point = self.incoming_point;
                    (self.get_neighbors(seed, &extrema, &point), Some(seed))
                } else {
                    let elem = self.current_elem;
                    let point = self.incoming_point;
                    let at_v = match self.incoming_side {
                        Some(s) => at_vertex_on_side(self.mesh, elem, &point, s),
                        None => self.mesh.at_vertex(elem, &point),
                    };
                    let mut neighbors = if let Some(v) = at_v {
                        self.get_vertex_neighbors(elem, v)
                    } else if self.dim == 3 {
                        let extrema = match self.incoming_side {
                            Some(s) => within_edge_on_side(self.mesh, elem, &point, s),
                            None => within_edge(self.mesh, elem, &point, TRACE_TOL),
                        };
                        if extrema.at_edge() {
                            let (v1, v2) = extrema.edge_vertices();
                            self.get_edge_neighbors(elem, v1, v2, &point)
                        } else {
                            Vec::new()
                        }
                    } else {
                        Vec::new()
                    };
                    if neighbors.is_empty() {
                        neighbors = self.get_point_neighbors(elem, &point);
                    }
                    if neighbors.is_empty() {
                        return self.fail_trace(ray, "could not find neighbors to move through");
                    }
                    (neighbors, Some(elem))
                };

                let Some((best_elem, best_side)) =
                    self.move_through_neighbors(&neighbors, move_last, &direction)
                else {
                    return self.fail_trace(
                        ray,
                        "could not find an intersection after trying to move through neighbors",
                    );
                };

                self.exits_elem_flag = true;
                self.last_elem = Some(self.current_elem);
                self.current_elem = best_elem;
                self.incoming_side = Some(best_side);
                ray.set_current_elem(Some(best_elem));
                ray.set_current_incoming_side(Some(best_side));
                ray.set_current_point(
                    self.intersection_point.unwrap_or(self.incoming_point),
                );

                if self.mesh.elem(best_elem).processor_id != self.rank {
                    // The next intersection was computed on an element
                    // owned by another rank; the receiver re-traces from
                    // the entry state
                    ray.set_current_point(self.incoming_point);
                    self.intersection_distance = INVALID_DISTANCE;
                    return self.continue_trace_off_processor(ray);
                }

                if self.mesh.elem(best_elem).subdomain != self.current_subdomain {
                    self.on_subdomain_changed(ray, true);
                }

                let extrema = self.intersected_extrema;
                self.store_exit_result(&extrema);
            }

            ray.add_intersection();
            self.results[TraceResult::Intersections as usize] += 1;
            ray.add_distance(self.intersection_distance);

            // The effective cap: the smaller of the per-ray and the
            // study-wide max distance
            let max_distance = ray.max_distance().min(self.study.cfg().ray_max_distance);
            if (ray.distance() - max_distance).abs() < TRACE_TOL {
                // Close enough to keep the intersection state
                ray.kill();
                self.should_continue = false;
            } else if ray.distance() > max_distance {
                // Moved past the cap: pull the endpoint back inside the
                // element and drop the (now interior) intersection state
                let difference = ray.distance() - max_distance;
                ray.add_distance(-difference);
                let point = self.intersection_point.unwrap_or(self.incoming_point)
                    - direction * difference;
                self.intersection_point = Some(point);
                self.intersection_distance -= difference;
                self.intersected_side = None;
                self.intersected_extrema.invalidate();
                ray.set_current_point(point);
                ray.kill();
                self.should_continue = false;
            }

            if !self.current_kernels.is_empty() {
                self.on_segment(ray)?;

                if !self.should_continue {
                    if ray.trajectory_changed() {
                        return self.fail_hard(
                            ray,
                            "segment kernels may not change the trajectory of a ray at its end",
                        );
                    }
                    self.on_complete_trace(ray);
                    return Ok(TraceOutcome::Completed);
                }

                if ray.trajectory_changed() {
                    // A kernel redirected the ray from within the
                    // element: restart the step without moving cells
                    let new_point = match ray.current_point() {
                        Some(p) => p,
                        None => return self.fail_hard(ray, "redirect lost the current point"),
                    };
                    let traveled = (new_point - self.incoming_point).norm();
                    ray.add_distance(-self.intersection_distance + traveled);
                    self.intersection_distance = traveled;
                    self.incoming_point = new_point;
                    self.incoming_side = None;
                    self.intersected_extrema.invalidate();
                    ray.set_current_incoming_side(None);
                    self.on_trajectory_changed(ray)?;
                    self.on_continue_trace(ray);
                    continue;
                }
            } else if !self.should_continue {
                self.on_complete_trace(ray);
                return Ok(TraceOutcome::Completed);
            }

            // At a vertex/edge whose intersected side is interior, the
            // point may still lie on the domain boundary without being
            // on a boundary side. Rectangular domains skip this unless
            // the point is on the bounding box.
            if self.dim > 1 && self.intersected_extrema.at_extrema() {
                if let Some(side) = self.intersected_side {
                    let has_neighbor = self.mesh.elem(self.current_elem).neighbors
                        [side as usize]
                        .is_some();
                    let point = self.intersection_point.unwrap_or(self.incoming_point);
                    if has_neighbor
                        && (!self.is_rectangular_domain
                            || on_bounding_box_boundary(
                                self.study.bounding_box(),
                                &point,
                                self.dim,
                                LOOSE_TRACE_TOL * self.study.domain_max_length(),
                            ))
                    {
                        if let Some((b_elem, b_side, b_extrema)) =
                            self.find_external_boundary_side(&direction)
                        {
                            // The new incoming side would require
                            // re-tracing backwards; it is not needed to
                            // continue, which is why boundary hooks do
                            // not see an incoming side
                            self.last_elem = Some(self.current_elem);
                            self.current_elem = b_elem;
                            self.intersected_side = Some(b_side);
                            self.intersected_extrema = b_extrema;
                            ray.set_current_elem(Some(b_elem));
                        }
                    }
                }
            }

            let Some(intersected_side) = self.intersected_side else {
                return self.fail_hard(ray, "continuing without an intersected side");
            };
            let intersection_point = self.intersection_point.unwrap_or(self.incoming_point);
            self.incoming_point = intersection_point;

            // The next element through the intersected side, descending
            // refined neighbors to the active child containing the point
            let neighbor = if self.study.has_same_level_active_elems() {
                self.mesh.elem(self.current_elem).neighbors[intersected_side as usize]
            } else {
                self.mesh
                    .active_neighbor(self.current_elem, intersected_side, &intersection_point)
            };

            if let Some(neighbor) = neighbor {
                let Some(inc) = self.mesh.which_neighbor_am_i(neighbor, self.current_elem)
                else {
                    return self.fail_hard(ray, "neighbor does not know this element");
                };

                self.last_elem = Some(self.current_elem);
                self.current_elem = neighbor;
                self.incoming_side = Some(inc);
                ray.set_current_elem(Some(neighbor));
                ray.set_current_incoming_side(Some(inc));

                let subdomain_changed =
                    self.mesh.elem(neighbor).subdomain != self.current_subdomain;

                // Internal boundary hooks fire only when the subdomain
                // changes or at an extrema, because internal sidesets
                // must separate different subdomains
                if self.study.has_internal_sidesets()
                    && (subdomain_changed || self.intersected_extrema.at_extrema())
                {
                    self.apply_on_internal_boundary(ray)?;

                    if !self.should_continue {
                        self.on_complete_trace(ray);
                        return Ok(TraceOutcome::Completed);
                    }

                    if ray.trajectory_changed() {
                        let new_direction = match ray.direction() {
                            Some(d) => d,
                            None => return self.fail_hard(ray, "redirect lost the direction"),
                        };
                        // If the crossed side is no longer incoming, the
                        // ray turned around: step back into the element
                        // we came from
                        let normal =
                            self.study
                                .get_side_normal(self.current_elem, inc, self.tid);
                        if normal.dot(&new_direction) > -TRACE_TOL {
                            let back = self.last_elem.unwrap_or(self.current_elem);
                            let back_side =
                                self.mesh.which_neighbor_am_i(back, self.current_elem);
                            self.current_elem = back;
                            self.incoming_side = back_side;
                            ray.set_current_elem(Some(back));
                            ray.set_current_incoming_side(back_side);
                        }
                        self.on_trajectory_changed(ray)?;
                    }
                }

                // Off-rank: at an extrema the neighbor move picks the
                // entry element, so keep going one more step
                if self.mesh.elem(self.current_elem).processor_id != self.rank
                    && !self.intersected_extrema.at_extrema()
                {
                    return self.continue_trace_off_processor(ray);
                }

                if self.mesh.elem(self.current_elem).subdomain != self.current_subdomain {
                    self.on_subdomain_changed(ray, true);
                }
            } else {
                // No neighbor: external boundary
                self.apply_on_external_boundary(ray)?;

                if !self.should_continue {
                    self.on_complete_trace(ray);
                    return Ok(TraceOutcome::Completed);
                }

                // The external contract guarantees a redirect happened
                if ray.trajectory_changed() {
                    let new_direction = match ray.direction() {
                        Some(d) => d,
                        None => return self.fail_hard(ray, "redirect lost the direction"),
                    };
                    if let Some(side) = self.intersected_side {
                        let normal =
                            self.study
                                .get_side_normal(self.current_elem, side, self.tid);
                        if normal.dot(&new_direction) >= TRACE_TOL {
                            return self.fail_hard(ray, "the reflected ray is not incoming");
                        }
                    }
                    self.last_elem = Some(self.current_elem);
                    self.incoming_side = self.intersected_side;
                    ray.set_current_point(self.incoming_point);
                    ray.set_current_incoming_side(self.incoming_side);
                    self.on_trajectory_changed(ray)?;
                }
            }

            self.on_continue_trace(ray);
        }
    }

    /// Invokes the active segment kernels on the segment
    /// `incoming_point -> intersection_point`.
    fn on_segment(&mut self, ray: &mut Ray) -> Result<()> {
        let start = self.incoming_point;
        let end = self.intersection_point.unwrap_or(start);
        let length = if self.intersection_distance == INVALID_DISTANCE {
            0.0
        } else {
            self.intersection_distance
        };

        if self.study.cfg().verify_trace_intersections
            && ((end - start).norm() - length).abs() > LOOSE_TRACE_TOL * self.current_subdomain_hmax
        {
            return self.fail_hard(ray, "the segment length does not match its endpoints");
        }

        self.segment_quadrature
            .reinit(self.study.segment_rule(), &start, &end, length);

        for i in 0..self.current_kernels.len() {
            let kernel = self.current_kernels[i].clone();
            {
                let mut ctx = SegmentCtx {
                    ray: &mut *ray,
                    mesh: self.mesh,
                    elem: self.current_elem,
                    subdomain: self.current_subdomain,
                    incoming_side: self.incoming_side,
                    segment_start: start,
                    segment_end: end,
                    segment_length: length,
                    quadrature: &self.segment_quadrature,
                    acquire: AcquireCtx {
                        next_id: self.study.unique_id_slot(self.tid),
                        stride: self.study.id_stride(),
                        data_size: self.study.ray_data_size(),
                        aux_data_size: self.study.ray_aux_data_size(),
                        study_tag: self.study.tag(),
                    },
                    spawned: &mut self.spawned,
                };
                kernel.on_segment(&mut ctx)?;
            }
            self.post_hook(ray, kernel.name())?;
        }
        Ok(())
    }

    /// Refreshes the cached subdomain state and the active kernel set;
    /// runs `pre_trace` on kernels that have not seen this ray yet.
    fn on_subdomain_changed(&mut self, ray: &Ray, same_ray: bool) {
        self.current_subdomain = self.mesh.elem(self.current_elem).subdomain;
        self.current_subdomain_hmax = self.study.subdomain_hmax(self.current_subdomain);

        if self.has_ray_kernels {
            if same_ray {
                for k in &self.current_kernels {
                    self.old_kernels.insert(kernel_addr(k));
                }
            } else {
                self.old_kernels.clear();
            }

            let ray_filter = self.study.cfg().use_ray_registration.then(|| ray.id());
            self.current_kernels = self.study.get_ray_kernels(self.current_subdomain, ray_filter);

            for k in &self.current_kernels {
                if !self.old_kernels.contains(&kernel_addr(k)) {
                    k.pre_trace();
                }
            }
        }
    }

    /// Verifies the continue/trajectory configuration after every hook.
    pub(crate) fn post_hook(&mut self, ray: &Ray, hook_name: &str) -> Result<()> {
        if !ray.should_continue() {
            self.should_continue = false;
        } else if !self.should_continue {
            return Err(RayTracingError::contract(
                format!(
                    "{hook_name} set a ray to continue that was previously set to not continue"
                ),
                ray.get_info(),
            ));
        }

        if !self.should_continue && ray.trajectory_changed() {
            return Err(RayTracingError::contract(
                format!(
                    "{hook_name} changed the trajectory of a ray that was set to not continue, \
                     or set a ray whose trajectory was changed to not continue"
                ),
                ray.get_info(),
            ));
        }
        Ok(())
    }

    /// Clears the transient flag, counts the change, and verifies the
    /// new state still sits in the current element.
    fn on_trajectory_changed(&mut self, ray: &mut Ray) -> Result<()> {
        if self.study.cfg().verify_trace_intersections {
            let point = ray.current_point().unwrap_or(self.incoming_point);
            let contained = if self.intersected_extrema.at_extrema() {
                self.mesh
                    .close_to_point(self.current_elem, &point, LOOSE_TRACE_TOL)
            } else {
                self.mesh.contains_point(self.current_elem, &point)
            };
            if !contained {
                return self
                    .fail_hard(ray, "the element does not contain the point after a trajectory change");
            }
        }

        ray.set_trajectory_changed(false);
        ray.add_trajectory_change();

        if self.current_trace.is_some() && !self.study.cfg().segments_on_cache_traces {
            if self.intersection_distance > 0.0 && self.intersection_distance != INVALID_DISTANCE {
                let point = ray.current_point().unwrap_or(self.incoming_point);
                self.cache_point(ray, point);
            }
        }
        Ok(())
    }

    fn on_continue_trace(&mut self, ray: &Ray) {
        if self.current_trace.is_some()
            && self.study.cfg().segments_on_cache_traces
            && self.intersection_distance > 0.0
            && self.intersection_distance != INVALID_DISTANCE
        {
            let point = ray.current_point().unwrap_or(self.incoming_point);
            self.cache_point(ray, point);
        }
    }

    fn on_complete_trace(&mut self, ray: &Ray) {
        if let Some(mut td) = self.current_trace.take() {
            if self.intersection_distance > 0.0 && self.intersection_distance != INVALID_DISTANCE {
                let point = ray.current_point().unwrap_or(self.incoming_point);
                let tp = td.add_point(point);
                if self.study.cfg().data_on_cache_traces {
                    tp.data = ray.data().to_vec();
                }
                if self.study.cfg().aux_data_on_cache_traces {
                    tp.aux_data = ray.aux_data().to_vec();
                }
            }
            td.finalize(ray);
            self.cached_traces.push(td);
        }
    }

    fn continue_trace_off_processor(&mut self, ray: &mut Ray) -> Result<TraceOutcome> {
        debug_assert_eq!(ray.current_elem(), Some(self.current_elem));
        let dest = self.mesh.elem(self.current_elem).processor_id;
        debug_assert_ne!(dest, self.rank);
        debug!(ray = ray.id().0, dest, "ray going off processor");

        ray.add_processor_crossing();

        if let Some(mut td) = self.current_trace.take() {
            if self.intersection_distance > 0.0 && self.intersection_distance != INVALID_DISTANCE {
                let tp = td.add_point(self.incoming_point);
                if self.study.cfg().data_on_cache_traces {
                    tp.data = ray.data().to_vec();
                }
                if self.study.cfg().aux_data_on_cache_traces {
                    tp.aux_data = ray.aux_data().to_vec();
                }
            }
            td.finalize(ray);
            self.cached_traces.push(td);
        }

        Ok(TraceOutcome::OffRank(dest))
    }

    fn cache_point(&mut self, ray: &Ray, point: Point) {
        if let Some(td) = &mut self.current_trace {
            let tp = td.add_point(point);
            if self.study.cfg().data_on_cache_traces {
                tp.data = ray.data().to_vec();
            }
            if self.study.cfg().aux_data_on_cache_traces {
                tp.aux_data = ray.aux_data().to_vec();
            }
        }
    }

    fn store_exit_result(&mut self, extrema: &ElemExtrema) {
        let index = match extrema {
            ElemExtrema::None => TraceResult::FaceHits,
            ElemExtrema::Vertex(_) => TraceResult::VertexHits,
            ElemExtrema::Edge(_, _) => TraceResult::EdgeHits,
        };
        self.results[index as usize] += 1;
    }

    /// A geometric failure: warn and kill in tolerant mode, fail the
    /// run otherwise.
    fn fail_trace(&mut self, ray: &mut Ray, reason: &str) -> Result<TraceOutcome> {
        if self.study.cfg().tolerate_failure {
            self.results[TraceResult::FailedTraces as usize] += 1;
            warn!(ray = ray.id().0, reason, "tolerated a failed trace");
            ray.kill();
            self.should_continue = false;
            self.on_complete_trace(ray);
            return Ok(TraceOutcome::Completed);
        }
        Err(RayTracingError::TraceFailed {
            reason: reason.to_string(),
            state: self.fail_message(ray),
        })
    }

    /// A verification failure; never tolerated.
    fn fail_hard<T>(&self, ray: &Ray, reason: &str) -> Result<T> {
        Err(RayTracingError::TraceFailed {
            reason: reason.to_string(),
            state: self.fail_message(ray),
        })
    }

    fn fail_message(&self, ray: &Ray) -> String {
        let fmt_opt = |v: Option<u16>| v.map_or("invalid".to_string(), |s| s.to_string());
        format!(
            "Ray on rank {} and thread {} failed to trace\n\n{}\n\
             Current trace information\n\
             \x20 current_subdomain = {}\n\
             \x20 current_elem = {}\n\
             \x20 incoming_point = {:?}\n\
             \x20 incoming_side = {}\n\
             \x20 intersection_point = {:?}\n\
             \x20 intersected_side = {}\n\
             \x20 intersected_extrema = {}\n\
             \x20 exits_elem = {}\n",
            self.rank,
            self.tid,
            ray.get_info(),
            self.current_subdomain,
            self.current_elem.0,
            self.incoming_point,
            fmt_opt(self.incoming_side),
            self.intersection_point,
            fmt_opt(self.intersected_side),
            self.intersected_extrema,
            self.exits_elem_flag,
        )
    }

    /// Subdomain hmax through the cached value when possible.
    pub(crate) fn subdomain_hmax_of(&self, elem: ElemId) -> f64 {
        let subdomain = self.mesh.elem(elem).subdomain;
        if subdomain == self.current_subdomain {
            self.current_subdomain_hmax
        } else {
            self.study.subdomain_hmax(subdomain)
        }
    }
}

fn kernel_addr(k: &Arc<dyn RayKernel>) -> usize {
    Arc::as_ptr(k) as *const () as usize
}
