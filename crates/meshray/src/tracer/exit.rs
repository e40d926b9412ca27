//! Exit-face search and extrema neighbor traversal.

use tracing::trace;

use crate::extrema::ElemExtrema;
use crate::geom::{
    intersect_quad, intersect_triangle, line_line_intersect_2d, Point, SegmentVertex,
    LOOSE_TRACE_TOL, TRACE_TOL,
};
use crate::mesh::ElemId;
use crate::neighbors::{
    find_edge_neighbors, find_node_neighbors, find_point_neighbors, NeighborInfo,
};

use super::{ExitHit, Tracer, TraceResult};

impl Tracer<'_> {
    /// Searches for the exit of `elem` along the ray from the incoming
    /// point. Skips the incoming side (unless non-planar, which is
    /// retried after everything else fails) and tracks the hit with the
    /// largest distance: near a shared vertex or edge of a non-planar
    /// element the face routine may report the nearer triangle rather
    /// than the true exit face.
    pub(crate) fn exits_elem(
        &mut self,
        elem: ElemId,
        incoming_side: Option<u16>,
        direction: &Point,
    ) -> Option<ExitHit> {
        if self.mesh.elem(elem).etype.dim() == 1 {
            return self.exits_elem_1d(elem, incoming_side, direction);
        }
        self.exits_elem_face_cell(elem, incoming_side, direction)
    }

    fn exits_elem_face_cell(
        &mut self,
        elem: ElemId,
        incoming_side: Option<u16>,
        direction: &Point,
    ) -> Option<ExitHit> {
        self.results[TraceResult::IntersectionCalls as usize] += 1;

        let hmax = self.subdomain_hmax_of(elem);
        let n_sides = self.mesh.elem(elem).n_sides();

        let mut best: Option<ExitHit> = None;
        // The minimum acceptable distance scales with the element size
        let mut best_distance = TRACE_TOL * hmax;
        let mut use_culling = self.backface_culling;
        let mut try_nonplanar_incoming = false;

        loop {
            let sides: smallvec::SmallVec<[u16; 6]> = if try_nonplanar_incoming {
                incoming_side.into_iter().collect()
            } else {
                (0..n_sides).collect()
            };

            for s in sides {
                if !try_nonplanar_incoming {
                    // The incoming side cannot also be the outgoing side
                    // unless it is non-planar, which is handled last
                    if Some(s) == incoming_side {
                        continue;
                    }

                    if self.backface_culling {
                        let dot = self.study.get_side_normal(elem, s, self.tid).dot(direction);
                        if use_culling {
                            // Side is non-entrant per the culling: skip
                            if dot < -LOOSE_TRACE_TOL {
                                self.results[TraceResult::BackfaceCullingSuccesses as usize] += 1;
                                continue;
                            }
                        } else {
                            // Second pass: only the previously culled
                            // sides remain to be checked
                            if dot >= -LOOSE_TRACE_TOL {
                                continue;
                            }
                            self.results[TraceResult::BackfaceCullingFailures as usize] += 1;
                        }
                    }
                }

                if let Some((point, distance, extrema)) =
                    self.side_intersect(elem, s, direction, hmax)
                {
                    trace!(side = s, distance, "side intersection");
                    if distance > best_distance {
                        best_distance = distance;
                        best = Some(ExitHit {
                            point,
                            side: s,
                            extrema,
                            distance,
                        });
                    }
                }
            }

            if best.is_some() {
                return best;
            }
            if try_nonplanar_incoming {
                return None;
            }
            // No hit while culling: retry the culled sides
            if use_culling {
                use_culling = false;
                continue;
            }
            // All sides failed; a non-planar incoming side may also be
            // the exit
            if let Some(inc) = incoming_side {
                if self.study.side_is_non_planar(elem, inc) {
                    try_nonplanar_incoming = true;
                    continue;
                }
            }
            return None;
        }
    }

    /// 1D: with an incoming side there is only one other choice;
    /// otherwise pick the vertex between the incoming point and an
    /// extended end point.
    fn exits_elem_1d(
        &mut self,
        elem: ElemId,
        incoming_side: Option<u16>,
        direction: &Point,
    ) -> Option<ExitHit> {
        self.results[TraceResult::IntersectionCalls as usize] += 1;

        let tol = self.subdomain_hmax_of(elem) * TRACE_TOL;

        if let Some(inc) = incoming_side {
            let side = if inc == 1 { 0 } else { 1 };
            let point = self.mesh.elem_point(elem, side);
            return Some(ExitHit {
                point,
                side,
                extrema: ElemExtrema::Vertex(side),
                distance: (self.incoming_point - point).norm(),
            });
        }

        let extended_end = self.incoming_point + self.study.domain_max_length() * direction;
        for side in 0..2u16 {
            let side_point = self.mesh.elem_point(elem, side);
            let incoming_to_side = (side_point - self.incoming_point).norm();
            if incoming_to_side < tol {
                continue;
            }
            let incoming_to_end = (extended_end - self.incoming_point).norm();
            let side_to_end = (extended_end - side_point).norm();
            if (incoming_to_side + side_to_end - incoming_to_end).abs() < tol {
                return Some(ExitHit {
                    point: side_point,
                    side,
                    extrema: ElemExtrema::Vertex(side),
                    distance: incoming_to_side,
                });
            }
        }
        None
    }

    /// Intersects the ray with one side. Side vertices are passed in
    /// reverse winding so the one-sided triangle test accepts exiting
    /// rays.
    fn side_intersect(
        &self,
        elem: ElemId,
        side: u16,
        direction: &Point,
        hmax: f64,
    ) -> Option<(Point, f64, ElemExtrema)> {
        let nodes = self.mesh.elem(elem).etype.side_nodes(side);
        match self.dim {
            2 => {
                let v0 = self.mesh.elem_point(elem, nodes[0]);
                let v1 = self.mesh.elem_point(elem, nodes[1]);
                let (point, distance, vertex) = line_line_intersect_2d(
                    &self.incoming_point,
                    direction,
                    self.study.domain_max_length(),
                    &v0,
                    &v1,
                )?;
                let extrema = match vertex {
                    SegmentVertex::None => ElemExtrema::None,
                    SegmentVertex::V0 => ElemExtrema::Vertex(nodes[0]),
                    SegmentVertex::V1 => ElemExtrema::Vertex(nodes[1]),
                };
                Some((point, distance, extrema))
            }
            _ => {
                let p = |i: usize| self.mesh.elem_point(elem, nodes[i]);
                let hit = if nodes.len() == 3 {
                    intersect_triangle(
                        &self.incoming_point,
                        direction,
                        &p(2),
                        &p(1),
                        &p(0),
                        nodes[2],
                        nodes[1],
                        nodes[0],
                        hmax,
                    )
                } else {
                    intersect_quad(
                        &self.incoming_point,
                        direction,
                        &p(3),
                        &p(2),
                        &p(1),
                        &p(0),
                        nodes[3],
                        nodes[2],
                        nodes[1],
                        nodes[0],
                        hmax,
                    )
                };
                hit.map(|(distance, extrema)| {
                    (self.incoming_point + distance * direction, distance, extrema)
                })
            }
        }
    }

    /// Tries each neighbor sharing the extrema, entering through a side
    /// whose outward normal opposes the ray, and keeps the candidate
    /// whose continuing segment is longest. `last_elem` is tried only if
    /// everyone else fails (reflecting corners return there).
    pub(crate) fn move_through_neighbors(
        &mut self,
        neighbors: &[NeighborInfo],
        last_elem: Option<ElemId>,
        direction: &Point,
    ) -> Option<(ElemId, u16)> {
        self.results[TraceResult::MovedThroughNeighbors as usize] += 1;

        // Desperate enough to take nearly anything
        let mut longest = 1.0e-12;
        let mut best: Option<(ElemId, u16, ExitHit)> = None;
        let mut last_info: Option<&NeighborInfo> = None;

        for info in neighbors {
            if Some(info.elem) == last_elem {
                last_info = Some(info);
                continue;
            }
            if let Some((incoming, hit)) = self.move_through_neighbor(info, direction) {
                if hit.distance > longest {
                    longest = hit.distance;
                    best = Some((info.elem, incoming, hit));
                }
            }
        }

        if best.is_none() {
            if let Some(info) = last_info {
                if let Some((incoming, hit)) = self.move_through_neighbor(info, direction) {
                    if hit.distance > longest {
                        best = Some((info.elem, incoming, hit));
                    }
                }
            }
        }

        let (elem, incoming, hit) = best?;
        self.intersection_point = Some(hit.point);
        self.intersected_side = Some(hit.side);
        self.intersected_extrema = hit.extrema;
        self.intersection_distance = hit.distance;
        Some((elem, incoming))
    }

    fn move_through_neighbor(
        &mut self,
        info: &NeighborInfo,
        direction: &Point,
    ) -> Option<(u16, ExitHit)> {
        if !info.valid {
            return None;
        }

        // Find an entrant side among the sides containing the feature
        let mut incoming = None;
        for (side, normal) in info.sides.iter().zip(&info.side_normals) {
            if normal.dot(direction) < LOOSE_TRACE_TOL {
                incoming = Some(*side);
                break;
            }
        }
        let incoming = incoming?;

        let hit = self.exits_elem(info.elem, Some(incoming), direction)?;
        Some((incoming, hit))
    }

    // Neighbor lookups, cached across the whole propagation

    pub(crate) fn get_neighbors(
        &mut self,
        elem: ElemId,
        extrema: &ElemExtrema,
        point: &Point,
    ) -> Vec<NeighborInfo> {
        match extrema {
            ElemExtrema::None => self.get_point_neighbors(elem, point),
            ElemExtrema::Vertex(v) => self.get_vertex_neighbors(elem, *v),
            ElemExtrema::Edge(v1, v2) => self.get_edge_neighbors(elem, *v1, *v2, point),
        }
    }

    pub(crate) fn get_vertex_neighbors(&mut self, elem: ElemId, vertex: u16) -> Vec<NeighborInfo> {
        self.results[TraceResult::VertexNeighborLookups as usize] += 1;

        let node = self.mesh.elem(elem).nodes[vertex as usize];
        if let Some(entry) = self.vertex_neighbors.get(&node) {
            return entry.clone();
        }

        self.results[TraceResult::VertexNeighborBuilds as usize] += 1;
        let mut entry = Vec::new();
        find_node_neighbors(self.mesh, elem, node, &mut self.scratch, &mut entry);
        self.fill_side_normals(&mut entry);
        self.vertex_neighbors.insert(node, entry.clone());
        entry
    }

    pub(crate) fn get_edge_neighbors(
        &mut self,
        elem: ElemId,
        v1: u16,
        v2: u16,
        point: &Point,
    ) -> Vec<NeighborInfo> {
        self.results[TraceResult::EdgeNeighborLookups as usize] += 1;

        let n1 = self.mesh.elem(elem).nodes[v1 as usize];
        let n2 = self.mesh.elem(elem).nodes[v2 as usize];
        let key = if n1 < n2 { (n1, n2) } else { (n2, n1) };

        if !self.edge_neighbors.contains_key(&key) {
            self.results[TraceResult::EdgeNeighborBuilds as usize] += 1;
            let mut entry = Vec::new();
            find_edge_neighbors(self.mesh, elem, key.0, key.1, &mut self.scratch, &mut entry);
            self.fill_side_normals(&mut entry);
            // When all neighbors cover the exact same edge, the validity
            // refresh per query point can be skipped entirely
            let all_same_edge = entry
                .iter()
                .all(|info| info.lower_bound == 0.0 && info.upper_bound == 1.0);
            self.edge_neighbors.insert(key, (all_same_edge, entry));
        }

        let (all_same_edge, entry) = self
            .edge_neighbors
            .get_mut(&key)
            .expect("just inserted");

        if !*all_same_edge {
            // Validate against the queried point: a partial cover only
            // applies where its interval contains the point
            let p1 = self.mesh.node(key.0);
            let p2 = self.mesh.node(key.1);
            let edge_length = (p1 - p2).norm();
            let location = (p1 - point).norm() / edge_length;
            for info in entry.iter_mut() {
                info.valid = (info.lower_bound - TRACE_TOL) < location
                    && location < (info.upper_bound + TRACE_TOL);
            }
        }

        entry.clone()
    }

    pub(crate) fn get_point_neighbors(&mut self, elem: ElemId, point: &Point) -> Vec<NeighborInfo> {
        self.results[TraceResult::PointNeighborBuilds as usize] += 1;
        let mut entry = Vec::new();
        find_point_neighbors(self.mesh, elem, point, &mut self.scratch, &mut entry);
        self.fill_side_normals(&mut entry);
        entry
    }

    fn fill_side_normals(&self, info: &mut [NeighborInfo]) {
        for entry in info {
            for (i, side) in entry.sides.iter().enumerate() {
                entry.side_normals[i] = self.study.get_side_normal(entry.elem, *side, self.tid);
            }
        }
    }
}
