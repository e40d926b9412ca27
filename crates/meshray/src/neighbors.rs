//! Point/vertex/edge neighbor enumeration.
//!
//! All three queries share a breadth-first walk over side-neighbor links
//! from a seed element, keyed by a stack-allocated visited set sized to
//! the worst-case point-neighbor fan-out. Inactive (refined) neighbors
//! contribute their active descendants adjacent to the frontier element.

use smallvec::{smallvec, SmallVec};

use crate::geom::{is_within_segment, within_segment, Point, LOOSE_TRACE_TOL};
use crate::mesh::{ElemId, Mesh, NodeId};

/// Worst-case fan-out of elements sharing a single point.
pub const MAX_POINT_NEIGHBORS: usize = 48;

/// Fixed-capacity set; insertion past capacity panics. Lookup is a linear
/// scan, which beats hashing at these sizes.
#[derive(Clone, Debug)]
pub struct StaticSet<T: Copy + PartialEq + Default, const N: usize> {
    data: [T; N],
    size: usize,
}

impl<T: Copy + PartialEq + Default, const N: usize> Default for StaticSet<T, N> {
    fn default() -> Self {
        Self {
            data: [T::default(); N],
            size: 0,
        }
    }
}

impl<T: Copy + PartialEq + Default, const N: usize> StaticSet<T, N> {
    #[inline]
    pub fn clear(&mut self) {
        self.size = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn contains(&self, value: &T) -> bool {
        self.data[..self.size].contains(value)
    }

    /// Inserts if absent. Panics when full; callers size `N` to the
    /// worst-case fan-out.
    pub fn insert(&mut self, value: T) {
        if self.contains(&value) {
            return;
        }
        assert!(self.size < N, "static set capacity {N} exceeded");
        self.data[self.size] = value;
        self.size += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data[..self.size].iter()
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }
}

/// Information about a single neighbor sharing a queried feature.
#[derive(Clone, Debug)]
pub struct NeighborInfo {
    pub elem: ElemId,
    /// Local sides of `elem` containing the feature.
    pub sides: SmallVec<[u16; 4]>,
    /// Outward normals of `sides`, filled by the tracer.
    pub side_normals: SmallVec<[Point; 4]>,
    /// Normalized parameter interval along a queried edge that this
    /// neighbor covers; `[-1, -1]` for point/vertex queries.
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Per-point filter for partial covers under refinement.
    pub valid: bool,
}

impl NeighborInfo {
    pub fn at_point(elem: ElemId, sides: SmallVec<[u16; 4]>) -> Self {
        Self::on_edge(elem, sides, -1.0, -1.0)
    }

    pub fn on_edge(elem: ElemId, sides: SmallVec<[u16; 4]>, lower: f64, upper: f64) -> Self {
        Self {
            elem,
            side_normals: smallvec![Point::zeros(); sides.len()],
            sides,
            lower_bound: lower,
            upper_bound: upper,
            valid: true,
        }
    }
}

/// Reusable BFS storage; one per tracer thread.
#[derive(Default)]
pub struct NeighborScratch {
    visited: StaticSet<ElemId, MAX_POINT_NEIGHBORS>,
    untested: StaticSet<ElemId, MAX_POINT_NEIGHBORS>,
    next_untested: StaticSet<ElemId, MAX_POINT_NEIGHBORS>,
    active_children: Vec<ElemId>,
}

/// Breadth-first expansion from `seed`; `keep` decides inclusion and
/// records matches.
fn find_neighbors(
    mesh: &Mesh,
    seed: ElemId,
    scratch: &mut NeighborScratch,
    mut keep: impl FnMut(&Mesh, ElemId) -> bool,
) {
    debug_assert!(mesh.elem(seed).active(), "inactive seed");

    scratch.visited.clear();
    scratch.untested.clear();
    scratch.next_untested.clear();

    scratch.visited.insert(seed);
    scratch.untested.insert(seed);

    while !scratch.untested.is_empty() {
        let frontier: SmallVec<[ElemId; 8]> = scratch.untested.iter().copied().collect();
        for elem in frontier {
            for side in 0..mesh.elem(elem).n_sides() {
                let Some(neighbor) = mesh.elem(elem).neighbors[side as usize] else {
                    continue;
                };
                if mesh.elem(neighbor).active() {
                    if !scratch.visited.contains(&neighbor) && keep(mesh, neighbor) {
                        scratch.next_untested.insert(neighbor);
                        scratch.visited.insert(neighbor);
                    }
                } else {
                    // Refined neighbor: test every adjacent active child
                    let mut children = std::mem::take(&mut scratch.active_children);
                    mesh.active_family_tree_by_neighbor(neighbor, elem, &mut children);
                    for child in &children {
                        if !scratch.visited.contains(child) && keep(mesh, *child) {
                            scratch.next_untested.insert(*child);
                            scratch.visited.insert(*child);
                        }
                    }
                    scratch.active_children = children;
                }
            }
        }
        scratch.untested.swap(&mut scratch.next_untested);
        scratch.next_untested.clear();
    }
}

/// Neighbors containing `point`: a candidate is kept iff it contains the
/// point and at least one of its sides contains the point.
pub fn find_point_neighbors(
    mesh: &Mesh,
    elem: ElemId,
    point: &Point,
    scratch: &mut NeighborScratch,
    info: &mut Vec<NeighborInfo>,
) {
    debug_assert!(mesh.close_to_point(elem, point, LOOSE_TRACE_TOL), "does not contain point");
    info.clear();

    let mut contains_point = |mesh: &Mesh, candidate: ElemId| {
        if mesh.close_to_point(candidate, point, LOOSE_TRACE_TOL) {
            let mut sides: SmallVec<[u16; 4]> = SmallVec::new();
            for s in 0..mesh.elem(candidate).n_sides() {
                if mesh.side_contains_point(candidate, s, point, LOOSE_TRACE_TOL) {
                    sides.push(s);
                }
            }
            if !sides.is_empty() {
                info.push(NeighborInfo::at_point(candidate, sides));
                return true;
            }
        }
        false
    };

    contains_point(mesh, elem);
    find_neighbors(mesh, elem, scratch, contains_point);
}

/// Neighbors sharing the vertex `node`: a candidate is kept iff it has
/// the node as a vertex, or (coarser under refinement) it contains the
/// node's point as a hanging node.
pub fn find_node_neighbors(
    mesh: &Mesh,
    elem: ElemId,
    node: NodeId,
    scratch: &mut NeighborScratch,
    info: &mut Vec<NeighborInfo>,
) {
    debug_assert!(mesh.elem(elem).get_node_index(node).is_some(), "does not contain node");
    info.clear();

    let point = mesh.node(node);
    let seed_level = mesh.elem(elem).level;

    let mut contains_node = |mesh: &Mesh, candidate: ElemId| {
        let cand = mesh.elem(candidate);
        if let Some(n) = cand.get_node_index(node) {
            if cand.is_vertex(n) {
                let mut sides: SmallVec<[u16; 4]> = SmallVec::new();
                for s in 0..cand.n_sides() {
                    if cand.etype.is_node_on_side(n, s) {
                        sides.push(s);
                    }
                }
                debug_assert!(!sides.is_empty(), "no side contains vertex");
                info.push(NeighborInfo::at_point(candidate, sides));
                return true;
            }
        }
        // A coarser candidate may hold the node as a hanging node
        if cand.level < seed_level && mesh.close_to_point(candidate, &point, LOOSE_TRACE_TOL) {
            let mut sides: SmallVec<[u16; 4]> = SmallVec::new();
            for s in 0..cand.n_sides() {
                if mesh.side_contains_point(candidate, s, &point, LOOSE_TRACE_TOL) {
                    sides.push(s);
                }
            }
            if !sides.is_empty() {
                info.push(NeighborInfo::at_point(candidate, sides));
                return true;
            }
        }
        false
    };

    contains_node(mesh, elem);
    find_neighbors(mesh, elem, scratch, contains_node);
}

/// Neighbors covering any part of the edge `node1 -> node2` (3D only).
/// Each record carries the `[lower, upper]` parameter interval of the
/// queried edge that the neighbor covers.
pub fn find_edge_neighbors(
    mesh: &Mesh,
    elem: ElemId,
    node1: NodeId,
    node2: NodeId,
    scratch: &mut NeighborScratch,
    info: &mut Vec<NeighborInfo>,
) {
    debug_assert!(mesh.dim() == 3, "edge neighbors are a 3D query");
    info.clear();

    let edge_length = (mesh.node(node1) - mesh.node(node2)).norm();

    let mut within_edge = |mesh: &Mesh, candidate: ElemId| {
        edge_neighbor_check(mesh, candidate, elem, node1, node2, edge_length, info)
    };

    within_edge(mesh, elem);
    find_neighbors(mesh, elem, scratch, within_edge);
}

/// Classifies `candidate` against the edge `vertex1 -> vertex2` of the
/// seed element and records the covered interval. The five cases:
/// both endpoints are vertices (full cover); one endpoint plus another
/// covering vertex (partial); one endpoint on a coarser candidate whose
/// edge extends past ours (full); coarser candidate with our endpoints
/// interior to its faces/edges; and interior candidate vertices only
/// (one- or two-sided partial cover).
fn edge_neighbor_check(
    mesh: &Mesh,
    candidate: ElemId,
    elem: ElemId,
    vertex1: NodeId,
    vertex2: NodeId,
    edge_length: f64,
    info: &mut Vec<NeighborInfo>,
) -> bool {
    let cand = mesh.elem(candidate);
    let et = cand.etype;
    let p1 = mesh.node(vertex1);
    let p2 = mesh.node(vertex2);

    let v1 = cand.get_node_index(vertex1);
    let v2 = cand.get_node_index(vertex2);

    let edge_sides = |e: u16| -> SmallVec<[u16; 4]> {
        let (a, b) = et.edge_sides(e);
        smallvec![a, b]
    };

    // Both endpoints are vertices of the candidate: full cover
    if let (Some(v1), Some(v2)) = (v1, v2) {
        for e in 0..et.n_edges() {
            if et.is_node_on_edge(v1, e) && et.is_node_on_edge(v2, e) {
                info.push(NeighborInfo::on_edge(candidate, edge_sides(e), 0.0, 1.0));
                return true;
            }
        }
        panic!("failed to find an edge containing both vertices");
    }

    let n_vertices = cand.n_vertices();

    if v1.is_some() || v2.is_some() {
        let has_v1 = v1.is_some();
        let common_v = v1.or(v2).unwrap();

        // Another candidate vertex within the target edge: partial cover
        let mut other_v = None;
        for v in 0..n_vertices {
            if v != common_v
                && is_within_segment(&p1, &p2, edge_length, &mesh.elem_point(candidate, v), LOOSE_TRACE_TOL)
            {
                other_v = Some(v);
                break;
            }
        }

        if let Some(other_v) = other_v {
            for e in 0..et.n_edges() {
                if et.is_node_on_edge(common_v, e) && et.is_node_on_edge(other_v, e) {
                    let bound =
                        (mesh.elem_point(candidate, other_v) - p1).norm() / edge_length;
                    let (lower, upper) = if has_v1 { (0.0, bound) } else { (bound, 1.0) };
                    info.push(NeighborInfo::on_edge(candidate, edge_sides(e), lower, upper));
                    return true;
                }
            }
            panic!("failed to find an edge containing both vertices");
        } else if cand.level < mesh.elem(elem).level {
            // Coarser candidate whose edge extends past ours: walk its
            // edges to find which contains our other endpoint
            let check = if has_v1 { p2 } else { p1 };
            for e in 0..et.n_edges() {
                let [ea, eb] = et.edge_nodes(e);
                if et.is_node_on_edge(common_v, e)
                    && within_segment(
                        &mesh.elem_point(candidate, ea),
                        &mesh.elem_point(candidate, eb),
                        &check,
                        LOOSE_TRACE_TOL,
                    )
                {
                    let other_v = if ea == common_v { eb } else { ea };
                    let bound =
                        (mesh.elem_point(candidate, other_v) - p1).norm() / edge_length;
                    let (lower, upper) = if has_v1 { (0.0, bound) } else { (bound, 1.0) };
                    info.push(NeighborInfo::on_edge(candidate, edge_sides(e), lower, upper));
                    return true;
                }
            }
            return false;
        }
    } else if cand.level < mesh.elem(elem).level {
        // Coarser candidate: our endpoints may be interior to its edges
        let mut v1_edge = None;
        let mut v2_edge = None;
        for e in 0..et.n_edges() {
            let [ea, eb] = et.edge_nodes(e);
            let pa = mesh.elem_point(candidate, ea);
            let pb = mesh.elem_point(candidate, eb);
            if v1_edge.is_none() && within_segment(&pa, &pb, &p1, LOOSE_TRACE_TOL) {
                v1_edge = Some(e);
            }
            if v2_edge.is_none() && within_segment(&pa, &pb, &p2, LOOSE_TRACE_TOL) {
                v2_edge = Some(e);
            }
        }

        match (v1_edge, v2_edge) {
            (Some(e1), Some(e2)) => {
                debug_assert!(e1 == e2, "endpoints should be within the same edge");
                info.push(NeighborInfo::on_edge(candidate, edge_sides(e1), 0.0, 1.0));
                return true;
            }
            (Some(in_edge), None) | (None, Some(in_edge)) => {
                let v1_within = v1_edge.is_some();
                let check_point = if v1_within { p2 } else { p1 };
                let (sa, sb) = et.edge_sides(in_edge);

                let mut sides: SmallVec<[u16; 4]> = SmallVec::new();
                let mut lower = 0.0;
                let mut upper = 1.0;
                if mesh.side_contains_point(candidate, sa, &check_point, LOOSE_TRACE_TOL) {
                    sides.push(sa);
                } else if mesh.side_contains_point(candidate, sb, &check_point, LOOSE_TRACE_TOL) {
                    sides.push(sb);
                } else {
                    // Touches only at the contained endpoint
                    let point_bound = if v1_within { 0.0 } else { 1.0 };
                    lower = point_bound;
                    upper = point_bound;
                    sides.push(sa);
                    sides.push(sb);
                }
                info.push(NeighborInfo::on_edge(candidate, sides, lower, upper));
                return true;
            }
            (None, None) => return false,
        }
    } else {
        // Neither endpoint is a vertex: look for candidate vertices
        // interior to the queried edge
        let mut first = None;
        let mut second = None;
        for v in 0..n_vertices {
            if is_within_segment(&p1, &p2, edge_length, &mesh.elem_point(candidate, v), LOOSE_TRACE_TOL)
            {
                if first.is_none() {
                    first = Some(v);
                } else {
                    second = Some(v);
                    break;
                }
            }
        }

        let Some(va) = first else {
            return false;
        };

        match second {
            None => {
                // Touches the edge at a single vertex
                let mut sides: SmallVec<[u16; 4]> = SmallVec::new();
                for s in 0..et.n_sides() {
                    if et.is_node_on_side(va, s) {
                        sides.push(s);
                    }
                }
                debug_assert!(!sides.is_empty(), "no side contains vertex");
                let bound = (mesh.elem_point(candidate, va) - p1).norm() / edge_length;
                info.push(NeighborInfo::on_edge(candidate, sides, bound, bound));
                return true;
            }
            Some(vb) => {
                for e in 0..et.n_edges() {
                    if et.is_node_on_edge(va, e) && et.is_node_on_edge(vb, e) {
                        let mut lower =
                            (mesh.elem_point(candidate, va) - p1).norm() / edge_length;
                        let mut upper =
                            (mesh.elem_point(candidate, vb) - p1).norm() / edge_length;
                        if lower > upper {
                            std::mem::swap(&mut lower, &mut upper);
                        }
                        info.push(NeighborInfo::on_edge(candidate, edge_sides(e), lower, upper));
                        return true;
                    }
                }
                panic!("failed to find an edge containing both vertices");
            }
        }
    }

    false
}
