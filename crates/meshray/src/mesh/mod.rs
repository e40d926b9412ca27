//! The unstructured mesh the tracing core consumes.
//!
//! Provides element/neighbor queries, side builders, a node-to-element
//! map, and a point locator. Supports non-conforming refinement (children
//! track their parent; neighbor links may point at inactive or coarser
//! elements, with descent to the active child containing a point).

mod build;
mod types;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::geom::{points_fuzzy_eq, within_segment, BoundingBox, Point, TRACE_TOL};

pub use types::{BoundaryId, Elem, ElemId, ElemType, NodeId, SubdomainId};

/// Up to four vertices per side.
pub type SidePoints = SmallVec<[Point; 4]>;

#[derive(Clone, Debug)]
pub struct Mesh {
    dim: u32,
    nodes: Vec<Point>,
    elems: Vec<Elem>,
    /// Active elements per node, rebuilt by `prepare()`.
    node_to_elems: Vec<Vec<ElemId>>,
    boundary: HashMap<(ElemId, u16), SmallVec<[BoundaryId; 2]>>,
    subdomains: Vec<SubdomainId>,
    n_ranks: u32,
}

impl Mesh {
    pub fn new(dim: u32) -> Self {
        Self {
            dim,
            nodes: Vec::new(),
            elems: Vec::new(),
            node_to_elems: Vec::new(),
            boundary: HashMap::new(),
            subdomains: Vec::new(),
            n_ranks: 1,
        }
    }

    #[inline]
    pub fn dim(&self) -> u32 {
        self.dim
    }

    #[inline]
    pub fn n_ranks(&self) -> u32 {
        self.n_ranks
    }

    #[inline]
    pub fn n_elems(&self) -> usize {
        self.elems.len()
    }

    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn elem(&self, id: ElemId) -> &Elem {
        &self.elems[id.0]
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> Point {
        self.nodes[id.0]
    }

    pub fn elems(&self) -> impl Iterator<Item = &Elem> {
        self.elems.iter()
    }

    pub fn active_elems(&self) -> impl Iterator<Item = &Elem> {
        self.elems.iter().filter(|e| e.active())
    }

    pub fn active_local_elems(&self, pid: u32) -> impl Iterator<Item = &Elem> + '_ {
        self.active_elems().filter(move |e| e.processor_id == pid)
    }

    /// Distinct subdomain ids over the whole mesh.
    pub fn subdomains(&self) -> &[SubdomainId] {
        &self.subdomains
    }

    /// Position of local vertex `v` of an element.
    #[inline]
    pub fn elem_point(&self, elem: ElemId, v: u16) -> Point {
        self.nodes[self.elems[elem.0].nodes[v as usize].0]
    }

    pub fn vertex_average(&self, elem: ElemId) -> Point {
        let e = self.elem(elem);
        let n = e.n_vertices() as usize;
        let mut sum = Point::zeros();
        for v in 0..n {
            sum += self.nodes[e.nodes[v].0];
        }
        sum / n as f64
    }

    /// Maximum vertex-pair distance.
    pub fn hmax(&self, elem: ElemId) -> f64 {
        self.vertex_pair_extent(elem, f64::max, 0.0)
    }

    /// Minimum vertex-pair distance.
    pub fn hmin(&self, elem: ElemId) -> f64 {
        self.vertex_pair_extent(elem, f64::min, f64::INFINITY)
    }

    fn vertex_pair_extent(&self, elem: ElemId, pick: fn(f64, f64) -> f64, init: f64) -> f64 {
        let e = self.elem(elem);
        let n = e.n_vertices() as usize;
        let mut extent = init;
        for i in 0..n {
            for j in (i + 1)..n {
                let d = (self.nodes[e.nodes[i].0] - self.nodes[e.nodes[j].0]).norm();
                extent = pick(extent, d);
            }
        }
        extent
    }

    /// Vertex positions of a side, in the side table's winding.
    pub fn side_points(&self, elem: ElemId, side: u16) -> SidePoints {
        let e = self.elem(elem);
        e.etype
            .side_nodes(side)
            .iter()
            .map(|v| self.nodes[e.nodes[*v as usize].0])
            .collect()
    }

    /// Unit outward normal of a side. Non-planar quad sides get the
    /// diagonal-cross approximation.
    pub fn outward_normal(&self, elem: ElemId, side: u16) -> Point {
        let pts = self.side_points(elem, side);
        let centroid = self.vertex_average(elem);
        let mut n = match pts.len() {
            1 => pts[0] - centroid,
            2 => {
                let d = pts[1] - pts[0];
                Point::new(d.y, -d.x, 0.0)
            }
            3 => (pts[1] - pts[0]).cross(&(pts[2] - pts[0])),
            _ => (pts[2] - pts[0]).cross(&(pts[3] - pts[1])),
        };
        n.normalize_mut();
        // Orient away from the element centroid
        let side_avg = pts.iter().sum::<Point>() / pts.len() as f64;
        if n.dot(&(centroid - side_avg)) > 0.0 {
            -n
        } else {
            n
        }
    }

    /// Whether a side is non-planar: a quad side whose fourth vertex is
    /// off the plane of the first three (3D only).
    pub fn side_is_non_planar(&self, elem: ElemId, side: u16) -> bool {
        let pts = self.side_points(elem, side);
        if pts.len() < 4 {
            return false;
        }
        let n = (pts[1] - pts[0]).cross(&(pts[2] - pts[0]));
        let h = self.hmax(elem);
        n.normalize().dot(&(pts[3] - pts[0])).abs() > TRACE_TOL * h
    }

    /// Whether a side contains `point` within `tol * hmax`.
    pub fn side_contains_point(&self, elem: ElemId, side: u16, point: &Point, tol: f64) -> bool {
        let pts = self.side_points(elem, side);
        let eps = tol * self.hmax(elem);
        match pts.len() {
            1 => (pts[0] - point).norm() < eps,
            2 => within_segment(&pts[0], &pts[1], point, tol),
            _ => {
                // In-plane distance plus half-plane tests along each edge
                let n = match pts.len() {
                    3 => (pts[1] - pts[0]).cross(&(pts[2] - pts[0])),
                    _ => (pts[2] - pts[0]).cross(&(pts[3] - pts[1])),
                }
                .normalize();
                if n.dot(&(point - pts[0])).abs() > eps {
                    return false;
                }
                for i in 0..pts.len() {
                    let a = pts[i];
                    let b = pts[(i + 1) % pts.len()];
                    if (b - a).cross(&(point - a)).dot(&n) < -eps {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Whether the element contains `point` within `tol * hmax`.
    pub fn close_to_point(&self, elem: ElemId, point: &Point, tol: f64) -> bool {
        let eps = tol * self.hmax(elem);
        match self.dim {
            1 => {
                let a = self.elem_point(elem, 0);
                let b = self.elem_point(elem, 1);
                within_segment(&a, &b, point, tol)
            }
            _ => {
                // Convex: inside every side's outward half-space
                for s in 0..self.elem(elem).n_sides() {
                    let n = self.outward_normal(elem, s);
                    let p0 = self.side_points(elem, s)[0];
                    if n.dot(&(point - p0)) > eps {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Tight containment check.
    pub fn contains_point(&self, elem: ElemId, point: &Point) -> bool {
        self.close_to_point(elem, point, 1e-6)
    }

    /// Local vertex index at `point`, if any vertex matches within the
    /// tight tolerance.
    pub fn at_vertex(&self, elem: ElemId, point: &Point) -> Option<u16> {
        let e = self.elem(elem);
        for v in 0..e.n_vertices() {
            if points_fuzzy_eq(&self.elem_point(elem, v), point, TRACE_TOL) {
                return Some(v);
            }
        }
        None
    }

    /// Boundary ids on a side; empty when none are assigned.
    pub fn boundary_ids(&self, elem: ElemId, side: u16) -> &[BoundaryId] {
        self.boundary
            .get(&(elem, side))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn add_boundary_id(&mut self, elem: ElemId, side: u16, id: BoundaryId) {
        let entry = self.boundary.entry((elem, side)).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
    }

    /// All distinct boundary ids present on the mesh.
    pub fn all_boundary_ids(&self) -> Vec<BoundaryId> {
        let mut ids: Vec<BoundaryId> = self.boundary.values().flatten().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Iterates (elem, side, boundary_id) triples.
    pub fn boundary_elems(&self) -> impl Iterator<Item = (ElemId, u16, BoundaryId)> + '_ {
        self.boundary
            .iter()
            .flat_map(|((e, s), ids)| ids.iter().map(move |id| (*e, *s, *id)))
    }

    /// Active elements containing `node` (as any of their nodes).
    pub fn node_elems(&self, node: NodeId) -> &[ElemId] {
        &self.node_to_elems[node.0]
    }

    /// Global bounding box over all nodes.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(self.nodes.iter())
    }

    /// Bounding box over the nodes of active elements owned by `pid`.
    pub fn local_bounding_box(&self, pid: u32) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for e in self.active_local_elems(pid) {
            for n in &e.nodes {
                bbox.union_point(&self.nodes[n.0]);
            }
        }
        bbox
    }

    /// Longest representable path through the domain.
    pub fn domain_max_length(&self) -> f64 {
        self.bounding_box().widths().norm()
    }

    /// Sum of active element volumes.
    pub fn total_volume(&self) -> f64 {
        self.active_elems().map(|e| self.elem_volume(e.id)).sum()
    }

    pub fn elem_volume(&self, elem: ElemId) -> f64 {
        let e = self.elem(elem);
        let p = |v: u16| self.elem_point(elem, v);
        let tet = |a: Point, b: Point, c: Point, d: Point| {
            ((b - a).cross(&(c - a)).dot(&(d - a)) / 6.0).abs()
        };
        let tri = |a: Point, b: Point, c: Point| (b - a).cross(&(c - a)).norm() / 2.0;
        match e.etype.first_order() {
            ElemType::Edge2 => (p(1) - p(0)).norm(),
            ElemType::Tri3 => tri(p(0), p(1), p(2)),
            ElemType::Quad4 => tri(p(0), p(1), p(2)) + tri(p(2), p(3), p(0)),
            ElemType::Tet4 => tet(p(0), p(1), p(2), p(3)),
            ElemType::Pyramid5 => tet(p(0), p(1), p(2), p(4)) + tet(p(0), p(2), p(3), p(4)),
            ElemType::Prism6 => {
                tet(p(0), p(1), p(2), p(3)) + tet(p(1), p(2), p(3), p(4))
                    + tet(p(2), p(3), p(4), p(5))
            }
            ElemType::Hex8 => {
                tet(p(0), p(1), p(3), p(4))
                    + tet(p(1), p(2), p(3), p(6))
                    + tet(p(1), p(3), p(4), p(6))
                    + tet(p(1), p(5), p(6), p(4))
                    + tet(p(3), p(4), p(6), p(7))
            }
            _ => unreachable!(),
        }
    }

    /// Locates the active element containing `point`, optionally
    /// restricted to elements owned by `pid`. Deterministic: the lowest
    /// element id wins.
    pub fn locate_point(&self, point: &Point, pid: Option<u32>) -> Option<ElemId> {
        self.active_elems()
            .filter(|e| pid.is_none_or(|p| e.processor_id == p))
            .find(|e| {
                let bbox = self.elem_bbox(e.id);
                let mut inflated = bbox;
                inflated.scale(0.01);
                inflated.contains_point(point) && self.contains_point(e.id, point)
            })
            .map(|e| e.id)
    }

    fn elem_bbox(&self, elem: ElemId) -> BoundingBox {
        let e = self.elem(elem);
        BoundingBox::from_points(e.nodes.iter().map(|n| &self.nodes[n.0]))
    }

    /// The side of `of` that faces `target` (or an ancestor of `target`).
    pub fn which_neighbor_am_i(&self, of: ElemId, target: ElemId) -> Option<u16> {
        let e = self.elem(of);
        for (s, n) in e.neighbors.iter().enumerate() {
            if let Some(n) = n {
                if *n == target || self.is_ancestor_of(*n, target) {
                    return Some(s as u16);
                }
            }
        }
        None
    }

    fn is_ancestor_of(&self, ancestor: ElemId, mut elem: ElemId) -> bool {
        while let Some(parent) = self.elem(elem).parent {
            if parent == ancestor {
                return true;
            }
            elem = parent;
        }
        false
    }

    /// Neighbor on a side, descending refined neighbors to the active
    /// child containing `point`.
    pub fn active_neighbor(&self, elem: ElemId, side: u16, point: &Point) -> Option<ElemId> {
        let neighbor = self.elem(elem).neighbors[side as usize]?;
        if self.elem(neighbor).active() {
            return Some(neighbor);
        }
        let neighbor_side = self.which_neighbor_am_i(neighbor, elem)?;
        self.child_containing_point_on_side(neighbor, point, neighbor_side)
    }

    /// Active descendant of an inactive `elem` containing `point` on
    /// `side`. The containment tolerance is loosened slightly; experience
    /// with refined meshes shows the tight tolerance rejects valid hits.
    pub fn child_containing_point_on_side(
        &self,
        elem: ElemId,
        point: &Point,
        side: u16,
    ) -> Option<ElemId> {
        debug_assert!(!self.elem(elem).active(), "should be inactive");
        for &child in &self.elem(elem).children {
            if !self.is_child_on_side(elem, child, side) {
                continue;
            }
            if self.close_to_point(child, point, 5e-5) {
                if self.elem(child).active() {
                    return Some(child);
                }
                return self.child_containing_point_on_side(child, point, side);
            }
        }
        None
    }

    /// Whether `child` touches the parent's side. Children inherit the
    /// parent's neighbor link on their external sides, which is what this
    /// checks.
    pub fn is_child_on_side(&self, parent: ElemId, child: ElemId, side: u16) -> bool {
        let p = self.elem(parent);
        let c = self.elem(child);
        match p.neighbors[side as usize] {
            Some(n) => c.neighbors.iter().flatten().any(|cn| *cn == n),
            // Boundary side of the parent: the child is on it if it has a
            // boundary side whose vertices all lie on the parent's side
            None => {
                let side_pts = self.side_points(parent, side);
                (0..c.n_sides()).any(|cs| {
                    c.neighbors[cs as usize].is_none()
                        && self
                            .side_points(child, cs)
                            .iter()
                            .all(|pt| side_contains(&side_pts, pt, self.hmax(parent)))
                })
            }
        }
    }

    /// Active descendants of inactive `of` that are adjacent to `elem`.
    pub fn active_family_tree_by_neighbor(&self, of: ElemId, elem: ElemId, out: &mut Vec<ElemId>) {
        out.clear();
        let mut stack = vec![of];
        while let Some(cur) = stack.pop() {
            let e = self.elem(cur);
            if e.active() {
                if self.which_neighbor_am_i(cur, elem).is_some() {
                    out.push(cur);
                }
            } else {
                stack.extend(e.children.iter().copied());
            }
        }
    }

    /// Rebuilds derived structures (node-to-element map, subdomain set).
    /// Must be called after construction or refinement.
    pub fn prepare(&mut self) {
        self.node_to_elems = vec![Vec::new(); self.nodes.len()];
        for e in &self.elems {
            if !e.active() {
                continue;
            }
            for n in &e.nodes {
                self.node_to_elems[n.0].push(e.id);
            }
        }
        let mut subdomains: Vec<SubdomainId> =
            self.elems.iter().filter(|e| e.active()).map(|e| e.subdomain).collect();
        subdomains.sort_unstable();
        subdomains.dedup();
        self.subdomains = subdomains;
    }

    pub fn set_subdomain(&mut self, elem: ElemId, subdomain: SubdomainId) {
        self.elems[elem.0].subdomain = subdomain;
    }

    /// Assigns subdomains from element centroids.
    pub fn assign_subdomains(&mut self, f: impl Fn(&Point) -> SubdomainId) {
        for i in 0..self.elems.len() {
            let centroid = self.vertex_average(ElemId(i));
            self.elems[i].subdomain = f(&centroid);
        }
        self.prepare();
    }

    pub(crate) fn elems_mut(&mut self) -> &mut Vec<Elem> {
        &mut self.elems
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<Point> {
        &mut self.nodes
    }

    pub(crate) fn set_n_ranks(&mut self, n: u32) {
        self.n_ranks = n;
    }
}

/// Whether `point` lies within the polygon/segment spanned by `side_pts`,
/// loosely. Used for child-on-boundary-side checks.
fn side_contains(side_pts: &SidePoints, point: &Point, hmax: f64) -> bool {
    let eps = 5e-5 * hmax;
    match side_pts.len() {
        1 => (side_pts[0] - point).norm() < eps,
        2 => within_segment(&side_pts[0], &side_pts[1], point, 5e-5),
        _ => {
            let n = (side_pts[1] - side_pts[0])
                .cross(&(side_pts[2] - side_pts[0]))
                .normalize();
            if n.dot(&(point - side_pts[0])).abs() > eps {
                return false;
            }
            for i in 0..side_pts.len() {
                let a = side_pts[i];
                let b = side_pts[(i + 1) % side_pts.len()];
                if (b - a).cross(&(point - a)).dot(&n) < -eps {
                    return false;
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests;
