//! Extrema location helpers used by the exit search and the boundary
//! collection.

use crate::extrema::ElemExtrema;
use crate::geom::{points_fuzzy_eq, within_segment, Point, TRACE_TOL};
use crate::mesh::{ElemId, Mesh};

/// Local vertex of `elem` at `point`, restricted to the vertices of
/// `side`.
pub fn at_vertex_on_side(mesh: &Mesh, elem: ElemId, point: &Point, side: u16) -> Option<u16> {
    let etype = mesh.elem(elem).etype;
    for &v in etype.side_nodes(side) {
        if points_fuzzy_eq(&mesh.elem_point(elem, v), point, TRACE_TOL) {
            return Some(v);
        }
    }
    None
}

/// Edge of `elem` whose interior contains `point`, over all edges
/// (3D only).
pub fn within_edge(mesh: &Mesh, elem: ElemId, point: &Point, tol: f64) -> ElemExtrema {
    let etype = mesh.elem(elem).etype;
    for e in 0..etype.n_edges() {
        let [a, b] = etype.edge_nodes(e);
        if within_segment(
            &mesh.elem_point(elem, a),
            &mesh.elem_point(elem, b),
            point,
            tol,
        ) {
            return ElemExtrema::Edge(a, b);
        }
    }
    ElemExtrema::None
}

/// Edge of `elem` containing `point`, restricted to the perimeter of
/// `side` (3D only). Walks consecutive side-vertex pairs.
pub fn within_edge_on_side(mesh: &Mesh, elem: ElemId, point: &Point, side: u16) -> ElemExtrema {
    let etype = mesh.elem(elem).etype;
    let nodes = etype.side_nodes(side);
    let mut last = nodes[nodes.len() - 1];
    for &v in nodes {
        if within_segment(
            &mesh.elem_point(elem, last),
            &mesh.elem_point(elem, v),
            point,
            TRACE_TOL,
        ) {
            return ElemExtrema::Edge(last, v);
        }
        last = v;
    }
    ElemExtrema::None
}

/// Vertex or edge of `elem` on `side` at `point`, if any.
pub fn within_extrema_on_side(
    mesh: &Mesh,
    elem: ElemId,
    point: &Point,
    side: u16,
    dim: u32,
) -> ElemExtrema {
    if let Some(v) = at_vertex_on_side(mesh, elem, point, side) {
        return ElemExtrema::Vertex(v);
    }
    if dim == 3 {
        return within_edge_on_side(mesh, elem, point, side);
    }
    ElemExtrema::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_and_edge_on_hex_side() {
        let mesh = Mesh::hex_grid(1, 1, 1, (0.0, 1.0), (0.0, 1.0), (0.0, 1.0));
        let elem = ElemId(0);

        // Corner of the bottom side
        let corner = Point::new(0.0, 0.0, 0.0);
        assert!(at_vertex_on_side(&mesh, elem, &corner, 0).is_some());

        // Mid-edge of the bottom side
        let mid_edge = Point::new(0.5, 0.0, 0.0);
        assert!(at_vertex_on_side(&mesh, elem, &mid_edge, 0).is_none());
        assert!(within_edge_on_side(&mesh, elem, &mid_edge, 0).at_edge());
        assert!(within_edge(&mesh, elem, &mid_edge, TRACE_TOL).at_edge());

        // Face interior is not an extrema
        let center = Point::new(0.5, 0.5, 0.0);
        assert!(within_extrema_on_side(&mesh, elem, &center, 0, 3).is_invalid());
    }
}
