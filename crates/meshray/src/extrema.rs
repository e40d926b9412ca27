//! Vertex/edge descriptor for element extrema.
//!
//! When a ray's exit is geometrically at a vertex or within an edge of an
//! element, the tracer carries this tag one step forward to drive the
//! neighbor traversal instead of the plain side-neighbor transition.

use std::fmt;

use crate::geom::{points_fuzzy_eq, within_segment, Point, TRACE_TOL};
use crate::mesh::{ElemId, Mesh};

/// Tagged extrema state: not at an extrema, at a local vertex, or within
/// the edge between two local vertices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ElemExtrema {
    #[default]
    None,
    Vertex(u16),
    Edge(u16, u16),
}

impl ElemExtrema {
    #[inline]
    pub fn at_extrema(&self) -> bool {
        !matches!(self, Self::None)
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn at_vertex(&self) -> bool {
        matches!(self, Self::Vertex(_))
    }

    #[inline]
    pub fn at_edge(&self) -> bool {
        matches!(self, Self::Edge(_, _))
    }

    /// At the edge defined by `v1` and `v2`, in either order.
    #[inline]
    pub fn at_edge_between(&self, v1: u16, v2: u16) -> bool {
        matches!(self, Self::Edge(a, b) if (*a == v1 && *b == v2) || (*a == v2 && *b == v1))
    }

    #[inline]
    pub fn invalidate(&mut self) {
        *self = Self::None;
    }

    /// The local vertex index when at a vertex.
    #[inline]
    pub fn vertex(&self) -> u16 {
        match self {
            Self::Vertex(v) => *v,
            _ => panic!("not at a vertex"),
        }
    }

    /// The local vertex pair when at an edge.
    #[inline]
    pub fn edge_vertices(&self) -> (u16, u16) {
        match self {
            Self::Edge(v1, v2) => (*v1, *v2),
            _ => panic!("not at an edge"),
        }
    }

    /// The vertex position when at a vertex.
    pub fn vertex_point(&self, mesh: &Mesh, elem: ElemId) -> Point {
        mesh.elem_point(elem, self.vertex())
    }

    /// The edge endpoint positions when at an edge.
    pub fn edge_points(&self, mesh: &Mesh, elem: ElemId) -> (Point, Point) {
        let (v1, v2) = self.edge_vertices();
        (mesh.elem_point(elem, v1), mesh.elem_point(elem, v2))
    }

    /// Whether the tagged vertex/edge of `elem` contains `point` within
    /// tolerance. Only checks when at an extrema; edge checks apply in 3D.
    pub fn is_valid(&self, mesh: &Mesh, elem: ElemId, point: &Point) -> bool {
        match self {
            Self::Vertex(_) => {
                points_fuzzy_eq(&self.vertex_point(mesh, elem), point, TRACE_TOL)
            }
            Self::Edge(_, _) if mesh.dim() == 3 => {
                let (p1, p2) = self.edge_points(mesh, elem);
                within_segment(&p1, &p2, point, TRACE_TOL)
            }
            _ => true,
        }
    }
}

impl fmt::Display for ElemExtrema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "not at extrema"),
            Self::Vertex(v) => write!(f, "at vertex {v}"),
            Self::Edge(v1, v2) => write!(f, "at edge with vertices {v1} and {v2}"),
        }
    }
}
