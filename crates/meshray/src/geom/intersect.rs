//! Side intersection routines.
//!
//! The triangle routine is Möller–Trumbore with two precision
//! adjustments: the triangle is rescaled by `1/hmax` before forming the
//! edges (the returned distance is rescaled back), and the barycentric
//! tests compare against `tol * det` without dividing by `det`, which
//! preserves the sign and avoids precision loss near corners.

use tracing::trace;

use super::types::{fuzzy_eq, BoundingBox, Point, TRACE_TOL};
use crate::extrema::ElemExtrema;

/// Which endpoint of a 1D side segment was hit, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentVertex {
    None,
    V0,
    V1,
}

/// Intersects the segment `start -> start + direction * length` with the
/// segment `v0 -> v1` in the xy plane.
///
/// Returns the intersection point, the distance along the ray, and the hit
/// side-vertex classification (`u` within tolerance of an endpoint).
pub fn line_line_intersect_2d(
    start: &Point,
    direction: &Point,
    length: f64,
    v0: &Point,
    v1: &Point,
) -> Option<(Point, f64, SegmentVertex)> {
    let r = direction * length;
    let s = v1 - v0;

    let rxs = r.x * s.y - r.y * s.x;

    // Parallel or colinear
    if rxs.abs() < TRACE_TOL {
        return None;
    }

    let v0mu0 = v0 - start;

    let t = (v0mu0.x * s.y - v0mu0.y * s.x) / rxs;
    if 0.0 >= t + TRACE_TOL || t - TRACE_TOL > 1.0 {
        trace!("line_line_intersect_2d: t = {t} out of range");
        return None;
    }

    let u = (v0mu0.x * r.y - v0mu0.y * r.x) / rxs;
    if 0.0 < u + TRACE_TOL && u - TRACE_TOL <= 1.0 {
        let intersection_point = start + r * t;
        let intersection_distance = t * length;

        let segment_vertex = if u < TRACE_TOL {
            SegmentVertex::V0
        } else if u > 1.0 - TRACE_TOL {
            SegmentVertex::V1
        } else {
            SegmentVertex::None
        };

        return Some((intersection_point, intersection_distance, segment_vertex));
    }

    trace!("line_line_intersect_2d: u = {u} out of range");
    None
}

/// Intersects a ray with the triangle `(p0, p1, p2)`, reporting the hit
/// distance and any vertex/edge extrema in terms of the local vertex
/// indices `(v0, v1, v2)`.
///
/// One-sided: only triangles whose front face (counter-clockwise winding
/// as seen from the ray origin side) is hit are accepted, so element sides
/// passed with inward winding accept exiting rays only.
pub fn intersect_triangle(
    start: &Point,
    direction: &Point,
    p0: &Point,
    p1: &Point,
    p2: &Point,
    v0: u16,
    v1: u16,
    v2: u16,
    hmax: f64,
) -> Option<(f64, ElemExtrema)> {
    let inv_hmax = 1.0 / hmax;

    let edge1 = (p1 - p0) * inv_hmax;
    let edge2 = (p2 - p0) * inv_hmax;

    let pvec = direction.cross(&edge2);

    let det = edge1.dot(&pvec);
    if det < TRACE_TOL {
        return None;
    }

    let tvec = (start - p0) * inv_hmax;
    let u = tvec.dot(&pvec);
    if u < -TRACE_TOL || u > det + TRACE_TOL {
        return None;
    }

    let qvec = tvec.cross(&edge1);
    let v = direction.dot(&qvec);
    if v < -TRACE_TOL || u + v > det + TRACE_TOL {
        return None;
    }

    let possible_distance = edge2.dot(&qvec) / det;
    if possible_distance <= TRACE_TOL {
        return None;
    }

    // The element was scaled by 1 / hmax; reverse by scaling the distance
    let intersection_distance = possible_distance * hmax;

    // u and v here are u * det and v * det; compare against tol * det
    // instead of dividing
    let mut extrema = ElemExtrema::None;
    if u < TRACE_TOL * det {
        if v < TRACE_TOL * det {
            extrema = ElemExtrema::Vertex(v0);
        } else if v > (1.0 - TRACE_TOL) * det {
            extrema = ElemExtrema::Vertex(v2);
        } else {
            extrema = ElemExtrema::Edge(v0, v2);
        }
    } else if v < TRACE_TOL * det {
        if u > (1.0 - TRACE_TOL) * det {
            extrema = ElemExtrema::Vertex(v1);
        } else {
            extrema = ElemExtrema::Edge(v0, v1);
        }
    } else if u + v > (1.0 - TRACE_TOL) * det {
        extrema = ElemExtrema::Edge(v1, v2);
    }

    Some((intersection_distance, extrema))
}

/// Intersects a ray with the quad `(q00, q10, q11, q01)` by splitting it
/// into the triangles `(q00, q10, q11)` and `(q11, q01, q00)`.
///
/// A hit reported on the edge `(v00, v11)` is the split diagonal, not a
/// real edge; the extrema is invalidated but the face hit is kept.
#[allow(clippy::too_many_arguments)]
pub fn intersect_quad(
    start: &Point,
    direction: &Point,
    q00: &Point,
    q10: &Point,
    q11: &Point,
    q01: &Point,
    v00: u16,
    v10: u16,
    v11: u16,
    v01: u16,
    hmax: f64,
) -> Option<(f64, ElemExtrema)> {
    let hit = intersect_triangle(start, direction, q00, q10, q11, v00, v10, v11, hmax)
        .or_else(|| intersect_triangle(start, direction, q11, q01, q00, v11, v01, v00, hmax));

    hit.map(|(distance, extrema)| {
        if extrema.at_edge_between(v00, v11) {
            (distance, ElemExtrema::None)
        } else {
            (distance, extrema)
        }
    })
}

/// Whether `point` lies within the segment `segment1 -> segment2` of the
/// given length: a sign test on the endpoint difference dot product plus a
/// length-sum test, both scaled by the segment length.
pub fn is_within_segment(
    segment1: &Point,
    segment2: &Point,
    segment_length: f64,
    point: &Point,
    tol: f64,
) -> bool {
    debug_assert!(
        fuzzy_eq((segment1 - segment2).norm(), segment_length, 1e-10 * segment_length.max(1.0)),
        "invalid segment length"
    );

    let diff1 = point - segment1;
    let diff2 = point - segment2;

    if diff1.dot(&diff2) > tol * segment_length {
        return false;
    }

    (diff1.norm() + diff2.norm() - segment_length).abs() < tol * segment_length
}

/// [`is_within_segment`] without a precomputed length.
pub fn within_segment(segment1: &Point, segment2: &Point, point: &Point, tol: f64) -> bool {
    is_within_segment(segment1, segment2, (segment1 - segment2).norm(), point, tol)
}

/// Whether `point` is on the boundary of `bbox` in any of the first `dim`
/// axes, within `tol`.
pub fn on_bounding_box_boundary(bbox: &BoundingBox, point: &Point, dim: u32, tol: f64) -> bool {
    for d in 0..dim as usize {
        if fuzzy_eq(point[d], bbox.min[d], tol) || fuzzy_eq(point[d], bbox.max[d], tol) {
            return true;
        }
    }
    false
}
