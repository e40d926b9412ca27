use proptest::prelude::*;

use super::*;
use crate::extrema::ElemExtrema;

#[test]
fn line_line_hits_and_misses() {
    let start = Point::new(0.0, 0.5, 0.0);
    let direction = Point::new(1.0, 0.0, 0.0);
    let v0 = Point::new(2.0, 0.0, 0.0);
    let v1 = Point::new(2.0, 1.0, 0.0);

    let (point, distance, vertex) =
        line_line_intersect_2d(&start, &direction, 10.0, &v0, &v1).unwrap();
    assert!(points_fuzzy_eq(&point, &Point::new(2.0, 0.5, 0.0), 1e-10));
    assert!((distance - 2.0).abs() < 1e-10);
    assert_eq!(vertex, SegmentVertex::None);

    // Parallel: miss
    let v0p = Point::new(0.0, 1.0, 0.0);
    let v1p = Point::new(1.0, 1.0, 0.0);
    assert!(line_line_intersect_2d(&start, &direction, 10.0, &v0p, &v1p).is_none());

    // Behind the start: miss
    let v0b = Point::new(-1.0, 0.0, 0.0);
    let v1b = Point::new(-1.0, 1.0, 0.0);
    assert!(line_line_intersect_2d(&start, &direction, 10.0, &v0b, &v1b).is_none());
}

#[test]
fn line_line_reports_endpoint_hits() {
    let start = Point::new(0.0, 0.0, 0.0);
    let direction = Point::new(1.0, 0.0, 0.0);
    let v0 = Point::new(2.0, 0.0, 0.0);
    let v1 = Point::new(2.0, 1.0, 0.0);

    let (_, _, vertex) = line_line_intersect_2d(&start, &direction, 10.0, &v0, &v1).unwrap();
    assert_eq!(vertex, SegmentVertex::V0);
}

#[test]
fn triangle_face_edge_and_vertex_hits() {
    // Unit triangle in the z = 1 plane, wound to face -z
    let p0 = Point::new(0.0, 0.0, 1.0);
    let p1 = Point::new(0.0, 1.0, 1.0);
    let p2 = Point::new(1.0, 0.0, 1.0);
    let direction = Point::new(0.0, 0.0, 1.0);

    // Interior hit
    let start = Point::new(0.25, 0.25, 0.0);
    let (distance, extrema) =
        intersect_triangle(&start, &direction, &p0, &p1, &p2, 0, 1, 2, 1.0).unwrap();
    assert!((distance - 1.0).abs() < 1e-10);
    assert!(extrema.is_invalid());

    // Vertex hit at p0
    let start = Point::new(0.0, 0.0, 0.0);
    let (_, extrema) =
        intersect_triangle(&start, &direction, &p0, &p1, &p2, 0, 1, 2, 1.0).unwrap();
    assert_eq!(extrema, ElemExtrema::Vertex(0));

    // Edge hit between v0 and v2 (v = 0 line)
    let start = Point::new(0.5, 0.0, 0.0);
    let (_, extrema) =
        intersect_triangle(&start, &direction, &p0, &p1, &p2, 0, 1, 2, 1.0).unwrap();
    assert_eq!(extrema, ElemExtrema::Edge(0, 2));

    // Wrong winding rejects (backface)
    let start = Point::new(0.25, 0.25, 2.0);
    let down = Point::new(0.0, 0.0, -1.0);
    assert!(intersect_triangle(&start, &down, &p0, &p1, &p2, 0, 1, 2, 1.0).is_none());
}

#[test]
fn triangle_rescales_by_hmax() {
    // A large triangle: the hmax rescale keeps the tolerance meaningful
    let scale = 1.0e6;
    let p0 = Point::new(0.0, 0.0, scale);
    let p1 = Point::new(0.0, scale, scale);
    let p2 = Point::new(scale, 0.0, scale);
    let direction = Point::new(0.0, 0.0, 1.0);
    let start = Point::new(0.25 * scale, 0.25 * scale, 0.0);

    let (distance, _) =
        intersect_triangle(&start, &direction, &p0, &p1, &p2, 0, 1, 2, scale).unwrap();
    assert!((distance - scale).abs() < 1e-6 * scale);
}

#[test]
fn quad_diagonal_hit_is_not_an_edge() {
    // Unit quad in z = 1 facing -z, vertices (v00, v10, v11, v01)
    let q00 = Point::new(0.0, 0.0, 1.0);
    let q10 = Point::new(0.0, 1.0, 1.0);
    let q11 = Point::new(1.0, 1.0, 1.0);
    let q01 = Point::new(1.0, 0.0, 1.0);
    let direction = Point::new(0.0, 0.0, 1.0);

    // On the split diagonal (v00 -> v11): face hit, extrema invalidated
    let start = Point::new(0.5, 0.5, 0.0);
    let (distance, extrema) = intersect_quad(
        &start, &direction, &q00, &q10, &q11, &q01, 0, 1, 2, 3, 1.0,
    )
    .unwrap();
    assert!((distance - 1.0).abs() < 1e-10);
    assert!(extrema.is_invalid());

    // A real edge (v00 -> v10) still reports
    let start = Point::new(0.0, 0.5, 0.0);
    let (_, extrema) = intersect_quad(
        &start, &direction, &q00, &q10, &q11, &q01, 0, 1, 2, 3, 1.0,
    )
    .unwrap();
    assert_eq!(extrema, ElemExtrema::Edge(0, 1));
}

#[test]
fn segment_containment() {
    let a = Point::new(0.0, 0.0, 0.0);
    let b = Point::new(2.0, 0.0, 0.0);

    assert!(within_segment(&a, &b, &Point::new(1.0, 0.0, 0.0), TRACE_TOL));
    assert!(within_segment(&a, &b, &a, TRACE_TOL));
    assert!(!within_segment(&a, &b, &Point::new(3.0, 0.0, 0.0), TRACE_TOL));
    assert!(!within_segment(&a, &b, &Point::new(1.0, 0.1, 0.0), TRACE_TOL));
    // A slightly off-axis point passes under the loose tolerance
    assert!(within_segment(&a, &b, &Point::new(1.0, 1e-6, 0.0), LOOSE_TRACE_TOL));
}

#[test]
fn bounding_box_boundary() {
    let bbox = BoundingBox::new(Point::zeros(), Point::new(1.0, 1.0, 1.0));
    assert!(on_bounding_box_boundary(&bbox, &Point::new(0.0, 0.5, 0.5), 3, 1e-8));
    assert!(on_bounding_box_boundary(&bbox, &Point::new(0.5, 1.0, 0.5), 3, 1e-8));
    assert!(!on_bounding_box_boundary(&bbox, &Point::new(0.5, 0.5, 0.5), 3, 1e-8));
    // The z face does not count in 2D
    assert!(!on_bounding_box_boundary(&bbox, &Point::new(0.5, 0.5, 0.0), 2, 1e-8));
}

proptest! {
    /// An interior hit's distance equals the start-to-plane distance
    /// along the ray.
    #[test]
    fn triangle_interior_hits_report_plane_distance(
        u in 0.05f64..0.4,
        v in 0.05f64..0.4,
        height in 0.1f64..10.0,
    ) {
        let p0 = Point::new(0.0, 0.0, height);
        let p1 = Point::new(0.0, 1.0, height);
        let p2 = Point::new(1.0, 0.0, height);
        let direction = Point::new(0.0, 0.0, 1.0);
        let start = Point::new(u, v, 0.0);

        let (distance, extrema) =
            intersect_triangle(&start, &direction, &p0, &p1, &p2, 0, 1, 2, 1.0).unwrap();
        prop_assert!((distance - height).abs() < 1e-9 * height.max(1.0));
        prop_assert!(extrema.is_invalid());
    }

    /// Containment agrees with the parametric definition of a segment.
    #[test]
    fn segment_containment_matches_parameterization(
        t in -0.5f64..1.5,
        len in 0.1f64..100.0,
    ) {
        let a = Point::new(1.0, 2.0, 3.0);
        let b = a + Point::new(len, 0.0, 0.0);
        let p = a + (b - a) * t;
        let inside = (0.0..=1.0).contains(&t);
        // Stay away from the tolerance band at the endpoints
        if (t.abs() > 1e-6) && ((t - 1.0).abs() > 1e-6) {
            prop_assert_eq!(within_segment(&a, &b, &p, TRACE_TOL), inside);
        }
    }
}
