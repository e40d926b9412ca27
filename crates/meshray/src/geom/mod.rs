//! Geometric primitives for the exit-face search.
//!
//! - intersection routines for element sides (2D line-line, 3D triangle
//!   and quad via Möller–Trumbore) with vertex/edge hit classification;
//! - segment containment and bounding-box boundary predicates;
//! - the trace tolerances that every routine scales by element size.
//!
//! All routines are eps-aware free functions over nalgebra vectors; the
//! tolerance conventions are tight (`TRACE_TOL`) for same-element checks
//! and loose (`LOOSE_TRACE_TOL`) for cross-element corner cases.

mod intersect;
mod types;

pub use intersect::{
    intersect_quad, intersect_triangle, is_within_segment, line_line_intersect_2d,
    on_bounding_box_boundary, within_segment, SegmentVertex,
};
pub use types::{fuzzy_eq, points_fuzzy_eq, BoundingBox, Point, LOOSE_TRACE_TOL, TRACE_TOL};

#[cfg(test)]
mod tests;
