//! Shared geometric types and tolerances.

use nalgebra::Vector3;

/// Points and directions are plain 3-vectors; 1D/2D meshes leave the
/// trailing components zero.
pub type Point = Vector3<f64>;

/// Tight tolerance for intersection and containment checks within a
/// single element.
pub const TRACE_TOL: f64 = 1e-8;

/// Loose tolerance for checks that span elements (backface culling,
/// cross-element corner cases).
pub const LOOSE_TRACE_TOL: f64 = 1e-5;

#[inline]
pub fn fuzzy_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

#[inline]
pub fn points_fuzzy_eq(a: &Point, b: &Point, tol: f64) -> bool {
    fuzzy_eq(a.x, b.x, tol) && fuzzy_eq(a.y, b.y, tol) && fuzzy_eq(a.z, b.z, tol)
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Empty box that unions correctly with any point.
    pub fn empty() -> Self {
        Self {
            min: Point::repeat(f64::INFINITY),
            max: Point::repeat(f64::NEG_INFINITY),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Self {
        let mut bbox = Self::empty();
        for p in points {
            bbox.union_point(p);
        }
        bbox
    }

    pub fn union_point(&mut self, p: &Point) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn union(&mut self, other: &BoundingBox) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    #[inline]
    pub fn contains_point(&self, p: &Point) -> bool {
        self.min.x <= p.x
            && p.x <= self.max.x
            && self.min.y <= p.y
            && p.y <= self.max.y
            && self.min.z <= p.z
            && p.z <= self.max.z
    }

    /// Inflates each side by `factor` times the box width in that axis.
    pub fn scale(&mut self, factor: f64) {
        let delta = (self.max - self.min) * factor;
        self.min -= delta;
        self.max += delta;
    }

    pub fn widths(&self) -> Point {
        self.max - self.min
    }
}
