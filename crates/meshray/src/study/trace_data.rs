//! Cached trace records for post-hoc exporters.

use crate::geom::Point;
use crate::ray::{Ray, RayId};

/// A point along a cached trace with a snapshot of the ray data there.
#[derive(Clone, Debug, Default)]
pub struct TracePoint {
    pub point: Point,
    pub data: Vec<f64>,
    pub aux_data: Vec<f64>,
}

/// Per-completed-ray record. Never consulted during tracing.
#[derive(Clone, Debug)]
pub struct TraceData {
    pub ray_id: RayId,
    pub processor_crossings: u32,
    pub intersections: u32,
    pub trajectory_changes: u32,
    pub distance: f64,
    pub points: Vec<TracePoint>,
}

impl TraceData {
    pub fn start(ray: &Ray) -> Self {
        Self {
            ray_id: ray.id(),
            processor_crossings: 0,
            intersections: 0,
            trajectory_changes: 0,
            distance: 0.0,
            points: Vec::new(),
        }
    }

    pub fn add_point(&mut self, point: Point) -> &mut TracePoint {
        self.points.push(TracePoint {
            point,
            data: Vec::new(),
            aux_data: Vec::new(),
        });
        self.points.last_mut().expect("just pushed")
    }

    /// Snapshots the final counters when the trace leaves this rank or
    /// completes.
    pub fn finalize(&mut self, ray: &Ray) {
        self.processor_crossings = ray.processor_crossings();
        self.intersections = ray.intersections();
        self.trajectory_changes = ray.trajectory_changes();
        self.distance = ray.distance();
    }
}
