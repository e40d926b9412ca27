//! Ray generators: the user-facing source of rays for each execution.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::geom::Point;
use crate::ray::Ray;
use crate::study::RayStudy;

/// Produces the rays to trace at the start of each execution.
pub trait RayGenerator: Send {
    fn generate(&mut self, study: &RayStudy) -> Result<Vec<Ray>>;

    /// Whether this call's output is replicated across ranks and must be
    /// claimed to unique owners before tracing.
    fn needs_claim(&self) -> bool {
        false
    }

    /// Receives the locally claimed subset after claiming, so the
    /// generator can reuse it on later executions.
    fn post_claim(&mut self, _study: &RayStudy, _claimed: &[Ray]) -> Result<()> {
        Ok(())
    }
}

/// How a defined ray travels from its start point.
#[derive(Clone, Debug)]
pub enum Trajectory {
    /// Unbounded in a direction.
    Direction(Point),
    /// Bounded by a maximum distance in a direction.
    DirectionWithMax(Point, f64),
    /// Bounded by a terminal point.
    EndPoint(Point),
    /// Reports at the start point without tracing.
    Stationary,
}

/// A user-defined ray: start, trajectory, and optionally a registered
/// name and initial data.
#[derive(Clone, Debug)]
pub struct RayDefinition {
    pub name: Option<String>,
    pub start: Point,
    pub trajectory: Trajectory,
    pub data: Vec<f64>,
}

impl RayDefinition {
    pub fn new(start: Point, trajectory: Trajectory) -> Self {
        Self {
            name: None,
            start,
            trajectory,
            data: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: Vec<f64>) -> Self {
        self.data = data;
        self
    }
}

/// Snapshot of a repeatable generator for resuming across executions.
#[derive(Clone, Debug, Default)]
pub struct GeneratorCheckpoint {
    pub local_rays: Vec<Ray>,
    pub needs_define: bool,
    pub needs_claim: bool,
}

/// Generates the same set of defined rays on every execution. The first
/// execution defines the rays replicated on all ranks and claims them;
/// later executions re-trace copies of the locally claimed subset
/// without re-claiming, until the mesh changes.
pub struct RepeatableGenerator {
    definitions: Vec<RayDefinition>,
    local_rays: Vec<Ray>,
    needs_define: bool,
    needs_claim: bool,
}

impl RepeatableGenerator {
    pub fn new(definitions: Vec<RayDefinition>) -> Self {
        Self {
            definitions,
            local_rays: Vec::new(),
            needs_define: true,
            needs_claim: true,
        }
    }

    /// Forces re-definition and re-claiming on the next execution, e.g.
    /// after the mesh changed.
    pub fn mesh_changed(&mut self) {
        self.needs_define = true;
        self.needs_claim = true;
        self.local_rays.clear();
    }

    pub fn checkpoint(&self) -> GeneratorCheckpoint {
        GeneratorCheckpoint {
            local_rays: self.local_rays.clone(),
            needs_define: self.needs_define,
            needs_claim: self.needs_claim,
        }
    }

    pub fn restore(&mut self, checkpoint: GeneratorCheckpoint) {
        self.local_rays = checkpoint.local_rays;
        self.needs_define = checkpoint.needs_define;
        self.needs_claim = checkpoint.needs_claim;
    }

    fn define_rays(&self, study: &RayStudy) -> Result<Vec<Ray>> {
        let mut rays = Vec::with_capacity(self.definitions.len());
        for def in &self.definitions {
            // Replicated ids issue identically on all ranks; registered
            // names map to ids shared by name
            let mut ray = match &def.name {
                Some(name) => study.acquire_registered_ray(name.clone()),
                None => study.acquire_replicated_ray(),
            };
            ray.set_start(def.start, None, None)?;
            match &def.trajectory {
                Trajectory::Direction(direction) => ray.set_starting_direction(*direction)?,
                Trajectory::DirectionWithMax(direction, max) => {
                    ray.set_starting_direction(*direction)?;
                    ray.set_starting_max_distance(*max)?;
                }
                Trajectory::EndPoint(end) => ray.set_starting_end_point(*end)?,
                Trajectory::Stationary => ray.set_stationary()?,
            }
            for (slot, value) in ray.data_mut().iter_mut().zip(&def.data) {
                *slot = *value;
            }
            rays.push(ray);
        }
        Ok(rays)
    }
}

impl RayGenerator for RepeatableGenerator {
    fn generate(&mut self, study: &RayStudy) -> Result<Vec<Ray>> {
        if self.needs_define {
            return self.define_rays(study);
        }
        // Re-trace copies of the claimed subset with fresh counters
        self.local_rays
            .iter()
            .map(|ray| study.acquire_copied_ray(ray))
            .collect()
    }

    fn needs_claim(&self) -> bool {
        self.needs_claim
    }

    fn post_claim(&mut self, study: &RayStudy, claimed: &[Ray]) -> Result<()> {
        self.local_rays = claimed
            .iter()
            .map(|ray| study.acquire_copied_ray(ray))
            .collect::<Result<Vec<_>>>()?;
        self.needs_define = false;
        self.needs_claim = false;
        Ok(())
    }
}

/// Emits `count` rays from one point with seeded random unit directions
/// on every execution. Useful for isotropic point sources and for
/// exercising the tracer from every angle; the seed makes runs
/// replayable.
pub struct RandomFanGenerator {
    start: Point,
    count: usize,
    seed: u64,
    max_distance: Option<f64>,
}

impl RandomFanGenerator {
    pub fn new(start: Point, count: usize, seed: u64) -> Self {
        Self {
            start,
            count,
            seed,
            max_distance: None,
        }
    }

    pub fn with_max_distance(mut self, max_distance: f64) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    fn direction(rng: &mut StdRng, dim: u32) -> Point {
        // Rejection-sample the unit ball to get a uniform direction
        loop {
            let d = Point::new(
                rng.gen_range(-1.0..1.0),
                if dim > 1 { rng.gen_range(-1.0..1.0) } else { 0.0 },
                if dim > 2 { rng.gen_range(-1.0..1.0) } else { 0.0 },
            );
            let norm = d.norm();
            if norm > 1e-3 && norm <= 1.0 {
                return d / norm;
            }
        }
    }
}

impl RayGenerator for RandomFanGenerator {
    fn generate(&mut self, study: &RayStudy) -> Result<Vec<Ray>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let dim = study.mesh().dim();
        let mut rays = Vec::with_capacity(self.count);
        for _ in 0..self.count {
            let mut ray = study.acquire_replicated_ray();
            ray.set_start(self.start, None, None)?;
            ray.set_starting_direction(Self::direction(&mut rng, dim))?;
            if let Some(max) = self.max_distance {
                ray.set_starting_max_distance(max)?;
            }
            rays.push(ray);
        }
        Ok(rays)
    }

    fn needs_claim(&self) -> bool {
        true
    }
}

/// A one-shot generator over already-started rays local to this rank.
pub struct LocalRayGenerator {
    rays: Vec<Ray>,
}

impl LocalRayGenerator {
    pub fn new(rays: Vec<Ray>) -> Self {
        Self { rays }
    }
}

impl RayGenerator for LocalRayGenerator {
    fn generate(&mut self, _study: &RayStudy) -> Result<Vec<Ray>> {
        Ok(std::mem::take(&mut self.rays))
    }
}
