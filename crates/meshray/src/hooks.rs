//! Hook contracts: segment kernels and boundary conditions.
//!
//! Hooks are trait objects dispatched by the tracer. Mutation rights over
//! the active ray flow through the segment/boundary contexts, which mint
//! the ray's capability keys; a hook cannot change the ray's id or data
//! size, cannot redirect twice in one segment, and cannot redirect a ray
//! whose end point was set or that was marked not to continue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{RayTracingError, Result};
use crate::extrema::ElemExtrema;
use crate::geom::{Point, LOOSE_TRACE_TOL};
use crate::mesh::{BoundaryId, ElemId, Mesh, SubdomainId};
use crate::quadrature::SegmentQuadrature;
use crate::ray::{ChangeDirectionKey, ChangeStartDirectionKey, Ray, RayId};

/// A scalar field evaluated at quadrature points; the seam to the FE
/// collaborator.
pub trait Field: Send + Sync {
    fn value(&self, point: &Point) -> f64;
}

impl<F: Fn(&Point) -> f64 + Send + Sync> Field for F {
    fn value(&self, point: &Point) -> f64 {
        self(point)
    }
}

/// Hook invoked on every segment a ray traverses.
pub trait RayKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Subdomains this kernel runs on; `None` means everywhere.
    fn subdomains(&self) -> Option<&[SubdomainId]> {
        None
    }

    /// Names of other kernels this one must run after.
    fn depends_on(&self) -> &[String] {
        &[]
    }

    /// Registered ray names this kernel is associated with; empty means
    /// all rays (only meaningful when the study uses ray registration).
    fn ray_names(&self) -> &[String] {
        &[]
    }

    /// Called at the beginning of a ray's trace on each processor/thread.
    fn pre_trace(&self) {}

    /// Called once before each study execution.
    fn pre_execute_study(&self) {}

    fn on_segment(&self, ctx: &mut SegmentCtx<'_>) -> Result<()>;
}

/// Hook invoked when a ray touches a boundary carrying its boundary id.
pub trait RayBoundaryCondition: Send + Sync {
    fn name(&self) -> &str;

    fn boundaries(&self) -> &[BoundaryId];

    fn depends_on(&self) -> &[String] {
        &[]
    }

    fn ray_names(&self) -> &[String] {
        &[]
    }

    fn pre_execute_study(&self) {}

    /// `num_applying` is the number of boundaries this same hook is
    /// simultaneously applied to at this point (greater than one where
    /// sidesets meet at a vertex or edge).
    fn on_boundary(&self, ctx: &mut BoundaryCtx<'_>, num_applying: usize) -> Result<()>;
}

/// Hands out unique ray ids and correctly sized rays to hooks that spawn
/// children mid-trace.
pub(crate) struct AcquireCtx<'a> {
    pub next_id: &'a AtomicU64,
    pub stride: u64,
    pub data_size: usize,
    pub aux_data_size: usize,
    pub study_tag: u64,
}

impl AcquireCtx<'_> {
    pub(crate) fn acquire(&self) -> Ray {
        let id = self.next_id.fetch_add(self.stride, Ordering::Relaxed);
        Ray::new(RayId(id), self.data_size, self.aux_data_size, self.study_tag)
    }
}

/// Context for [`RayKernel::on_segment`].
pub struct SegmentCtx<'a> {
    pub(crate) ray: &'a mut Ray,
    pub(crate) mesh: &'a Mesh,
    pub(crate) elem: ElemId,
    pub(crate) subdomain: SubdomainId,
    pub(crate) incoming_side: Option<u16>,
    pub(crate) segment_start: Point,
    pub(crate) segment_end: Point,
    pub(crate) segment_length: f64,
    pub(crate) quadrature: &'a SegmentQuadrature,
    pub(crate) acquire: AcquireCtx<'a>,
    pub(crate) spawned: &'a mut Vec<Ray>,
}

impl SegmentCtx<'_> {
    pub fn ray(&self) -> &Ray {
        &*self.ray
    }

    pub fn elem(&self) -> ElemId {
        self.elem
    }

    pub fn subdomain(&self) -> SubdomainId {
        self.subdomain
    }

    pub fn incoming_side(&self) -> Option<u16> {
        self.incoming_side
    }

    pub fn segment_start(&self) -> Point {
        self.segment_start
    }

    pub fn segment_end(&self) -> Point {
        self.segment_end
    }

    pub fn segment_length(&self) -> f64 {
        self.segment_length
    }

    /// Physical quadrature points and their JxW weights on this segment.
    pub fn quadrature(&self) -> &SegmentQuadrature {
        self.quadrature
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        self.ray.data_mut()
    }

    pub fn aux_data_mut(&mut self) -> &mut [f64] {
        self.ray.aux_data_mut()
    }

    /// Stops the ray at the end of this segment.
    pub fn set_should_continue(&mut self, should_continue: bool) -> Result<()> {
        self.ray.set_should_continue(should_continue)
    }

    /// Redirects the ray from `start`, which must be within the current
    /// element. At most one redirect per segment.
    pub fn change_ray_start_direction(&mut self, start: Point, direction: Point) -> Result<()> {
        if self.ray.end_set() {
            return Err(self
                .ray
                .contract("cannot redirect a ray whose end point was set at generation"));
        }
        if !self.ray.should_continue() {
            return Err(self
                .ray
                .contract("cannot redirect a ray that was set to not continue"));
        }
        if self.ray.trajectory_changed() {
            return Err(self
                .ray
                .contract("cannot redirect a ray twice within one segment"));
        }
        if !self.mesh.close_to_point(self.elem, &start, LOOSE_TRACE_TOL) {
            return Err(self
                .ray
                .contract("the redirect start point is not within the current element"));
        }
        self.ray
            .change_start_direction(start, direction, ChangeStartDirectionKey(()))
    }

    /// Acquires a child ray starting at `start` within the current
    /// element, with a unique id and zeroed data.
    pub fn acquire_ray(&self, start: Point, direction: Point) -> Result<Ray> {
        let mut ray = self.acquire.acquire();
        ray.set_start(start, Some(self.elem), None)?;
        ray.set_starting_direction(direction)?;
        Ok(ray)
    }

    /// Moves a child ray into the work buffer; it will be traced during
    /// this propagation.
    pub fn move_ray_to_buffer(&mut self, ray: Ray) {
        self.spawned.push(ray);
    }
}

/// Context for [`RayBoundaryCondition::on_boundary`].
pub struct BoundaryCtx<'a> {
    pub(crate) ray: &'a mut Ray,
    pub(crate) mesh: &'a Mesh,
    pub(crate) elem: ElemId,
    pub(crate) intersected_side: u16,
    pub(crate) intersected_extrema: ElemExtrema,
    pub(crate) intersection_point: Point,
    pub(crate) boundary_id: BoundaryId,
    pub(crate) side_normal: Point,
    pub(crate) acquire: AcquireCtx<'a>,
    pub(crate) spawned: &'a mut Vec<Ray>,
}

impl BoundaryCtx<'_> {
    pub fn ray(&self) -> &Ray {
        &*self.ray
    }

    /// One element touching the intersection point; at a vertex or edge
    /// this is only one of possibly several.
    pub fn elem(&self) -> ElemId {
        self.elem
    }

    pub fn intersected_side(&self) -> u16 {
        self.intersected_side
    }

    pub fn intersected_extrema(&self) -> ElemExtrema {
        self.intersected_extrema
    }

    pub fn intersection_point(&self) -> Point {
        self.intersection_point
    }

    pub fn boundary_id(&self) -> BoundaryId {
        self.boundary_id
    }

    /// Outward normal of the intersected side.
    pub fn side_normal(&self) -> Point {
        self.side_normal
    }

    pub fn mesh(&self) -> &Mesh {
        self.mesh
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        self.ray.data_mut()
    }

    pub fn aux_data_mut(&mut self) -> &mut [f64] {
        self.ray.aux_data_mut()
    }

    pub fn set_should_continue(&mut self, should_continue: bool) -> Result<()> {
        self.ray.set_should_continue(should_continue)
    }

    /// Changes the ray's direction at the boundary. The new direction
    /// must be incoming on the intersected side; the tracer enforces
    /// this after the hook returns. `skip_changed_check` permits a
    /// second change at a corner where the same hook applies to several
    /// boundaries at once.
    pub fn change_ray_direction(&mut self, direction: Point, skip_changed_check: bool) -> Result<()> {
        if !self.ray.should_continue() {
            return Err(self
                .ray
                .contract("cannot change the direction of a ray that should not continue"));
        }
        if !skip_changed_check && self.ray.trajectory_changed() {
            return Err(self
                .ray
                .contract("cannot change the direction of a ray whose direction was already changed"));
        }
        if self.ray.end_set() {
            return Err(self
                .ray
                .contract("cannot change the direction of a ray whose end point was set at generation"));
        }
        self.ray.change_direction(direction, ChangeDirectionKey(()))
    }

    /// Acquires a child ray starting at the intersection point.
    pub fn acquire_ray(&self, direction: Point) -> Result<Ray> {
        let mut ray = self.acquire.acquire();
        ray.set_start(
            self.intersection_point,
            Some(self.elem),
            Some(self.intersected_side),
        )?;
        ray.set_starting_direction(direction)?;
        Ok(ray)
    }

    pub fn move_ray_to_buffer(&mut self, ray: Ray) {
        self.spawned.push(ray);
    }
}

// Built-in hooks

/// Accumulates the traversed segment length into a ray data slot.
pub struct DistanceKernel {
    name: String,
    data_index: usize,
    subdomains: Option<Vec<SubdomainId>>,
}

impl DistanceKernel {
    pub fn new(name: impl Into<String>, data_index: usize) -> Self {
        Self {
            name: name.into(),
            data_index,
            subdomains: None,
        }
    }

    pub fn restricted(mut self, subdomains: Vec<SubdomainId>) -> Self {
        self.subdomains = Some(subdomains);
        self
    }
}

impl RayKernel for DistanceKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn subdomains(&self) -> Option<&[SubdomainId]> {
        self.subdomains.as_deref()
    }

    fn on_segment(&self, ctx: &mut SegmentCtx<'_>) -> Result<()> {
        let length = ctx.segment_length();
        ctx.data_mut()[self.data_index] += length;
        Ok(())
    }
}

/// Accumulates the line integral of a field along each segment into a
/// ray data slot.
pub struct IntegralKernel<F: Field> {
    name: String,
    data_index: usize,
    field: F,
    subdomains: Option<Vec<SubdomainId>>,
}

impl<F: Field> IntegralKernel<F> {
    pub fn new(name: impl Into<String>, data_index: usize, field: F) -> Self {
        Self {
            name: name.into(),
            data_index,
            field,
            subdomains: None,
        }
    }

    pub fn restricted(mut self, subdomains: Vec<SubdomainId>) -> Self {
        self.subdomains = Some(subdomains);
        self
    }
}

impl<F: Field> RayKernel for IntegralKernel<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subdomains(&self) -> Option<&[SubdomainId]> {
        self.subdomains.as_deref()
    }

    fn on_segment(&self, ctx: &mut SegmentCtx<'_>) -> Result<()> {
        let quad = ctx.quadrature();
        let integral: f64 = quad
            .points
            .iter()
            .zip(&quad.weights)
            .map(|(p, w)| self.field.value(p) * w)
            .sum();
        ctx.data_mut()[self.data_index] += integral;
        Ok(())
    }
}

/// Adds each segment's length into a per-element shared accumulator.
/// The write is serialized by a process-wide lock because accumulator
/// entries are shared across rays and threads.
pub struct AuxAccumulationKernel {
    name: String,
    accumulator: std::sync::Arc<Mutex<Vec<f64>>>,
    subdomains: Option<Vec<SubdomainId>>,
}

impl AuxAccumulationKernel {
    pub fn new(name: impl Into<String>, accumulator: std::sync::Arc<Mutex<Vec<f64>>>) -> Self {
        Self {
            name: name.into(),
            accumulator,
            subdomains: None,
        }
    }
}

impl RayKernel for AuxAccumulationKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn subdomains(&self) -> Option<&[SubdomainId]> {
        self.subdomains.as_deref()
    }

    /// Zeroes the accumulator before each execution so contributions do
    /// not pile up across runs.
    fn pre_execute_study(&self) {
        if let Ok(mut acc) = self.accumulator.lock() {
            acc.fill(0.0);
        }
    }

    fn on_segment(&self, ctx: &mut SegmentCtx<'_>) -> Result<()> {
        let mut acc = self
            .accumulator
            .lock()
            .map_err(|_| RayTracingError::setup("aux accumulator lock poisoned"))?;
        acc[ctx.elem().0] += ctx.segment_length();
        Ok(())
    }
}

/// Specular reflection about the outward normal of the hit side.
pub struct ReflectBc {
    name: String,
    boundaries: Vec<BoundaryId>,
}

impl ReflectBc {
    pub fn new(name: impl Into<String>, boundaries: Vec<BoundaryId>) -> Self {
        Self {
            name: name.into(),
            boundaries,
        }
    }
}

impl RayBoundaryCondition for ReflectBc {
    fn name(&self) -> &str {
        &self.name
    }

    fn boundaries(&self) -> &[BoundaryId] {
        &self.boundaries
    }

    fn on_boundary(&self, ctx: &mut BoundaryCtx<'_>, _num_applying: usize) -> Result<()> {
        let direction = ctx
            .ray()
            .direction()
            .ok_or_else(|| ctx.ray().contract("reflecting a ray with no direction"))?;
        let normal = ctx.side_normal();
        let reflected = direction - 2.0 * direction.dot(&normal) * normal;
        // A corner applies this hook once per meeting boundary; later
        // reflections must go through even though the trajectory already
        // changed this step
        ctx.change_ray_direction(reflected, true)
    }
}

/// Stops rays at the boundary.
pub struct KillBc {
    name: String,
    boundaries: Vec<BoundaryId>,
}

impl KillBc {
    pub fn new(name: impl Into<String>, boundaries: Vec<BoundaryId>) -> Self {
        Self {
            name: name.into(),
            boundaries,
        }
    }
}

impl RayBoundaryCondition for KillBc {
    fn name(&self) -> &str {
        &self.name
    }

    fn boundaries(&self) -> &[BoundaryId] {
        &self.boundaries
    }

    fn on_boundary(&self, ctx: &mut BoundaryCtx<'_>, _num_applying: usize) -> Result<()> {
        ctx.set_should_continue(false)
    }
}

/// Records every invocation without touching the ray. Only valid on
/// internal boundaries, where the resolve-or-kill contract does not
/// apply.
#[derive(Default)]
pub struct NullBc {
    name: String,
    boundaries: Vec<BoundaryId>,
    /// `(boundary_id, num_applying)` per invocation.
    hits: Mutex<Vec<(BoundaryId, usize)>>,
}

impl NullBc {
    pub fn new(name: impl Into<String>, boundaries: Vec<BoundaryId>) -> Self {
        Self {
            name: name.into(),
            boundaries,
            hits: Mutex::new(Vec::new()),
        }
    }

    pub fn hits(&self) -> Vec<(BoundaryId, usize)> {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RayBoundaryCondition for NullBc {
    fn name(&self) -> &str {
        &self.name
    }

    fn boundaries(&self) -> &[BoundaryId] {
        &self.boundaries
    }

    fn on_boundary(&self, ctx: &mut BoundaryCtx<'_>, num_applying: usize) -> Result<()> {
        self.hits
            .lock()
            .map_err(|_| RayTracingError::setup("hit recorder lock poisoned"))?
            .push((ctx.boundary_id(), num_applying));
        Ok(())
    }
}
