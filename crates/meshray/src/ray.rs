//! The ray: a parametric line segment with counters, carried data, and
//! termination state. The unit of work for the whole system.
//!
//! Rays are constructed only through the study's acquire family. Starting
//! information is settable until tracing begins; afterwards the starting
//! mutators fail. Mid-trace mutation is reserved to the tracer (crate
//! internals) and to hooks through capability keys that only the hook
//! dispatch can mint.

use crate::error::{RayTracingError, Result};
use crate::geom::{points_fuzzy_eq, Point, TRACE_TOL};
use crate::mesh::ElemId;

/// Globally unique ray identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RayId(pub u64);

impl RayId {
    pub const INVALID: RayId = RayId(u64::MAX);

    #[inline]
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

/// Permits [`Ray::change_direction`]; minted only by the boundary-hook
/// dispatch.
pub struct ChangeDirectionKey(pub(crate) ());

/// Permits [`Ray::change_start_direction`]; minted only by the
/// segment-hook dispatch.
pub struct ChangeStartDirectionKey(pub(crate) ());

#[derive(Clone, Debug)]
pub struct Ray {
    id: RayId,
    /// Furthest point reached: the start before tracing, the outgoing
    /// segment point during kernels, the terminal point after.
    current_point: Option<Point>,
    direction: Option<Point>,
    current_elem: Option<ElemId>,
    current_incoming_side: Option<u16>,
    /// Whether the user bounded the ray by a terminal point.
    end_set: bool,
    processor_crossings: u32,
    intersections: u32,
    trajectory_changes: u32,
    /// Transient; cleared after observers run. Not sent in parallel.
    trajectory_changed: bool,
    distance: f64,
    max_distance: f64,
    /// Monotone: once cleared it cannot be re-armed. Not sent in parallel.
    should_continue: bool,
    data: Vec<f64>,
    aux_data: Vec<f64>,
    /// Tag of the owning study; rays from different studies never
    /// compare equal.
    study_tag: u64,
}

impl Ray {
    pub(crate) fn new(id: RayId, data_size: usize, aux_data_size: usize, study_tag: u64) -> Self {
        Self {
            id,
            current_point: None,
            direction: None,
            current_elem: None,
            current_incoming_side: None,
            end_set: false,
            processor_crossings: 0,
            intersections: 0,
            trajectory_changes: 0,
            trajectory_changed: false,
            distance: 0.0,
            max_distance: f64::INFINITY,
            should_continue: true,
            data: vec![0.0; data_size],
            aux_data: vec![0.0; aux_data_size],
            study_tag,
        }
    }

    /// Resets for pool reuse.
    pub(crate) fn reset(&mut self, id: RayId, data_size: usize, aux_data_size: usize) {
        self.id = id;
        self.current_point = None;
        self.direction = None;
        self.current_elem = None;
        self.current_incoming_side = None;
        self.end_set = false;
        self.distance = 0.0;
        self.max_distance = f64::INFINITY;
        self.data.clear();
        self.data.resize(data_size, 0.0);
        self.aux_data.clear();
        self.aux_data.resize(aux_data_size, 0.0);
        self.reset_counters_internal();
    }

    /// Copies another ray's starting state and data with zeroed counters.
    /// Fails if the other ray has begun tracing.
    pub(crate) fn reset_from(&mut self, other: &Ray) -> Result<()> {
        other.error_if_tracing("cannot copy a ray")?;

        self.reset(other.id, other.data.len(), other.aux_data.len());

        if let Some(point) = other.current_point {
            self.set_start(point, other.current_elem, other.current_incoming_side)?;
        }
        if other.end_set {
            self.set_starting_end_point(other.end_point()?)?;
        } else {
            if let Some(direction) = other.direction {
                self.set_starting_direction(direction)?;
            }
            if other.max_distance_set() {
                self.max_distance = other.max_distance;
            }
        }

        self.data.copy_from_slice(&other.data);
        self.aux_data.copy_from_slice(&other.aux_data);
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> RayId {
        self.id
    }

    pub(crate) fn change_id(&mut self, id: RayId) {
        self.id = id;
    }

    pub(crate) fn study_tag(&self) -> u64 {
        self.study_tag
    }

    #[inline]
    pub fn current_point(&self) -> Option<Point> {
        self.current_point
    }

    #[inline]
    pub fn direction(&self) -> Option<Point> {
        self.direction
    }

    #[inline]
    pub fn current_elem(&self) -> Option<ElemId> {
        self.current_elem
    }

    #[inline]
    pub fn current_incoming_side(&self) -> Option<u16> {
        self.current_incoming_side
    }

    #[inline]
    pub fn end_set(&self) -> bool {
        self.end_set
    }

    #[inline]
    pub fn processor_crossings(&self) -> u32 {
        self.processor_crossings
    }

    #[inline]
    pub fn intersections(&self) -> u32 {
        self.intersections
    }

    #[inline]
    pub fn trajectory_changes(&self) -> u32 {
        self.trajectory_changes
    }

    #[inline]
    pub fn trajectory_changed(&self) -> bool {
        self.trajectory_changed
    }

    #[inline]
    pub fn distance(&self) -> f64 {
        self.distance
    }

    #[inline]
    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    #[inline]
    pub fn max_distance_set(&self) -> bool {
        self.max_distance != f64::INFINITY
    }

    /// A stationary ray reports at its start point without tracing.
    #[inline]
    pub fn stationary(&self) -> bool {
        self.max_distance == 0.0
    }

    #[inline]
    pub fn should_continue(&self) -> bool {
        self.should_continue
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[inline]
    pub fn aux_data(&self) -> &[f64] {
        &self.aux_data
    }

    #[inline]
    pub fn aux_data_mut(&mut self) -> &mut [f64] {
        &mut self.aux_data
    }

    /// Whether tracing has begun; starting mutators fail afterwards.
    #[inline]
    pub fn has_traced(&self) -> bool {
        self.distance > 0.0 || self.processor_crossings > 0 || self.intersections > 0
    }

    /// Whether the ray has reached its user-set end point.
    pub fn at_end(&self) -> Result<bool> {
        if !self.end_set {
            return Err(self.contract("at_end() requires an end point set at generation"));
        }
        Ok((self.distance - self.max_distance).abs() < TRACE_TOL)
    }

    /// The user-set end point, inferred from the current point, the
    /// remaining distance, and the direction.
    pub fn end_point(&self) -> Result<Point> {
        if !self.end_set {
            return Err(self.contract("end_point() requires an end point set at generation"));
        }
        let point = self
            .current_point
            .ok_or_else(|| self.contract("end_point() requires a current point"))?;
        let direction = self
            .direction
            .ok_or_else(|| self.contract("end_point() requires a direction"))?;
        Ok(point + (self.max_distance - self.distance) * direction)
    }

    /// Sets the starting point, element (if known), and incoming side
    /// (if known and on a side of the element). Must precede the other
    /// starting mutators. May be re-called before tracing to change the
    /// element and side, but not to move the point.
    pub fn set_start(
        &mut self,
        point: Point,
        elem: Option<ElemId>,
        incoming_side: Option<u16>,
    ) -> Result<()> {
        self.error_if_tracing("cannot set the start")?;
        if let Some(existing) = self.current_point {
            if !points_fuzzy_eq(&existing, &point, TRACE_TOL) {
                return Err(self.contract(
                    "the starting point was already set and may not be moved; \
                     clear the starting info first",
                ));
            }
        }
        self.current_point = Some(point);
        self.current_elem = elem;
        self.current_incoming_side = incoming_side;
        Ok(())
    }

    /// Sets the starting direction. Requires a prior `set_start`; cannot
    /// be combined with `set_starting_end_point`.
    pub fn set_starting_direction(&mut self, direction: Point) -> Result<()> {
        self.error_if_tracing("cannot set the starting direction")?;
        if self.current_point.is_none() {
            return Err(self.contract("set_start() must be called before the starting direction"));
        }
        if self.direction.is_some() {
            return Err(self.contract(
                "the starting direction was already set; clear the starting info first",
            ));
        }
        if direction.norm() < TRACE_TOL {
            return Err(self.contract("the starting direction is the zero vector"));
        }
        self.direction = Some(direction.normalize());
        Ok(())
    }

    /// Bounds the ray by a terminal point: sets the direction toward it
    /// and the maximum distance to the straight-line separation.
    pub fn set_starting_end_point(&mut self, end_point: Point) -> Result<()> {
        self.error_if_tracing("cannot set the starting end point")?;
        let Some(start) = self.current_point else {
            return Err(self.contract("set_start() must be called before the end point"));
        };
        if points_fuzzy_eq(&start, &end_point, TRACE_TOL) {
            return Err(self.contract("the end point equals the start point"));
        }
        if self.direction.is_some() {
            return Err(self.contract(
                "an end point cannot be combined with set_starting_direction()",
            ));
        }
        if self.max_distance_set() {
            return Err(self.contract(
                "an end point cannot be combined with set_starting_max_distance()",
            ));
        }
        let difference = end_point - start;
        self.set_starting_max_distance(difference.norm())?;
        self.set_starting_direction(difference)?;
        self.end_set = true;
        Ok(())
    }

    /// Limits the total distance the ray may travel.
    pub fn set_starting_max_distance(&mut self, max_distance: f64) -> Result<()> {
        self.error_if_tracing("cannot set the starting max distance")?;
        if self.current_point.is_none() {
            return Err(self.contract("set_start() must be called before the max distance"));
        }
        if max_distance <= 0.0 {
            return Err(self.contract("the starting max distance must be positive"));
        }
        if self.end_set {
            return Err(self.contract(
                "a max distance cannot be combined with set_starting_end_point()",
            ));
        }
        self.max_distance = max_distance;
        Ok(())
    }

    /// Marks the ray stationary: zero max distance, no direction.
    pub fn set_stationary(&mut self) -> Result<()> {
        self.error_if_tracing("cannot set stationary")?;
        if self.current_point.is_none() {
            return Err(self.contract("set_start() must be called before set_stationary()"));
        }
        if self.end_set {
            return Err(self.contract("set_stationary() cannot follow set_starting_end_point()"));
        }
        if self.direction.is_some() {
            return Err(self.contract("set_stationary() cannot follow set_starting_direction()"));
        }
        self.max_distance = 0.0;
        Ok(())
    }

    /// Drops the starting element, e.g. after the mesh changed.
    pub fn invalidate_starting_elem(&mut self) -> Result<()> {
        self.error_if_tracing("cannot invalidate the starting element")?;
        self.current_elem = None;
        Ok(())
    }

    pub fn invalidate_starting_incoming_side(&mut self) -> Result<()> {
        self.error_if_tracing("cannot invalidate the starting incoming side")?;
        self.current_incoming_side = None;
        Ok(())
    }

    /// Clears all starting information.
    pub fn clear_starting_info(&mut self) -> Result<()> {
        self.error_if_tracing("cannot clear the starting info")?;
        self.current_point = None;
        self.current_elem = None;
        self.current_incoming_side = None;
        self.direction = None;
        self.max_distance = f64::INFINITY;
        self.end_set = false;
        Ok(())
    }

    /// Returns a non-started ray to its construction state so it can be
    /// traced again. Legal only during generation.
    pub fn reset_counters(&mut self) {
        self.reset_counters_internal();
    }

    fn reset_counters_internal(&mut self) {
        self.processor_crossings = 0;
        self.intersections = 0;
        self.trajectory_changes = 0;
        self.distance = 0.0;
        self.trajectory_changed = false;
        self.should_continue = true;
    }

    /// Stops the ray. Monotone: re-arming a stopped ray is an error.
    pub fn set_should_continue(&mut self, should_continue: bool) -> Result<()> {
        if should_continue && !self.should_continue {
            return Err(self.contract(
                "a ray that was set to not continue cannot be set to continue again",
            ));
        }
        self.should_continue = should_continue;
        Ok(())
    }

    /// Redirects the ray mid-trace from a boundary. Only callable by the
    /// boundary-hook dispatch, which mints the key.
    pub fn change_direction(&mut self, direction: Point, _key: ChangeDirectionKey) -> Result<()> {
        if direction.norm() < TRACE_TOL {
            return Err(self.contract("cannot set a zero vector direction"));
        }
        self.direction = Some(direction.normalize());
        self.trajectory_changed = true;
        Ok(())
    }

    /// Redirects the ray from a point inside the current element. Only
    /// callable by the segment-hook dispatch, which mints the key.
    pub fn change_start_direction(
        &mut self,
        start: Point,
        direction: Point,
        _key: ChangeStartDirectionKey,
    ) -> Result<()> {
        if direction.norm() < TRACE_TOL {
            return Err(self.contract("cannot set a zero vector direction"));
        }
        self.current_point = Some(start);
        self.direction = Some(direction.normalize());
        self.trajectory_changed = true;
        Ok(())
    }

    // Tracer internals

    pub(crate) fn set_current_point(&mut self, point: Point) {
        self.current_point = Some(point);
    }

    /// Restores the direction when rematerializing from the packed
    /// representation; does not flag a trajectory change.
    pub(crate) fn set_direction_internal(&mut self, direction: Point) {
        self.direction = Some(direction);
    }

    pub(crate) fn set_current_elem(&mut self, elem: Option<ElemId>) {
        self.current_elem = elem;
    }

    pub(crate) fn set_current_incoming_side(&mut self, side: Option<u16>) {
        self.current_incoming_side = side;
    }

    pub(crate) fn set_trajectory_changed(&mut self, changed: bool) {
        self.trajectory_changed = changed;
    }

    pub(crate) fn add_processor_crossing(&mut self) {
        self.processor_crossings += 1;
    }

    pub(crate) fn add_intersection(&mut self) {
        self.intersections += 1;
    }

    pub(crate) fn add_trajectory_change(&mut self) {
        self.trajectory_changes += 1;
    }

    pub(crate) fn add_distance(&mut self, add: f64) {
        self.distance += add;
    }

    pub(crate) fn kill(&mut self) {
        self.should_continue = false;
    }

    /// Restores transient flags after rematerializing from the packed
    /// representation.
    pub(crate) fn rearm_after_unpack(&mut self) {
        self.should_continue = true;
        self.trajectory_changed = false;
    }

    pub(crate) fn set_counters_from_unpack(
        &mut self,
        processor_crossings: u32,
        intersections: u32,
        trajectory_changes: u32,
        distance: f64,
        max_distance: f64,
        end_set: bool,
    ) {
        self.processor_crossings = processor_crossings;
        self.intersections = intersections;
        self.trajectory_changes = trajectory_changes;
        self.distance = distance;
        self.max_distance = max_distance;
        self.end_set = end_set;
    }

    fn error_if_tracing(&self, reason: &str) -> Result<()> {
        if self.has_traced() {
            return Err(self.contract(format!("{reason} after the ray has started tracing")));
        }
        Ok(())
    }

    pub(crate) fn contract(&self, reason: impl Into<String>) -> RayTracingError {
        RayTracingError::contract(reason, self.get_info())
    }

    /// Renders the full ray state for diagnostics.
    pub fn get_info(&self) -> String {
        let fmt_point = |p: &Option<Point>| match p {
            Some(p) => format!("({}, {}, {})", p.x, p.y, p.z),
            None => "invalid".to_string(),
        };
        let mut out = String::new();
        out.push_str(&format!("  id() = {:?}\n", self.id));
        out.push_str(&format!("  current_point() = {}\n", fmt_point(&self.current_point)));
        out.push_str(&format!("  direction() = {}\n", fmt_point(&self.direction)));
        out.push_str(&format!(
            "  current_elem() = {}\n",
            self.current_elem.map_or("invalid".to_string(), |e| e.0.to_string())
        ));
        out.push_str(&format!(
            "  current_incoming_side() = {}\n",
            self.current_incoming_side
                .map_or("invalid".to_string(), |s| s.to_string())
        ));
        out.push_str(&format!("  end_set() = {}\n", self.end_set));
        out.push_str(&format!("  distance() = {}\n", self.distance));
        out.push_str(&format!("  max_distance() = {}\n", self.max_distance));
        out.push_str(&format!("  processor_crossings() = {}\n", self.processor_crossings));
        out.push_str(&format!("  intersections() = {}\n", self.intersections));
        out.push_str(&format!("  trajectory_changes() = {}\n", self.trajectory_changes));
        out.push_str(&format!("  should_continue() = {}\n", self.should_continue));
        out.push_str(&format!("  trajectory_changed() = {}\n", self.trajectory_changed));
        out.push_str(&format!("  data() = {:?}\n", self.data));
        out.push_str(&format!("  aux_data() = {:?}\n", self.aux_data));
        out
    }
}

/// Deep fuzzy equality: points, scalars, and data compare under the trace
/// tolerance; element handles and the study association compare exactly.
impl PartialEq for Ray {
    fn eq(&self, other: &Self) -> bool {
        let opt_points_eq = |a: &Option<Point>, b: &Option<Point>| match (a, b) {
            (Some(a), Some(b)) => points_fuzzy_eq(a, b, TRACE_TOL),
            (None, None) => true,
            _ => false,
        };
        let data_eq = |a: &[f64], b: &[f64]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < TRACE_TOL)
        };

        self.id == other.id
            && opt_points_eq(&self.current_point, &other.current_point)
            && opt_points_eq(&self.direction, &other.direction)
            && self.current_elem == other.current_elem
            && self.current_incoming_side == other.current_incoming_side
            && self.end_set == other.end_set
            && self.processor_crossings == other.processor_crossings
            && self.intersections == other.intersections
            && self.trajectory_changes == other.trajectory_changes
            && self.trajectory_changed == other.trajectory_changed
            && (self.distance - other.distance).abs() < TRACE_TOL
            && ((self.max_distance - other.max_distance).abs() < TRACE_TOL
                || (self.max_distance == other.max_distance))
            && self.should_continue == other.should_continue
            && data_eq(&self.data, &other.data)
            && data_eq(&self.aux_data, &other.aux_data)
            && self.study_tag == other.study_tag
    }
}
