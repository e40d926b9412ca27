//! The per-rank ray study: owner of global tables, hook registries, ray
//! acquisition, and bookkeeping.
//!
//! A study is built over a shared mesh, configured with segment kernels
//! and boundary conditions, and set up once (`initial_setup`) before any
//! propagation. During propagation the study is read-only except for the
//! explicitly locked paths (bank, counters, side-normal caches).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::{RayTracingError, Result};
use crate::geom::{BoundingBox, Point, TRACE_TOL};
use crate::hooks::{RayBoundaryCondition, RayKernel};
use crate::mesh::{BoundaryId, ElemId, Mesh, SubdomainId};
use crate::quadrature::GaussRule;
use crate::ray::{Ray, RayId};

mod trace_data;

pub use trace_data::{TraceData, TracePoint};


/// Buffer draining order for the parallel executor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Newest work first; keeps the live set small.
    #[default]
    Lifo,
    /// Oldest work first.
    Circular,
}

#[derive(Clone, Debug)]
pub struct StudyConfig {
    /// Worker threads per rank; each holds its own tracer.
    pub n_threads: usize,
    /// Require every subdomain to be covered by at least one kernel.
    pub ray_kernel_coverage_check: bool,
    /// Verify starting info, unique ids, and claiming.
    pub verify_rays: bool,
    /// Per-step geometric consistency checks during tracing.
    pub verify_trace_intersections: bool,
    /// Warn and kill on geometric failure instead of failing the run.
    pub tolerate_failure: bool,
    /// Allow boundary hooks on internal sidesets.
    pub use_internal_sidesets: bool,
    pub bank_rays_on_completion: bool,
    /// Global cap applied to every ray, on top of per-ray max distances.
    pub ray_max_distance: f64,
    pub backface_culling: bool,
    pub buffer_policy: BufferPolicy,
    /// Rays handed to the tracers per executor iteration.
    pub chunk_size: usize,
    /// Packed rays per destination before a send is flushed.
    pub send_buffer_size: usize,
    pub cache_traces: bool,
    pub data_on_cache_traces: bool,
    pub aux_data_on_cache_traces: bool,
    /// Cache every segment point rather than only trajectory changes.
    pub segments_on_cache_traces: bool,
    pub warn_non_planar: bool,
    pub warn_subdomain_hmax: bool,
    /// Associate hooks with registered ray names.
    pub use_ray_registration: bool,
    /// Per-ray subdomain setup even when the subdomain is unchanged.
    pub ray_dependent_subdomain_setup: bool,
    pub quadrature_order: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            n_threads: 1,
            ray_kernel_coverage_check: true,
            verify_rays: true,
            verify_trace_intersections: cfg!(debug_assertions),
            tolerate_failure: false,
            use_internal_sidesets: false,
            bank_rays_on_completion: true,
            ray_max_distance: f64::INFINITY,
            backface_culling: true,
            buffer_policy: BufferPolicy::Lifo,
            chunk_size: 100,
            send_buffer_size: 100,
            cache_traces: false,
            data_on_cache_traces: false,
            aux_data_on_cache_traces: false,
            segments_on_cache_traces: false,
            warn_non_planar: true,
            warn_subdomain_hmax: false,
            use_ray_registration: false,
            ray_dependent_subdomain_setup: false,
            quadrature_order: 1,
        }
    }
}

/// Per-execution bookkeeping, aggregated at `on_complete_ray`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StudyCounters {
    pub rays_completed: u64,
    pub total_processor_crossings: u64,
    pub max_processor_crossings: u32,
    pub total_intersections: u64,
    pub max_intersections: u32,
    pub max_trajectory_changes: u32,
    pub total_distance: f64,
    pub tolerated_failures: u64,
}

impl StudyCounters {
    /// Merges another rank's counters into this one.
    pub fn merge(&mut self, other: &StudyCounters) {
        self.rays_completed += other.rays_completed;
        self.total_processor_crossings += other.total_processor_crossings;
        self.max_processor_crossings = self.max_processor_crossings.max(other.max_processor_crossings);
        self.total_intersections += other.total_intersections;
        self.max_intersections = self.max_intersections.max(other.max_intersections);
        self.max_trajectory_changes = self.max_trajectory_changes.max(other.max_trajectory_changes);
        self.total_distance += other.total_distance;
        self.tolerated_failures += other.tolerated_failures;
    }
}

/// Wall-clock durations of the last execution's phases.
#[derive(Clone, Copy, Debug, Default)]
pub struct StudyTimings {
    pub generation: Duration,
    pub propagation: Duration,
    pub execution: Duration,
}

/// Checkpointed study state for resuming across executions.
#[derive(Clone, Debug, Default)]
pub struct StudyCheckpoint {
    pub registered_ray_names: Vec<String>,
    pub counters: StudyCounters,
}

static STUDY_TAG: AtomicU64 = AtomicU64::new(1);

pub struct RayStudy {
    mesh: Arc<Mesh>,
    cfg: StudyConfig,
    rank: u32,
    n_ranks: u32,
    tag: u64,

    kernels: Vec<Arc<dyn RayKernel>>,
    bcs: Vec<Arc<dyn RayBoundaryCondition>>,

    // Registration tables, frozen at initial_setup
    ray_data_map: HashMap<String, usize>,
    ray_data_names: Vec<String>,
    ray_aux_data_map: HashMap<String, usize>,
    ray_aux_data_names: Vec<String>,
    called_initial_setup: bool,

    /// Name to id and the inverse; locked so generators can register
    /// during generation.
    registered_rays: Mutex<(HashMap<String, RayId>, Vec<String>)>,

    // Setup scans
    internal_sidesets_map: Vec<Vec<Vec<BoundaryId>>>,
    internal_sidesets: BTreeSet<BoundaryId>,
    non_planar_sides: Vec<Vec<bool>>,
    has_non_planar_sides: bool,
    subdomain_hmax: HashMap<SubdomainId, f64>,
    has_same_level_active_elems: bool,
    is_rectangular_domain: bool,
    bbox: BoundingBox,
    loose_bbox: BoundingBox,
    domain_max_length: f64,
    segment_rule: GaussRule,

    // Ray id allocation
    threaded_next_ray_id: Vec<AtomicU64>,
    replicated_next_ray_id: AtomicU64,

    // Lazy per-thread side-normal caches
    threaded_cached_normals: Vec<Mutex<HashMap<(ElemId, u16), Point>>>,

    // Pool
    pool: Mutex<Vec<Ray>>,

    // Shared write targets during propagation
    ray_bank: Mutex<Vec<Ray>>,
    counters: Mutex<StudyCounters>,
    cached_traces: Mutex<Vec<TraceData>>,
    trace_results: Mutex<Vec<u64>>,

    global_counters: Option<StudyCounters>,
    timings: StudyTimings,
}

impl RayStudy {
    pub fn new(mesh: Arc<Mesh>, rank: u32, cfg: StudyConfig) -> Self {
        let n_ranks = mesh.n_ranks();
        let n_threads = cfg.n_threads.max(1);
        let threaded_next_ray_id = (0..n_threads)
            .map(|tid| AtomicU64::new(rank as u64 * n_threads as u64 + tid as u64))
            .collect();
        let threaded_cached_normals = (0..n_threads).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            mesh,
            rank,
            n_ranks,
            tag: STUDY_TAG.fetch_add(1, Ordering::Relaxed),
            kernels: Vec::new(),
            bcs: Vec::new(),
            ray_data_map: HashMap::new(),
            ray_data_names: Vec::new(),
            ray_aux_data_map: HashMap::new(),
            ray_aux_data_names: Vec::new(),
            called_initial_setup: false,
            registered_rays: Mutex::new((HashMap::new(), Vec::new())),
            internal_sidesets_map: Vec::new(),
            internal_sidesets: BTreeSet::new(),
            non_planar_sides: Vec::new(),
            has_non_planar_sides: false,
            subdomain_hmax: HashMap::new(),
            has_same_level_active_elems: true,
            is_rectangular_domain: false,
            bbox: BoundingBox::empty(),
            loose_bbox: BoundingBox::empty(),
            domain_max_length: 0.0,
            segment_rule: GaussRule::for_order(cfg.quadrature_order),
            threaded_next_ray_id,
            replicated_next_ray_id: AtomicU64::new(0),
            threaded_cached_normals,
            pool: Mutex::new(Vec::new()),
            ray_bank: Mutex::new(Vec::new()),
            counters: Mutex::new(StudyCounters::default()),
            cached_traces: Mutex::new(Vec::new()),
            trace_results: Mutex::new(Vec::new()),
            global_counters: None,
            timings: StudyTimings::default(),
            cfg,
        }
    }

    #[inline]
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    #[inline]
    pub fn cfg(&self) -> &StudyConfig {
        &self.cfg
    }

    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    #[inline]
    pub fn n_ranks(&self) -> u32 {
        self.n_ranks
    }

    #[inline]
    pub fn n_threads(&self) -> usize {
        self.cfg.n_threads.max(1)
    }

    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    pub fn add_kernel(&mut self, kernel: Arc<dyn RayKernel>) -> Result<()> {
        if self.called_initial_setup {
            return Err(RayTracingError::setup(
                "cannot add a kernel after initial_setup()",
            ));
        }
        self.kernels.push(kernel);
        Ok(())
    }

    pub fn add_bc(&mut self, bc: Arc<dyn RayBoundaryCondition>) -> Result<()> {
        if self.called_initial_setup {
            return Err(RayTracingError::setup("cannot add a BC after initial_setup()"));
        }
        self.bcs.push(bc);
        Ok(())
    }

    pub fn kernels(&self) -> &[Arc<dyn RayKernel>] {
        &self.kernels
    }

    pub fn bcs(&self) -> &[Arc<dyn RayBoundaryCondition>] {
        &self.bcs
    }

    // Ray data registration

    pub fn register_ray_data(&mut self, name: impl Into<String>) -> Result<usize> {
        self.register_ray_data_internal(name.into(), false)
    }

    pub fn register_ray_aux_data(&mut self, name: impl Into<String>) -> Result<usize> {
        self.register_ray_data_internal(name.into(), true)
    }

    fn register_ray_data_internal(&mut self, name: String, aux: bool) -> Result<usize> {
        if self.called_initial_setup {
            return Err(RayTracingError::setup(format!(
                "cannot register ray {}data '{name}' after initial_setup()",
                if aux { "aux " } else { "" }
            )));
        }

        let (map, other_map) = if aux {
            (&self.ray_aux_data_map, &self.ray_data_map)
        } else {
            (&self.ray_data_map, &self.ray_aux_data_map)
        };

        if let Some(index) = map.get(&name) {
            return Ok(*index);
        }
        if other_map.contains_key(&name) {
            return Err(RayTracingError::setup(format!(
                "cannot register ray {}data '{name}': ray {}data already exists with that name",
                if aux { "aux " } else { "" },
                if aux { "" } else { "aux " },
            )));
        }

        let (map, names) = if aux {
            (&mut self.ray_aux_data_map, &mut self.ray_aux_data_names)
        } else {
            (&mut self.ray_data_map, &mut self.ray_data_names)
        };
        let index = map.len();
        map.insert(name.clone(), index);
        names.push(name);
        Ok(index)
    }

    pub fn get_ray_data_index(&self, name: &str) -> Option<usize> {
        self.ray_data_map.get(name).copied()
    }

    pub fn get_ray_aux_data_index(&self, name: &str) -> Option<usize> {
        self.ray_aux_data_map.get(name).copied()
    }

    pub fn get_ray_data_name(&self, index: usize) -> Option<&str> {
        self.ray_data_names.get(index).map(String::as_str)
    }

    pub fn get_ray_aux_data_name(&self, index: usize) -> Option<&str> {
        self.ray_aux_data_names.get(index).map(String::as_str)
    }

    #[inline]
    pub fn ray_data_size(&self) -> usize {
        self.ray_data_map.len()
    }

    #[inline]
    pub fn ray_aux_data_size(&self) -> usize {
        self.ray_aux_data_map.len()
    }

    // Registered (named) rays

    /// Registers a name, or returns the existing id. Registered ids are
    /// dense from zero; all ranks must register in the same order.
    pub fn register_ray(&self, name: impl Into<String>) -> RayId {
        let name = name.into();
        let mut tables = self.registered_rays.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = tables.0.get(&name) {
            return *id;
        }
        let id = RayId(tables.0.len() as u64);
        tables.0.insert(name.clone(), id);
        tables.1.push(name);
        id
    }

    pub fn registered_ray_id(&self, name: &str) -> Option<RayId> {
        self.registered_rays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .get(name)
            .copied()
    }

    pub fn registered_ray_name(&self, id: RayId) -> Option<String> {
        self.registered_rays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .1
            .get(id.0 as usize)
            .cloned()
    }

    // Ray id allocation

    /// Per-thread stride allocation: ids are globally unique without
    /// coordination.
    pub(crate) fn generate_unique_ray_id(&self, tid: usize) -> RayId {
        RayId(self.threaded_next_ray_id[tid].fetch_add(self.id_stride(), Ordering::Relaxed))
    }

    /// Lockstep counter: all ranks issue identical ids when their call
    /// sequences match.
    pub(crate) fn generate_replicated_ray_id(&self) -> RayId {
        RayId(self.replicated_next_ray_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn unique_id_slot(&self, tid: usize) -> &AtomicU64 {
        &self.threaded_next_ray_id[tid]
    }

    #[inline]
    pub(crate) fn id_stride(&self) -> u64 {
        self.n_ranks as u64 * self.n_threads() as u64
    }

    /// Resets the stride allocator so re-runs are reproducible.
    pub fn reset_unique_ray_ids(&self) {
        let n_threads = self.n_threads() as u64;
        for (tid, slot) in self.threaded_next_ray_id.iter().enumerate() {
            slot.store(self.rank as u64 * n_threads + tid as u64, Ordering::Relaxed);
        }
    }

    /// Resets the replicated allocator; must be called in lockstep on
    /// all ranks.
    pub fn reset_replicated_ray_ids(&self) {
        self.replicated_next_ray_id.store(0, Ordering::Relaxed);
    }

    // Acquire family

    /// A ray with a unique id and data sized to the registered tables.
    pub fn acquire_ray(&self) -> Ray {
        self.acquire_internal(self.generate_unique_ray_id(0), self.ray_data_size(), self.ray_aux_data_size())
    }

    /// A ray with a unique id and no data; sized later.
    pub fn acquire_unsized_ray(&self) -> Ray {
        self.acquire_internal(self.generate_unique_ray_id(0), 0, 0)
    }

    /// A ray with a rank-synchronized id, identical on all ranks.
    pub fn acquire_replicated_ray(&self) -> Ray {
        self.acquire_internal(self.generate_replicated_ray_id(), self.ray_data_size(), self.ray_aux_data_size())
    }

    /// A ray addressed by a user-chosen name.
    pub fn acquire_registered_ray(&self, name: impl Into<String>) -> Ray {
        let id = self.register_ray(name);
        self.acquire_internal(id, self.ray_data_size(), self.ray_aux_data_size())
    }

    /// A ray with another ray's starting state and data, zeroed counters,
    /// and the same id. Fails if the other ray has begun tracing.
    pub fn acquire_copied_ray(&self, other: &Ray) -> Result<Ray> {
        let mut ray = self.acquire_internal(other.id(), other.data().len(), other.aux_data().len());
        ray.reset_from(other)?;
        Ok(ray)
    }

    pub(crate) fn acquire_internal(&self, id: RayId, data_size: usize, aux_data_size: usize) -> Ray {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        match pool.pop() {
            Some(mut ray) => {
                ray.reset(id, data_size, aux_data_size);
                ray
            }
            None => Ray::new(id, data_size, aux_data_size, self.tag),
        }
    }

    /// Returns a ray to the pool.
    pub fn release_ray(&self, ray: Ray) {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).push(ray);
    }

    // Hook queries

    pub fn has_ray_kernels(&self) -> bool {
        !self.kernels.is_empty()
    }

    /// Active segment kernels on a subdomain, optionally filtered to
    /// those associated with a registered ray.
    pub fn get_ray_kernels(
        &self,
        subdomain: SubdomainId,
        ray_id: Option<RayId>,
    ) -> Vec<Arc<dyn RayKernel>> {
        self.kernels
            .iter()
            .filter(|k| k.subdomains().is_none_or(|s| s.contains(&subdomain)))
            .filter(|k| self.hook_applies_to_ray(k.ray_names(), ray_id))
            .cloned()
            .collect()
    }

    /// Active boundary hooks for any of the given boundary ids.
    pub fn get_ray_bcs(
        &self,
        boundary_ids: &[BoundaryId],
        ray_id: Option<RayId>,
    ) -> Vec<Arc<dyn RayBoundaryCondition>> {
        self.bcs
            .iter()
            .filter(|bc| bc.boundaries().iter().any(|b| boundary_ids.contains(b)))
            .filter(|bc| self.hook_applies_to_ray(bc.ray_names(), ray_id))
            .cloned()
            .collect()
    }

    fn hook_applies_to_ray(&self, ray_names: &[String], ray_id: Option<RayId>) -> bool {
        if !self.cfg.use_ray_registration || ray_names.is_empty() {
            return true;
        }
        let Some(ray_id) = ray_id else {
            return true;
        };
        ray_names
            .iter()
            .any(|name| self.registered_ray_id(name) == Some(ray_id))
    }

    // Geometry caches

    /// Outward normal of a side through the lazy per-thread cache.
    pub fn get_side_normal(&self, elem: ElemId, side: u16, tid: usize) -> Point {
        let mut cache = self.threaded_cached_normals[tid]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *cache
            .entry((elem, side))
            .or_insert_with(|| self.mesh.outward_normal(elem, side))
    }

    /// Whether the ray direction enters through the side (non-positive
    /// dot product with the outward normal, within tolerance).
    pub fn side_is_incoming(&self, elem: ElemId, side: u16, direction: &Point, tid: usize) -> bool {
        self.get_side_normal(elem, side, tid).dot(direction) < TRACE_TOL
    }

    pub fn side_is_non_planar(&self, elem: ElemId, side: u16) -> bool {
        self.non_planar_sides
            .get(elem.0)
            .is_some_and(|sides| sides.get(side as usize).copied().unwrap_or(false))
    }

    pub fn has_non_planar_sides(&self) -> bool {
        self.has_non_planar_sides
    }

    /// Precomputed global max of element hmax over a subdomain; tracing
    /// scales its tolerances by this.
    pub fn subdomain_hmax(&self, subdomain: SubdomainId) -> f64 {
        self.subdomain_hmax.get(&subdomain).copied().unwrap_or(1.0)
    }

    /// Boundary ids with active hooks per side of an element; an empty
    /// slice when the element carries none.
    pub fn get_internal_sidesets(&self, elem: ElemId) -> &[Vec<BoundaryId>] {
        self.internal_sidesets_map
            .get(elem.0)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_internal_sidesets(&self) -> bool {
        !self.internal_sidesets.is_empty()
    }

    pub fn is_rectangular_domain(&self) -> bool {
        self.is_rectangular_domain
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn loose_bounding_box(&self) -> &BoundingBox {
        &self.loose_bbox
    }

    pub fn domain_max_length(&self) -> f64 {
        self.domain_max_length
    }

    pub fn has_same_level_active_elems(&self) -> bool {
        self.has_same_level_active_elems
    }

    pub fn segment_rule(&self) -> &GaussRule {
        &self.segment_rule
    }

    // Setup

    /// Freezes registration and runs the setup scans. Must be called
    /// before the first execution and after every mesh change.
    pub fn initial_setup(&mut self) -> Result<()> {
        self.called_initial_setup = true;
        self.mesh_scans()
    }

    /// Re-runs the scans after the mesh changed.
    pub fn mesh_changed(&mut self) -> Result<()> {
        for cache in &self.threaded_cached_normals {
            cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        self.mesh_scans()
    }

    fn mesh_scans(&mut self) -> Result<()> {
        self.coverage_checks()?;
        self.dependency_checks()?;
        self.traceable_mesh_checks()?;
        self.internal_sideset_setup()?;
        self.non_planar_side_setup();
        self.subdomain_hmax_setup();
        self.domain_setup();
        Ok(())
    }

    fn coverage_checks(&self) -> Result<()> {
        if !self.cfg.ray_kernel_coverage_check {
            return Ok(());
        }
        let mut covered: BTreeSet<SubdomainId> = BTreeSet::new();
        let mut covers_all = false;
        for k in &self.kernels {
            match k.subdomains() {
                None => covers_all = true,
                Some(s) => covered.extend(s.iter().copied()),
            }
        }
        if covers_all {
            return Ok(());
        }
        let missing: Vec<SubdomainId> = self
            .mesh
            .subdomains()
            .iter()
            .filter(|s| !covered.contains(s))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(RayTracingError::setup(format!(
                "subdomains {missing:?} do not have ray kernels defined"
            )));
        }
        Ok(())
    }

    fn dependency_checks(&self) -> Result<()> {
        let kernel_names: Vec<&str> = self.kernels.iter().map(|k| k.name()).collect();
        for k in &self.kernels {
            for dep in k.depends_on() {
                if !kernel_names.contains(&dep.as_str()) {
                    return Err(RayTracingError::setup(format!(
                        "kernel '{}' depends on '{dep}', which does not exist",
                        k.name()
                    )));
                }
            }
        }
        let bc_names: Vec<&str> = self.bcs.iter().map(|b| b.name()).collect();
        for b in &self.bcs {
            for dep in b.depends_on() {
                if !bc_names.contains(&dep.as_str()) {
                    return Err(RayTracingError::setup(format!(
                        "boundary condition '{}' depends on '{dep}', which does not exist",
                        b.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn traceable_mesh_checks(&mut self) -> Result<()> {
        let mut min_level = u32::MAX;
        let mut max_level = 0;
        for e in self.mesh.active_elems() {
            min_level = min_level.min(e.level);
            max_level = max_level.max(e.level);
        }
        self.has_same_level_active_elems = min_level == max_level;
        let refined = max_level > 0;

        for e in self.mesh.active_local_elems(self.rank) {
            if refined {
                if !e.etype.is_adaptivity_traceable() {
                    return Err(RayTracingError::setup(format!(
                        "element type {:?} is not supported in ray tracing with refinement",
                        e.etype
                    )));
                }
            } else if !e.etype.is_traceable() {
                return Err(RayTracingError::setup(format!(
                    "element type {:?} is not supported in ray tracing",
                    e.etype
                )));
            }
        }
        Ok(())
    }

    /// Finds boundary ids with active hooks that sit between two
    /// elements. Internal boundaries must separate different subdomains.
    fn internal_sideset_setup(&mut self) -> Result<()> {
        self.internal_sidesets.clear();
        self.internal_sidesets_map.clear();
        self.internal_sidesets_map
            .resize(self.mesh.n_elems(), Vec::new());

        for (elem, side, bnd_id) in self.mesh.boundary_elems() {
            let e = self.mesh.elem(elem);
            if !e.active() {
                continue;
            }
            let Some(neighbor) = e.neighbors[side as usize] else {
                continue;
            };

            if self.get_ray_bcs(&[bnd_id], None).is_empty() {
                continue;
            }

            if self.mesh.elem(neighbor).subdomain == e.subdomain {
                return Err(RayTracingError::setup(
                    "boundary hooks exist on internal sidesets that are not bounded by a \
                     different subdomain on each side",
                ));
            }

            self.internal_sidesets.insert(bnd_id);

            let entry = &mut self.internal_sidesets_map[elem.0];
            if entry.is_empty() {
                entry.resize(e.n_sides() as usize, Vec::new());
            }
            if !entry[side as usize].contains(&bnd_id) {
                entry[side as usize].push(bnd_id);
            }
        }

        if !self.cfg.use_internal_sidesets && !self.internal_sidesets.is_empty() {
            return Err(RayTracingError::setup(
                "boundary hooks are defined on internal sidesets, but the study is not \
                 configured to use internal sidesets during tracing",
            ));
        }
        Ok(())
    }

    fn non_planar_side_setup(&mut self) {
        self.has_non_planar_sides = false;
        self.non_planar_sides.clear();
        if self.mesh.dim() != 3 {
            return;
        }
        self.non_planar_sides.resize(self.mesh.n_elems(), Vec::new());
        let mut warned = !self.cfg.warn_non_planar;
        for i in 0..self.mesh.n_elems() {
            let elem = ElemId(i);
            if !self.mesh.elem(elem).active() {
                continue;
            }
            let n_sides = self.mesh.elem(elem).n_sides();
            let entry = &mut self.non_planar_sides[i];
            entry.resize(n_sides as usize, false);
            for s in 0..n_sides {
                if self.mesh.side_is_non_planar(elem, s) {
                    entry[s as usize] = true;
                    self.has_non_planar_sides = true;
                    if !warned {
                        warn!(
                            "the mesh contains non-planar faces; tracing on them is an \
                             approximation and may fail"
                        );
                        warned = true;
                    }
                }
            }
        }
    }

    fn subdomain_hmax_setup(&mut self) {
        self.subdomain_hmax.clear();
        // The mesh is replicated, so a full scan gives the global max
        // directly
        for e in self.mesh.active_elems() {
            let entry = self.subdomain_hmax.entry(e.subdomain).or_insert(f64::MIN);
            *entry = entry.max(self.mesh.hmax(e.id));
        }

        if self.cfg.warn_subdomain_hmax {
            for e in self.mesh.active_local_elems(self.rank) {
                let hmin = self.mesh.hmin(e.id);
                let hmax = self.mesh.hmax(e.id);
                let max_hmax = self.subdomain_hmax(e.subdomain);
                let hmax_rel = hmax / max_hmax;
                if !(1.0e-2..=1.0e2).contains(&hmax_rel) {
                    warn!("element hmax varies significantly from subdomain hmax");
                }
                if max_hmax / hmin > 1.0e2 {
                    warn!("element hmin varies significantly from subdomain hmax");
                }
            }
        }
    }

    fn domain_setup(&mut self) {
        self.bbox = self.mesh.bounding_box();
        self.loose_bbox = self.bbox;
        self.loose_bbox.scale(0.01);
        self.domain_max_length = self.mesh.domain_max_length();

        let mut bbox_volume = 1.0;
        for d in 0..self.mesh.dim() as usize {
            bbox_volume *= self.bbox.max[d] - self.bbox.min[d];
        }
        self.is_rectangular_domain =
            (bbox_volume - self.mesh.total_volume()).abs() < 1e-6 * bbox_volume.max(1.0);
    }

    /// Verifies a ray is startable: point inside the loose bounding box,
    /// a valid and containing starting element when set, and a valid
    /// incoming side when set.
    pub fn verify_starting_ray(&self, ray: &Ray) -> Result<()> {
        if !self.cfg.verify_rays {
            return Ok(());
        }
        let Some(point) = ray.current_point() else {
            return Err(ray.contract("the starting point is not set"));
        };
        if !self.loose_bbox.contains_point(&point) {
            return Err(ray.contract("the mesh does not contain the starting point"));
        }
        if let Some(elem) = ray.current_elem() {
            if !self.mesh.elem(elem).active() {
                return Err(ray.contract("the starting element is not active"));
            }
            let mut non_planar_start = false;
            if let Some(side) = ray.current_incoming_side() {
                if side >= self.mesh.elem(elem).n_sides() {
                    return Err(
                        ray.contract("the starting incoming side is not valid for its element")
                    );
                }
                non_planar_start = self.side_is_non_planar(elem, side);
                if !non_planar_start
                    && !self
                        .mesh
                        .side_contains_point(elem, side, &point, crate::geom::LOOSE_TRACE_TOL)
                {
                    return Err(ray.contract(
                        "the starting incoming side does not contain the starting point",
                    ));
                }
            }
            if !non_planar_start
                && !self
                    .mesh
                    .close_to_point(elem, &point, crate::geom::LOOSE_TRACE_TOL)
            {
                return Err(
                    ray.contract("the starting element does not contain the starting point")
                );
            }
        } else if ray.current_incoming_side().is_some() {
            return Err(
                ray.contract("the starting incoming side is set but the starting element is not")
            );
        }
        Ok(())
    }

    // Execution bookkeeping

    /// Resets per-execution state; called by the executor before
    /// generation.
    pub fn pre_execute(&mut self) {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = StudyCounters::default();
        let mut bank = self.ray_bank.lock().unwrap_or_else(|e| e.into_inner());
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.extend(bank.drain(..));
        drop(bank);
        drop(pool);
        self.cached_traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.trace_results.lock().unwrap_or_else(|e| e.into_inner()) = Vec::new();
        self.global_counters = None;
        for k in &self.kernels {
            k.pre_execute_study();
        }
        for b in &self.bcs {
            b.pre_execute_study();
        }
    }

    /// Completion callback: aggregates counters and banks the ray.
    pub fn on_complete_ray(&self, ray: Ray) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.rays_completed += 1;
        counters.total_processor_crossings += ray.processor_crossings() as u64;
        counters.max_processor_crossings =
            counters.max_processor_crossings.max(ray.processor_crossings());
        counters.total_intersections += ray.intersections() as u64;
        counters.max_intersections = counters.max_intersections.max(ray.intersections());
        counters.max_trajectory_changes =
            counters.max_trajectory_changes.max(ray.trajectory_changes());
        counters.total_distance += ray.distance();
        drop(counters);

        if self.cfg.bank_rays_on_completion {
            self.ray_bank
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ray);
        } else {
            self.release_ray(ray);
        }
    }

    pub(crate) fn add_tolerated_failures(&self, count: u64) {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tolerated_failures += count;
    }

    pub fn counters(&self) -> StudyCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counters reduced over all ranks; available after execution.
    pub fn global_counters(&self) -> Option<StudyCounters> {
        self.global_counters
    }

    pub(crate) fn set_global_counters(&mut self, counters: StudyCounters) {
        self.global_counters = Some(counters);
    }

    pub fn timings(&self) -> StudyTimings {
        self.timings
    }

    pub(crate) fn set_timings(&mut self, timings: StudyTimings) {
        self.timings = timings;
    }

    // Bank access

    pub fn banked_rays(&self) -> Vec<Ray> {
        self.ray_bank
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_banked_ray(&self, id: RayId) -> Option<Ray> {
        self.ray_bank
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id() == id)
            .cloned()
    }

    pub fn banked_ray_data(&self, id: RayId, index: usize) -> Option<f64> {
        self.get_banked_ray(id).map(|r| r.data()[index])
    }

    pub fn banked_ray_aux_data(&self, id: RayId, index: usize) -> Option<f64> {
        self.get_banked_ray(id).map(|r| r.aux_data()[index])
    }

    // Trace caches and results

    pub(crate) fn add_cached_traces(&self, traces: Vec<TraceData>) {
        self.cached_traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(traces);
    }

    pub fn cached_traces(&self) -> Vec<TraceData> {
        self.cached_traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn add_trace_results(&self, results: &[u64]) {
        let mut stored = self.trace_results.lock().unwrap_or_else(|e| e.into_inner());
        if stored.len() < results.len() {
            stored.resize(results.len(), 0);
        }
        for (slot, value) in stored.iter_mut().zip(results) {
            *slot += value;
        }
    }

    /// Per-rank tracer result counters, indexed by
    /// [`crate::tracer::TraceResult`].
    pub fn trace_results(&self) -> Vec<u64> {
        self.trace_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // Checkpointing

    pub fn checkpoint(&self) -> StudyCheckpoint {
        StudyCheckpoint {
            registered_ray_names: self
                .registered_rays
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .1
                .clone(),
            counters: self.counters(),
        }
    }

    pub fn restore_checkpoint(&mut self, checkpoint: &StudyCheckpoint) {
        {
            let mut tables = self.registered_rays.lock().unwrap_or_else(|e| e.into_inner());
            tables.0.clear();
            tables.1.clear();
        }
        for name in &checkpoint.registered_ray_names {
            self.register_ray(name.clone());
        }
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.counters;
    }
}
