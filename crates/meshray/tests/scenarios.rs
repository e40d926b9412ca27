//! End-to-end scenarios: generation, claiming, propagation, handoff,
//! and hook dispatch over real meshes.

use std::sync::Arc;

use meshray::prelude::*;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn solo_study(mesh: Mesh, cfg: StudyConfig, configure: impl FnOnce(&mut RayStudy)) -> RayStudy {
    let mut study = RayStudy::new(Arc::new(mesh), 0, cfg);
    configure(&mut study);
    study.initial_setup().unwrap();
    study
}

fn kill_all_bc(mesh: &Mesh) -> Arc<KillBc> {
    Arc::new(KillBc::new("kill", mesh.all_boundary_ids()))
}

/// Two 1D segments, an unbounded ray counts its
/// intersections and dies on the far boundary.
#[test]
fn scenario_1d_traversal() {
    init_logging();
    let mesh = Mesh::line(2, 0.0, 1.0);
    let kill = kill_all_bc(&mesh);
    let mut study = solo_study(mesh, StudyConfig::default(), |study| {
        let index = study.register_ray_data("count").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("count", index)))
            .unwrap();
        study.add_bc(kill).unwrap();
    });

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.1, 0.0, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    let id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let banked = study.get_banked_ray(id).unwrap();
    assert_eq!(banked.intersections(), 2);
    assert!((banked.distance() - 0.9).abs() < 1e-10);
    assert!(!banked.should_continue());
    let end = banked.current_point().unwrap();
    assert!((end - Point::new(1.0, 0.0, 0.0)).norm() < 1e-10);

    let counters = study.global_counters().unwrap();
    assert_eq!(counters.total_intersections, 2);
    assert_eq!(counters.rays_completed, 1);
}

/// Line integral of u^2 over the diagonal of a 2x2 quad
/// mesh with u = 1 everywhere: the result is the diagonal length.
#[test]
fn scenario_line_integral() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let mut study = solo_study(mesh, StudyConfig::default(), |study| {
        let index = study.register_ray_data("integral").unwrap();
        let u = |_: &Point| 1.0;
        study
            .add_kernel(Arc::new(IntegralKernel::new(
                "u_squared",
                index,
                move |p: &Point| u(p) * u(p),
            )))
            .unwrap();
    });

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.0, 0.0, 0.0), None, None).unwrap();
    ray.set_starting_end_point(Point::new(1.0, 1.0, 0.0)).unwrap();
    let id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let value = study.banked_ray_data(id, 0).unwrap();
    assert!((value - 2.0f64.sqrt()).abs() < 1e-8);
}

/// Reflecting corner: a bounded ray in a single quad
/// reflects off every wall until its max distance runs out.
#[test]
fn scenario_reflecting_corner() {
    let mesh = Mesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0));
    let reflect = Arc::new(ReflectBc::new("reflect", mesh.all_boundary_ids()));
    let mut study = solo_study(
        mesh,
        StudyConfig {
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |study| {
            study.add_bc(reflect).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 1.0, 0.0)).unwrap();
    ray.set_starting_max_distance(10.0).unwrap();
    let id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let banked = study.get_banked_ray(id).unwrap();
    assert!(banked.intersections() >= 7);
    assert!((banked.distance() - 10.0).abs() < 1e-8);
    assert!(banked.trajectory_changes() >= 7);
    assert!(!banked.should_continue());
}

/// Cross-rank handoff: a strip of hexes, one per rank; a
/// ray crosses all of them and banks on the last rank only.
#[test]
fn scenario_cross_rank_handoff() {
    let mut mesh = Mesh::hex_grid(4, 1, 1, (0.0, 4.0), (0.0, 1.0), (0.0, 1.0));
    mesh.partition_slabs_x(4);
    let mesh = Arc::new(mesh);
    let boundaries = mesh.all_boundary_ids();

    let results = execute_on_ranks(4, |mut comm| {
        let rank = comm.rank();
        let mut study = RayStudy::new(mesh.clone(), rank, StudyConfig::default());
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study
            .add_bc(Arc::new(KillBc::new("kill", boundaries.clone())))
            .unwrap();
        study.initial_setup().unwrap();

        let rays = if rank == 0 {
            let mut ray = study.acquire_ray();
            ray.set_start(Point::new(0.1, 0.5, 0.5), None, None).unwrap();
            ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
            vec![ray]
        } else {
            Vec::new()
        };
        let mut generator = LocalRayGenerator::new(rays);
        execute_study(&mut study, &mut comm, &mut generator)?;
        Ok(study.banked_rays())
    })
    .unwrap();

    // Banked on the last rank, nowhere else
    for (rank, banked) in results.iter().enumerate() {
        if rank == 3 {
            assert_eq!(banked.len(), 1);
        } else {
            assert!(banked.is_empty(), "rank {rank} banked a ray");
        }
    }

    let ray = &results[3][0];
    assert_eq!(ray.processor_crossings(), 3);
    assert_eq!(ray.intersections(), 4);
    assert!((ray.distance() - 3.9).abs() < 1e-9);
    assert!((ray.data()[0] - 3.9).abs() < 1e-9);
}

/// Replicated ray claim: a single replicated ray is owned
/// by exactly one rank, chosen by the even-id smallest-elem tie-break.
#[test]
fn scenario_replicated_claim() {
    let mut mesh = Mesh::hex_grid(2, 2, 2, (0.0, 1.0), (0.0, 1.0), (0.0, 1.0));
    mesh.partition_slabs_x(4);
    let mesh = Arc::new(mesh);
    let boundaries = mesh.all_boundary_ids();

    let results = execute_on_ranks(4, |mut comm| {
        let rank = comm.rank();
        let mut study = RayStudy::new(mesh.clone(), rank, StudyConfig::default());
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study
            .add_bc(Arc::new(KillBc::new("kill", boundaries.clone())))
            .unwrap();
        study.initial_setup().unwrap();

        let definitions = vec![RayDefinition::new(
            Point::new(0.5, 0.5, 0.5),
            Trajectory::Direction(Point::new(0.0, 0.0, 1.0)),
        )];
        let mut generator = RepeatableGenerator::new(definitions);
        execute_study(&mut study, &mut comm, &mut generator)?;
        Ok((study.counters().rays_completed, study.banked_rays()))
    })
    .unwrap();

    // Exactly one rank owns and completes the ray
    let completed: u64 = results.iter().map(|(n, _)| n).sum();
    assert_eq!(completed, 1);

    // Ray id 0 is even, so the smallest containing element (ElemId(0),
    // on rank 0) was claimed; the ray travels +z and crosses one
    // partition boundary before banking
    let banked: Vec<_> = results.iter().flat_map(|(_, b)| b).collect();
    assert_eq!(banked.len(), 1);
    assert_eq!(banked[0].id(), RayId(0));
    assert_eq!(banked[0].processor_crossings(), 1);
    assert!((banked[0].distance() - 0.5).abs() < 1e-9);
}

/// Repeated executions of a repeatable generator claim once and produce
/// identical results each time.
#[test]
fn repeatable_generator_is_deterministic_across_runs() {
    let mut mesh = Mesh::quad_grid(4, 1, (0.0, 4.0), (0.0, 1.0));
    mesh.partition_slabs_x(2);
    let mesh = Arc::new(mesh);
    let boundaries = mesh.all_boundary_ids();

    let results = execute_on_ranks(2, |mut comm| {
        let rank = comm.rank();
        let mut study = RayStudy::new(mesh.clone(), rank, StudyConfig::default());
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study
            .add_bc(Arc::new(KillBc::new("kill", boundaries.clone())))
            .unwrap();
        study.initial_setup().unwrap();

        let definitions = vec![RayDefinition::new(
            Point::new(0.2, 0.5, 0.0),
            Trajectory::Direction(Point::new(1.0, 0.0, 0.0)),
        )];
        let mut generator = RepeatableGenerator::new(definitions);

        let mut distances = Vec::new();
        for _ in 0..3 {
            execute_study(&mut study, &mut comm, &mut generator)?;
            let total = study.global_counters().unwrap().total_distance;
            distances.push(total);
        }
        Ok(distances)
    })
    .unwrap();

    for distances in &results {
        assert!((distances[0] - 3.8).abs() < 1e-9);
        assert!((distances[1] - distances[0]).abs() < 1e-12);
        assert!((distances[2] - distances[0]).abs() < 1e-12);
    }
}

/// A corner where two boundary sidesets meet: the hook runs once per
/// boundary with `num_applying` reflecting simultaneous application.
#[test]
fn corner_reports_num_applying() {
    let mesh = Mesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0));
    let recorder = Arc::new(NullBc::new("recorder", mesh.all_boundary_ids()));
    let kill = kill_all_bc(&mesh);
    let mut study = solo_study(
        mesh,
        StudyConfig {
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |study| {
            study.add_bc(recorder.clone()).unwrap();
            study.add_bc(kill).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.25, 0.25, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 1.0, 0.0)).unwrap();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    // The ray hits the (1, 1) corner where boundaries 1 (right) and 2
    // (top) meet; the recorder fires once per boundary, each aware it is
    // applied twice at this point
    let hits = recorder.hits();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|(_, n)| *n == 2));
    let ids: Vec<u32> = hits.iter().map(|(id, _)| *id).collect();
    assert!(ids.contains(&1) && ids.contains(&2));
}

/// A 3D corner where three boundary sidesets meet: each distinct
/// boundary fires once, aware that the hook applies to three at once.
#[test]
fn three_boundary_corner_in_3d() {
    let mesh = Mesh::hex_grid(1, 1, 1, (0.0, 1.0), (0.0, 1.0), (0.0, 1.0));
    let recorder = Arc::new(NullBc::new("recorder", mesh.all_boundary_ids()));
    let kill = kill_all_bc(&mesh);
    let mut study = solo_study(
        mesh,
        StudyConfig {
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |study| {
            study.add_bc(recorder.clone()).unwrap();
            study.add_bc(kill).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.5), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 1.0, 1.0)).unwrap();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    // The (1, 1, 1) corner touches the x+, y+, and z+ faces (ids 2, 3,
    // and 5 on a hex grid)
    let hits = recorder.hits();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|(_, n)| *n == 3));
    let mut ids: Vec<u32> = hits.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![2, 3, 5]);

    // The banked ray carries no incoming side on an external termination
    let banked = &study.banked_rays()[0];
    assert!(banked.current_incoming_side().is_none());
    assert!(!banked.should_continue());
}

/// Internal sidesets: hooks fire when crossing a subdomain-separating
/// boundary and may redirect the ray.
#[test]
fn internal_boundary_hooks_fire_on_crossing() {
    let mut mesh = Mesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0));
    mesh.assign_subdomains(|c| if c.x < 1.0 { 0 } else { 1 });
    // Mark both faces of the interface
    mesh.add_boundary_id(ElemId(0), 1, 10);
    mesh.add_boundary_id(ElemId(1), 3, 10);

    let recorder = Arc::new(NullBc::new("recorder", vec![10]));
    // Kill only on the outer walls, not the interface
    let kill = Arc::new(KillBc::new("kill", vec![0, 1, 2, 3]));
    let mut study = solo_study(
        mesh,
        StudyConfig {
            use_internal_sidesets: true,
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |study| {
            study.add_bc(recorder.clone()).unwrap();
            study.add_bc(kill).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    // One crossing of the internal sideset, one distinct boundary id
    let hits = recorder.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0], (10, 1));
}

/// Data freeze (scenario 6 lives in the study unit tests); here the
/// aux accumulation path: a shared per-element accumulator under a lock.
#[test]
fn aux_accumulation_collects_per_element_lengths() {
    let mesh = Mesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0));
    let n_elems = mesh.n_elems();
    let kill = kill_all_bc(&mesh);
    let accumulator = Arc::new(std::sync::Mutex::new(vec![0.0; n_elems]));
    let mut study = solo_study(mesh, StudyConfig::default(), |study| {
        study
            .add_kernel(Arc::new(meshray::hooks::AuxAccumulationKernel::new(
                "aux",
                accumulator.clone(),
            )))
            .unwrap();
        study.add_bc(kill).unwrap();
    });

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.0, 0.5, 0.0), Some(ElemId(0)), Some(3))
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let acc = accumulator.lock().unwrap();
    assert!((acc[0] - 1.0).abs() < 1e-10);
    assert!((acc[1] - 1.0).abs() < 1e-10);
}

/// Spawned child rays are traced within the same execution.
#[test]
fn boundary_hooks_can_spawn_child_rays() {
    struct SplitBc {
        boundaries: Vec<BoundaryId>,
    }
    impl RayBoundaryCondition for SplitBc {
        fn name(&self) -> &str {
            "split"
        }
        fn boundaries(&self) -> &[BoundaryId] {
            &self.boundaries
        }
        fn on_boundary(
            &self,
            ctx: &mut BoundaryCtx<'_>,
            _num_applying: usize,
        ) -> Result<(), RayTracingError> {
            // Spawn a child going back the other way at the right wall
            // only, then die; the child dies plainly at the left wall
            if ctx.boundary_id() == 1 {
                let direction = ctx.ray().direction().unwrap() * -1.0;
                let child = ctx.acquire_ray(direction)?;
                ctx.move_ray_to_buffer(child);
            }
            ctx.set_should_continue(false)
        }
    }

    let mesh = Mesh::line(2, 0.0, 1.0);
    let boundaries = mesh.all_boundary_ids();
    let mut study = solo_study(
        mesh,
        StudyConfig {
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |study| {
            study.add_bc(Arc::new(SplitBc { boundaries })).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.1, 0.0, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    let parent_id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let banked = study.banked_rays();
    assert_eq!(banked.len(), 2);
    let child = banked.iter().find(|r| r.id() != parent_id).unwrap();
    // The child traced from x = 1 back to x = 0
    assert!((child.distance() - 1.0).abs() < 1e-9);
}

/// Trace caching records the segment points of completed rays.
#[test]
fn trace_cache_records_points() {
    let mesh = Mesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0));
    let kill = kill_all_bc(&mesh);
    let mut study = solo_study(
        mesh,
        StudyConfig {
            cache_traces: true,
            segments_on_cache_traces: true,
            data_on_cache_traces: true,
            ..StudyConfig::default()
        },
        |study| {
            let index = study.register_ray_data("distance").unwrap();
            study
                .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
                .unwrap();
            study.add_bc(kill).unwrap();
        },
    );

    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.0, 0.5, 0.0), Some(ElemId(0)), Some(3))
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    let id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let traces = study.cached_traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.ray_id, id);
    assert_eq!(trace.intersections, 2);
    // Start plus one point per segment
    assert_eq!(trace.points.len(), 3);
    assert!((trace.points[1].point.x - 1.0).abs() < 1e-10);
    // Data snapshots grow along the path
    assert!(trace.points[2].data[0] > trace.points[1].data[0]);
}

/// Packed handoff conservation: total sends equal total receives, and
/// per-ray counters survive serialization (invariant 4).
#[test]
fn handoff_counts_are_conserved() {
    let mut mesh = Mesh::quad_grid(4, 1, (0.0, 4.0), (0.0, 1.0));
    mesh.partition_slabs_x(2);
    let mesh = Arc::new(mesh);
    let boundaries = mesh.all_boundary_ids();

    let results = execute_on_ranks(2, |mut comm| {
        let rank = comm.rank();
        let mut study = RayStudy::new(mesh.clone(), rank, StudyConfig::default());
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study
            .add_bc(Arc::new(KillBc::new("kill", boundaries.clone())))
            .unwrap();
        study.initial_setup().unwrap();

        // One ray per rank, both crossing the partition boundary
        let mut ray = study.acquire_ray();
        if rank == 0 {
            ray.set_start(Point::new(0.5, 0.5, 0.0), None, None).unwrap();
            ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
        } else {
            ray.set_start(Point::new(3.5, 0.5, 0.0), None, None).unwrap();
            ray.set_starting_direction(Point::new(-1.0, 0.0, 0.0)).unwrap();
        }
        let mut generator = LocalRayGenerator::new(vec![ray]);
        execute_study(&mut study, &mut comm, &mut generator)?;

        let (sent, received) = comm.transfer_counts();
        Ok((sent, received, study.counters()))
    })
    .unwrap();

    let (sent, received, _) = results[0];
    assert_eq!(sent, received);
    assert_eq!(sent, 2);

    let total_crossings: u64 = results.iter().map(|(_, _, c)| c.total_processor_crossings).sum();
    assert_eq!(total_crossings, 2);
}

/// No ray id appears in two banks (invariant 7), even with many rays
/// and multiple worker threads per rank.
#[test]
fn banked_ids_are_globally_unique() {
    let mut mesh = Mesh::quad_grid(8, 2, (0.0, 8.0), (0.0, 2.0));
    mesh.partition_slabs_x(2);
    let mesh = Arc::new(mesh);
    let boundaries = mesh.all_boundary_ids();

    let results = execute_on_ranks(2, |mut comm| {
        let rank = comm.rank();
        let cfg = StudyConfig {
            n_threads: 2,
            ..StudyConfig::default()
        };
        let mut study = RayStudy::new(mesh.clone(), rank, cfg);
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study
            .add_bc(Arc::new(KillBc::new("kill", boundaries.clone())))
            .unwrap();
        study.initial_setup().unwrap();

        // A fan of rays from each rank's side
        let mut rays = Vec::new();
        for i in 0..10 {
            let y = 0.05 + 0.19 * i as f64;
            let mut ray = study.acquire_ray();
            let x = if rank == 0 { 0.1 } else { 7.9 };
            let direction = if rank == 0 { 1.0 } else { -1.0 };
            ray.set_start(Point::new(x, y, 0.0), None, None).unwrap();
            ray.set_starting_direction(Point::new(direction, 0.0, 0.0))
                .unwrap();
            rays.push(ray);
        }
        let mut generator = LocalRayGenerator::new(rays);
        execute_study(&mut study, &mut comm, &mut generator)?;
        Ok(study.banked_rays().iter().map(|r| r.id()).collect::<Vec<_>>())
    })
    .unwrap();

    let mut all_ids: Vec<RayId> = results.into_iter().flatten().collect();
    assert_eq!(all_ids.len(), 20);
    all_ids.sort();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 20, "a ray id was banked twice");
}

/// A seeded random fan claims deterministically and every ray resolves
/// on the boundary.
#[test]
fn random_fan_is_replayable() {
    init_logging();
    let run = |seed: u64| {
        let mesh = Mesh::quad_grid(4, 4, (0.0, 1.0), (0.0, 1.0));
        let kill = kill_all_bc(&mesh);
        let mut study = solo_study(mesh, StudyConfig::default(), |study| {
            let index = study.register_ray_data("distance").unwrap();
            study
                .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
                .unwrap();
            study.add_bc(kill).unwrap();
        });

        let mut comm = solo_comm();
        let mut generator = RandomFanGenerator::new(Point::new(0.3, 0.6, 0.0), 25, seed);
        execute_study(&mut study, &mut comm, &mut generator).unwrap();
        (study.counters().rays_completed, study.counters().total_distance)
    };

    let (completed_a, distance_a) = run(42);
    let (completed_b, distance_b) = run(42);
    assert_eq!(completed_a, 25);
    assert_eq!(completed_a, completed_b);
    assert!((distance_a - distance_b).abs() < 1e-12);
    assert!(distance_a > 0.0);
}

/// Tolerant mode counts failures and the run proceeds.
#[test]
fn tolerated_failures_are_counted() {
    let mesh = Mesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0));
    let mut study = solo_study(
        mesh,
        StudyConfig {
            tolerate_failure: true,
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
        |_| {},
    );

    // No boundary hooks: the external boundary cannot be resolved
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.0), None, None).unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    assert_eq!(study.counters().tolerated_failures, 1);
    assert_eq!(study.counters().rays_completed, 1);
}

/// Tracing through a non-conforming (refined) mesh descends into the
/// active children across the hanging interface.
#[test]
fn traces_through_refined_interface() {
    let mut mesh = Mesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0));
    mesh.refine(ElemId(0)).unwrap();
    mesh.prepare();
    let kill = kill_all_bc(&mesh);

    let mut study = solo_study(mesh, StudyConfig::default(), |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study.add_bc(kill).unwrap();
    });

    // Right to left: coarse elem first, then two refined children
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(1.9, 0.25, 0.0), Some(ElemId(1)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(-1.0, 0.0, 0.0)).unwrap();
    let id = ray.id();

    let mut comm = solo_comm();
    let mut generator = LocalRayGenerator::new(vec![ray]);
    execute_study(&mut study, &mut comm, &mut generator).unwrap();

    let banked = study.get_banked_ray(id).unwrap();
    // One coarse segment plus two fine segments
    assert_eq!(banked.intersections(), 3);
    assert!((banked.distance() - 1.9).abs() < 1e-9);
    assert!((banked.data()[0] - 1.9).abs() < 1e-9);
}
