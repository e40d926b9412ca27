use std::sync::Arc;

use super::*;
use crate::hooks::{DistanceKernel, KillBc};
use crate::mesh::Mesh;
use crate::study::StudyConfig;

fn study_over(mesh: Mesh, configure: impl FnOnce(&mut RayStudy)) -> RayStudy {
    let mut study = RayStudy::new(Arc::new(mesh), 0, StudyConfig::default());
    configure(&mut study);
    study.initial_setup().unwrap();
    study
}

fn kill_all_bc(mesh: &Mesh) -> KillBc {
    KillBc::new("kill", mesh.all_boundary_ids())
}

#[test]
fn traces_across_a_quad_grid() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let kill = Arc::new(kill_all_bc(&mesh));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study.add_bc(kill.clone()).unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.1, 0.25, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert!(!ray.should_continue());
    // Two quads along the path
    assert_eq!(ray.intersections(), 2);
    assert!((ray.distance() - 0.9).abs() < 1e-10);
    assert!((ray.data()[0] - 0.9).abs() < 1e-10);
    assert!(crate::geom::points_fuzzy_eq(
        &ray.current_point().unwrap(),
        &Point::new(1.0, 0.25, 0.0),
        1e-10
    ));
    assert_eq!(tracer.results()[TraceResult::Intersections as usize], 2);
    assert_eq!(tracer.results()[TraceResult::FaceHits as usize], 2);
}

#[test]
fn max_distance_terminates_inside_an_element() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.1, 0.25, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    ray.set_starting_max_distance(0.6).unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert!((ray.distance() - 0.6).abs() < 1e-10);
    // The endpoint is interior, so no outgoing side is reported
    assert!(crate::geom::points_fuzzy_eq(
        &ray.current_point().unwrap(),
        &Point::new(0.7, 0.25, 0.0),
        1e-10
    ));
}

#[test]
fn end_point_ray_lands_on_its_end() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.0, 0.0, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_end_point(Point::new(1.0, 1.0, 0.0)).unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert!(ray.at_end().unwrap());
    assert!((ray.distance() - 2.0f64.sqrt()).abs() < 1e-8);
}

#[test]
fn stationary_ray_reports_without_tracing() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.25, 0.25, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_stationary().unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert_eq!(ray.intersections(), 0);
    assert_eq!(ray.distance(), 0.0);
    assert_eq!(tracer.results()[TraceResult::EndedStationary as usize], 1);
    // The kernel saw a zero-length segment
    assert_eq!(ray.data()[0], 0.0);
}

#[test]
fn unresolved_external_boundary_fails_or_is_tolerated() {
    // No boundary hooks registered at all
    let mesh = Mesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    assert!(tracer.trace(&mut ray).is_err());

    // Tolerant mode: warn and kill instead
    let mesh = Mesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0));
    let mut study = RayStudy::new(
        Arc::new(mesh),
        0,
        StudyConfig {
            tolerate_failure: true,
            ray_kernel_coverage_check: false,
            ..StudyConfig::default()
        },
    );
    study.initial_setup().unwrap();

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.5, 0.5, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();
    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert!(!ray.should_continue());
    assert_eq!(tracer.results()[TraceResult::FailedTraces as usize], 1);
}

#[test]
fn trace_through_a_1d_mesh() {
    let mesh = Mesh::line(2, 0.0, 1.0);
    let kill = Arc::new(kill_all_bc(&mesh));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study.add_bc(kill).unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.1, 0.0, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert_eq!(ray.intersections(), 2);
    assert!((ray.distance() - 0.9).abs() < 1e-12);
    assert!(crate::geom::points_fuzzy_eq(
        &ray.current_point().unwrap(),
        &Point::new(1.0, 0.0, 0.0),
        1e-10
    ));
}

#[test]
fn grazes_a_shared_corner_through_neighbors() {
    // A diagonal ray through the exact center of a 2x2 grid must cross
    // into the opposite quad through the shared vertex
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    let kill = Arc::new(kill_all_bc(&mesh));
    let study = study_over(mesh, |study| {
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study.add_bc(kill).unwrap();
    });

    let mut tracer = Tracer::new(&study, 0);
    let mut ray = study.acquire_ray();
    ray.set_start(Point::new(0.25, 0.25, 0.0), Some(ElemId(0)), None)
        .unwrap();
    ray.set_starting_direction(Point::new(1.0, 1.0, 0.0)).unwrap();

    let outcome = tracer.trace(&mut ray).unwrap();
    assert_eq!(outcome, TraceOutcome::Completed);
    assert!(!ray.should_continue());
    let total = 0.75 * 2.0f64.sqrt();
    assert!((ray.distance() - total).abs() < 1e-8);
    assert!(tracer.results()[TraceResult::VertexHits as usize] >= 1);
    assert!(tracer.results()[TraceResult::MovedThroughNeighbors as usize] >= 1);
}

#[test]
fn hex_trace_with_backface_culling_disabled_matches(
) {
    for culling in [true, false] {
        let mesh = Mesh::hex_grid(3, 1, 1, (0.0, 3.0), (0.0, 1.0), (0.0, 1.0));
        let kill = Arc::new(kill_all_bc(&mesh));
        let mut study = RayStudy::new(
            Arc::new(mesh),
            0,
            StudyConfig {
                backface_culling: culling,
                ..StudyConfig::default()
            },
        );
        let index = study.register_ray_data("distance").unwrap();
        study
            .add_kernel(Arc::new(DistanceKernel::new("distance", index)))
            .unwrap();
        study.add_bc(kill).unwrap();
        study.initial_setup().unwrap();

        let mut tracer = Tracer::new(&study, 0);
        let mut ray = study.acquire_ray();
        ray.set_start(Point::new(0.2, 0.4, 0.6), Some(ElemId(0)), None)
            .unwrap();
        ray.set_starting_direction(Point::new(1.0, 0.0, 0.0)).unwrap();

        tracer.trace(&mut ray).unwrap();
        assert_eq!(ray.intersections(), 3, "culling = {culling}");
        assert!((ray.distance() - 2.8).abs() < 1e-9, "culling = {culling}");
        if culling {
            assert!(tracer.results()[TraceResult::BackfaceCullingSuccesses as usize] > 0);
        }
    }
}
