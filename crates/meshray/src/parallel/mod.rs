//! The parallel executor: owns the work buffer and inter-rank transport,
//! drives generation, claiming, propagation, and termination.

mod buffer;
mod comm;
mod pack;

pub use buffer::WorkBuffer;
pub use comm::{make_comms, solo_comm, RankComm};
pub use pack::{pack_ray, packed_size, unpack_ray, HEADER_WORDS};

pub use crate::study::BufferPolicy;

use std::collections::HashSet;
use std::time::Instant;

use tracing::{info, warn};

use crate::claim::claim_rays;
use crate::error::{RayTracingError, Result};
use crate::generate::RayGenerator;
use crate::ray::Ray;
use crate::study::{RayStudy, StudyCounters, StudyTimings};
use crate::tracer::{TraceOutcome, TraceResult, Tracer};

/// Runs `f` once per rank, each on its own thread with its own
/// communicator, and returns the per-rank results ordered by rank.
pub fn execute_on_ranks<T, F>(n_ranks: u32, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(RankComm) -> Result<T> + Sync,
{
    let comms = make_comms(n_ranks);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(RayTracingError::setup("a rank thread panicked")),
            })
            .collect()
    })
}

/// Executes one full study cycle on this rank: generation, claiming,
/// distributed propagation until global quiescence, and counter
/// reduction.
pub fn execute_study(
    study: &mut RayStudy,
    comm: &mut RankComm,
    generator: &mut dyn RayGenerator,
) -> Result<()> {
    let execution_start = Instant::now();
    study.pre_execute();

    // Generation
    let generation_start = Instant::now();
    let mut rays = generator.generate(study)?;

    if generator.needs_claim() {
        rays = claim_rays(study, comm, rays, false)?;
        generator.post_claim(study, &rays)?;
    } else {
        // Locally generated rays: resolve missing starting elements with
        // the local point locator and keep only the local ones
        let mesh = study.mesh();
        let rank = study.rank();
        let mut local = Vec::with_capacity(rays.len());
        for mut ray in rays {
            if ray.current_elem().is_none() {
                let Some(point) = ray.current_point() else {
                    return Err(ray.contract("generated a ray with no starting point"));
                };
                if let Some(elem) = mesh.locate_point(&point, Some(rank)) {
                    ray.set_start(point, Some(elem), ray.current_incoming_side())?;
                }
            }
            match ray.current_elem() {
                Some(elem) if mesh.elem(elem).processor_id == rank => local.push(ray),
                _ => study.release_ray(ray),
            }
        }
        rays = local;
    }

    for ray in &rays {
        study.verify_starting_ray(ray)?;
    }

    if study.cfg().verify_rays {
        verify_unique_ray_ids(comm, &rays)?;
    }

    let mut buffer = WorkBuffer::new(study.cfg().buffer_policy);
    comm.add_live_rays(rays.len());
    for ray in rays {
        buffer.push(ray);
    }
    let generation_time = generation_start.elapsed();

    // Propagation
    let propagation_start = Instant::now();
    if let Err(err) = propagate(study, comm, &mut buffer) {
        comm.abort();
        return Err(err);
    }
    let propagation_time = propagation_start.elapsed();

    // Reduce counters over all ranks
    let local_counters = study.counters();
    let gathered = comm.allgather(local_counters);
    let mut global = StudyCounters::default();
    for counters in &gathered {
        global.merge(counters);
    }
    study.set_global_counters(global);

    if study.cfg().tolerate_failure && global.tolerated_failures > 0 && study.rank() == 0 {
        warn!(
            failures = global.tolerated_failures,
            "ray tracing failures were tolerated"
        );
    }

    study.set_timings(StudyTimings {
        generation: generation_time,
        propagation: propagation_time,
        execution: execution_start.elapsed(),
    });

    info!(
        rank = study.rank(),
        completed = local_counters.rays_completed,
        "study execution finished"
    );
    Ok(())
}

/// Drains the buffer through the tracers until no live rays remain
/// anywhere: all work buffers empty and nothing in flight.
fn propagate(study: &RayStudy, comm: &mut RankComm, buffer: &mut WorkBuffer) -> Result<()> {
    let n_ranks = comm.n_ranks();
    let mut tracers: Vec<Tracer> = (0..study.n_threads())
        .map(|tid| Tracer::new(study, tid))
        .collect();

    // Per-destination send buffers, flushed on threshold or poll
    let mut send_words: Vec<Vec<f64>> = vec![Vec::new(); n_ranks as usize];
    let mut send_counts: Vec<usize> = vec![0; n_ranks as usize];

    while comm.live_rays() > 0 {
        if comm.is_aborted() {
            return Err(RayTracingError::setup("execution aborted by another rank"));
        }
        // Receive handed-off rays
        while let Some((words, count)) = comm.try_recv_packed() {
            let mut offset = 0;
            for _ in 0..count {
                let (ray, used) = unpack_ray(&words[offset..], study)?;
                offset += used;
                buffer.push(ray);
            }
        }

        if buffer.is_empty() {
            std::thread::yield_now();
            continue;
        }

        let chunk = buffer.drain_chunk(study.cfg().chunk_size);
        let outcomes = trace_chunk(&mut tracers, chunk)?;

        // Hooks may have spawned child rays mid-trace; they are local by
        // construction
        for tracer in &mut tracers {
            let spawned = tracer.take_spawned();
            comm.add_live_rays(spawned.len());
            for ray in spawned {
                buffer.push(ray);
            }
        }

        for (ray, outcome) in outcomes {
            match outcome {
                TraceOutcome::Completed => {
                    study.on_complete_ray(ray);
                    comm.ray_completed();
                }
                TraceOutcome::OffRank(dest) => {
                    pack_ray(&ray, &mut send_words[dest as usize])?;
                    send_counts[dest as usize] += 1;
                    study.release_ray(ray);
                    if send_counts[dest as usize] >= study.cfg().send_buffer_size {
                        flush_send(comm, &mut send_words, &mut send_counts, dest);
                    }
                }
            }
        }

        // Poll: everything buffered goes out now
        for dest in 0..n_ranks {
            flush_send(comm, &mut send_words, &mut send_counts, dest);
        }
    }

    for tracer in &mut tracers {
        study.add_tolerated_failures(tracer.results()[TraceResult::FailedTraces as usize]);
        study.add_trace_results(tracer.results());
        study.add_cached_traces(tracer.take_cached_traces());
    }
    Ok(())
}

fn flush_send(
    comm: &RankComm,
    send_words: &mut [Vec<f64>],
    send_counts: &mut [usize],
    dest: u32,
) {
    let dest = dest as usize;
    if send_counts[dest] > 0 {
        comm.send_packed(dest as u32, std::mem::take(&mut send_words[dest]), send_counts[dest]);
        send_counts[dest] = 0;
    }
}

/// Traces a chunk of rays, one worker thread per tracer when more than
/// one is configured. Threads operate on disjoint rays.
fn trace_chunk(
    tracers: &mut [Tracer<'_>],
    chunk: Vec<Ray>,
) -> Result<Vec<(Ray, TraceOutcome)>> {
    if tracers.len() == 1 {
        let tracer = &mut tracers[0];
        return chunk
            .into_iter()
            .map(|mut ray| tracer.trace(&mut ray).map(|outcome| (ray, outcome)))
            .collect();
    }

    let n = tracers.len();
    let mut parts: Vec<Vec<Ray>> = (0..n).map(|_| Vec::new()).collect();
    for (i, ray) in chunk.into_iter().enumerate() {
        parts[i % n].push(ray);
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = tracers
            .iter_mut()
            .zip(parts)
            .map(|(tracer, part)| {
                scope.spawn(move || {
                    part.into_iter()
                        .map(|mut ray| tracer.trace(&mut ray).map(|outcome| (ray, outcome)))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(result) => outcomes.extend(result?),
                Err(_) => return Err(RayTracingError::setup("a tracer thread panicked")),
            }
        }
        Ok(outcomes)
    })
}

/// Rays must be globally unique by id after generation.
fn verify_unique_ray_ids(comm: &mut RankComm, rays: &[Ray]) -> Result<()> {
    let local_ids: Vec<u64> = rays.iter().map(|r| r.id().0).collect();
    let gathered = comm.allgather(local_ids);
    let mut seen = HashSet::new();
    for rank_ids in &gathered {
        for id in rank_ids {
            if !seen.insert(*id) {
                return Err(RayTracingError::setup(format!(
                    "duplicate ray id {id} after generation"
                )));
            }
        }
    }
    Ok(())
}
