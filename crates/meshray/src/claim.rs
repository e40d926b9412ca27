//! Claiming of replicated rays: assigns each ray produced on all ranks
//! to exactly one owning rank.
//!
//! Each rank filters the replicated list against the other ranks'
//! inflated bounding boxes, exchanges the residuals, locates every
//! candidate in its local elements, and applies a deterministic
//! tie-break among the containing elements: the smallest containing
//! element id when the ray id is even, the largest when odd. A
//! verification pass at rank 0 rejects unclaimed and multiply-claimed
//! rays.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{RayTracingError, Result};
use crate::geom::BoundingBox;
use crate::mesh::{ElemId, Mesh};
use crate::parallel::{pack_ray, unpack_ray, RankComm};
use crate::ray::Ray;
use crate::study::RayStudy;

pub struct ClaimRays<'a> {
    study: &'a RayStudy,
    mesh: &'a Mesh,
    rank: u32,
    do_exchange: bool,
    inflated_bboxes: Vec<BoundingBox>,
    elem_point_neighbors: HashMap<ElemId, Vec<ElemId>>,
}

impl<'a> ClaimRays<'a> {
    pub fn new(study: &'a RayStudy, comm: &mut RankComm, do_exchange: bool) -> Self {
        let mesh = study.mesh();
        let rank = comm.rank();

        // Inflate every rank's bounding box a bit so boundary points are
        // considered by all plausible owners
        let local = mesh.local_bounding_box(rank);
        let gathered = comm.allgather([
            local.min.x, local.min.y, local.min.z, local.max.x, local.max.y, local.max.z,
        ]);
        let inflated_bboxes = gathered
            .into_iter()
            .map(|b| {
                let mut bbox = BoundingBox::new(
                    crate::geom::Point::new(b[0], b[1], b[2]),
                    crate::geom::Point::new(b[3], b[4], b[5]),
                );
                bbox.scale(0.01);
                bbox
            })
            .collect();

        // Point neighbors of every active element, for the tie-break
        let mut elem_point_neighbors: HashMap<ElemId, Vec<ElemId>> = HashMap::new();
        for elem in mesh.active_elems() {
            let fill = elem_point_neighbors.entry(elem.id).or_default();
            for v in 0..elem.n_vertices() {
                let node = elem.nodes[v as usize];
                for &neighbor in mesh.node_elems(node) {
                    if neighbor != elem.id && !fill.contains(&neighbor) {
                        fill.push(neighbor);
                    }
                }
            }
        }

        Self {
            study,
            mesh,
            rank,
            do_exchange,
            inflated_bboxes,
            elem_point_neighbors,
        }
    }

    /// Claims `rays`, returning the locally owned subset with starting
    /// elements and incoming sides resolved.
    pub fn claim(&self, comm: &mut RankComm, rays: Vec<Ray>) -> Result<Vec<Ray>> {
        // Exchange: ship rays to ranks whose inflated bbox contains them
        let mut candidates = rays;
        if self.do_exchange {
            let mut to_send: Vec<Vec<f64>> = vec![Vec::new(); comm.n_ranks() as usize];
            for ray in &candidates {
                let Some(point) = ray.current_point() else {
                    return Err(ray.contract("claiming a ray with no starting point"));
                };
                for (pid, bbox) in self.inflated_bboxes.iter().enumerate() {
                    if pid as u32 != self.rank && bbox.contains_point(&point) {
                        pack_ray(ray, &mut to_send[pid])?;
                    }
                }
            }
            let exchanged = comm.allgather(to_send);
            for (src, buffers) in exchanged.into_iter().enumerate() {
                if src as u32 == self.rank {
                    continue;
                }
                let words = &buffers[self.rank as usize];
                let mut offset = 0;
                while offset < words.len() {
                    let (ray, used) = unpack_ray(&words[offset..], self.study)?;
                    offset += used;
                    candidates.push(ray);
                }
            }
        }

        let mut local_rays = Vec::new();
        let mut report: Vec<(u64, bool)> = Vec::with_capacity(candidates.len());
        for mut ray in candidates {
            let claimed = self.possibly_claim(&mut ray)?;
            report.push((ray.id().0, claimed));
            if claimed {
                self.study.verify_starting_ray(&ray)?;
                local_rays.push(ray);
            } else {
                self.study.release_ray(ray);
            }
        }

        debug!(rank = self.rank, claimed = local_rays.len(), "claimed rays");

        if self.study.cfg().verify_rays {
            self.verify_claiming(comm, &report)?;
        }

        Ok(local_rays)
    }

    fn possibly_claim(&self, ray: &mut Ray) -> Result<bool> {
        let Some(point) = ray.current_point() else {
            return Err(ray.contract("claiming a ray with no starting point"));
        };

        let Some(located) = self.mesh.locate_point(&point, Some(self.rank)) else {
            return Ok(false);
        };

        // Smallest containing element id for even ids, largest for odd,
        // so claiming is deterministic and globally exclusive
        let smallest = ray.id().0 % 2 == 0;
        let mut extremum = located;
        if let Some(neighbors) = self.elem_point_neighbors.get(&located) {
            for &neighbor in neighbors {
                let candidate = (smallest && neighbor < extremum) || (!smallest && neighbor > extremum);
                if candidate && self.mesh.close_to_point(neighbor, &point, crate::geom::LOOSE_TRACE_TOL)
                {
                    extremum = neighbor;
                }
            }
        }

        if self.mesh.elem(extremum).processor_id != self.rank {
            return Ok(false);
        }

        // Resolve the starting incoming side: keep a valid user-set one,
        // otherwise search for a side that contains the point and that
        // the direction enters through
        let direction = ray.direction();
        let side_ok = |side: u16| -> bool {
            self.mesh
                .side_contains_point(extremum, side, &point, crate::geom::LOOSE_TRACE_TOL)
                && direction.is_some_and(|d| self.study.side_is_incoming(extremum, side, &d, 0))
        };
        let mut incoming_side = ray.current_incoming_side().filter(|s| side_ok(*s));
        if incoming_side.is_none() {
            incoming_side =
                (0..self.mesh.elem(extremum).n_sides()).find(|s| side_ok(*s));
        }

        ray.set_start(point, Some(extremum), incoming_side)?;
        Ok(true)
    }

    /// Collects claim reports at rank 0: every generated ray must be
    /// claimed by exactly one rank.
    fn verify_claiming(&self, comm: &mut RankComm, report: &[(u64, bool)]) -> Result<()> {
        let gathered = comm.allgather(report.to_vec());

        let verdict: Result<()> = if self.rank == 0 {
            let mut claims: HashMap<u64, u32> = HashMap::new();
            for rank_report in &gathered {
                for (id, claimed) in rank_report {
                    let entry = claims.entry(*id).or_insert(0);
                    if *claimed {
                        *entry += 1;
                    }
                }
            }
            let mut result = Ok(());
            for (id, count) in claims {
                if count == 0 {
                    result = Err(RayTracingError::ClaimFailed(format!(
                        "failed to claim the ray with id {id}"
                    )));
                    break;
                }
                if count > 1 {
                    result = Err(RayTracingError::ClaimFailed(format!(
                        "the ray with id {id} was claimed by {count} ranks"
                    )));
                    break;
                }
            }
            result
        } else {
            Ok(())
        };

        // Every rank fails when rank 0 rejects the claim
        let ok = comm.allgather(verdict.is_ok());
        if ok.iter().all(|v| *v) {
            Ok(())
        } else {
            verdict.or(Err(RayTracingError::ClaimFailed(
                "claim verification failed on rank 0".to_string(),
            )))
        }
    }
}

/// Convenience wrapper: builds the claimer and claims in one call.
pub fn claim_rays(
    study: &RayStudy,
    comm: &mut RankComm,
    rays: Vec<Ray>,
    do_exchange: bool,
) -> Result<Vec<Ray>> {
    ClaimRays::new(study, comm, do_exchange).claim(comm, rays)
}
