//! Packed ray representation for inter-rank transfer.
//!
//! Layout, in buffer words (f64):
//!   0: data size, 1: aux data size, 2: id (bit reinterpret),
//!   3-5: current point, 6-8: direction, 9: element id (bit
//!   reinterpret), 10-11: the bit-packed tuple (incoming side 16 bits,
//!   end_set 1, processor crossings 16, intersections 24; trajectory
//!   changes 16 in the second word), 12: distance, 13: max distance,
//!   then `data` and `aux_data` verbatim.
//!
//! The receiving rank rematerializes with `should_continue = true` and
//! `trajectory_changed = false`.

use crate::error::{RayTracingError, Result};
use crate::mesh::ElemId;
use crate::ray::{Ray, RayId};
use crate::study::RayStudy;

/// Fixed words ahead of the data arrays.
pub const HEADER_WORDS: usize = 14;

/// Total words for a ray with the given data sizes.
pub fn packed_size(data_size: usize, aux_data_size: usize) -> usize {
    HEADER_WORDS + data_size + aux_data_size
}

const INVALID_SIDE_BITS: u64 = 0xFFFF;
/// Sentinel word for "no element" (pre-claim rays travel without one).
const INVALID_ELEM_BITS: u64 = u64::MAX;

/// Appends the packed representation of `ray` to `out`. The starting
/// element and direction may be unset (pre-claim rays); the point must
/// exist.
pub fn pack_ray(ray: &Ray, out: &mut Vec<f64>) -> Result<()> {
    let Some(point) = ray.current_point() else {
        return Err(ray.contract("cannot pack a ray with no current point"));
    };
    // A stationary or not-yet-directed ray has no direction; the zero
    // vector is not a legal direction, so it is free as a sentinel
    let direction = ray.direction().unwrap_or_else(crate::geom::Point::zeros);
    let elem_bits = ray
        .current_elem()
        .map_or(INVALID_ELEM_BITS, |e| e.0 as u64);

    out.reserve(packed_size(ray.data().len(), ray.aux_data().len()));

    out.push(ray.data().len() as f64);
    out.push(ray.aux_data().len() as f64);
    out.push(f64::from_bits(ray.id().0));
    out.extend_from_slice(&[point.x, point.y, point.z]);
    out.extend_from_slice(&[direction.x, direction.y, direction.z]);
    out.push(f64::from_bits(elem_bits));

    let side_bits = ray
        .current_incoming_side()
        .map_or(INVALID_SIDE_BITS, |s| s as u64);
    let word0 = side_bits
        | (u64::from(ray.end_set()) << 16)
        | ((ray.processor_crossings() as u64 & 0xFFFF) << 17)
        | ((ray.intersections() as u64 & 0xFF_FFFF) << 33);
    let word1 = ray.trajectory_changes() as u64 & 0xFFFF;
    out.push(f64::from_bits(word0));
    out.push(f64::from_bits(word1));

    out.push(ray.distance());
    out.push(ray.max_distance());
    out.extend_from_slice(ray.data());
    out.extend_from_slice(ray.aux_data());
    Ok(())
}

/// Rematerializes one ray from the front of `words`; returns it with the
/// number of words consumed.
pub fn unpack_ray(words: &[f64], study: &RayStudy) -> Result<(Ray, usize)> {
    if words.len() < HEADER_WORDS {
        return Err(RayTracingError::setup("truncated packed ray header"));
    }

    let data_size = words[0] as usize;
    let aux_data_size = words[1] as usize;
    let total = packed_size(data_size, aux_data_size);
    if words.len() < total {
        return Err(RayTracingError::setup("truncated packed ray data"));
    }

    let id = RayId(words[2].to_bits());
    let mut ray = study.acquire_internal(id, data_size, aux_data_size);

    ray.set_current_point(crate::geom::Point::new(words[3], words[4], words[5]));
    let direction = crate::geom::Point::new(words[6], words[7], words[8]);
    if direction != crate::geom::Point::zeros() {
        ray.set_direction_internal(direction);
    }
    let elem_bits = words[9].to_bits();
    ray.set_current_elem((elem_bits != INVALID_ELEM_BITS).then_some(ElemId(elem_bits as usize)));

    let word0 = words[10].to_bits();
    let word1 = words[11].to_bits();
    let side_bits = word0 & 0xFFFF;
    let side = (side_bits != INVALID_SIDE_BITS).then_some(side_bits as u16);
    ray.set_current_incoming_side(side);

    let end_set = (word0 >> 16) & 1 == 1;
    let processor_crossings = ((word0 >> 17) & 0xFFFF) as u32;
    let intersections = ((word0 >> 33) & 0xFF_FFFF) as u32;
    let trajectory_changes = (word1 & 0xFFFF) as u32;

    ray.set_counters_from_unpack(
        processor_crossings,
        intersections,
        trajectory_changes,
        words[12],
        words[13],
        end_set,
    );

    ray.data_mut()
        .copy_from_slice(&words[HEADER_WORDS..HEADER_WORDS + data_size]);
    ray.aux_data_mut()
        .copy_from_slice(&words[HEADER_WORDS + data_size..total]);

    ray.rearm_after_unpack();
    Ok((ray, total))
}
