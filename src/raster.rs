//! Raster snapping for partly available allocations.
//!
//! Partly available windows are partitioned into fixed-width slots (the
//! raster, in minutes). Reservation boundaries snap to raster ticks, so a
//! slot's start is a stable key: the reserved_slots primary key on
//! (resource, allocation_id, start) catches overlapping claims without ever
//! comparing ranges.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::errors::Error;

/// Raster values must divide an hour without remainder.
pub const VALID_RASTERS: [i32; 5] = [5, 10, 15, 30, 60];

pub const MIN_RASTER: i32 = 5;
pub const MAX_RASTER: i32 = 60;

pub fn is_valid_raster(raster: i32) -> bool {
    VALID_RASTERS.contains(&raster)
}

pub(crate) fn ensure_valid_raster(raster: i32) -> Result<(), Error> {
    if is_valid_raster(raster) {
        Ok(())
    } else {
        Err(Error::InvalidAllocation)
    }
}

/// Snap down to the raster tick at or before `ts`.
pub fn rasterize_start(ts: DateTime<Utc>, raster: i32) -> DateTime<Utc> {
    debug_assert!(is_valid_raster(raster));
    let excess = Duration::minutes(i64::from(ts.minute() as i32 % raster))
        + Duration::seconds(i64::from(ts.second()))
        + Duration::nanoseconds(i64::from(ts.nanosecond()));
    ts - excess
}

/// Snap up to the raster tick at or after `ts`. A `ts` already on a tick is
/// returned unchanged, so `[start, end)` stays half-open.
pub fn rasterize_end(ts: DateTime<Utc>, raster: i32) -> DateTime<Utc> {
    let down = rasterize_start(ts, raster);
    if down == ts {
        ts
    } else {
        down + Duration::minutes(i64::from(raster))
    }
}

/// Rasterize both ends of a half-open span (start down, end up).
pub fn rasterize_span(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    raster: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (rasterize_start(start, raster), rasterize_end(end, raster))
}

/// True if `ts` sits exactly on a raster tick.
pub fn is_aligned(ts: DateTime<Utc>, raster: i32) -> bool {
    rasterize_start(ts, raster) == ts
}

/// All raster slots within `[start, end)` as half-open pairs.
pub fn iterate_span(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    raster: i32,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = rasterize_span(start, end, raster);
    let step = Duration::minutes(i64::from(raster));

    let mut slots = Vec::new();
    let mut cursor = start;
    while cursor < end {
        slots.push((cursor, cursor + step));
        cursor += step;
    }
    slots
}
