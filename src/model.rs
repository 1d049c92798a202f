//! The persistent entities and their capacity math.
//!
//! The math on these types is pure: callers load the relevant reserved
//! slots and pass them in, which keeps every invariant testable without a
//! database. Anything that needs to consult other rows lives on the
//! scheduler instead.

use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar;
use crate::errors::Error;
use crate::raster;
use crate::settings::JsonCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_target_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Allocation,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReservationKind {
    Free,
    Waitinglist,
}

/// A window of time on a resource within which reservations may be created.
///
/// For `quota > 1` the window is stored as a family of rows: one master
/// (`mirror_of` is NULL) plus `quota - 1` mirrors pointing at it, all
/// sharing their temporal bounds. Mirrors exist so every unit of capacity
/// has its own `allocation_id` for the reserved-slot primary key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Allocation {
    pub id: i64,
    pub resource: Uuid,
    /// `None` marks the master; mirrors carry their master's id.
    pub mirror_of: Option<i64>,
    pub group_key: Uuid,
    pub timezone: String,
    #[sqlx(rename = "start_utc")]
    pub start: DateTime<Utc>,
    #[sqlx(rename = "end_utc")]
    pub end: DateTime<Utc>,
    pub quota: i32,
    pub quota_limit: i32,
    pub partly_available: bool,
    pub approve_manually: bool,
    pub waitinglist_spots: Option<i32>,
    pub raster: i32,
    pub data: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
}

impl PartialEq for Allocation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Allocation {}

impl std::hash::Hash for Allocation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Allocation {
    pub fn is_master(&self) -> bool {
        self.mirror_of.is_none()
    }

    /// The id of the family's master row; a master is its own mirror.
    pub fn master_id(&self) -> i64 {
        self.mirror_of.unwrap_or(self.id)
    }

    pub fn tz(&self) -> Result<Tz, Error> {
        calendar::parse_tz(&self.timezone)
    }

    pub fn display_start(&self) -> DateTime<Tz> {
        let tz = self.tz().unwrap_or(chrono_tz::UTC);
        self.start.with_timezone(&tz)
    }

    pub fn display_end(&self) -> DateTime<Tz> {
        let tz = self.tz().unwrap_or(chrono_tz::UTC);
        self.end.with_timezone(&tz)
    }

    /// True if the allocation covers whole local days.
    pub fn whole_day(&self) -> bool {
        let tz = match self.tz() {
            Ok(tz) => tz,
            Err(_) => return false,
        };
        calendar::is_whole_day(self.start, self.end, tz)
    }

    /// Half-open overlap against the rasterized request.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let (start, end) = raster::rasterize_span(start, end, self.raster);
        calendar::overlaps(start, end, self.start, self.end)
    }

    /// True if the rasterized request fits inside the allocation.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let (start, end) = raster::rasterize_span(start, end, self.raster);
        self.start <= start && end <= self.end
    }

    /// Clamp an optional request range to the allocation bounds.
    pub fn align_dates(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = start.unwrap_or(self.start).max(self.start);
        let end = end.unwrap_or(self.end).min(self.end);
        (start, end)
    }

    /// Every atomic slot within the (clamped) range, reserved or free. A
    /// partly available allocation yields one slot per raster tick, anything
    /// else a single slot spanning the whole window.
    pub fn all_slots(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        if self.partly_available {
            let (start, end) = self.align_dates(start, end);
            raster::iterate_span(start, end, self.raster)
        } else {
            vec![(self.start, self.end)]
        }
    }

    pub fn count_slots(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> usize {
        if !self.partly_available {
            return 1;
        }
        let (start, end) = self.align_dates(start, end);
        let seconds = (end - start).num_seconds().max(0);
        (seconds / (i64::from(self.raster) * 60)) as usize
    }

    fn own_slot_starts<'a>(
        &self,
        slots: &'a [ReservedSlot],
    ) -> impl Iterator<Item = DateTime<Utc>> + 'a {
        let id = self.id;
        slots
            .iter()
            .filter(move |s| s.allocation_id == id)
            .map(|s| s.start)
    }

    /// The slots not yet claimed by any reservation.
    pub fn free_slots(
        &self,
        slots: &[ReservedSlot],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let reserved: Vec<_> = self.own_slot_starts(slots).collect();
        self.all_slots(start, end)
            .into_iter()
            .filter(|(s, _)| !reserved.contains(s))
            .collect()
    }

    /// True if the given range is completely free on this row.
    pub fn is_available_for(
        &self,
        slots: &[ReservedSlot],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        let reserved: Vec<_> = self.own_slot_starts(slots).collect();
        self.all_slots(start, end)
            .iter()
            .all(|(s, _)| !reserved.contains(s))
    }

    /// Availability of this row in percent.
    pub fn availability(&self, slots: &[ReservedSlot]) -> f64 {
        let total = self.count_slots(None, None);
        let used = self.own_slot_starts(slots).count();

        if total == used {
            return 0.0;
        }
        if used == 0 {
            return 100.0;
        }
        100.0 - used as f64 / total as f64 * 100.0
    }

    /// Like [`availability`](Self::availability), but DST transition days
    /// are treated as 24-hour days: on the 25-hour day the repeated hour's
    /// slots are counted once, on the 23-hour day the skipped hour counts as
    /// used. Renderers that draw a uniform day grid want this; everyone else
    /// wants the raw value.
    pub fn normalized_availability(&self, slots: &[ReservedSlot]) -> f64 {
        if !self.partly_available {
            return self.availability(slots);
        }
        let tz = match self.tz() {
            Ok(tz) => tz,
            Err(_) => return self.availability(slots),
        };

        let local_start = self.start.with_timezone(&tz);
        let local_end = self.end.with_timezone(&tz);
        if local_start.offset().fix() == local_end.offset().fix() {
            return self.availability(slots);
        }

        let real = self.end - self.start;
        let on_wall_clock = local_end.naive_local() - local_start.naive_local();
        let slot_len = i64::from(self.raster) * 60;
        let total = on_wall_clock.num_seconds() / slot_len;
        let slots_per_hour = (60 / self.raster) as usize;

        let used = if real > on_wall_clock {
            // 25h day: don't count slots inside the repeated hour twice
            match self.duplicated_hour(tz) {
                Some((ws, we)) => self
                    .own_slot_starts(slots)
                    .filter(|s| !(*s >= ws && *s < we))
                    .count(),
                None => self.own_slot_starts(slots).count(),
            }
        } else {
            // 23h day: the skipped hour occupies grid space but can never
            // be free
            self.own_slot_starts(slots).count() + slots_per_hour
        };

        if used == 0 {
            return 100.0;
        }
        if total <= used as i64 {
            return 0.0;
        }
        100.0 - used as f64 / total as f64 * 100.0
    }

    /// UTC window of the first occurrence of the repeated local hour on a
    /// fall-back day, if the allocation starts on one.
    fn duplicated_hour(&self, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let local_date = self.start.with_timezone(&tz).date_naive();
        let wall = local_date.and_hms_opt(2, 0, 0)?;
        let start = match tz.from_local_datetime(&wall) {
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::None => return None,
        };
        Some((start, start + Duration::hours(1)))
    }

    /// The slot list normalized to a 24-hour day: the skipped hour on a
    /// 23-hour day appears as `None` placeholders, the repeated hour on a
    /// 25-hour day is collapsed to a single occurrence.
    pub fn normalized_slots(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let plain = |this: &Self| -> Vec<Option<(DateTime<Utc>, DateTime<Utc>)>> {
            this.all_slots(start, end).into_iter().map(Some).collect()
        };

        if !self.partly_available {
            return plain(self);
        }
        let tz = match self.tz() {
            Ok(tz) => tz,
            Err(_) => return plain(self),
        };
        let local_start = self.start.with_timezone(&tz);
        let local_end = self.end.with_timezone(&tz);
        if local_start.offset().fix() == local_end.offset().fix() {
            return plain(self);
        }

        let real = self.end - self.start;
        let on_wall_clock = local_end.naive_local() - local_start.naive_local();
        let slots_per_hour = (60 / self.raster) as usize;

        if real > on_wall_clock {
            // 25h day: drop the second occurrence of the repeated hour
            let Some((ws, _)) = self.duplicated_hour(tz) else {
                return plain(self);
            };
            let mut skipped = 0;
            self.all_slots(start, end)
                .into_iter()
                .filter(|(s, _)| {
                    if skipped < slots_per_hour && *s >= ws {
                        skipped += 1;
                        false
                    } else {
                        true
                    }
                })
                .map(Some)
                .collect()
        } else {
            // 23h day: splice in placeholders where the skipped hour would be
            let gap_at = calendar::to_utc(
                local_start.date_naive().and_hms_opt(2, 0, 0).unwrap(),
                tz,
            );
            let mut out = Vec::new();
            let mut inserted = false;
            for slot in self.all_slots(start, end) {
                if !inserted && slot.0 >= gap_at {
                    out.extend(std::iter::repeat(None).take(slots_per_hour));
                    inserted = true;
                }
                out.push(Some(slot));
            }
            out
        }
    }

    /// Partition the allocation into contiguous free/reserved blocks, each
    /// with its share of the whole in percent. With `normalize_dst` the
    /// blocks are laid out on a uniform 24-hour grid.
    pub fn availability_partitions(
        &self,
        slots: &[ReservedSlot],
        normalize_dst: bool,
    ) -> Vec<(f64, bool)> {
        let own: Vec<_> = self.own_slot_starts(slots).collect();

        let grid = if normalize_dst && self.partly_available {
            self.normalized_slots(None, None)
        } else {
            if own.is_empty() {
                return vec![(100.0, false)];
            }
            self.all_slots(None, None).into_iter().map(Some).collect()
        };

        if grid.is_empty() {
            return vec![(100.0, false)];
        }

        let step = 100.0 / grid.len() as f64;
        let pieces: Vec<bool> = grid
            .iter()
            .map(|slot| match slot {
                None => true,
                Some((s, _)) => own.contains(s),
            })
            .collect();

        let mut partitions: Vec<(f64, bool)> = Vec::new();
        for reserved in pieces {
            match partitions.last_mut() {
                Some((share, last)) if *last == reserved => *share += step,
                _ => partitions.push((step, reserved)),
            }
        }

        // squash float drift so the shares sum to exactly 100
        let total: f64 = partitions.iter().map(|(share, _)| share).sum();
        if let Some((share, _)) = partitions.last_mut() {
            *share += 100.0 - total;
        }
        partitions
    }

    /// Decode the opaque `data` blob into a caller-defined shape, through
    /// the context's JSON codec.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self, codec: &JsonCodec) -> Option<T> {
        self.data.as_ref().and_then(|v| codec.decode_as(v).ok())
    }
}

/// A confirmed atomic unit of consumed capacity inside an allocation.
///
/// The primary key `(resource, allocation_id, start)` is what makes
/// double-booking impossible: two transactions claiming the same unit
/// collide in the database and exactly one of them commits.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReservedSlot {
    pub resource: Uuid,
    pub allocation_id: i64,
    #[sqlx(rename = "start_utc")]
    pub start: DateTime<Utc>,
    #[sqlx(rename = "end_utc")]
    pub end: DateTime<Utc>,
    #[sqlx(rename = "reservation_token")]
    pub token: Uuid,
    pub created: DateTime<Utc>,
}

impl PartialEq for ReservedSlot {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.allocation_id == other.allocation_id
            && self.start == other.start
    }
}

impl Eq for ReservedSlot {}

impl std::hash::Hash for ReservedSlot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.resource, self.allocation_id, self.start).hash(state);
    }
}

/// A claim by an actor: pending while in a session cart, approved once its
/// reserved slots exist. Terminal states are deletions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: i64,
    /// Shared across all lines created by one `reserve` call (a cart).
    pub token: Uuid,
    /// The group key of the targeted allocation family.
    pub target: Uuid,
    pub target_type: TargetType,
    pub resource: Uuid,
    #[sqlx(rename = "start_utc")]
    pub start: Option<DateTime<Utc>>,
    #[sqlx(rename = "end_utc")]
    pub end: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub status: ReservationStatus,
    pub kind: ReservationKind,
    pub email: String,
    pub session_id: Option<Uuid>,
    pub quota: i32,
    pub data: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
}

impl PartialEq for Reservation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Reservation {}

impl std::hash::Hash for Reservation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Reservation {
    pub fn is_pending(&self) -> bool {
        self.status == ReservationStatus::Pending
    }

    /// The requested span for allocation-targeted reservations. Group
    /// targets carry no dates of their own; their spans come from the
    /// group's allocations.
    pub fn timespan(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    /// Decode the opaque `data` blob into a caller-defined shape, through
    /// the context's JSON codec.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self, codec: &JsonCodec) -> Option<T> {
        self.data.as_ref().and_then(|v| codec.decode_as(v).ok())
    }

    #[cfg(test)]
    pub(crate) fn test_pending() -> Self {
        Self {
            id: 1,
            token: Uuid::new_v4(),
            target: Uuid::new_v4(),
            target_type: TargetType::Allocation,
            resource: Uuid::new_v4(),
            start: None,
            end: None,
            timezone: Some("UTC".into()),
            status: ReservationStatus::Pending,
            kind: ReservationKind::Free,
            email: "test@example.org".into(),
            session_id: None,
            quota: 1,
            data: None,
            created: Utc::now(),
            modified: None,
        }
    }
}

/// Pick the row of a mirror family that can take `[start, end)`: the master
/// first, then mirrors by ascending id. `family` must be the master plus its
/// mirrors, `slots` the family's reserved slots.
pub fn find_spot<'a>(
    family: &'a [Allocation],
    slots: &[ReservedSlot],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<&'a Allocation> {
    let mut ordered: Vec<&Allocation> = family.iter().collect();
    ordered.sort_by_key(|a| (!a.is_master(), a.id));

    ordered
        .into_iter()
        .find(|a| a.is_available_for(slots, Some(start), Some(end)))
}
