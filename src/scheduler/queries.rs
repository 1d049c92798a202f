//! Read-only queries: availability reporting, search, lookups.
//!
//! Everything here runs on the context's read session; the guard refuses
//! these calls while the write session holds uncommitted work.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc, Weekday};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::calendar::{self, TimeInput};
use crate::errors::Error;
use crate::model::{find_spot, Allocation, Reservation, ReservedSlot};

use super::availability::{availability_by_allocations, AllocationUsage};
use super::{
    allocations_by_groups, family_of, masters_in_range, slots_for_allocations, Scheduler,
    ALLOCATION_COLS, RESERVATION_COLS, SLOT_COLS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WholeDayFilter {
    #[default]
    Any,
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupFilter {
    #[default]
    Any,
    Yes,
    No,
}

/// Filters for [`Scheduler::search_allocations`].
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Only allocations on these weekdays (in the allocation's timezone).
    pub days: Option<Vec<Weekday>>,
    /// Minimum number of spots reservable in one reservation.
    pub minspots: i32,
    /// Drop allocations without a free spot in the searched window.
    pub available_only: bool,
    pub whole_day: WholeDayFilter,
    pub groups: GroupFilter,
    /// Don't pull in the remaining members of matched groups.
    pub strict: bool,
}

impl Scheduler {
    /// Overall availability of this resource over `[start, end)` in
    /// percent, averaged over all allocation families in the range and
    /// DST-normalized per day.
    pub async fn availability(
        &self,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
    ) -> Result<f64, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .read("availability", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let usages = this.usages_in_range(conn, start, end).await?;
                    Ok(availability_by_allocations(&usages))
                })
            })
            .await
    }

    /// Availability per local calendar day, keyed by the day the
    /// allocation starts on in its own timezone.
    pub async fn availability_by_day(
        &self,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
    ) -> Result<BTreeMap<NaiveDate, f64>, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .read("availability_by_day", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let usages = this.usages_in_range(conn, start, end).await?;

                    let mut by_day: BTreeMap<NaiveDate, Vec<AllocationUsage>> = BTreeMap::new();
                    for usage in usages {
                        let day = usage.allocation.display_start().date_naive();
                        by_day.entry(day).or_default().push(usage);
                    }

                    Ok(by_day
                        .into_iter()
                        .map(|(day, usages)| (day, availability_by_allocations(&usages)))
                        .collect())
                })
            })
            .await
    }

    /// Every allocation row (masters and mirrors) overlapping the range,
    /// paired with its slots.
    async fn usages_in_range(
        &self,
        conn: &mut PgConnection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AllocationUsage>, Error> {
        let sql = format!(
            "SELECT {ALLOCATION_COLS} FROM allocations \
             WHERE resource = $1 AND start_utc < $3 AND end_utc > $2 \
             ORDER BY start_utc, id"
        );
        let allocations = sqlx::query_as::<_, Allocation>(&sql)
            .bind(self.resource())
            .bind(start)
            .bind(end)
            .fetch_all(&mut *conn)
            .await?;

        let ids: Vec<i64> = allocations.iter().map(|a| a.id).collect();
        let mut slots_by_id: HashMap<i64, Vec<ReservedSlot>> = HashMap::new();
        for slot in slots_for_allocations(conn, &ids).await? {
            slots_by_id.entry(slot.allocation_id).or_default().push(slot);
        }

        Ok(allocations
            .into_iter()
            .map(|a| {
                let slots = slots_by_id.remove(&a.id).unwrap_or_default();
                AllocationUsage::new(a, slots)
            })
            .collect())
    }

    /// Master allocations overlapping `[start, end)`, ordered by start.
    pub async fn allocations_in_range(
        &self,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
    ) -> Result<Vec<Allocation>, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .read("allocations_in_range", |conn| {
                let this = self.clone();
                Box::pin(async move { masters_in_range(conn, this.resource(), start, end).await })
            })
            .await
    }

    /// One allocation row by id.
    pub async fn allocation_by_id(&self, id: i64) -> Result<Allocation, Error> {
        let session = self.context().session()?;
        session
            .read("allocation_by_id", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    super::allocation_by_id(conn, this.resource(), id)
                        .await?
                        .ok_or(Error::InvalidAllocation)
                })
            })
            .await
    }

    /// The mirrors of a master allocation, ascending id.
    pub async fn allocation_mirrors_by_master(
        &self,
        master_id: i64,
    ) -> Result<Vec<Allocation>, Error> {
        let session = self.context().session()?;
        session
            .read("allocation_mirrors_by_master", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let family = family_of(conn, this.resource(), master_id).await?;
                    Ok(family.into_iter().filter(|a| !a.is_master()).collect())
                })
            })
            .await
    }

    /// Allocations belonging to a group, masters only by default.
    pub async fn allocations_by_group(
        &self,
        group: Uuid,
        masters_only: bool,
    ) -> Result<Vec<Allocation>, Error> {
        let session = self.context().session()?;
        session
            .read("allocations_by_group", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    allocations_by_groups(conn, this.resource(), &[group], masters_only).await
                })
            })
            .await
    }

    /// The date spans of a group's windows.
    pub async fn allocation_dates_by_group(
        &self,
        group: Uuid,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, Error> {
        let masters = self.allocations_by_group(group, true).await?;
        Ok(masters.into_iter().map(|a| (a.start, a.end)).collect())
    }

    /// Free capacity of a master's family over `[start, end)`, counted in
    /// whole family rows.
    pub async fn free_allocations_count(
        &self,
        master_id: i64,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
    ) -> Result<usize, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .read("free_allocations_count", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let family = family_of(conn, this.resource(), master_id).await?;
                    let ids: Vec<i64> = family.iter().map(|a| a.id).collect();
                    let slots = slots_for_allocations(conn, &ids).await?;
                    Ok(family
                        .iter()
                        .filter(|a| a.is_available_for(&slots, Some(start), Some(end)))
                        .count())
                })
            })
            .await
    }

    /// Search allocations with the full filter set. The search window's
    /// times apply per day: searching June 12:00–14:00 finds everything in
    /// June overlapping 12:00–14:00 on its day.
    pub async fn search_allocations(
        &self,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
        params: SearchParams,
    ) -> Result<Vec<Allocation>, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .read("search_allocations", |conn| {
                let this = self.clone();
                let params = params.clone();
                Box::pin(async move { this.search_tx(conn, start, end, params).await })
            })
            .await
    }

    async fn search_tx(
        &self,
        conn: &mut PgConnection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        params: SearchParams,
    ) -> Result<Vec<Allocation>, Error> {
        let candidates = masters_in_range(conn, self.resource(), start, end).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // group sizes decide group membership in one query
        let groups: Vec<Uuid> = candidates.iter().map(|a| a.group_key).collect();
        let group_sizes: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT group_key, COUNT(*) FILTER (WHERE mirror_of IS NULL) \
             FROM allocations WHERE resource = $1 AND group_key = ANY($2) \
             GROUP BY group_key",
        )
        .bind(self.resource())
        .bind(&groups)
        .fetch_all(&mut *conn)
        .await?;
        let group_sizes: HashMap<Uuid, i64> = group_sizes.into_iter().collect();

        let mut results: Vec<Allocation> = Vec::new();
        let mut known_groups: Vec<Uuid> = Vec::new();
        let mut known_ids: Vec<i64> = Vec::new();

        for allocation in candidates {
            // project the search times onto the allocation's days
            let day_start = combine_utc(allocation.start, start);
            let day_end = combine_utc(allocation.end, end);
            if !allocation.overlaps(day_start, day_end) {
                continue;
            }

            if let Some(days) = &params.days {
                let tz = allocation.tz().unwrap_or(chrono_tz::UTC);
                if !days.contains(&calendar::weekday_in(tz, allocation.start)) {
                    continue;
                }
            }

            match params.whole_day {
                WholeDayFilter::Yes if !allocation.whole_day() => continue,
                WholeDayFilter::No if allocation.whole_day() => continue,
                _ => {}
            }

            // a quota limit below the required spots can never satisfy them
            if params.minspots > 0
                && 0 < allocation.quota_limit
                && allocation.quota_limit < params.minspots
            {
                continue;
            }

            if params.available_only || params.minspots > 0 {
                let family = family_of(conn, self.resource(), allocation.id).await?;
                let ids: Vec<i64> = family.iter().map(|a| a.id).collect();
                let slots = slots_for_allocations(conn, &ids).await?;

                let (s, e) = allocation.align_dates(Some(day_start), Some(day_end));
                if params.available_only && find_spot(&family, &slots, s, e).is_none() {
                    continue;
                }
                if params.minspots > 0 {
                    let free = family
                        .iter()
                        .filter(|a| a.is_available_for(&slots, Some(s), Some(e)))
                        .count();
                    if free < params.minspots as usize {
                        continue;
                    }
                }
            }

            let in_group = known_groups.contains(&allocation.group_key)
                || group_sizes.get(&allocation.group_key).copied().unwrap_or(0) > 1;
            if in_group {
                if !known_groups.contains(&allocation.group_key) {
                    known_groups.push(allocation.group_key);
                }
                known_ids.push(allocation.id);
            }

            match params.groups {
                GroupFilter::Yes if !in_group => continue,
                GroupFilter::No if in_group => continue,
                _ => {}
            }

            results.push(allocation);
        }

        // groups match as a whole: pull in the members the window missed
        if !params.strict && params.groups != GroupFilter::No && !known_groups.is_empty() {
            let sql = format!(
                "SELECT {ALLOCATION_COLS} FROM allocations \
                 WHERE resource = $1 AND group_key = ANY($2) AND mirror_of IS NULL \
                   AND NOT (id = ANY($3))"
            );
            let extra = sqlx::query_as::<_, Allocation>(&sql)
                .bind(self.resource())
                .bind(&known_groups)
                .bind(&known_ids)
                .fetch_all(&mut *conn)
                .await?;
            results.extend(extra);
            results.sort_by_key(|a| (a.start, a.id));
        }

        Ok(results)
    }

    // ── Reservation lookups ──────────────────────────────────────

    /// All reservations of a token, oldest line first.
    pub async fn reservations_by_token(&self, token: Uuid) -> Result<Vec<Reservation>, Error> {
        let session = self.context().session()?;
        let reservations = session
            .read("reservations_by_token", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    super::reservations_by_token(conn, this.resource(), token, None).await
                })
            })
            .await?;
        if reservations.is_empty() {
            return Err(Error::InvalidReservationToken);
        }
        Ok(reservations)
    }

    /// The cart of a session, oldest first.
    pub async fn reservations_by_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<Reservation>, Error> {
        let session = self.context().session()?;
        session
            .read("reservations_by_session", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    super::reservations_by_session(conn, this.resource(), session_id).await
                })
            })
            .await
    }

    /// Reservations touching the group of the given allocation.
    pub async fn reservations_by_allocation(
        &self,
        allocation_id: i64,
    ) -> Result<Vec<Reservation>, Error> {
        let allocation = self.allocation_by_id(allocation_id).await?;
        self.reservations_by_group(allocation.group_key).await
    }

    /// Reservations whose token targets the given group, including the
    /// sibling lines of those tokens.
    pub async fn reservations_by_group(&self, group: Uuid) -> Result<Vec<Reservation>, Error> {
        let session = self.context().session()?;
        session
            .read("reservations_by_group", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let sql = format!(
                        "SELECT {RESERVATION_COLS} FROM reservations \
                         WHERE resource = $1 AND token IN ( \
                             SELECT token FROM reservations \
                             WHERE resource = $1 AND target = $2) \
                         ORDER BY id"
                    );
                    Ok(sqlx::query_as::<_, Reservation>(&sql)
                        .bind(this.resource())
                        .bind(group)
                        .fetch_all(&mut *conn)
                        .await?)
                })
            })
            .await
    }

    /// The reserved slots written for a token.
    pub async fn reserved_slots_by_reservation(
        &self,
        token: Uuid,
    ) -> Result<Vec<ReservedSlot>, Error> {
        let session = self.context().session()?;
        session
            .read("reserved_slots_by_reservation", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let sql = format!(
                        "SELECT {SLOT_COLS} FROM reserved_slots \
                         WHERE resource = $1 AND reservation_token = $2 \
                         ORDER BY start_utc, allocation_id"
                    );
                    Ok(sqlx::query_as::<_, ReservedSlot>(&sql)
                        .bind(this.resource())
                        .bind(token)
                        .fetch_all(&mut *conn)
                        .await?)
                })
            })
            .await
    }
}

/// Combine the date of `day_anchor` with the time of `time_anchor`, both in
/// UTC. This is how a search window's times are projected onto each
/// allocation's day.
fn combine_utc(day_anchor: DateTime<Utc>, time_anchor: DateTime<Utc>) -> DateTime<Utc> {
    let combined = NaiveDateTime::new(day_anchor.date_naive(), time_anchor.time());
    DateTime::from_naive_utc_and_offset(combined, Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn combine_takes_date_and_time() {
        let day = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 12, 45, 0).unwrap();
        let combined = combine_utc(day, time);
        assert_eq!(
            combined,
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 45, 0).unwrap()
        );
    }

    #[test]
    fn search_params_defaults_are_permissive() {
        let params = SearchParams::default();
        assert!(params.days.is_none());
        assert_eq!(params.minspots, 0);
        assert!(!params.available_only);
        assert_eq!(params.whole_day, WholeDayFilter::Any);
        assert_eq!(params.groups, GroupFilter::Any);
        assert!(!params.strict);
    }
}
