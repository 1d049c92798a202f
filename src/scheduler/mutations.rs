//! Allocation mutations: allocate, change, move, remove.

use chrono::{DateTime, Utc, Weekday};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::calendar::{self, TimeInput};
use crate::errors::Error;
use crate::model::{Allocation, ReservedSlot};
use crate::raster;

use super::{
    allocation_by_id, allocations_by_groups, family_of, masters_in_range,
    pending_reservations_by_target, slots_for_allocations, Scheduler, ALLOCATION_COLS,
};

/// Parameters for [`Scheduler::allocate`].
#[derive(Debug, Clone)]
pub struct AllocateParams {
    pub dates: Vec<(TimeInput, TimeInput)>,
    pub quota: i32,
    pub quota_limit: i32,
    pub partly_available: bool,
    pub approve_manually: bool,
    pub grouped: bool,
    pub raster: i32,
    pub whole_day: bool,
    /// Skip windows colliding with existing masters instead of failing.
    pub skip_overlapping: bool,
    pub waitinglist_spots: Option<i32>,
    pub data: Option<serde_json::Value>,
}

impl AllocateParams {
    pub fn new(dates: Vec<(TimeInput, TimeInput)>) -> Self {
        Self {
            dates,
            quota: 1,
            quota_limit: 0,
            partly_available: false,
            approve_manually: true,
            grouped: false,
            raster: raster::MIN_RASTER,
            whole_day: false,
            skip_overlapping: false,
            waitinglist_spots: None,
            data: None,
        }
    }

    pub fn single(start: impl Into<TimeInput>, end: impl Into<TimeInput>) -> Self {
        Self::new(vec![(start.into(), end.into())])
    }

    pub fn quota(mut self, quota: i32) -> Self {
        self.quota = quota;
        self
    }

    pub fn quota_limit(mut self, limit: i32) -> Self {
        self.quota_limit = limit;
        self
    }

    pub fn partly_available(mut self, raster: i32) -> Self {
        self.partly_available = true;
        self.raster = raster;
        self
    }

    pub fn approve_manually(mut self, manually: bool) -> Self {
        self.approve_manually = manually;
        self
    }

    pub fn grouped(mut self) -> Self {
        self.grouped = true;
        self
    }

    pub fn whole_day(mut self) -> Self {
        self.whole_day = true;
        self
    }

    pub fn skip_overlapping(mut self) -> Self {
        self.skip_overlapping = true;
        self
    }

    pub fn waitinglist_spots(mut self, spots: i32) -> Self {
        self.waitinglist_spots = Some(spots);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Non-temporal attribute changes for [`Scheduler::change_allocation`].
/// `None` leaves an attribute untouched; the double options distinguish
/// "don't change" from "set to null".
#[derive(Debug, Clone, Default)]
pub struct AllocationChanges {
    pub quota: Option<i32>,
    pub quota_limit: Option<i32>,
    pub approve_manually: Option<bool>,
    pub waitinglist_spots: Option<Option<i32>>,
    pub data: Option<Option<serde_json::Value>>,
}

/// Parameters for [`Scheduler::move_allocation`].
#[derive(Debug, Clone, Default)]
pub struct MoveParams {
    pub new_start: Option<TimeInput>,
    pub new_end: Option<TimeInput>,
    pub whole_day: bool,
    pub group: Option<Uuid>,
    pub quota: Option<i32>,
    pub approve_manually: Option<bool>,
    pub quota_limit: Option<i32>,
    pub data: Option<Option<serde_json::Value>>,
}

impl MoveParams {
    pub fn to(start: impl Into<TimeInput>, end: impl Into<TimeInput>) -> Self {
        Self {
            new_start: Some(start.into()),
            new_end: Some(end.into()),
            ..Self::default()
        }
    }
}

/// What [`Scheduler::remove_allocation`] should remove.
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    /// A master allocation and its mirrors.
    ById(i64),
    /// Every allocation of the given groups.
    ByGroups(Vec<Uuid>),
}

#[derive(Debug, Clone)]
struct PreparedAllocate {
    spans: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    shared_group: Option<Uuid>,
    timezone: String,
    quota: i32,
    quota_limit: i32,
    partly_available: bool,
    approve_manually: bool,
    raster: i32,
    skip_overlapping: bool,
    waitinglist_spots: Option<i32>,
    data: Option<serde_json::Value>,
}

impl Scheduler {
    /// Open one or more windows of reservable time on this resource.
    ///
    /// Windows colliding with existing masters fail with
    /// `OverlappingAllocation` (or are skipped with `skip_overlapping`).
    /// A quota above one materializes mirror rows next to the master.
    /// Returns the created masters.
    pub async fn allocate(&self, params: AllocateParams) -> Result<Vec<Allocation>, Error> {
        let prepared = self.prepare_allocate(params)?;
        if prepared.spans.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.context().session()?;
        session
            .serializable("allocate", |conn| {
                let this = self.clone();
                let prepared = prepared.clone();
                Box::pin(async move { this.allocate_tx(conn, prepared).await })
            })
            .await
    }

    fn prepare_allocate(&self, params: AllocateParams) -> Result<PreparedAllocate, Error> {
        raster::ensure_valid_raster(params.raster)?;
        if params.quota < 1 {
            return Err(Error::InvalidQuota);
        }
        if params.quota_limit < 0 {
            return Err(Error::InvalidAllocation);
        }
        // partly available windows are reserved per raster tick; a group is
        // all-or-nothing, the two cannot mix
        if params.partly_available && params.grouped {
            return Err(Error::InvalidAllocation);
        }
        if params.skip_overlapping && params.grouped {
            return Err(Error::InvalidAllocation);
        }

        let mut dates = self.prepare_dates(&params.dates);
        if params.whole_day {
            for pair in &mut dates {
                *pair = calendar::align_range_to_day(pair.0, pair.1, self.timezone());
            }
        }

        let spans: Vec<_> = dates
            .iter()
            .map(|(s, e)| raster::rasterize_span(*s, *e, params.raster))
            .collect();

        for (start, end) in &spans {
            if start >= end {
                return Err(Error::InvalidAllocation);
            }
            if calendar::count_overlaps(&spans, *start, *end) > 1 {
                return Err(Error::InvalidAllocation);
            }
        }

        Ok(PreparedAllocate {
            spans,
            shared_group: params.grouped.then(Uuid::new_v4),
            timezone: self.timezone().name().to_string(),
            quota: params.quota,
            quota_limit: params.quota_limit,
            partly_available: params.partly_available,
            approve_manually: params.approve_manually,
            raster: params.raster,
            skip_overlapping: params.skip_overlapping,
            waitinglist_spots: params.waitinglist_spots,
            data: self.encode_data(params.data)?,
        })
    }

    async fn allocate_tx(
        &self,
        conn: &mut PgConnection,
        p: PreparedAllocate,
    ) -> Result<Vec<Allocation>, Error> {
        // one bounded query over the input envelope instead of one per pair
        let envelope_start = p.spans.iter().map(|s| s.0).min().expect("nonempty spans");
        let envelope_end = p.spans.iter().map(|s| s.1).max().expect("nonempty spans");
        let existing =
            masters_in_range(conn, self.resource(), envelope_start, envelope_end).await?;

        let mut skipped = Vec::new();
        for other in &existing {
            for (start, end) in &p.spans {
                if !calendar::overlaps(*start, *end, other.start, other.end) {
                    continue;
                }
                if p.skip_overlapping {
                    skipped.push((*start, *end));
                } else {
                    return Err(Error::OverlappingAllocation {
                        start: *start,
                        end: *end,
                        existing: other.id,
                    });
                }
            }
        }

        let mut masters = Vec::new();
        for (start, end) in &p.spans {
            if skipped.contains(&(*start, *end)) {
                continue;
            }

            let group = p.shared_group.unwrap_or_else(Uuid::new_v4);
            let master = insert_allocation(conn, self.resource(), None, group, &p, *start, *end)
                .await?;

            for _ in 1..p.quota {
                insert_allocation(
                    conn,
                    self.resource(),
                    Some(master.id),
                    group,
                    &p,
                    *start,
                    *end,
                )
                .await?;
            }

            masters.push(master);
        }

        tracing::debug!(
            resource = %self.resource(),
            count = masters.len(),
            "allocations added"
        );
        self.hooks().emit_allocations_added(&masters);
        Ok(masters)
    }

    /// Change non-temporal attributes of a master allocation and its family.
    /// Quota changes that would drop below in-use capacity fail with
    /// `AffectedReservation`.
    pub async fn change_allocation(
        &self,
        master_id: i64,
        changes: AllocationChanges,
    ) -> Result<(), Error> {
        let mut changes = changes;
        if let Some(data) = changes.data.take() {
            changes.data = Some(self.encode_data(data)?);
        }

        let session = self.context().session()?;
        session
            .serializable("change_allocation", |conn| {
                let this = self.clone();
                let changes = changes.clone();
                Box::pin(async move { this.change_allocation_tx(conn, master_id, changes).await })
            })
            .await
    }

    async fn change_allocation_tx(
        &self,
        conn: &mut PgConnection,
        master_id: i64,
        changes: AllocationChanges,
    ) -> Result<(), Error> {
        let master = allocation_by_id(conn, self.resource(), master_id)
            .await?
            .filter(Allocation::is_master)
            .ok_or(Error::InvalidAllocation)?;

        if let Some(limit) = changes.quota_limit {
            if limit < 0 {
                return Err(Error::InvalidAllocation);
            }
            sqlx::query(
                "UPDATE allocations SET quota_limit = $1, modified = now() \
                 WHERE resource = $2 AND (id = $3 OR mirror_of = $3)",
            )
            .bind(limit)
            .bind(self.resource())
            .bind(master_id)
            .execute(&mut *conn)
            .await?;
        }

        if let Some(manually) = changes.approve_manually {
            sqlx::query(
                "UPDATE allocations SET approve_manually = $1, modified = now() \
                 WHERE resource = $2 AND (id = $3 OR mirror_of = $3)",
            )
            .bind(manually)
            .bind(self.resource())
            .bind(master_id)
            .execute(&mut *conn)
            .await?;
        }

        if let Some(spots) = changes.waitinglist_spots {
            sqlx::query(
                "UPDATE allocations SET waitinglist_spots = $1, modified = now() \
                 WHERE resource = $2 AND (id = $3 OR mirror_of = $3)",
            )
            .bind(spots)
            .bind(self.resource())
            .bind(master_id)
            .execute(&mut *conn)
            .await?;
        }

        if let Some(data) = changes.data {
            sqlx::query(
                "UPDATE allocations SET data = $1, modified = now() \
                 WHERE resource = $2 AND (id = $3 OR mirror_of = $3)",
            )
            .bind(data)
            .bind(self.resource())
            .bind(master_id)
            .execute(&mut *conn)
            .await?;
        }

        if let Some(quota) = changes.quota {
            self.change_quota_tx(conn, &master, quota).await?;
        }

        Ok(())
    }

    /// Grow or shrink a family's quota. Shrinking reorganizes reserved
    /// slots onto the lowest-id rows so the surplus mirrors are free to
    /// drop; if capacity is in use beyond the new quota the change fails.
    async fn change_quota_tx(
        &self,
        conn: &mut PgConnection,
        master: &Allocation,
        new_quota: i32,
    ) -> Result<(), Error> {
        if new_quota < 1 {
            return Err(Error::InvalidQuota);
        }
        if new_quota == master.quota {
            return Ok(());
        }

        if new_quota > master.quota {
            let p = PreparedAllocate {
                spans: vec![(master.start, master.end)],
                shared_group: Some(master.group_key),
                timezone: master.timezone.clone(),
                quota: new_quota,
                quota_limit: master.quota_limit,
                partly_available: master.partly_available,
                approve_manually: master.approve_manually,
                raster: master.raster,
                skip_overlapping: false,
                waitinglist_spots: master.waitinglist_spots,
                data: master.data.clone(),
            };
            for _ in master.quota..new_quota {
                insert_allocation(
                    conn,
                    self.resource(),
                    Some(master.id),
                    master.group_key,
                    &p,
                    master.start,
                    master.end,
                )
                .await?;
            }
            sqlx::query(
                "UPDATE allocations SET quota = $1, modified = now() \
                 WHERE resource = $2 AND (id = $3 OR mirror_of = $3)",
            )
            .bind(new_quota)
            .bind(self.resource())
            .bind(master.id)
            .execute(&mut *conn)
            .await?;
            return Ok(());
        }

        // shrink: rows sorted master first, then mirrors by id
        let family = family_of(conn, self.resource(), master.id).await?;
        let family_ids: Vec<i64> = family.iter().map(|a| a.id).collect();
        let slots = slots_for_allocations(conn, &family_ids).await?;

        let keep: Vec<&Allocation> = family.iter().take(new_quota as usize).collect();
        let surplus: Vec<&Allocation> = family.iter().skip(new_quota as usize).collect();

        // group the family's slots per tick and re-seat them on the kept rows
        let mut by_tick: std::collections::BTreeMap<DateTime<Utc>, Vec<&ReservedSlot>> =
            std::collections::BTreeMap::new();
        for slot in &slots {
            by_tick.entry(slot.start).or_default().push(slot);
        }

        for (tick, claimed) in &by_tick {
            if claimed.len() > new_quota as usize {
                let token = claimed[0].token;
                tracing::debug!(%tick, in_use = claimed.len(), "quota shrink conflicts with slots");
                return Err(Error::AffectedReservation { token });
            }
            for (seat, slot) in claimed.iter().enumerate() {
                let owner = keep[seat].id;
                if slot.allocation_id == owner {
                    continue;
                }
                sqlx::query(
                    "UPDATE reserved_slots SET allocation_id = $1 \
                     WHERE resource = $2 AND allocation_id = $3 AND start_utc = $4",
                )
                .bind(owner)
                .bind(self.resource())
                .bind(slot.allocation_id)
                .bind(slot.start)
                .execute(&mut *conn)
                .await?;
            }
        }

        let keep_ids: Vec<i64> = keep.iter().map(|a| a.id).collect();
        let drop_ids: Vec<i64> = surplus.iter().map(|a| a.id).collect();

        sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(&drop_ids)
            .execute(&mut *conn)
            .await?;
        sqlx::query("UPDATE allocations SET quota = $1, modified = now() WHERE id = ANY($2)")
            .bind(new_quota)
            .bind(&keep_ids)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Move a master allocation (and its whole family and group) to a new
    /// window. Fails when existing reserved slots or pending reservations
    /// would fall outside the new bounds, or when the new window overlaps
    /// another master.
    pub async fn move_allocation(&self, master_id: i64, params: MoveParams) -> Result<(), Error> {
        let mut params = params;
        if let Some(data) = params.data.take() {
            params.data = Some(self.encode_data(data)?);
        }

        let session = self.context().session()?;
        session
            .serializable("move_allocation", |conn| {
                let this = self.clone();
                let params = params.clone();
                Box::pin(async move { this.move_allocation_tx(conn, master_id, params).await })
            })
            .await
    }

    async fn move_allocation_tx(
        &self,
        conn: &mut PgConnection,
        master_id: i64,
        params: MoveParams,
    ) -> Result<(), Error> {
        let master = allocation_by_id(conn, self.resource(), master_id)
            .await?
            .filter(Allocation::is_master)
            .ok_or(Error::InvalidAllocation)?;

        // moving across timezones would need a migration of the stored spans
        if master.timezone != self.timezone().name() {
            return Err(Error::InvalidAllocation);
        }

        let mut new_start = params
            .new_start
            .map(|t| self.standardize(t))
            .unwrap_or(master.start);
        let mut new_end = params
            .new_end
            .map(|t| self.standardize(t))
            .unwrap_or(master.end);

        if params.whole_day {
            (new_start, new_end) = calendar::align_range_to_day(new_start, new_end, self.timezone());
        }
        (new_start, new_end) = raster::rasterize_span(new_start, new_end, master.raster);
        if new_start >= new_end {
            return Err(Error::InvalidAllocation);
        }

        let family = family_of(conn, self.resource(), master.id).await?;
        let family_ids: Vec<i64> = family.iter().map(|a| a.id).collect();

        for other in masters_in_range(conn, self.resource(), new_start, new_end).await? {
            if other.id != master.id {
                return Err(Error::OverlappingAllocation {
                    start: new_start,
                    end: new_end,
                    existing: other.id,
                });
            }
        }

        let bounds_changed = new_start != master.start || new_end != master.end;
        let slots = slots_for_allocations(conn, &family_ids).await?;

        for slot in &slots {
            let fits = new_start <= slot.start && slot.end <= new_end;
            if master.partly_available {
                if !fits {
                    return Err(Error::AffectedReservation { token: slot.token });
                }
            } else if bounds_changed {
                return Err(Error::AffectedReservation { token: slot.token });
            }
        }

        for pending in
            pending_reservations_by_target(conn, self.resource(), master.group_key).await?
        {
            match pending.timespan() {
                Some((start, end)) if master.partly_available => {
                    if !(new_start <= start && end <= new_end) {
                        return Err(Error::AffectedPendingReservation {
                            reservation_id: pending.id,
                        });
                    }
                }
                _ => {
                    if bounds_changed {
                        return Err(Error::AffectedPendingReservation {
                            reservation_id: pending.id,
                        });
                    }
                }
            }
        }

        // attributes shared across the whole (possibly larger) group
        let group = params.group.unwrap_or(master.group_key);
        if let Some(manually) = params.approve_manually {
            sqlx::query(
                "UPDATE allocations SET approve_manually = $1, modified = now() \
                 WHERE resource = $2 AND group_key = $3",
            )
            .bind(manually)
            .bind(self.resource())
            .bind(group)
            .execute(&mut *conn)
            .await?;
        }
        if let Some(limit) = params.quota_limit {
            sqlx::query(
                "UPDATE allocations SET quota_limit = $1, modified = now() \
                 WHERE resource = $2 AND group_key = $3",
            )
            .bind(limit)
            .bind(self.resource())
            .bind(group)
            .execute(&mut *conn)
            .await?;
        }

        if let Some(quota) = params.quota {
            self.change_quota_tx(conn, &master, quota).await?;
        }

        // re-read: the quota change may have dropped mirrors
        let family = family_of(conn, self.resource(), master.id).await?;
        let family_ids: Vec<i64> = family.iter().map(|a| a.id).collect();

        if let Some(data) = params.data {
            sqlx::query("UPDATE allocations SET data = $1 WHERE id = ANY($2)")
                .bind(data)
                .bind(&family_ids)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query(
            "UPDATE allocations SET start_utc = $1, end_utc = $2, group_key = $3, \
             modified = now() WHERE id = ANY($4)",
        )
        .bind(new_start)
        .bind(new_end)
        .bind(group)
        .bind(&family_ids)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Delete allocations. Refuses when any reserved slot or pending
    /// reservation references the family.
    pub async fn remove_allocation(&self, target: RemoveTarget) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("remove_allocation", |conn| {
                let this = self.clone();
                let target = target.clone();
                Box::pin(async move { this.remove_allocation_tx(conn, target).await })
            })
            .await
    }

    async fn remove_allocation_tx(
        &self,
        conn: &mut PgConnection,
        target: RemoveTarget,
    ) -> Result<(), Error> {
        let allocations = match target {
            RemoveTarget::ById(id) => {
                let master = allocation_by_id(conn, self.resource(), id)
                    .await?
                    .filter(Allocation::is_master)
                    .ok_or(Error::InvalidAllocation)?;
                family_of(conn, self.resource(), master.id).await?
            }
            RemoveTarget::ByGroups(groups) => {
                allocations_by_groups(conn, self.resource(), &groups, false).await?
            }
        };

        let ids: Vec<i64> = allocations.iter().map(|a| a.id).collect();
        let slots = slots_for_allocations(conn, &ids).await?;
        if let Some(slot) = slots.first() {
            return Err(Error::AffectedReservation { token: slot.token });
        }

        let mut groups: Vec<Uuid> = allocations.iter().map(|a| a.group_key).collect();
        groups.sort();
        groups.dedup();
        for group in groups {
            let pending =
                pending_reservations_by_target(conn, self.resource(), group).await?;
            if let Some(reservation) = pending.first() {
                return Err(Error::AffectedPendingReservation {
                    reservation_id: reservation.id,
                });
            }
        }

        sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete allocations in `[start, end]` that carry no reserved slots
    /// and are referenced by no reservation, whole groups at a time.
    /// Returns how many rows were deleted.
    ///
    /// A weekday filter compares in the allocation's timezone and forces
    /// `exclude_groups`, since deleting single days out of a group would
    /// tear it apart.
    pub async fn remove_unused_allocations(
        &self,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
        days: Option<Vec<Weekday>>,
        exclude_groups: bool,
    ) -> Result<u64, Error> {
        let start = self.standardize(start);
        let end = self.standardize(end);
        let session = self.context().session()?;
        session
            .serializable("remove_unused_allocations", |conn| {
                let this = self.clone();
                let days = days.clone();
                Box::pin(async move {
                    this.remove_unused_tx(conn, start, end, days, exclude_groups)
                        .await
                })
            })
            .await
    }

    async fn remove_unused_tx(
        &self,
        conn: &mut PgConnection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        days: Option<Vec<Weekday>>,
        exclude_groups: bool,
    ) -> Result<u64, Error> {
        let exclude_groups = exclude_groups || days.is_some();
        let singleton_groups = if exclude_groups {
            "AND COUNT(*) FILTER (WHERE mirror_of IS NULL) = 1"
        } else {
            ""
        };

        // a reserved slot anywhere in the group counts as reserved, even if
        // no reservation references it (corrupt data reads as in-use)
        let sql = format!(
            "SELECT {ALLOCATION_COLS} FROM allocations a \
             WHERE a.resource = $1 AND $2 <= a.start_utc AND a.end_utc <= $3 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM reserved_slots s \
                   JOIN allocations member ON member.id = s.allocation_id \
                   WHERE member.group_key = a.group_key) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM reservations r \
                   WHERE r.resource = $1 AND r.target = a.group_key) \
               AND a.group_key IN ( \
                   SELECT group_key FROM allocations \
                   WHERE resource = $1 GROUP BY group_key \
                   HAVING $2 <= MIN(start_utc) AND MAX(end_utc) <= $3 {singleton_groups})"
        );
        let candidates = sqlx::query_as::<_, Allocation>(&sql)
            .bind(self.resource())
            .bind(start)
            .bind(end)
            .fetch_all(&mut *conn)
            .await?;

        let ids: Vec<i64> = candidates
            .iter()
            .filter(|a| match &days {
                None => true,
                Some(days) => {
                    let tz = a.tz().unwrap_or(chrono_tz::UTC);
                    days.contains(&calendar::weekday_in(tz, a.start))
                }
            })
            .map(|a| a.id)
            .collect();

        let deleted = sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        tracing::debug!(resource = %self.resource(), deleted, "removed unused allocations");
        Ok(deleted)
    }

    /// Remove every trace of this resource: reservations, reserved slots
    /// and allocations. Meant for teardown, not day-to-day operation.
    pub async fn extinguish_managed_records(&self) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("extinguish_managed_records", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    sqlx::query("DELETE FROM reservations WHERE resource = $1")
                        .bind(this.resource())
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("DELETE FROM reserved_slots WHERE resource = $1")
                        .bind(this.resource())
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("DELETE FROM allocations WHERE resource = $1")
                        .bind(this.resource())
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }
}

async fn insert_allocation(
    conn: &mut PgConnection,
    resource: Uuid,
    mirror_of: Option<i64>,
    group: Uuid,
    p: &PreparedAllocate,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Allocation, Error> {
    let sql = format!(
        "INSERT INTO allocations \
         (resource, mirror_of, group_key, timezone, start_utc, end_utc, quota, \
          quota_limit, partly_available, approve_manually, waitinglist_spots, raster, data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING {ALLOCATION_COLS}"
    );
    Ok(sqlx::query_as::<_, Allocation>(&sql)
        .bind(resource)
        .bind(mirror_of)
        .bind(group)
        .bind(&p.timezone)
        .bind(start)
        .bind(end)
        .bind(p.quota)
        .bind(p.quota_limit)
        .bind(p.partly_available)
        .bind(p.approve_manually)
        .bind(p.waitinglist_spots)
        .bind(p.raster)
        .bind(&p.data)
        .fetch_one(&mut *conn)
        .await?)
}
