//! The reservation lifecycle: reserve, approve, deny, remove, plus the
//! session-cart maintenance around pending reservations.
//!
//! Reserving is a two-step process. `reserve` validates the request and
//! writes pending rows tied to a token; `approve_reservations` resolves the
//! targets to concrete allocation rows and writes the reserved slots. The
//! slot table's primary key turns concurrent claims on the same capacity
//! into a database conflict, so the approval step is the only place where
//! double-booking can be attempted and it always loses.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::calendar::TimeInput;
use crate::errors::{is_unique_violation, Error};
use crate::model::{
    find_spot, Allocation, Reservation, ReservationKind, ReservationStatus, ReservedSlot,
    TargetType,
};
use crate::raster;

use super::{
    allocations_by_groups, family_of, is_valid_email, is_valid_reservation_length,
    masters_in_range, pending_reservations_by_target, reservations_by_session,
    reservations_by_token, slots_for_allocations, Scheduler, RESERVATION_COLS, SLOT_COLS,
};

/// Parameters for [`Scheduler::reserve`]. Exactly one of `dates` and
/// `group` must be given.
#[derive(Debug, Clone)]
pub struct ReserveParams {
    pub email: String,
    pub dates: Vec<(TimeInput, TimeInput)>,
    pub group: Option<Uuid>,
    pub data: Option<serde_json::Value>,
    pub session_id: Option<Uuid>,
    pub quota: i32,
    /// Reuse the token already present in the session's cart, if any.
    pub single_token_per_session: bool,
}

impl ReserveParams {
    pub fn dates(email: impl Into<String>, dates: Vec<(TimeInput, TimeInput)>) -> Self {
        Self {
            email: email.into(),
            dates,
            group: None,
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        }
    }

    pub fn single(
        email: impl Into<String>,
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
    ) -> Self {
        Self::dates(email, vec![(start.into(), end.into())])
    }

    pub fn group(email: impl Into<String>, group: Uuid) -> Self {
        Self {
            email: email.into(),
            dates: Vec::new(),
            group: Some(group),
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        }
    }

    pub fn quota(mut self, quota: i32) -> Self {
        self.quota = quota;
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn single_token_per_session(mut self) -> Self {
        self.single_token_per_session = true;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A reservation line about to be written.
#[derive(Debug, Clone)]
struct Line {
    target: Uuid,
    target_type: TargetType,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    timezone: Option<String>,
    kind: ReservationKind,
}

impl Scheduler {
    /// Create pending reservations and return their shared token. The
    /// token is what `approve_reservations` consumes to write the slots.
    pub async fn reserve(&self, params: ReserveParams) -> Result<Uuid, Error> {
        let mut params = params;
        let email = params.email.trim().to_string();
        if !is_valid_email(&email) {
            return Err(Error::InvalidEmailAddress);
        }
        if params.quota < 1 {
            return Err(Error::InvalidQuota);
        }
        if params.dates.is_empty() == params.group.is_none() {
            return Err(Error::ReservationParametersInvalid);
        }
        params.data = self.encode_data(params.data.take())?;
        let dates = self.prepare_dates(&params.dates);

        let session = self.context().session()?;
        session
            .serializable("reserve", |conn| {
                let this = self.clone();
                let email = email.clone();
                let dates = dates.clone();
                let params = params.clone();
                Box::pin(async move { this.reserve_tx(conn, email, dates, params).await })
            })
            .await
    }

    async fn reserve_tx(
        &self,
        conn: &mut PgConnection,
        email: String,
        dates: Vec<(DateTime<Utc>, DateTime<Utc>)>,
        params: ReserveParams,
    ) -> Result<Uuid, Error> {
        let quota = params.quota;

        let mut lines: Vec<Line> = Vec::new();
        if let Some(group) = params.group {
            lines.push(self.group_line(conn, group, quota).await?);
        } else {
            let mut reserved_groups: Vec<Uuid> = Vec::new();

            for (start, end) in dates {
                if !is_valid_reservation_length(start, end, self.timezone()) {
                    return Err(Error::ReservationTooLong);
                }
                if start >= end || (end - start).num_minutes() < i64::from(raster::MIN_RASTER) {
                    return Err(Error::ReservationTooShort);
                }

                let masters = masters_in_range(conn, self.resource(), start, end).await?;
                let mut any_hit = false;

                for master in &masters {
                    if !master.overlaps(start, end) {
                        continue;
                    }
                    any_hit = true;

                    if self.in_group(conn, master).await? {
                        // group members are all-or-nothing: reserve the
                        // group as a whole, once
                        if reserved_groups.contains(&master.group_key) {
                            continue;
                        }
                        reserved_groups.push(master.group_key);
                        lines.push(self.group_line(conn, master.group_key, quota).await?);
                        continue;
                    }

                    self.validate_line(conn, master, start, end, quota).await?;

                    let (start, end) = raster::rasterize_span(start, end, master.raster);
                    lines.push(Line {
                        target: master.group_key,
                        target_type: TargetType::Allocation,
                        start: Some(start),
                        end: Some(end),
                        timezone: Some(master.timezone.clone()),
                        kind: if master.approve_manually {
                            ReservationKind::Waitinglist
                        } else {
                            ReservationKind::Free
                        },
                    });
                }

                if !any_hit {
                    return Err(Error::NotReservable { reservation: None });
                }
            }
        }

        if lines.is_empty() {
            return Err(Error::InvalidReservation);
        }

        // decide the token: fresh, or reused from the session's cart
        let token = match (params.single_token_per_session, params.session_id) {
            (true, Some(session_id)) => {
                reservations_by_session(conn, self.resource(), session_id)
                    .await?
                    .first()
                    .map(|r| r.token)
                    .unwrap_or_else(Uuid::new_v4)
            }
            _ => Uuid::new_v4(),
        };

        // a session cart may not contain the same line twice
        if let Some(session_id) = params.session_id {
            let existing = reservations_by_session(conn, self.resource(), session_id).await?;
            for line in &lines {
                if let Some(dup) = existing.iter().find(|r| {
                    r.target == line.target
                        && r.start == line.start
                        && r.end == line.end
                        && r.quota == quota
                }) {
                    return Err(Error::AlreadyReserved {
                        reservation: Some(Box::new(dup.clone())),
                    });
                }
            }
        }

        let mut created = Vec::with_capacity(lines.len());
        for line in &lines {
            created.push(
                insert_reservation(
                    conn,
                    self.resource(),
                    token,
                    line,
                    &email,
                    params.session_id,
                    quota,
                    params.data.as_ref(),
                )
                .await?,
            );
        }

        tracing::debug!(resource = %self.resource(), %token, lines = created.len(), "reserved");
        self.hooks().emit_reservations_made(&created);
        Ok(token)
    }

    /// True if the master's group has more than one member window.
    async fn in_group(&self, conn: &mut PgConnection, master: &Allocation) -> Result<bool, Error> {
        let members: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM allocations \
             WHERE resource = $1 AND group_key = $2 AND mirror_of IS NULL",
        )
        .bind(self.resource())
        .bind(master.group_key)
        .fetch_one(&mut *conn)
        .await?;
        Ok(members > 1)
    }

    /// Build the single line reserving a whole group, after checking that
    /// the group can still take the reservation.
    async fn group_line(
        &self,
        conn: &mut PgConnection,
        group: Uuid,
        quota: i32,
    ) -> Result<Line, Error> {
        let masters = self.group_masters(conn, group).await?;
        if masters.is_empty() {
            return Err(Error::NotReservable { reservation: None });
        }

        let sample = &masters[0];
        if 0 < sample.quota_limit && sample.quota_limit < quota {
            return Err(Error::QuotaOverLimit);
        }
        if sample.quota < quota {
            return Err(Error::QuotaImpossible);
        }

        if sample.approve_manually {
            self.check_waitinglist(conn, sample).await?;
        } else {
            // at least one member must still have a free spot
            let mut free = 0;
            for master in &masters {
                let family = family_of(conn, self.resource(), master.id).await?;
                let ids: Vec<i64> = family.iter().map(|a| a.id).collect();
                let slots = slots_for_allocations(conn, &ids).await?;
                free += family
                    .iter()
                    .filter(|a| a.is_available_for(&slots, None, None))
                    .count();
            }
            if free < quota as usize {
                return Err(Error::AlreadyReserved { reservation: None });
            }
        }

        Ok(Line {
            target: group,
            target_type: TargetType::Group,
            start: None,
            end: None,
            timezone: Some(sample.timezone.clone()),
            kind: if sample.approve_manually {
                ReservationKind::Waitinglist
            } else {
                ReservationKind::Free
            },
        })
    }

    async fn validate_line(
        &self,
        conn: &mut PgConnection,
        master: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        quota: i32,
    ) -> Result<(), Error> {
        if master.partly_available {
            if !raster::is_aligned(start, master.raster) || !raster::is_aligned(end, master.raster)
            {
                return Err(Error::ReservationParametersInvalid);
            }
            if !master.contains(start, end) {
                return Err(Error::ReservationOutOfBounds);
            }
        } else if start != master.start || end != master.end {
            // the whole window or nothing
            return Err(Error::ReservationParametersInvalid);
        }

        if 0 < master.quota_limit && master.quota_limit < quota {
            return Err(Error::QuotaOverLimit);
        }
        if master.quota < quota {
            return Err(Error::QuotaImpossible);
        }

        if master.approve_manually {
            // the reservation joins the waiting list, no spot needed yet
            self.check_waitinglist(conn, master).await?;
            return Ok(());
        }

        let family = family_of(conn, self.resource(), master.id).await?;
        let ids: Vec<i64> = family.iter().map(|a| a.id).collect();
        let slots = slots_for_allocations(conn, &ids).await?;

        if find_spot(&family, &slots, start, end).is_none() {
            return Err(Error::AlreadyReserved { reservation: None });
        }
        let free = family
            .iter()
            .filter(|a| a.is_available_for(&slots, Some(start), Some(end)))
            .count();
        if free < quota as usize {
            return Err(Error::AlreadyReserved { reservation: None });
        }
        Ok(())
    }

    async fn check_waitinglist(
        &self,
        conn: &mut PgConnection,
        master: &Allocation,
    ) -> Result<(), Error> {
        if let Some(cap) = master.waitinglist_spots {
            let pending =
                pending_reservations_by_target(conn, self.resource(), master.group_key).await?;
            if pending.len() >= cap as usize {
                return Err(Error::AlreadyReserved { reservation: None });
            }
        }
        Ok(())
    }

    async fn group_masters(
        &self,
        conn: &mut PgConnection,
        group: Uuid,
    ) -> Result<Vec<Allocation>, Error> {
        let mut masters = allocations_by_groups(conn, self.resource(), &[group], true).await?;
        masters.sort_by_key(|a| a.id);
        Ok(masters)
    }

    /// Approve every pending reservation with this token: resolve targets,
    /// write the reserved slots, flip the status. Returns the created
    /// slots. A capacity conflict surfaces as `AlreadyReserved` carrying
    /// the reservation it arose from, and rolls the whole approval back.
    pub async fn approve_reservations(&self, token: Uuid) -> Result<Vec<ReservedSlot>, Error> {
        let session = self.context().session()?;
        session
            .serializable("approve_reservations", |conn| {
                let this = self.clone();
                Box::pin(async move { this.approve_tx(conn, token).await })
            })
            .await
    }

    async fn approve_tx(
        &self,
        conn: &mut PgConnection,
        token: Uuid,
    ) -> Result<Vec<ReservedSlot>, Error> {
        let all = reservations_by_token(conn, self.resource(), token, None).await?;
        if all.is_empty() {
            return Err(Error::InvalidReservationToken);
        }

        let mut approved = Vec::new();
        let mut created = Vec::new();

        for reservation in all.into_iter().filter(Reservation::is_pending) {
            let slots = match self.approve_one(conn, &reservation).await {
                Ok(slots) => slots,
                Err(e) => return Err(e.with_reservation(reservation)),
            };
            if slots.is_empty() {
                return Err(Error::NotReservable {
                    reservation: Some(Box::new(reservation)),
                });
            }

            sqlx::query(
                "UPDATE reservations SET status = 'approved', modified = now() WHERE id = $1",
            )
            .bind(reservation.id)
            .execute(&mut *conn)
            .await?;

            created.extend(slots);
            let mut reservation = reservation;
            reservation.status = ReservationStatus::Approved;
            approved.push(reservation);
        }

        if !approved.is_empty() {
            tracing::debug!(
                resource = %self.resource(), %token,
                reservations = approved.len(), slots = created.len(),
                "approved"
            );
            self.hooks().emit_reservations_approved(&approved);
            self.hooks().emit_reserved_slots_reserved(&created);
        }
        Ok(created)
    }

    async fn approve_one(
        &self,
        conn: &mut PgConnection,
        reservation: &Reservation,
    ) -> Result<Vec<ReservedSlot>, Error> {
        let mut created = Vec::new();

        match reservation.target_type {
            TargetType::Group => {
                // one spot per quota unit, first free allocation by id wins
                let masters = self.group_masters(conn, reservation.target).await?;
                for _ in 0..reservation.quota {
                    let mut found = false;
                    for master in &masters {
                        if self
                            .claim_spot(conn, master, None, None, reservation.token, &mut created)
                            .await?
                        {
                            found = true;
                            break;
                        }
                    }
                    if !found {
                        return Err(Error::AlreadyReserved { reservation: None });
                    }
                }
            }
            TargetType::Allocation => {
                let (start, end) = reservation
                    .timespan()
                    .ok_or(Error::ReservationParametersInvalid)?;

                let masters = masters_in_range(conn, self.resource(), start, end).await?;
                for master in masters.iter().filter(|m| m.overlaps(start, end)) {
                    for _ in 0..reservation.quota {
                        if !self
                            .claim_spot(
                                conn,
                                master,
                                Some(start),
                                Some(end),
                                reservation.token,
                                &mut created,
                            )
                            .await?
                        {
                            return Err(Error::AlreadyReserved { reservation: None });
                        }
                    }
                }
            }
        }

        Ok(created)
    }

    /// Find a free row in the master's family and write the slots for the
    /// given range (the full window when none is given). Returns false when
    /// the family is exhausted.
    async fn claim_spot(
        &self,
        conn: &mut PgConnection,
        master: &Allocation,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        token: Uuid,
        created: &mut Vec<ReservedSlot>,
    ) -> Result<bool, Error> {
        let family = family_of(conn, self.resource(), master.id).await?;
        let ids: Vec<i64> = family.iter().map(|a| a.id).collect();
        let mut slots = slots_for_allocations(conn, &ids).await?;
        // slots written earlier in this approval are part of the picture
        slots.extend(
            created
                .iter()
                .filter(|s| ids.contains(&s.allocation_id))
                .cloned(),
        );

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            _ => (master.start, master.end),
        };
        let Some(spot) = find_spot(&family, &slots, start, end) else {
            return Ok(false);
        };

        for (slot_start, slot_end) in spot.all_slots(Some(start), Some(end)) {
            created.push(insert_slot(conn, self.resource(), spot.id, slot_start, slot_end, token).await?);
        }
        Ok(true)
    }

    /// Drop the pending reservations of a token. Approved reservations are
    /// untouched; removing those takes `remove_reservation`.
    pub async fn deny_reservation(&self, token: Uuid) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("deny_reservation", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let sql = format!(
                        "DELETE FROM reservations \
                         WHERE resource = $1 AND token = $2 AND status = 'pending' \
                         RETURNING {RESERVATION_COLS}"
                    );
                    let denied = sqlx::query_as::<_, Reservation>(&sql)
                        .bind(this.resource())
                        .bind(token)
                        .fetch_all(&mut *conn)
                        .await?;

                    if !denied.is_empty() {
                        tracing::debug!(resource = %this.resource(), %token, "denied");
                        this.hooks().emit_reservations_denied(&denied);
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Delete reservations with this token (optionally only one id) along
    /// with their reserved slots.
    pub async fn remove_reservation(&self, token: Uuid, id: Option<i64>) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("remove_reservation", |conn| {
                let this = self.clone();
                Box::pin(async move { this.remove_reservation_tx(conn, token, id).await })
            })
            .await
    }

    async fn remove_reservation_tx(
        &self,
        conn: &mut PgConnection,
        token: Uuid,
        id: Option<i64>,
    ) -> Result<(), Error> {
        let reservations = reservations_by_token(conn, self.resource(), token, id).await?;
        if reservations.is_empty() {
            return Err(Error::InvalidReservationToken);
        }

        let mut released = Vec::new();
        for reservation in &reservations {
            released.extend(self.release_slots_of(conn, reservation).await?);
        }

        let ids: Vec<i64> = reservations.iter().map(|r| r.id).collect();
        sqlx::query("DELETE FROM reservations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *conn)
            .await?;

        tracing::debug!(
            resource = %self.resource(), %token,
            reservations = ids.len(), slots = released.len(),
            "removed"
        );
        self.hooks().emit_reservations_removed(&reservations);
        if !released.is_empty() {
            self.hooks().emit_reserved_slots_released(&released);
        }
        Ok(())
    }

    /// Delete the reserved slots belonging to one reservation row.
    async fn release_slots_of(
        &self,
        conn: &mut PgConnection,
        reservation: &Reservation,
    ) -> Result<Vec<ReservedSlot>, Error> {
        let family =
            allocations_by_groups(conn, self.resource(), &[reservation.target], false).await?;
        let ids: Vec<i64> = family.iter().map(|a| a.id).collect();

        let sql = format!(
            "DELETE FROM reserved_slots \
             WHERE resource = $1 AND reservation_token = $2 AND allocation_id = ANY($3) \
               AND ($4::TIMESTAMPTZ IS NULL OR start_utc >= $4) \
               AND ($5::TIMESTAMPTZ IS NULL OR start_utc < $5) \
             RETURNING {SLOT_COLS}"
        );
        Ok(sqlx::query_as::<_, ReservedSlot>(&sql)
            .bind(self.resource())
            .bind(reservation.token)
            .bind(&ids)
            .bind(reservation.start)
            .bind(reservation.end)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Change the timespan (and optionally quota) of one reservation, within
    /// its current allocation. Returns the updated reservation, or `None`
    /// when there was nothing to change.
    pub async fn change_reservation(
        &self,
        token: Uuid,
        id: i64,
        new_start: impl Into<TimeInput>,
        new_end: impl Into<TimeInput>,
        quota: Option<i32>,
    ) -> Result<Option<Reservation>, Error> {
        let new_start = self.standardize(new_start);
        let new_end = self.standardize(new_end);
        let session = self.context().session()?;
        session
            .serializable("change_reservation", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    this.change_reservation_tx(conn, token, id, new_start, new_end, quota)
                        .await
                })
            })
            .await
    }

    async fn change_reservation_tx(
        &self,
        conn: &mut PgConnection,
        token: Uuid,
        id: i64,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        quota: Option<i32>,
    ) -> Result<Option<Reservation>, Error> {
        let reservation = reservations_by_token(conn, self.resource(), token, Some(id))
            .await?
            .into_iter()
            .next()
            .ok_or(Error::InvalidReservationToken)?;

        if reservation.target_type != TargetType::Allocation {
            return Err(Error::ReservationParametersInvalid);
        }
        let quota = quota.unwrap_or(reservation.quota);
        if quota < 1 {
            return Err(Error::InvalidQuota);
        }

        let masters = self.group_masters(conn, reservation.target).await?;
        let master = masters.first().ok_or(Error::NotReservable {
            reservation: Some(Box::new(reservation.clone())),
        })?;
        if !master.partly_available {
            return Err(Error::ReservationParametersInvalid);
        }

        let (new_start, new_end) = raster::rasterize_span(new_start, new_end, master.raster);
        if reservation.timespan() == Some((new_start, new_end)) && reservation.quota == quota {
            return Ok(None);
        }
        if !master.contains(new_start, new_end) {
            return Err(Error::ReservationOutOfBounds);
        }

        let old_slots = match reservation.status {
            ReservationStatus::Approved => self.release_slots_of(conn, &reservation).await?,
            ReservationStatus::Pending => Vec::new(),
        };

        let sql = format!(
            "UPDATE reservations SET start_utc = $1, end_utc = $2, quota = $3, \
             modified = now() WHERE id = $4 RETURNING {RESERVATION_COLS}"
        );
        let updated = sqlx::query_as::<_, Reservation>(&sql)
            .bind(new_start)
            .bind(new_end)
            .bind(quota)
            .bind(reservation.id)
            .fetch_one(&mut *conn)
            .await?;

        if updated.status == ReservationStatus::Approved {
            let mut created = Vec::new();
            for _ in 0..quota {
                if !self
                    .claim_spot(conn, master, Some(new_start), Some(new_end), token, &mut created)
                    .await?
                {
                    return Err(Error::AlreadyReserved {
                        reservation: Some(Box::new(updated)),
                    });
                }
            }
            self.hooks().emit_reserved_slots_released(&old_slots);
            self.hooks().emit_reserved_slots_reserved(&created);
        }

        Ok(Some(updated))
    }

    /// Change the email on all reservations of a token.
    pub async fn change_email(&self, token: Uuid, new_email: &str) -> Result<(), Error> {
        let new_email = new_email.trim().to_string();
        if !is_valid_email(&new_email) {
            return Err(Error::InvalidEmailAddress);
        }
        let session = self.context().session()?;
        session
            .serializable("change_email", |conn| {
                let this = self.clone();
                let new_email = new_email.clone();
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE reservations SET email = $1, modified = now() \
                         WHERE resource = $2 AND token = $3",
                    )
                    .bind(&new_email)
                    .bind(this.resource())
                    .bind(token)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    // ── Session carts ────────────────────────────────────────────

    /// Detach a session's reservations from the cart (they survive session
    /// expiry afterwards). With a token, only that token's lines.
    pub async fn confirm_reservations_for_session(
        &self,
        session_id: Uuid,
        token: Option<Uuid>,
    ) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("confirm_reservations_for_session", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let sql = format!(
                        "UPDATE reservations SET session_id = NULL, modified = now() \
                         WHERE resource = $1 AND session_id = $2 \
                           AND ($3::UUID IS NULL OR token = $3) \
                         RETURNING {RESERVATION_COLS}"
                    );
                    let confirmed = sqlx::query_as::<_, Reservation>(&sql)
                        .bind(this.resource())
                        .bind(session_id)
                        .bind(token)
                        .fetch_all(&mut *conn)
                        .await?;

                    if confirmed.is_empty() {
                        return Err(Error::NoReservationsToConfirm);
                    }
                    this.hooks().emit_reservations_confirmed(confirmed, session_id);
                    Ok(())
                })
            })
            .await
    }

    /// Drop one token's reservations out of a session cart, slots included.
    /// The remaining cart lines get a fresh `modified` timestamp so recent
    /// activity keeps the whole cart alive.
    pub async fn remove_reservation_from_session(
        &self,
        session_id: Uuid,
        token: Uuid,
    ) -> Result<(), Error> {
        let session = self.context().session()?;
        session
            .serializable("remove_reservation_from_session", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let sql = format!(
                        "DELETE FROM reservations \
                         WHERE resource = $1 AND session_id = $2 AND token = $3 \
                         RETURNING {RESERVATION_COLS}"
                    );
                    let removed = sqlx::query_as::<_, Reservation>(&sql)
                        .bind(this.resource())
                        .bind(session_id)
                        .bind(token)
                        .fetch_all(&mut *conn)
                        .await?;
                    if removed.is_empty() {
                        return Err(Error::InvalidReservationToken);
                    }

                    // auto-approved carts already carry slots
                    let slot_sql = format!(
                        "DELETE FROM reserved_slots \
                         WHERE resource = $1 AND reservation_token = $2 \
                         RETURNING {SLOT_COLS}"
                    );
                    let released = sqlx::query_as::<_, ReservedSlot>(&slot_sql)
                        .bind(this.resource())
                        .bind(token)
                        .fetch_all(&mut *conn)
                        .await?;

                    sqlx::query(
                        "UPDATE reservations SET modified = now() \
                         WHERE resource = $1 AND session_id = $2",
                    )
                    .bind(this.resource())
                    .bind(session_id)
                    .execute(&mut *conn)
                    .await?;

                    this.hooks().emit_reservations_removed(&removed);
                    if !released.is_empty() {
                        this.hooks().emit_reserved_slots_released(&released);
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Session ids whose pending cart lines all predate the cutoff.
    pub async fn find_expired_reservation_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, Error> {
        let session = self.context().session()?;
        session
            .read("find_expired_reservation_sessions", |conn| {
                let this = self.clone();
                Box::pin(async move { expired_sessions(conn, this.resource(), cutoff).await })
            })
            .await
    }

    /// Delete the pending reservations of all sessions expired at the
    /// cutoff. Approved reservations are never touched by this path.
    /// Returns the expired session ids.
    pub async fn remove_expired_reservation_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, Error> {
        let session = self.context().session()?;
        session
            .serializable("remove_expired_reservation_sessions", |conn| {
                let this = self.clone();
                Box::pin(async move {
                    let expired = expired_sessions(conn, this.resource(), cutoff).await?;
                    if expired.is_empty() {
                        return Ok(expired);
                    }

                    let sql = format!(
                        "DELETE FROM reservations \
                         WHERE resource = $1 AND session_id = ANY($2) AND status = 'pending' \
                         RETURNING {RESERVATION_COLS}"
                    );
                    let removed = sqlx::query_as::<_, Reservation>(&sql)
                        .bind(this.resource())
                        .bind(&expired)
                        .fetch_all(&mut *conn)
                        .await?;

                    if !removed.is_empty() {
                        tracing::debug!(
                            resource = %this.resource(),
                            sessions = expired.len(),
                            reservations = removed.len(),
                            "expired session carts removed"
                        );
                        this.hooks().emit_reservations_removed(&removed);
                    }
                    Ok(expired)
                })
            })
            .await
    }
}

async fn expired_sessions(
    conn: &mut PgConnection,
    resource: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, Error> {
    Ok(sqlx::query_scalar(
        "SELECT session_id FROM reservations \
         WHERE resource = $1 AND session_id IS NOT NULL AND status = 'pending' \
         GROUP BY session_id \
         HAVING MAX(GREATEST(created, COALESCE(modified, created))) < $2",
    )
    .bind(resource)
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?)
}

#[allow(clippy::too_many_arguments)]
async fn insert_reservation(
    conn: &mut PgConnection,
    resource: Uuid,
    token: Uuid,
    line: &Line,
    email: &str,
    session_id: Option<Uuid>,
    quota: i32,
    data: Option<&serde_json::Value>,
) -> Result<Reservation, Error> {
    let sql = format!(
        "INSERT INTO reservations \
         (token, target, target_type, resource, start_utc, end_utc, timezone, \
          status, kind, email, session_id, quota, data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12) \
         RETURNING {RESERVATION_COLS}"
    );
    Ok(sqlx::query_as::<_, Reservation>(&sql)
        .bind(token)
        .bind(line.target)
        .bind(line.target_type)
        .bind(resource)
        .bind(line.start)
        .bind(line.end)
        .bind(&line.timezone)
        .bind(line.kind)
        .bind(email)
        .bind(session_id)
        .bind(quota)
        .bind(data)
        .fetch_one(&mut *conn)
        .await?)
}

async fn insert_slot(
    conn: &mut PgConnection,
    resource: Uuid,
    allocation_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    token: Uuid,
) -> Result<ReservedSlot, Error> {
    let sql = format!(
        "INSERT INTO reserved_slots \
         (resource, allocation_id, start_utc, end_utc, reservation_token) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {SLOT_COLS}"
    );
    sqlx::query_as::<_, ReservedSlot>(&sql)
        .bind(resource)
        .bind(allocation_id)
        .bind(start)
        .bind(end)
        .bind(token)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyReserved { reservation: None }
            } else {
                e.into()
            }
        })
}
