//! The public API of the engine.
//!
//! A [`Scheduler`] is bound to one `(context, resource)` pair and talks to
//! the context's sessions: mutating calls open the serializable write
//! session, check preconditions, write rows and fire events; pure queries
//! use the read session. The submodules split the surface the same way the
//! data flows: `mutations` for the allocation side, `reserve` for the
//! reservation lifecycle, `queries` for reads, `availability` for the pure
//! aggregation math.

mod availability;
mod mutations;
mod queries;
mod reserve;

pub use availability::{availability_by_allocations, AllocationUsage};
pub use mutations::{AllocateParams, AllocationChanges, MoveParams, RemoveTarget};
pub use queries::{GroupFilter, SearchParams, WholeDayFilter};
pub use reserve::ReserveParams;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::calendar::{self, TimeInput};
use crate::errors::Error;
use crate::events::EventHooks;
use crate::model::{Allocation, Reservation, ReservedSlot};
use crate::registry::{Context, Registry};

/// The main handle. Cheap to clone; clones share the context.
#[derive(Clone)]
pub struct Scheduler {
    context: Context,
    resource: Uuid,
    timezone: Tz,
}

impl Scheduler {
    /// Bind a scheduler to a resource of a context. The timezone decides
    /// what a whole day means and how naive inputs are interpreted; it must
    /// not change once allocations exist.
    pub fn new(context: Context, resource: Uuid, timezone: &str) -> Result<Self, Error> {
        let timezone = calendar::parse_tz(timezone)?;
        Ok(Self {
            context,
            resource,
            timezone,
        })
    }

    /// Convenience constructor resolving the context by name.
    pub fn from_registry(
        registry: &Registry,
        context_name: &str,
        resource: Uuid,
        timezone: &str,
    ) -> Result<Self, Error> {
        Self::new(registry.context(context_name)?, resource, timezone)
    }

    pub fn resource(&self) -> Uuid {
        self.resource
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn hooks(&self) -> &EventHooks {
        self.context.hooks()
    }

    pub(crate) fn standardize(&self, input: impl Into<TimeInput>) -> DateTime<Utc> {
        calendar::standardize(input, self.timezone)
    }

    /// Run a caller-supplied `data` blob through the context's JSON codec
    /// before it is stored. A codec that rejects the blob aborts the
    /// operation with `InvalidData`.
    pub(crate) fn encode_data(
        &self,
        data: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, Error> {
        match data {
            Some(value) => {
                let codec = &self.context.settings().json;
                Ok(Some(codec.reencode(&value).map_err(Error::InvalidData)?))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn prepare_dates(
        &self,
        dates: &[(TimeInput, TimeInput)],
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        dates
            .iter()
            .map(|(s, e)| (self.standardize(*s), self.standardize(*e)))
            .collect()
    }
}

/// A reservation may span at most a day, with a little slack for whole-day
/// spans on 25-hour DST transition days.
pub(crate) fn is_valid_reservation_length(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
) -> bool {
    if end - start <= Duration::hours(24) {
        return true;
    }
    calendar::is_whole_day(start, end, tz) && end - start <= Duration::hours(25)
}

/// Deliberately simple: one `@`, something on both sides, a dot in the
/// domain. Anything stricter belongs to the caller.
pub(crate) fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

// ── Row helpers shared by the submodules ─────────────────────────

pub(crate) const ALLOCATION_COLS: &str = "id, resource, mirror_of, group_key, timezone, \
     start_utc, end_utc, quota, quota_limit, partly_available, approve_manually, \
     waitinglist_spots, raster, data, created, modified";

pub(crate) const RESERVATION_COLS: &str = "id, token, target, target_type, resource, \
     start_utc, end_utc, timezone, status, kind, email, session_id, quota, data, \
     created, modified";

pub(crate) const SLOT_COLS: &str =
    "resource, allocation_id, start_utc, end_utc, reservation_token, created";

/// Master allocations of a resource overlapping `[start, end)`.
pub(crate) async fn masters_in_range(
    conn: &mut PgConnection,
    resource: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Allocation>, Error> {
    let sql = format!(
        "SELECT {ALLOCATION_COLS} FROM allocations \
         WHERE resource = $1 AND mirror_of IS NULL \
           AND start_utc < $3 AND end_utc > $2 \
         ORDER BY start_utc, id"
    );
    Ok(sqlx::query_as::<_, Allocation>(&sql)
        .bind(resource)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *conn)
        .await?)
}

/// One allocation row of this resource, master or mirror.
pub(crate) async fn allocation_by_id(
    conn: &mut PgConnection,
    resource: Uuid,
    id: i64,
) -> Result<Option<Allocation>, Error> {
    let sql = format!(
        "SELECT {ALLOCATION_COLS} FROM allocations WHERE resource = $1 AND id = $2"
    );
    Ok(sqlx::query_as::<_, Allocation>(&sql)
        .bind(resource)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// A master and its mirrors, master first, mirrors by ascending id.
pub(crate) async fn family_of(
    conn: &mut PgConnection,
    resource: Uuid,
    master_id: i64,
) -> Result<Vec<Allocation>, Error> {
    let sql = format!(
        "SELECT {ALLOCATION_COLS} FROM allocations \
         WHERE resource = $1 AND (id = $2 OR mirror_of = $2) \
         ORDER BY mirror_of NULLS FIRST, id"
    );
    Ok(sqlx::query_as::<_, Allocation>(&sql)
        .bind(resource)
        .bind(master_id)
        .fetch_all(&mut *conn)
        .await?)
}

/// All reserved slots referencing the given allocation rows.
pub(crate) async fn slots_for_allocations(
    conn: &mut PgConnection,
    allocation_ids: &[i64],
) -> Result<Vec<ReservedSlot>, Error> {
    let sql = format!(
        "SELECT {SLOT_COLS} FROM reserved_slots WHERE allocation_id = ANY($1) \
         ORDER BY allocation_id, start_utc"
    );
    Ok(sqlx::query_as::<_, ReservedSlot>(&sql)
        .bind(allocation_ids)
        .fetch_all(&mut *conn)
        .await?)
}

/// Allocations of the given groups; optionally masters only.
pub(crate) async fn allocations_by_groups(
    conn: &mut PgConnection,
    resource: Uuid,
    groups: &[Uuid],
    masters_only: bool,
) -> Result<Vec<Allocation>, Error> {
    let masters = if masters_only {
        "AND mirror_of IS NULL"
    } else {
        ""
    };
    let sql = format!(
        "SELECT {ALLOCATION_COLS} FROM allocations \
         WHERE resource = $1 AND group_key = ANY($2) {masters} \
         ORDER BY start_utc, id"
    );
    Ok(sqlx::query_as::<_, Allocation>(&sql)
        .bind(resource)
        .bind(groups)
        .fetch_all(&mut *conn)
        .await?)
}

/// Pending reservations targeting a group.
pub(crate) async fn pending_reservations_by_target(
    conn: &mut PgConnection,
    resource: Uuid,
    target: Uuid,
) -> Result<Vec<Reservation>, Error> {
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource = $1 AND target = $2 AND status = 'pending' \
         ORDER BY id"
    );
    Ok(sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource)
        .bind(target)
        .fetch_all(&mut *conn)
        .await?)
}

/// Reservations with this token, optionally narrowed to one id.
pub(crate) async fn reservations_by_token(
    conn: &mut PgConnection,
    resource: Uuid,
    token: Uuid,
    id: Option<i64>,
) -> Result<Vec<Reservation>, Error> {
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource = $1 AND token = $2 AND ($3::BIGINT IS NULL OR id = $3) \
         ORDER BY id"
    );
    Ok(sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource)
        .bind(token)
        .bind(id)
        .fetch_all(&mut *conn)
        .await?)
}

/// All reservations of a session cart, oldest first.
pub(crate) async fn reservations_by_session(
    conn: &mut PgConnection,
    resource: Uuid,
    session_id: Uuid,
) -> Result<Vec<Reservation>, Error> {
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource = $1 AND session_id = $2 \
         ORDER BY created, id"
    );
    Ok(sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource)
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await?)
}
