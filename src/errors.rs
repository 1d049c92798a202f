use chrono::{DateTime, Utc};

use crate::model::Reservation;

/// All failure modes of the engine. Validation errors abort the current
/// transaction and propagate; serialization conflicts are retried by the
/// session layer and only surface as `TransactionRollback` once the retry
/// budget is spent.
#[derive(Debug)]
pub enum Error {
    /// A new or moved master allocation overlaps an existing one.
    OverlappingAllocation {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        existing: i64,
    },
    /// A destructive operation would lose confirmed capacity.
    AffectedReservation { token: uuid::Uuid },
    /// A destructive operation would lose a pending reservation.
    AffectedPendingReservation { reservation_id: i64 },
    /// Slot primary-key collision on approval, or a duplicate line in a
    /// session cart. Carries the offending reservation when known.
    AlreadyReserved {
        reservation: Option<Box<Reservation>>,
    },
    ReservationTooLong,
    ReservationTooShort,
    /// The requested range does not fit inside the targeted allocation.
    ReservationOutOfBounds,
    /// Reserve-time validation failed (raster misalignment, inverted range).
    ReservationParametersInvalid,
    /// Requested quota exceeds the allocation's per-reservation limit.
    QuotaOverLimit,
    /// Requested quota exceeds the allocation's total quota.
    QuotaImpossible,
    /// Requested quota is below one.
    InvalidQuota,
    /// No allocation covers the requested range.
    NotReservable {
        reservation: Option<Box<Reservation>>,
    },
    InvalidAllocation,
    /// The context's JSON codec rejected a `data` blob.
    InvalidData(serde_json::Error),
    InvalidEmailAddress,
    InvalidReservationToken,
    /// Reserve produced no reservation lines.
    InvalidReservation,
    NoReservationsToConfirm,
    /// The read session was used while the write session holds uncommitted
    /// changes it would not see.
    DirtyReadOnlySession,
    /// A write was attempted through the read-only session.
    ModifiedReadOnlySession,
    /// The serializable retry budget was exhausted.
    TransactionRollback { attempts: u32 },
    UnknownContext(String),
    ContextAlreadyExists(String),
    /// Not a known IANA timezone name.
    Timezone(String),
    Database(sqlx::Error),
}

impl Error {
    /// Attach the offending reservation to errors that carry one.
    pub(crate) fn with_reservation(self, reservation: Reservation) -> Self {
        match self {
            Error::AlreadyReserved { .. } => Error::AlreadyReserved {
                reservation: Some(Box::new(reservation)),
            },
            Error::NotReservable { .. } => Error::NotReservable {
                reservation: Some(Box::new(reservation)),
            },
            other => other,
        }
    }

    /// The reservation this error arose from, if any.
    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            Error::AlreadyReserved { reservation } | Error::NotReservable { reservation } => {
                reservation.as_deref()
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::OverlappingAllocation { start, end, existing } => write!(
                f,
                "allocation [{start}, {end}) overlaps existing allocation {existing}"
            ),
            Error::AffectedReservation { token } => {
                write!(f, "operation would lose reserved capacity of {token}")
            }
            Error::AffectedPendingReservation { reservation_id } => {
                write!(f, "operation would lose pending reservation {reservation_id}")
            }
            Error::AlreadyReserved { .. } => write!(f, "already reserved"),
            Error::ReservationTooLong => write!(f, "reservation exceeds one day"),
            Error::ReservationTooShort => write!(f, "reservation shorter than the minimum raster"),
            Error::ReservationOutOfBounds => {
                write!(f, "reservation does not fit inside the allocation")
            }
            Error::ReservationParametersInvalid => write!(f, "invalid reservation parameters"),
            Error::QuotaOverLimit => write!(f, "quota exceeds the per-reservation limit"),
            Error::QuotaImpossible => write!(f, "quota exceeds the allocation quota"),
            Error::InvalidQuota => write!(f, "quota must be at least 1"),
            Error::NotReservable { .. } => write!(f, "no allocation covers the requested range"),
            Error::InvalidAllocation => write!(f, "invalid allocation parameters"),
            Error::InvalidData(e) => write!(f, "invalid data blob: {e}"),
            Error::InvalidEmailAddress => write!(f, "invalid email address"),
            Error::InvalidReservationToken => write!(f, "unknown reservation token"),
            Error::InvalidReservation => write!(f, "reserve call produced no reservations"),
            Error::NoReservationsToConfirm => write!(f, "no reservations to confirm"),
            Error::DirtyReadOnlySession => {
                write!(f, "read-only session used while the write session is dirty")
            }
            Error::ModifiedReadOnlySession => {
                write!(f, "write attempted on the read-only session")
            }
            Error::TransactionRollback { attempts } => {
                write!(f, "serializable transaction failed after {attempts} attempts")
            }
            Error::UnknownContext(name) => write!(f, "unknown context: {name}"),
            Error::ContextAlreadyExists(name) => write!(f, "context already exists: {name}"),
            Error::Timezone(name) => write!(f, "unknown timezone: {name}"),
            Error::Database(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::InvalidData(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match sqlstate(&e).as_deref() {
            // read_only_sql_transaction: the read session's guard fired.
            Some("25006") => Error::ModifiedReadOnlySession,
            _ => Error::Database(e),
        }
    }
}

/// SQLSTATE of a driver error, if one is attached.
pub(crate) fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// True for conflicts that serializable retry is allowed to absorb:
/// serialization_failure and deadlock_detected. Unique violations are not
/// retried; on the reserved_slots primary key they mean double-booking and
/// surface immediately as `AlreadyReserved`.
pub(crate) fn is_serialization_failure(e: &sqlx::Error) -> bool {
    matches!(sqlstate(e).as_deref(), Some("40001") | Some("40P01"))
}

/// True when an insert collided with an existing primary key or unique
/// index. On the reserved_slots table this is the double-booking signal.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(sqlstate(e).as_deref(), Some("23505"))
}
