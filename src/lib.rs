//! A reservations engine.
//!
//! Allocations open windows of reservable time on named resources;
//! reservations claim capacity inside those windows, pending first and
//! approved once their reserved slots are written. The composite primary
//! key on reserved slots makes double-booking a database conflict, and
//! every mutating operation runs inside a serializable Postgres
//! transaction with bounded retry, so correctness under concurrent writers
//! comes from the store rather than from in-process locks.
//!
//! ```no_run
//! use reserva::{AllocateParams, Registry, ReserveParams, Scheduler, Settings};
//! use uuid::Uuid;
//!
//! # async fn demo() -> Result<(), reserva::Error> {
//! let registry = Registry::new();
//! let context = registry.register(
//!     "my-app",
//!     Settings::new("postgres://localhost/my_app").with_timezone("Europe/Zurich"),
//! )?;
//! context.migrate().await?;
//!
//! let scheduler = Scheduler::new(context, Uuid::new_v4(), "Europe/Zurich")?;
//!
//! let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
//! let start = day.and_hms_opt(9, 0, 0).unwrap();
//! let end = day.and_hms_opt(17, 0, 0).unwrap();
//!
//! scheduler
//!     .allocate(AllocateParams::single(start, end).approve_manually(false))
//!     .await?;
//! let token = scheduler
//!     .reserve(ReserveParams::single("alice@example.org", start, end))
//!     .await?;
//! scheduler.approve_reservations(token).await?;
//! # Ok(())
//! # }
//! ```

pub mod calendar;
pub mod errors;
pub mod events;
pub mod model;
pub mod observability;
pub mod raster;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod settings;

pub use calendar::TimeInput;
pub use errors::Error;
pub use events::EventHooks;
pub use model::{
    Allocation, Reservation, ReservationKind, ReservationStatus, ReservedSlot, TargetType,
};
pub use registry::{default_registry, Context, Registry};
pub use scheduler::{
    AllocateParams, AllocationChanges, GroupFilter, MoveParams, RemoveTarget, ReserveParams,
    Scheduler, SearchParams, WholeDayFilter,
};
pub use session::SessionProvider;
pub use settings::{JsonCodec, Settings};
