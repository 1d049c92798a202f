//! Metric names emitted through the `metrics` facade. The library never
//! installs an exporter; the embedding application decides where these go.

/// Counter: write transactions started. Labels: op, status.
pub const WRITE_TRANSACTIONS_TOTAL: &str = "reserva_write_transactions_total";

/// Counter: serializable transactions retried after a serialization failure.
pub const WRITE_RETRIES_TOTAL: &str = "reserva_write_retries_total";

/// Histogram: wall time of a write transaction in seconds, including retries.
pub const WRITE_DURATION_SECONDS: &str = "reserva_write_duration_seconds";

/// Counter: read-only transactions. Labels: status.
pub const READ_TRANSACTIONS_TOTAL: &str = "reserva_read_transactions_total";

/// Counter: event hook emissions. Labels: hook.
pub const EVENTS_EMITTED_TOTAL: &str = "reserva_events_emitted_total";
