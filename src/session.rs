//! The two logical sessions of a context.
//!
//! All mutating scheduler operations run inside exactly one serializable
//! transaction on the write pool; pure queries use the read pool with
//! read-only transactions. Correctness under concurrent writers comes from
//! Postgres serializable isolation, not from in-process locks: a
//! serialization failure rolls the transaction back and the operation is
//! retried with fresh reads, up to a bounded budget.
//!
//! The guard between the two sessions works in both directions. Reads are
//! refused while a write transaction is open (`DirtyReadOnlySession`: the
//! read session would not see the uncommitted changes), and any write
//! smuggled through the read session is rejected by Postgres itself because
//! the transaction is `READ ONLY` (`ModifiedReadOnlySession`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};

use crate::errors::{is_serialization_failure, Error};
use crate::observability;
use crate::settings::Settings;

/// Base delay before the first retry; doubled per attempt up to [`MAX_BACKOFF`].
const BASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(80);

pub struct SessionProvider {
    write: PgPool,
    read: PgPool,
    /// Write transactions currently open; the read-side guard observes this.
    open_writes: AtomicUsize,
    retries: u32,
}

impl SessionProvider {
    /// Build the two pools over the settings DSN. Connections are
    /// established lazily on first use.
    pub fn connect(settings: &Settings) -> Result<Self, Error> {
        let options: PgConnectOptions = settings.dsn.parse().map_err(Error::Database)?;

        let write = PgPoolOptions::new()
            .max_connections(settings.write_pool_size)
            .connect_lazy_with(options.clone());
        let read = PgPoolOptions::new()
            .max_connections(settings.read_pool_size)
            .connect_lazy_with(options);

        Ok(Self {
            write,
            read,
            open_writes: AtomicUsize::new(0),
            retries: settings.write_retries,
        })
    }

    /// Run the embedded schema migrations. Call once per database.
    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations")
            .run(&self.write)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))
    }

    /// The write pool. Exposed for embedders that need to run their own
    /// statements in the same database (e.g. test fixtures).
    pub fn write_pool(&self) -> &PgPool {
        &self.write
    }

    /// True while a write transaction is open and uncommitted.
    pub fn is_dirty(&self) -> bool {
        self.open_writes.load(Ordering::SeqCst) > 0
    }

    /// Run `op` inside a serializable transaction, retrying serialization
    /// failures. The closure is invoked once per attempt with a fresh
    /// transaction; the outermost caller owns the commit.
    pub async fn serializable<T, F>(&self, name: &'static str, op: F) -> Result<T, Error>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, Error>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.open_writes.fetch_add(1, Ordering::SeqCst);
            let result = self.write_once(&op).await;
            self.open_writes.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok(value) => {
                    metrics::counter!(
                        observability::WRITE_TRANSACTIONS_TOTAL,
                        "op" => name, "status" => "ok"
                    )
                    .increment(1);
                    metrics::histogram!(observability::WRITE_DURATION_SECONDS, "op" => name)
                        .record(started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err(Error::Database(e)) if is_serialization_failure(&e) => {
                    if attempt > self.retries {
                        metrics::counter!(
                            observability::WRITE_TRANSACTIONS_TOTAL,
                            "op" => name, "status" => "rollback"
                        )
                        .increment(1);
                        return Err(Error::TransactionRollback { attempts: attempt });
                    }
                    metrics::counter!(observability::WRITE_RETRIES_TOTAL, "op" => name)
                        .increment(1);
                    tracing::warn!(op = name, attempt, "serialization failure, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => {
                    metrics::counter!(
                        observability::WRITE_TRANSACTIONS_TOTAL,
                        "op" => name, "status" => "error"
                    )
                    .increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn write_once<T, F>(&self, op: &F) -> Result<T, Error>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, Error>>,
    {
        let mut tx = self.write.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        match op(&mut tx).await {
            Ok(value) => {
                // serialization failures surface on commit as well
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }

    /// Run `op` inside a read-only transaction on the read pool.
    pub async fn read<T, F>(&self, name: &'static str, op: F) -> Result<T, Error>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, Error>>,
    {
        if self.is_dirty() {
            return Err(Error::DirtyReadOnlySession);
        }

        let mut tx = self.read.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        match op(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                metrics::counter!(
                    observability::READ_TRANSACTIONS_TOTAL,
                    "op" => name, "status" => "ok"
                )
                .increment(1);
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await.ok();
                metrics::counter!(
                    observability::READ_TRANSACTIONS_TOTAL,
                    "op" => name, "status" => "error"
                )
                .increment(1);
                Err(e)
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(8);
    (BASE_BACKOFF * factor).min(MAX_BACKOFF)
}
