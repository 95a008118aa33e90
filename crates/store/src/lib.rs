//! Durable indexed storage for log records and their sync-control sidecars,
//! backed by sqlx/SQLite.

pub mod cache;
pub mod error;
pub mod schema;
mod store;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

pub use cache::{NoopCache, RecordCache};
pub use error::StoreError;
pub use schema::ensure_schema;
pub use store::{BatchSummary, RecordFilter, RecordStore, SyncStats};

/// Pool connect options.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 10,
            max_connections: 100,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Connect the store pool. Extended result codes are enabled on every
/// connection so unique-constraint failures are distinguishable; foreign
/// keys are on for the usual reasons.
pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .min_connections(settings.min_connections)
        .max_connections(settings.max_connections)
        .idle_timeout(settings.idle_timeout)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA extended_result_codes = ON")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA foreign_keys = ON")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}
