//! Indexed storage of records and their sync sidecars.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ledgerlog_core::{LogLevel, LogRecord, SyncControl, SyncStatus};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

use crate::cache::{NoopCache, RecordCache};
use crate::error::{is_unique_violation, StoreError};

const RECORD_COLUMNS: &str = "id, timestamp, source, level, message, metadata, stacktrace, hash, \
                              created_ms, batch_id, merkle_root, batched_ms";
const SYNC_COLUMNS: &str =
    "record_id, status, batch_id, ledger_tx_id, created_ms, synced_ms, failed_ms, last_error";

/// Equality filter for list queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source: Option<String>,
    pub level: Option<LogLevel>,
}

/// Aggregated sync-control counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub pending: i64,
    pub pending_batch: i64,
    pub synced: i64,
    pub failed: i64,
    pub total: i64,
}

/// One row of the batch listing.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub merkle_root: String,
    pub record_count: i64,
    pub batched_at: DateTime<Utc>,
}

pub struct RecordStore {
    pool: Pool<Sqlite>,
    op_timeout: Duration,
    cache: Arc<dyn RecordCache>,
}

impl RecordStore {
    pub fn new(pool: Pool<Sqlite>, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            cache: Arc::new(NoopCache),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn RecordCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.op_timeout)))
    }

    /// Insert one record. Fails with `Duplicate` when the id already exists.
    pub async fn insert_record(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.deadline(async {
            insert_record_exec(&self.pool, record).await
        })
        .await?;
        self.cache.invalidate_record(&record.id).await;
        self.cache.invalidate_source(&record.source).await;
        Ok(())
    }

    /// Insert a record together with its sync sidecar in one transaction, so
    /// the one-sidecar-per-record invariant cannot be observed broken.
    pub async fn ingest(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.deadline(async {
            let mut tx = self.pool.begin().await?;
            if let Err(e) = insert_record_tx(&mut tx, record).await {
                tx.rollback().await.ok();
                return Err(e);
            }
            let control = SyncControl::new(record.id.clone(), record.created_at);
            insert_sync_control_tx(&mut tx, &control).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_record(&record.id).await;
        self.cache.invalidate_source(&record.source).await;
        Ok(())
    }

    pub async fn insert_sync_control(&self, control: &SyncControl) -> Result<(), StoreError> {
        self.deadline(async {
            let mut tx = self.pool.begin().await?;
            insert_sync_control_tx(&mut tx, control).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_sync_control(&self, control: &SyncControl) -> Result<(), StoreError> {
        self.deadline(async {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO sync_control ({SYNC_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))
            .bind(&control.record_id)
            .bind(control.status.as_str())
            .bind(&control.batch_id)
            .bind(&control.ledger_tx_id)
            .bind(control.created_at.timestamp_millis())
            .bind(control.synced_at.map(|t| t.timestamp_millis()))
            .bind(control.failed_at.map(|t| t.timestamp_millis()))
            .bind(&control.last_error)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn find_record_by_id(&self, id: &str) -> Result<LogRecord, StoreError> {
        self.deadline(async {
            let row = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM log_records WHERE id = ?1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => record_from_row(&row),
                None => Err(StoreError::NotFound),
            }
        })
        .await
    }

    /// List records matching the filter, newest first.
    pub async fn find_records(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LogRecord>, StoreError> {
        self.deadline(async {
            let mut sql = format!("SELECT {RECORD_COLUMNS} FROM log_records");
            push_filter_clause(&mut sql, filter);
            sql.push_str(" ORDER BY created_ms DESC, rowid DESC LIMIT ? OFFSET ?");

            let mut query = sqlx::query(&sql);
            if let Some(source) = &filter.source {
                query = query.bind(source);
            }
            if let Some(level) = filter.level {
                query = query.bind(level.as_str());
            }
            let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    pub async fn count_records(&self, filter: &RecordFilter) -> Result<i64, StoreError> {
        self.deadline(async {
            let mut sql = String::from("SELECT COUNT(*) AS n FROM log_records");
            push_filter_clause(&mut sql, filter);
            let mut query = sqlx::query(&sql);
            if let Some(source) = &filter.source {
                query = query.bind(source);
            }
            if let Some(level) = filter.level {
                query = query.bind(level.as_str());
            }
            Ok(query.fetch_one(&self.pool).await?.get::<i64, _>("n"))
        })
        .await
    }

    /// Claim candidates for the next batch: records without a batch id,
    /// oldest first. The returned order is the Merkle input order.
    pub async fn find_unbatched(&self, limit: i64) -> Result<Vec<LogRecord>, StoreError> {
        self.deadline(async {
            let rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM log_records WHERE batch_id IS NULL \
                 ORDER BY created_ms ASC, rowid ASC LIMIT ?1"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    /// All records of one batch in the order used at batch creation.
    pub async fn find_by_batch(&self, batch_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        self.deadline(async {
            let rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM log_records WHERE batch_id = ?1 \
                 ORDER BY created_ms ASC, rowid ASC"
            ))
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    /// Atomically stamp `batch_id`/`merkle_root`/`batched_at` onto exactly the
    /// given records. Records that were tagged concurrently no longer match
    /// the `batch_id IS NULL` guard; in that case the transaction rolls back
    /// and `TagMismatch` reports the discrepancy, leaving no partial state.
    pub async fn tag_batch(
        &self,
        ids: &[String],
        batch_id: &str,
        merkle_root: &str,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sources = self
            .deadline(async {
                let mut tx = self.pool.begin().await?;
                let sql = format!(
                    "UPDATE log_records SET batch_id = ?, merkle_root = ?, batched_ms = ? \
                     WHERE batch_id IS NULL AND id IN ({})",
                    placeholders(ids.len())
                );
                let mut query = sqlx::query(&sql)
                    .bind(batch_id)
                    .bind(merkle_root)
                    .bind(Utc::now().timestamp_millis());
                for id in ids {
                    query = query.bind(id);
                }
                let updated = query.execute(&mut *tx).await?.rows_affected() as usize;
                if updated != ids.len() {
                    tx.rollback().await?;
                    return Err(StoreError::TagMismatch {
                        expected: ids.len(),
                        updated,
                    });
                }

                let sql = format!(
                    "SELECT DISTINCT source FROM log_records WHERE id IN ({})",
                    placeholders(ids.len())
                );
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                let sources: Vec<String> = query
                    .fetch_all(&mut *tx)
                    .await?
                    .into_iter()
                    .map(|row| row.get::<String, _>("source"))
                    .collect();
                tx.commit().await?;
                Ok(sources)
            })
            .await?;

        for id in ids {
            self.cache.invalidate_record(id).await;
        }
        for source in sources {
            self.cache.invalidate_source(&source).await;
        }
        Ok(())
    }

    /// Move one sidecar to `status`, stamping the matching instant column.
    pub async fn update_sync_status(
        &self,
        record_id: &str,
        status: SyncStatus,
        batch_id: Option<&str>,
        ledger_tx_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.deadline(async {
            let updated = update_sync_exec(
                &self.pool,
                &[record_id.to_string()],
                status,
                batch_id,
                ledger_tx_id,
                last_error,
            )
            .await?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    pub async fn update_sync_status_batch(
        &self,
        record_ids: &[String],
        status: SyncStatus,
        batch_id: Option<&str>,
        ledger_tx_id: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<u64, StoreError> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        self.deadline(async {
            update_sync_exec(
                &self.pool,
                record_ids,
                status,
                batch_id,
                ledger_tx_id,
                last_error,
            )
            .await
        })
        .await
    }

    pub async fn find_sync_control(&self, record_id: &str) -> Result<SyncControl, StoreError> {
        self.deadline(async {
            let row = sqlx::query(&format!(
                "SELECT {SYNC_COLUMNS} FROM sync_control WHERE record_id = ?1"
            ))
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => sync_from_row(&row),
                None => Err(StoreError::NotFound),
            }
        })
        .await
    }

    pub async fn sync_stats(&self) -> Result<SyncStats, StoreError> {
        self.deadline(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_control GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
            let mut stats = SyncStats::default();
            for row in rows {
                let n: i64 = row.get("n");
                stats.total += n;
                match row.get::<String, _>("status").as_str() {
                    "pending" => stats.pending = n,
                    "pending_batch" => stats.pending_batch = n,
                    "synced" => stats.synced = n,
                    "failed" => stats.failed = n,
                    other => {
                        tracing::warn!(status = other, "unknown sync status in aggregation");
                    }
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Batch groups, newest first, with the total group count.
    pub async fn list_batches(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<BatchSummary>, i64), StoreError> {
        self.deadline(async {
            let total: i64 = sqlx::query(
                "SELECT COUNT(DISTINCT batch_id) AS n FROM log_records WHERE batch_id IS NOT NULL",
            )
            .fetch_one(&self.pool)
            .await?
            .get("n");

            let rows = sqlx::query(
                "SELECT batch_id, merkle_root, COUNT(*) AS record_count, \
                        MIN(batched_ms) AS batched_ms \
                 FROM log_records WHERE batch_id IS NOT NULL \
                 GROUP BY batch_id, merkle_root \
                 ORDER BY batched_ms DESC LIMIT ?1 OFFSET ?2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let mut batches = Vec::with_capacity(rows.len());
            for row in rows {
                batches.push(BatchSummary {
                    batch_id: row.get("batch_id"),
                    merkle_root: row.get("merkle_root"),
                    record_count: row.get("record_count"),
                    batched_at: datetime_from_ms(row.get("batched_ms"))?,
                });
            }
            Ok((batches, total))
        })
        .await
    }

    pub async fn healthy(&self) -> bool {
        self.deadline(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
        .is_ok()
    }
}

async fn insert_record_exec(pool: &Pool<Sqlite>, record: &LogRecord) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    insert_record_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_record_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &LogRecord,
) -> Result<(), StoreError> {
    let metadata_json = match &record.metadata {
        Some(map) if !map.is_empty() => Some(
            serde_json::to_string(map)
                .map_err(|e| StoreError::Corrupt(format!("metadata serialization: {e}")))?,
        ),
        _ => None,
    };
    let result = sqlx::query(&format!(
        "INSERT INTO log_records ({RECORD_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    ))
    .bind(&record.id)
    .bind(&record.timestamp)
    .bind(&record.source)
    .bind(record.level.as_str())
    .bind(&record.message)
    .bind(metadata_json)
    .bind(&record.stacktrace)
    .bind(&record.hash)
    .bind(record.created_at.timestamp_millis())
    .bind(&record.batch_id)
    .bind(&record.merkle_root)
    .bind(record.batched_at.map(|t| t.timestamp_millis()))
    .execute(&mut **tx)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(record.id.clone())),
        Err(e) => Err(e.into()),
    }
}

async fn insert_sync_control_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    control: &SyncControl,
) -> Result<(), StoreError> {
    let result = sqlx::query(&format!(
        "INSERT INTO sync_control ({SYNC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
    ))
    .bind(&control.record_id)
    .bind(control.status.as_str())
    .bind(&control.batch_id)
    .bind(&control.ledger_tx_id)
    .bind(control.created_at.timestamp_millis())
    .bind(control.synced_at.map(|t| t.timestamp_millis()))
    .bind(control.failed_at.map(|t| t.timestamp_millis()))
    .bind(&control.last_error)
    .execute(&mut **tx)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => {
            Err(StoreError::Duplicate(control.record_id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn update_sync_exec(
    pool: &Pool<Sqlite>,
    record_ids: &[String],
    status: SyncStatus,
    batch_id: Option<&str>,
    ledger_tx_id: Option<&str>,
    last_error: Option<&str>,
) -> Result<u64, StoreError> {
    let now_ms = Utc::now().timestamp_millis();
    let mut sets = vec!["status = ?".to_string()];
    if batch_id.is_some() {
        sets.push("batch_id = ?".to_string());
    }
    if ledger_tx_id.is_some() {
        sets.push("ledger_tx_id = ?".to_string());
    }
    match status {
        SyncStatus::Synced => sets.push("synced_ms = ?".to_string()),
        SyncStatus::Failed => {
            sets.push("failed_ms = ?".to_string());
            sets.push("last_error = ?".to_string());
        }
        SyncStatus::Pending | SyncStatus::PendingBatch => {}
    }
    let sql = format!(
        "UPDATE sync_control SET {} WHERE record_id IN ({})",
        sets.join(", "),
        placeholders(record_ids.len())
    );

    let mut query = sqlx::query(&sql).bind(status.as_str());
    if let Some(batch_id) = batch_id {
        query = query.bind(batch_id);
    }
    if let Some(tx_id) = ledger_tx_id {
        query = query.bind(tx_id);
    }
    match status {
        SyncStatus::Synced => query = query.bind(now_ms),
        SyncStatus::Failed => {
            query = query.bind(now_ms).bind(last_error.unwrap_or("unknown error"));
        }
        _ => {}
    }
    for id in record_ids {
        query = query.bind(id);
    }
    Ok(query.execute(pool).await?.rows_affected())
}

fn push_filter_clause(sql: &mut String, filter: &RecordFilter) {
    let mut conditions: Vec<&str> = Vec::new();
    if filter.source.is_some() {
        conditions.push("source = ?");
    }
    if filter.level.is_some() {
        conditions.push("level = ?");
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn datetime_from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn record_from_row(row: &SqliteRow) -> Result<LogRecord, StoreError> {
    let level: String = row.get("level");
    let metadata: Option<String> = row.get("metadata");
    let metadata = metadata
        .map(|json| {
            serde_json::from_str::<BTreeMap<String, String>>(&json)
                .map_err(|e| StoreError::Corrupt(format!("metadata json: {e}")))
        })
        .transpose()?;
    Ok(LogRecord {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        source: row.get("source"),
        level: level
            .parse::<LogLevel>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        message: row.get("message"),
        metadata,
        stacktrace: row.get("stacktrace"),
        hash: row.get("hash"),
        created_at: datetime_from_ms(row.get("created_ms"))?,
        batch_id: row.get("batch_id"),
        merkle_root: row.get("merkle_root"),
        batched_at: row
            .get::<Option<i64>, _>("batched_ms")
            .map(datetime_from_ms)
            .transpose()?,
    })
}

fn sync_from_row(row: &SqliteRow) -> Result<SyncControl, StoreError> {
    let status: String = row.get("status");
    Ok(SyncControl {
        record_id: row.get("record_id"),
        status: status
            .parse::<SyncStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        batch_id: row.get("batch_id"),
        ledger_tx_id: row.get("ledger_tx_id"),
        created_at: datetime_from_ms(row.get("created_ms"))?,
        synced_at: row
            .get::<Option<i64>, _>("synced_ms")
            .map(datetime_from_ms)
            .transpose()?,
        failed_at: row
            .get::<Option<i64>, _>("failed_ms")
            .map(datetime_from_ms)
            .transpose()?,
        last_error: row.get("last_error"),
    })
}
