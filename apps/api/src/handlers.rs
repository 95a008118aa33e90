use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use ledgerlog_core::{canonical_record_hash, LogLevel, LogRecord};
use ledgerlog_scheduler::{verify, SchedulerError};
use ledgerlog_store::{RecordFilter, StoreError};
use serde_json::json;

use crate::error::ApiError;
use crate::models::{BatchSubmitIn, ListQuery, LogRecordIn, PageQuery};
use crate::AppState;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 1000;
const FORCE_BATCH_JOBS: usize = 10;

fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        offset.unwrap_or(0).max(0),
    )
}

fn required(field: Option<String>, name: &str) -> Result<String, ApiError> {
    field
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("missing required field: {name}")))
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

pub async fn post_log(
    State(state): State<AppState>,
    Json(body): Json<LogRecordIn>,
) -> Result<impl IntoResponse, ApiError> {
    let source = required(body.source, "source")?;
    let level = required(body.level, "level")?
        .parse::<LogLevel>()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let message = body
        .message
        .ok_or_else(|| ApiError::Validation("missing required field: message".into()))?;

    let id = body
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let timestamp = body
        .timestamp
        .filter(|ts| !ts.is_empty())
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let metadata = body.metadata.filter(|map| !map.is_empty());
    let stacktrace = body.stacktrace.filter(|trace| !trace.is_empty());

    let hash = canonical_record_hash(
        &id,
        &timestamp,
        &source,
        level,
        &message,
        metadata.as_ref(),
        stacktrace.as_deref(),
    );
    let record = LogRecord {
        id,
        timestamp,
        source,
        level,
        message,
        metadata,
        stacktrace,
        hash,
        created_at: Utc::now(),
        batch_id: None,
        merkle_root: None,
        batched_at: None,
    };

    // Durability first: nothing is acknowledged before the WAL fsync.
    if let Some(wal) = &state.wal {
        wal.append(&record).await.map_err(|e| {
            tracing::error!(record_id = %record.id, error = %e, "wal append failed");
            ApiError::Dependency(format!("write-ahead log unavailable: {e}"))
        })?;
    }

    match state.store.ingest(&record).await {
        Ok(()) => {}
        Err(StoreError::Duplicate(id)) => {
            return Err(ApiError::Conflict(format!("record {id} already exists")));
        }
        Err(e) if state.wal.is_some() && e.is_retriable() => {
            // The record is already durable in the WAL; the drainer finishes
            // the insert.
            tracing::warn!(
                record_id = %record.id,
                error = %e,
                "store insert failed after wal append, deferring to drainer"
            );
        }
        Err(e) => return Err(e.into()),
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": record.id, "hash": record.hash })),
    ))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let level = query
        .level
        .map(|raw| {
            raw.parse::<LogLevel>()
                .map_err(|e| ApiError::Validation(e.to_string()))
        })
        .transpose()?;
    let filter = RecordFilter {
        source: query.source,
        level,
    };

    let records = state.store.find_records(&filter, limit, offset).await?;
    let total = state.store.count_records(&filter).await?;
    Ok(Json(json!({
        "records": records,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.find_record_by_id(&id).await?;
    Ok(Json(record))
}

/// Records are immutable audit state: deletion is accepted and recorded as a
/// logical no-op, but the per-id cache entry is dropped so readers never see
/// content the caller asked to retire from caches.
pub async fn delete_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.find_record_by_id(&id).await?;
    state.cache.invalidate_record(&record.id).await;
    Ok(Json(json!({
        "id": record.id,
        "status": "accepted",
        "deleted": false,
        "message": "records are immutable; delete recorded as a no-op",
    })))
}

// ---------------------------------------------------------------------------
// Merkle batching
// ---------------------------------------------------------------------------

pub async fn submit_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchSubmitIn>,
) -> Result<impl IntoResponse, ApiError> {
    let batch_size = body.batch_size;
    state
        .scheduler
        .submit(batch_size)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

pub async fn force_batch(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut submitted = 0usize;
    for _ in 0..FORCE_BATCH_JOBS {
        match state.scheduler.submit(None) {
            Ok(()) => submitted += 1,
            Err(SchedulerError::QueueFull) => break,
            Err(e) => return Err(ApiError::Internal(e.to_string())),
        }
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "jobs_submitted": submitted })),
    ))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (batch, records) = verify::batch_detail(&state.store, &id).await?;
    let num_records = records.len();
    Ok(Json(json!({
        "batch": batch,
        "records": records,
        "num_records": num_records,
    })))
}

pub async fn verify_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = verify::verify_batch(&state.store, &id).await?;
    let status = if report.is_valid {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(report)))
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let (batches, total) = state.store.list_batches(limit, offset).await?;
    Ok(Json(json!({
        "batches": batches,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

pub async fn merkle_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.stats())
}

// ---------------------------------------------------------------------------
// Operational
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = if state.store.healthy().await {
        "healthy"
    } else {
        "unhealthy"
    };
    let ledger = match &state.ledger {
        None => "disabled",
        Some(client) => match client.health_check().await {
            Ok(()) => "healthy",
            Err(_) => "unhealthy",
        },
    };
    let wal = match &state.wal {
        None => "disabled",
        Some(wal) if wal.healthy() => "healthy",
        Some(_) => "unhealthy",
    };
    let scheduler = if state.scheduler.is_running() {
        "healthy"
    } else {
        "stopped"
    };
    Json(json!({
        "status": "ok",
        "dependencies": {
            "store": store,
            "ledger": ledger,
            "wal": wal,
            "scheduler": scheduler,
        },
    }))
}

pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sync = state.store.sync_stats().await?;
    let total_records = state.store.count_records(&RecordFilter::default()).await?;
    let wal = state.wal.as_ref().map(|wal| wal.stats());
    Ok(Json(json!({
        "records": { "total": total_records },
        "sync": sync,
        "scheduler": state.scheduler.stats(),
        "wal": wal,
    })))
}

pub async fn wal_stats(State(state): State<AppState>) -> impl IntoResponse {
    match &state.wal {
        Some(wal) => Json(json!({ "enabled": true, "stats": wal.stats() })),
        None => Json(json!({ "enabled": false })),
    }
}

pub async fn wal_force_process(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let wal = state
        .wal
        .as_ref()
        .ok_or_else(|| ApiError::Dependency("write-ahead log disabled".into()))?;
    let report = wal
        .drain_once(state.sink.as_ref())
        .await
        .map_err(|e| ApiError::Internal(format!("wal drain failed: {e}")))?;
    Ok(Json(json!({ "status": "completed", "report": report })))
}

pub async fn wal_health(State(state): State<AppState>) -> impl IntoResponse {
    let status = match &state.wal {
        None => "disabled",
        Some(wal) if wal.healthy() => "healthy",
        Some(_) => "unhealthy",
    };
    Json(json!({ "status": status }))
}
