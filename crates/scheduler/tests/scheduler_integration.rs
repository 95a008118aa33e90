//! Integration tests for the batch scheduler and verifier.
//!
//! Covers: lifecycle guards, batch tagging + anchoring through the stub
//! ledger, ledger-disabled and ledger-failing cycles, non-overlapping
//! claims under duplicate submission, queue backpressure, and tamper
//! detection by the verifier.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ledgerlog_core::{
    canonical_record_hash, merkle_root, BatchAnchor, LedgerBatchRecord, LedgerClient,
    LedgerError, LogLevel, LogRecord, SyncStatus,
};
use ledgerlog_scheduler::verify::{verify_batch, Integrity};
use ledgerlog_scheduler::{BatchScheduler, SchedulerConfig, SchedulerError};
use ledgerlog_store::{ensure_schema, RecordStore, StoreError};
use ledger_gateway::StubLedger;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Isolated named in-memory store shared across all pool connections.
async fn make_store() -> Arc<RecordStore> {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let url = format!("sqlite:file:scheduler_test_{nanos}?mode=memory&cache=shared");
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("failed to open in-memory SQLite pool");
    ensure_schema(&pool).await.expect("ensure_schema failed");
    Arc::new(RecordStore::new(pool, Duration::from_secs(5)))
}

fn test_record(id: &str, created_ms: i64) -> LogRecord {
    let timestamp = "2026-03-01T09:00:00Z".to_string();
    let hash = canonical_record_hash(
        id,
        &timestamp,
        "scheduler-test",
        LogLevel::Info,
        "payload",
        None,
        None,
    );
    LogRecord {
        id: id.to_string(),
        timestamp,
        source: "scheduler-test".into(),
        level: LogLevel::Info,
        message: "payload".into(),
        metadata: None,
        stacktrace: None,
        hash,
        created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap(),
        batch_id: None,
        merkle_root: None,
        batched_at: None,
    }
}

async fn ingest_n(store: &RecordStore, prefix: &str, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("{prefix}-{i}");
        store
            .ingest(&test_record(&id, 1_000 + i as i64))
            .await
            .expect("ingest failed");
        ids.push(id);
    }
    ids
}

fn small_config(worker_count: usize) -> SchedulerConfig {
    SchedulerConfig {
        auto_batch_size: 10,
        auto_batch_interval: Duration::from_secs(3600),
        worker_count,
        max_queue_depth: 16,
        ledger_timeout: Duration::from_secs(5),
        verification_enabled: true,
    }
}

/// Poll until `check` passes or the budget runs out.
async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Ledger that always rejects with a fatal validation error.
struct RejectingLedger;

#[async_trait]
impl LedgerClient for RejectingLedger {
    async fn store_batch(&self, _batch: &BatchAnchor) -> Result<String, LedgerError> {
        Err(LedgerError::Validation("schema mismatch".into()))
    }

    async fn query_batch(
        &self,
        _batch_id: &str,
    ) -> Result<Option<LedgerBatchRecord>, LedgerError> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Ledger that reports every batch as already anchored.
struct DuplicateLedger;

#[async_trait]
impl LedgerClient for DuplicateLedger {
    async fn store_batch(&self, batch: &BatchAnchor) -> Result<String, LedgerError> {
        Err(LedgerError::Duplicate(batch.batch_id.clone()))
    }

    async fn query_batch(
        &self,
        _batch_id: &str,
    ) -> Result<Option<LedgerBatchRecord>, LedgerError> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_is_guarded_against_double_start() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store, None, small_config(1));

    scheduler.start().await.unwrap();
    assert!(matches!(
        scheduler.start().await,
        Err(SchedulerError::AlreadyRunning)
    ));
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_without_start_is_an_error() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store, None, small_config(1));
    assert!(matches!(
        scheduler.stop(Duration::from_secs(1)).await,
        Err(SchedulerError::NotRunning)
    ));
}

#[tokio::test]
async fn submit_requires_a_running_scheduler() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store, None, small_config(1));
    assert!(matches!(
        scheduler.submit(Some(5)),
        Err(SchedulerError::NotRunning)
    ));

    scheduler.start().await.unwrap();
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
    assert!(matches!(
        scheduler.submit(Some(5)),
        Err(SchedulerError::NotRunning)
    ));
}

#[tokio::test]
async fn scheduler_restarts_after_stop() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store.clone(), None, small_config(1));

    scheduler.start().await.unwrap();
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
    scheduler.start().await.unwrap();

    ingest_n(&store, "restart", 2).await;
    scheduler.submit(Some(5)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Batch creation and anchoring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_cycle_tags_records_and_anchors_on_the_ledger() {
    let store = make_store().await;
    let ids = ingest_n(&store, "cycle", 3).await;
    let stub = Arc::new(StubLedger::new());
    let scheduler = BatchScheduler::new(store.clone(), Some(stub.clone()), small_config(2));

    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    // All three records carry the same batch id and the expected root.
    let batch_id = store
        .find_record_by_id(&ids[0])
        .await
        .unwrap()
        .batch_id
        .expect("record must be tagged");
    let members = store.find_by_batch(&batch_id).await.unwrap();
    assert_eq!(members.len(), 3);

    let expected_root = merkle_root(
        &members.iter().map(|r| r.hash.clone()).collect::<Vec<_>>(),
    )
    .unwrap();
    for member in &members {
        assert_eq!(member.merkle_root.as_deref(), Some(expected_root.as_str()));
        assert!(member.batched_at.is_some());
    }
    // Claim order is ascending created_at.
    assert_eq!(members[0].id, ids[0]);
    assert_eq!(members[2].id, ids[2]);

    // Sidecars are synced with the stub's transaction id.
    for id in &ids {
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::Synced);
        assert!(control
            .ledger_tx_id
            .as_deref()
            .unwrap()
            .starts_with("stub-tx-"));
        assert!(control.synced_at.is_some());
    }

    assert_eq!(stub.anchored_count().await, 1);
    let stats = scheduler.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(stats.last_batch_size, 3);
    assert!(stats.last_batch_id.is_some());
    // The post-tag self-check ran and passed.
    assert_eq!(stats.verified_batches, 1);
    assert_eq!(stats.verification_failures, 0);
}

#[tokio::test]
async fn disabled_verification_skips_the_post_tag_check() {
    let store = make_store().await;
    let ids = ingest_n(&store, "noverify", 2).await;
    let stub = Arc::new(StubLedger::new());
    let config = SchedulerConfig {
        verification_enabled: false,
        ..small_config(1)
    };
    let scheduler = BatchScheduler::new(store.clone(), Some(stub.clone()), config);

    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    // The batch is still tagged and anchored; only the self-check is skipped.
    assert_eq!(stub.anchored_count().await, 1);
    for id in &ids {
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::Synced);
    }
    let stats = scheduler.stats();
    assert_eq!(stats.verified_batches, 0);
    assert_eq!(stats.verification_failures, 0);
}

#[tokio::test]
async fn ledger_disabled_cycles_leave_sidecars_pending_batch() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store.clone(), None, small_config(1));
    scheduler.start().await.unwrap();

    // First cycle.
    let first = ingest_n(&store, "nolg-a", 2).await;
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);

    // Second cycle over fresh records.
    let second = ingest_n(&store, "nolg-b", 3).await;
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 2).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    // Every batch verifies VALID; every sidecar stays pending_batch.
    let (batches, total) = store.list_batches(10, 0).await.unwrap();
    assert_eq!(total, 2);
    for batch in &batches {
        let report = verify_batch(&store, &batch.batch_id).await.unwrap();
        assert!(report.is_valid, "batch {} must verify", batch.batch_id);
        assert_eq!(report.integrity, Integrity::Valid);
    }
    for id in first.iter().chain(second.iter()) {
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::PendingBatch);
        assert!(control.batch_id.is_some());
        assert!(control.ledger_tx_id.is_none());
    }
}

#[tokio::test]
async fn failing_ledger_leaves_batch_tagged_and_retriable() {
    let store = make_store().await;
    let ids = ingest_n(&store, "fail", 2).await;
    let stub = Arc::new(StubLedger::new());
    stub.set_failing(true);
    let scheduler = BatchScheduler::new(store.clone(), Some(stub.clone()), small_config(1));

    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().failed_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    // Records stay tagged; sidecars stay pending_batch so a later anchor of
    // the same batch id remains possible.
    for id in &ids {
        let record = store.find_record_by_id(id).await.unwrap();
        assert!(record.batch_id.is_some());
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::PendingBatch);
    }
    assert_eq!(stub.anchored_count().await, 0);
    let stats = scheduler.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.failed_batches, 1);
}

#[tokio::test]
async fn fatal_ledger_rejection_marks_sidecars_failed() {
    let store = make_store().await;
    let ids = ingest_n(&store, "fatal", 2).await;
    let scheduler =
        BatchScheduler::new(store.clone(), Some(Arc::new(RejectingLedger)), small_config(1));

    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().failed_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    for id in &ids {
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::Failed);
        assert!(control.last_error.as_deref().unwrap().contains("schema"));
        assert!(control.failed_at.is_some());
    }
}

#[tokio::test]
async fn duplicate_on_ledger_counts_as_anchored() {
    let store = make_store().await;
    let ids = ingest_n(&store, "dupe", 2).await;
    let scheduler =
        BatchScheduler::new(store.clone(), Some(Arc::new(DuplicateLedger)), small_config(1));

    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    for id in &ids {
        let control = store.find_sync_control(id).await.unwrap();
        assert_eq!(control.status, SyncStatus::Synced);
        // No fresh transaction id was issued for the replayed anchor.
        assert!(control.ledger_tx_id.is_none());
    }
    assert_eq!(scheduler.stats().failed_batches, 0);
}

// ---------------------------------------------------------------------------
// Claims, backpressure, empty cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_submissions_never_produce_overlapping_batches() {
    let store = make_store().await;
    let ids = ingest_n(&store, "overlap", 6).await;
    let scheduler = BatchScheduler::new(store.clone(), None, small_config(1));

    scheduler.start().await.unwrap();
    scheduler.submit(Some(3)).unwrap();
    scheduler.submit(Some(3)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 2).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    // Each record belongs to exactly one batch; the two batches are disjoint
    // by the tag guard, so together they hold all six records.
    let (batches, _) = store.list_batches(10, 0).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert_ne!(batches[0].batch_id, batches[1].batch_id);
    assert_eq!(batches[0].record_count + batches[1].record_count, 6);

    for id in &ids {
        let record = store.find_record_by_id(id).await.unwrap();
        assert!(record.batch_id.is_some(), "{id} must be tagged exactly once");
    }
    assert_eq!(store.find_unbatched(10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn empty_claims_are_counted_as_noops() {
    let store = make_store().await;
    let scheduler = BatchScheduler::new(store, None, small_config(1));
    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().empty_claims >= 1).await);
    assert_eq!(scheduler.stats().total_batches, 0);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_submissions() {
    let store = make_store().await;
    // No workers: nothing ever drains the queue.
    let config = SchedulerConfig {
        max_queue_depth: 2,
        ..small_config(0)
    };
    let scheduler = BatchScheduler::new(store, None, config);
    scheduler.start().await.unwrap();

    scheduler.submit(Some(1)).unwrap();
    scheduler.submit(Some(1)).unwrap();
    assert!(matches!(
        scheduler.submit(Some(1)),
        Err(SchedulerError::QueueFull)
    ));
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verification_is_idempotent_and_detects_tampering() {
    let store = make_store().await;
    ingest_n(&store, "tamper", 3).await;
    let scheduler = BatchScheduler::new(store.clone(), None, small_config(1));
    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    let (batches, _) = store.list_batches(1, 0).await.unwrap();
    let batch_id = batches[0].batch_id.clone();

    let first = verify_batch(&store, &batch_id).await.unwrap();
    let second = verify_batch(&store, &batch_id).await.unwrap();
    assert!(first.is_valid);
    assert_eq!(first, second);
    assert_eq!(first.num_records, 3);
    assert_eq!(
        first.original_root.as_deref(),
        Some(first.recomputed_root.as_str())
    );

    // Tamper with one record's message directly in the store.
    sqlx::query("UPDATE log_records SET message = 'forged' WHERE id = 'tamper-1'")
        .execute(store.pool())
        .await
        .unwrap();

    let report = verify_batch(&store, &batch_id).await.unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.integrity, Integrity::Corrupted);
    assert_ne!(
        report.original_root.as_deref(),
        Some(report.recomputed_root.as_str())
    );
}

#[tokio::test]
async fn verifying_an_unknown_batch_is_not_found() {
    let store = make_store().await;
    assert!(matches!(
        verify_batch(&store, "batch_missing").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn disagreeing_stored_roots_are_corrupted() {
    let store = make_store().await;
    ingest_n(&store, "split", 2).await;
    let scheduler = BatchScheduler::new(store.clone(), None, small_config(1));
    scheduler.start().await.unwrap();
    scheduler.submit(Some(10)).unwrap();
    assert!(wait_until(|| scheduler.stats().total_batches == 1).await);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    let (batches, _) = store.list_batches(1, 0).await.unwrap();
    let batch_id = batches[0].batch_id.clone();
    sqlx::query("UPDATE log_records SET merkle_root = 'deadbeef' WHERE id = 'split-0'")
        .execute(store.pool())
        .await
        .unwrap();

    let report = verify_batch(&store, &batch_id).await.unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.integrity, Integrity::Corrupted);
    assert!(report.message.contains("disagree"));
}
