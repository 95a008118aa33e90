//! Batch scheduler: converts the stream of unbatched records into
//! Merkle-anchored batches with bounded concurrency and backpressure.
//!
//! A ticker and explicit submissions feed a bounded job channel; a pool of
//! workers claims unbatched records, tags them with a fresh batch id and
//! Merkle root, and hands the batch to the ledger client. Sends into the
//! channel are try-sends: when the queue is full the tick is dropped and a
//! counter records it.

pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerlog_core::{merkle_root, BatchAnchor, LedgerClient, SyncStatus};
use ledgerlog_store::{RecordStore, StoreError};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub auto_batch_size: usize,
    pub auto_batch_interval: Duration,
    pub worker_count: usize,
    pub max_queue_depth: usize,
    /// Deadline for one ledger anchor call.
    pub ledger_timeout: Duration,
    /// Re-verify every freshly tagged batch before anchoring it.
    pub verification_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_batch_size: 100,
            auto_batch_interval: Duration::from_secs(30),
            worker_count: 5,
            max_queue_depth: 100,
            ledger_timeout: Duration::from_secs(30),
            verification_enabled: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("scheduler not running")]
    NotRunning,
    #[error("job queue full")]
    QueueFull,
    #[error("workers did not stop within the deadline")]
    StopTimeout,
}

/// Copy-out snapshot of the scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub total_batches: u64,
    pub total_records: u64,
    pub failed_batches: u64,
    pub processing_errors: u64,
    pub dropped_ticks: u64,
    pub empty_claims: u64,
    pub verified_batches: u64,
    pub verification_failures: u64,
    pub last_batch_id: Option<String>,
    pub last_batch_size: usize,
    pub last_batch_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct BatchJob {
    batch_size: usize,
}

struct Shared {
    store: Arc<RecordStore>,
    ledger: Option<Arc<dyn LedgerClient>>,
    config: SchedulerConfig,
    stats: std::sync::Mutex<SchedulerStats>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct BatchScheduler {
    shared: Arc<Shared>,
    sender: std::sync::Mutex<Option<mpsc::Sender<BatchJob>>>,
    running: Mutex<Option<Running>>,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<RecordStore>,
        ledger: Option<Arc<dyn LedgerClient>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                ledger,
                config,
                stats: std::sync::Mutex::new(SchedulerStats::default()),
            }),
            sender: std::sync::Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Spawn the worker pool and the ticker. Fails when already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel::<BatchJob>(self.shared.config.max_queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.shared.config.worker_count + 1);
        for worker_id in 0..self.shared.config.worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                self.shared.clone(),
                receiver.clone(),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(ticker_loop(
            self.shared.clone(),
            tx.clone(),
            shutdown_rx,
        )));

        *self.sender.lock().expect("scheduler sender lock") = Some(tx);
        *running = Some(Running {
            shutdown: shutdown_tx,
            handles,
        });
        self.shared.stats.lock().expect("scheduler stats lock").running = true;
        tracing::info!(
            workers = self.shared.config.worker_count,
            queue_depth = self.shared.config.max_queue_depth,
            interval_secs = self.shared.config.auto_batch_interval.as_secs(),
            "batch scheduler started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for the workers to exit. In-flight jobs are
    /// finished; queued jobs are abandoned.
    pub async fn stop(&self, deadline: Duration) -> Result<(), SchedulerError> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::NotRunning)?;
        self.sender.lock().expect("scheduler sender lock").take();
        let _ = running.shutdown.send(true);

        let join_all = async {
            for handle in running.handles {
                let _ = handle.await;
            }
        };
        let result = tokio::time::timeout(deadline, join_all)
            .await
            .map_err(|_| SchedulerError::StopTimeout);
        self.shared.stats.lock().expect("scheduler stats lock").running = false;
        tracing::info!("batch scheduler stopped");
        result
    }

    /// Non-blocking job submission.
    pub fn submit(&self, batch_size: Option<usize>) -> Result<(), SchedulerError> {
        let guard = self.sender.lock().expect("scheduler sender lock");
        let sender = guard.as_ref().ok_or(SchedulerError::NotRunning)?;
        let job = BatchJob {
            batch_size: batch_size.unwrap_or(self.shared.config.auto_batch_size),
        };
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => SchedulerError::QueueFull,
            TrySendError::Closed(_) => SchedulerError::NotRunning,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().expect("scheduler stats lock").clone()
    }

    pub fn is_running(&self) -> bool {
        self.stats().running
    }
}

async fn ticker_loop(
    shared: Arc<Shared>,
    sender: mpsc::Sender<BatchJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.auto_batch_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let job = BatchJob { batch_size: shared.config.auto_batch_size };
                match sender.try_send(job) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // Previous batches are still in flight; queueing more
                        // adds no value. Drop the tick but keep it countable.
                        let mut stats = shared.stats.lock().expect("scheduler stats lock");
                        stats.dropped_ticks += 1;
                        tracing::debug!(dropped_ticks = stats.dropped_ticks, "batch tick dropped, queue full");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<BatchJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.changed() => None,
            }
        };
        match job {
            Some(job) => process_job(&shared, worker_id, job).await,
            None => {
                tracing::debug!(worker_id, "batch worker exiting");
                return;
            }
        }
    }
}

async fn process_job(shared: &Shared, worker_id: usize, job: BatchJob) {
    let records = match shared.store.find_unbatched(job.batch_size as i64).await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "failed to claim unbatched records");
            bump(shared, |s| s.processing_errors += 1);
            return;
        }
    };
    if records.is_empty() {
        bump(shared, |s| s.empty_claims += 1);
        return;
    }

    let batch_id = new_batch_id();
    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    let hashes: Vec<String> = records.iter().map(|r| r.hash.clone()).collect();
    let Some(root) = merkle_root(&hashes) else {
        // Unreachable with a non-empty claim; counted rather than panicking.
        bump(shared, |s| s.processing_errors += 1);
        return;
    };

    if let Err(e) = shared.store.tag_batch(&ids, &batch_id, &root).await {
        match e {
            StoreError::TagMismatch { expected, updated } => {
                // A concurrent worker claimed some of these records between
                // the read and the update. The transaction rolled back, so
                // the untouched records stay claimable by the next job.
                tracing::warn!(
                    worker_id,
                    batch_id = %batch_id,
                    expected,
                    updated,
                    "batch tagging raced, rolled back"
                );
            }
            other => {
                tracing::error!(worker_id, batch_id = %batch_id, error = %other, "batch tagging failed");
            }
        }
        bump(shared, |s| s.processing_errors += 1);
        return;
    }

    if let Err(e) = shared
        .store
        .update_sync_status_batch(&ids, SyncStatus::PendingBatch, Some(&batch_id), None, None)
        .await
    {
        tracing::error!(worker_id, batch_id = %batch_id, error = %e, "failed to mark sidecars pending_batch");
        bump(shared, |s| s.processing_errors += 1);
    }

    bump(shared, |s| {
        s.total_batches += 1;
        s.total_records += records.len() as u64;
        s.last_batch_id = Some(batch_id.clone());
        s.last_batch_size = records.len();
        s.last_batch_at = Some(Utc::now());
    });
    tracing::info!(
        worker_id,
        batch_id = %batch_id,
        record_count = records.len(),
        merkle_root = %root,
        "batch created"
    );

    if shared.config.verification_enabled && !verify_tagged_batch(shared, worker_id, &batch_id).await
    {
        // A corrupted batch must not reach the ledger; the sidecars stay
        // pending_batch for operator reconciliation.
        return;
    }

    let Some(ledger) = shared.ledger.as_ref() else {
        return;
    };
    anchor_batch(shared, worker_id, ledger.as_ref(), &batch_id, &root, ids).await;
}

/// Post-tag self-check: re-verify the batch that was just written. Returns
/// false only on a CORRUPTED verdict; a verification read error is counted
/// but does not block anchoring.
async fn verify_tagged_batch(shared: &Shared, worker_id: usize, batch_id: &str) -> bool {
    match verify::verify_batch(&shared.store, batch_id).await {
        Ok(report) if report.is_valid => {
            bump(shared, |s| s.verified_batches += 1);
            true
        }
        Ok(report) => {
            tracing::error!(
                worker_id,
                batch_id = %batch_id,
                original_root = ?report.original_root,
                recomputed_root = %report.recomputed_root,
                "freshly tagged batch failed verification"
            );
            bump(shared, |s| s.verification_failures += 1);
            false
        }
        Err(e) => {
            tracing::error!(worker_id, batch_id = %batch_id, error = %e, "batch verification read failed");
            bump(shared, |s| s.processing_errors += 1);
            true
        }
    }
}

async fn anchor_batch(
    shared: &Shared,
    worker_id: usize,
    ledger: &dyn LedgerClient,
    batch_id: &str,
    root: &str,
    ids: Vec<String>,
) {
    let anchor = BatchAnchor {
        batch_id: batch_id.to_string(),
        merkle_root: root.to_string(),
        timestamp: Utc::now(),
        record_count: ids.len(),
        record_ids: ids.clone(),
    };

    let outcome = tokio::time::timeout(shared.config.ledger_timeout, ledger.store_batch(&anchor)).await;
    let tx_id = match outcome {
        Ok(Ok(tx_id)) => Some(tx_id),
        // The batch id is already on the ledger: an earlier anchor attempt
        // made it through even though we never saw the acknowledgement.
        Ok(Err(e)) if matches!(e, ledgerlog_core::LedgerError::Duplicate(_)) => {
            tracing::info!(worker_id, batch_id = %batch_id, "batch already anchored, treating as success");
            None
        }
        Ok(Err(e)) if e.is_retriable() => {
            tracing::warn!(worker_id, batch_id = %batch_id, error = %e, "ledger anchor failed, batch stays pending");
            bump(shared, |s| s.failed_batches += 1);
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(worker_id, batch_id = %batch_id, error = %e, "ledger rejected the batch");
            bump(shared, |s| s.failed_batches += 1);
            if let Err(store_err) = shared
                .store
                .update_sync_status_batch(
                    &ids,
                    SyncStatus::Failed,
                    None,
                    None,
                    Some(&e.to_string()),
                )
                .await
            {
                tracing::error!(batch_id = %batch_id, error = %store_err, "failed to mark sidecars failed");
            }
            return;
        }
        Err(_) => {
            tracing::warn!(
                worker_id,
                batch_id = %batch_id,
                deadline_secs = shared.config.ledger_timeout.as_secs(),
                "ledger anchor deadline elapsed, batch stays pending"
            );
            bump(shared, |s| s.failed_batches += 1);
            return;
        }
    };

    if let Err(e) = shared
        .store
        .update_sync_status_batch(&ids, SyncStatus::Synced, Some(batch_id), tx_id.as_deref(), None)
        .await
    {
        tracing::error!(batch_id = %batch_id, error = %e, "failed to mark sidecars synced");
        bump(shared, |s| s.processing_errors += 1);
    }
}

fn bump(shared: &Shared, update: impl FnOnce(&mut SchedulerStats)) {
    let mut stats = shared.stats.lock().expect("scheduler stats lock");
    update(&mut stats);
}

fn new_batch_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("batch_{}", &uuid[..12])
}
