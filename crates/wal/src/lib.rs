//! Write-ahead log guaranteeing that an acknowledged record survives process
//! loss and eventually reaches the record store.
//!
//! Layout: one directory with two newline-delimited JSON files. `pending`
//! holds records not yet accepted by the store; `processed` is the audit of
//! completed drains. Appends are fsynced under an exclusive file lock before
//! the caller may acknowledge. A background drainer replays `pending` into
//! the store and rewrites the file atomically (tempfile + rename).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use ledgerlog_core::LogRecord;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::{watch, Mutex, Notify};

const PENDING_FILE: &str = "pending";
const PROCESSED_FILE: &str = "processed";

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("wal append task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One line of `pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub wal_timestamp: DateTime<Utc>,
    pub record: LogRecord,
}

/// One line of `processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub wal_timestamp: DateTime<Utc>,
    pub processed_timestamp: DateTime<Utc>,
    pub record_id: String,
}

/// Destination for drained records.
///
/// `AlreadyAccepted` is a success from the WAL's perspective: the record
/// reached the store on an earlier attempt (typically the ingest handler's
/// direct insert) and the entry can move to `processed`.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("record already accepted")]
    AlreadyAccepted,
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept(&self, record: LogRecord) -> Result<(), SinkError>;
}

/// Snapshot of WAL counters.
#[derive(Debug, Clone, Serialize)]
pub struct WalStats {
    pub pending_entries: usize,
    pub pending_file_bytes: u64,
    pub processed_total: u64,
    pub drains_completed: u64,
    pub drain_errors: u64,
    pub parse_failures: u64,
    pub last_drain_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatsInner {
    pending_entries: usize,
    processed_total: u64,
    drains_completed: u64,
    drain_errors: u64,
    parse_failures: u64,
    last_drain_at: Option<DateTime<Utc>>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub retained: usize,
    pub parse_failures: usize,
}

pub struct WriteAheadLog {
    dir: PathBuf,
    max_pending_bytes: Option<u64>,
    // Serializes appends and the drainer's final rewrite in-process; the
    // exclusive file lock guards against sibling processes.
    append_lock: Mutex<()>,
    // One drain (or prune) at a time.
    drain_lock: Mutex<()>,
    drain_nudge: Notify,
    stats: std::sync::Mutex<StatsInner>,
}

impl WriteAheadLog {
    /// Open (or create) the WAL directory. The line count of a surviving
    /// `pending` file seeds the pending gauge; the first drain retries them.
    pub fn open(dir: impl Into<PathBuf>, max_file_size_mb: Option<u64>) -> Result<Self, WalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let pending = read_lines(&dir.join(PENDING_FILE))?.len();
        let wal = Self {
            dir,
            max_pending_bytes: max_file_size_mb.map(|mb| mb * 1024 * 1024),
            append_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            drain_nudge: Notify::new(),
            stats: std::sync::Mutex::new(StatsInner {
                pending_entries: pending,
                ..StatsInner::default()
            }),
        };
        Ok(wal)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Durably append one record. The entry is serialized, written to
    /// `pending` under the exclusive file lock and fsynced before this
    /// returns. On any error the caller must not acknowledge the record.
    pub async fn append(&self, record: &LogRecord) -> Result<(), WalError> {
        let entry = PendingEntry {
            wal_timestamp: Utc::now(),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let path = self.dir.join(PENDING_FILE);

        let _guard = self.append_lock.lock().await;
        let written = tokio::task::spawn_blocking(move || -> Result<u64, std::io::Error> {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.lock_exclusive()?;
            let result = (|| {
                let mut f = &file;
                f.write_all(line.as_bytes())?;
                f.sync_all()?;
                f.metadata().map(|m| m.len())
            })();
            let _ = fs2::FileExt::unlock(&file);
            result
        })
        .await??;

        let pending_now = {
            let mut stats = self.stats.lock().expect("wal stats lock");
            stats.pending_entries += 1;
            stats.pending_entries
        };
        if let Some(cap) = self.max_pending_bytes {
            if written > cap {
                tracing::warn!(
                    pending_bytes = written,
                    cap_bytes = cap,
                    pending_entries = pending_now,
                    "wal pending file exceeds configured size cap"
                );
            }
        }
        Ok(())
    }

    /// Wake the drainer ahead of its next tick.
    pub fn nudge(&self) {
        self.drain_nudge.notify_one();
    }

    /// Replay every pending entry into `sink`, move successes to `processed`
    /// and atomically rewrite `pending` with only the remaining failures.
    /// Entries whose line no longer parses are retained and counted, never
    /// dropped. The append lock is held only for the final rewrite.
    pub async fn drain_once(&self, sink: &dyn RecordSink) -> Result<DrainReport, WalError> {
        let _drain_guard = self.drain_lock.lock().await;
        let pending_path = self.dir.join(PENDING_FILE);

        // Append-only file: the prefix read here stays stable while the
        // callbacks run, so the lock is not needed yet.
        let snapshot = read_lines(&pending_path)?;
        if snapshot.is_empty() {
            self.note_drain(0, 0, 0);
            return Ok(DrainReport::default());
        }
        let snapshot_len = snapshot.len();

        let mut retained: Vec<String> = Vec::new();
        let mut completed: Vec<ProcessedEntry> = Vec::new();
        let mut parse_failures = 0usize;
        let mut drain_errors = 0u64;

        for line in &snapshot {
            match serde_json::from_str::<PendingEntry>(line) {
                Ok(entry) => match sink.accept(entry.record.clone()).await {
                    Ok(()) | Err(SinkError::AlreadyAccepted) => {
                        completed.push(ProcessedEntry {
                            wal_timestamp: entry.wal_timestamp,
                            processed_timestamp: Utc::now(),
                            record_id: entry.record.id.clone(),
                        });
                    }
                    Err(SinkError::Unavailable(reason)) => {
                        drain_errors += 1;
                        tracing::warn!(
                            record_id = %entry.record.id,
                            error = %reason,
                            "wal drain insert failed, entry retained"
                        );
                        retained.push(line.clone());
                    }
                },
                Err(e) => {
                    parse_failures += 1;
                    tracing::error!(error = %e, "unparseable wal entry retained");
                    retained.push(line.clone());
                }
            }
        }

        if !completed.is_empty() {
            self.append_processed(&completed)?;
        }

        let _append_guard = self.append_lock.lock().await;
        let current = read_lines(&pending_path)?;
        let mut remaining = retained;
        remaining.extend(current.into_iter().skip(snapshot_len));
        let remaining_len = remaining.len();
        if remaining.is_empty() {
            if pending_path.exists() {
                fs::remove_file(&pending_path)?;
            }
        } else {
            rewrite_atomic(&self.dir, &pending_path, &remaining)?;
        }
        drop(_append_guard);

        let report = DrainReport {
            processed: completed.len(),
            retained: remaining_len,
            parse_failures,
        };
        {
            let mut stats = self.stats.lock().expect("wal stats lock");
            stats.pending_entries = remaining_len;
            stats.processed_total += completed.len() as u64;
            stats.drain_errors += drain_errors;
            stats.parse_failures += parse_failures as u64;
            stats.drains_completed += 1;
            stats.last_drain_at = Some(Utc::now());
        }
        Ok(report)
    }

    /// Drop `processed` lines older than the retention window. Lines that do
    /// not parse are preserved. Returns the number of pruned lines.
    pub async fn prune_processed(&self, retention: chrono::Duration) -> Result<usize, WalError> {
        let _drain_guard = self.drain_lock.lock().await;
        let path = self.dir.join(PROCESSED_FILE);
        let lines = read_lines(&path)?;
        if lines.is_empty() {
            return Ok(0);
        }
        let cutoff = Utc::now() - retention;
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| match serde_json::from_str::<ProcessedEntry>(line) {
                Ok(entry) => entry.processed_timestamp >= cutoff,
                Err(_) => true,
            })
            .cloned()
            .collect();
        let pruned = lines.len() - kept.len();
        if pruned > 0 {
            if kept.is_empty() {
                fs::remove_file(&path)?;
            } else {
                rewrite_atomic(&self.dir, &path, &kept)?;
            }
            tracing::info!(pruned, "wal processed file pruned");
        }
        Ok(pruned)
    }

    pub fn stats(&self) -> WalStats {
        let inner = self.stats.lock().expect("wal stats lock");
        WalStats {
            pending_entries: inner.pending_entries,
            pending_file_bytes: fs::metadata(self.dir.join(PENDING_FILE))
                .map(|m| m.len())
                .unwrap_or(0),
            processed_total: inner.processed_total,
            drains_completed: inner.drains_completed,
            drain_errors: inner.drain_errors,
            parse_failures: inner.parse_failures,
            last_drain_at: inner.last_drain_at,
        }
    }

    /// The WAL is healthy while its directory is present and writable.
    pub fn healthy(&self) -> bool {
        self.dir.is_dir()
            && OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(PENDING_FILE))
                .is_ok()
    }

    fn append_processed(&self, entries: &[ProcessedEntry]) -> Result<(), WalError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(PROCESSED_FILE))?;
        let mut f = &file;
        f.write_all(buf.as_bytes())?;
        f.sync_all()?;
        Ok(())
    }

    fn note_drain(&self, processed: usize, errors: u64, parse_failures: u64) {
        let mut stats = self.stats.lock().expect("wal stats lock");
        stats.pending_entries = 0;
        stats.processed_total += processed as u64;
        stats.drain_errors += errors;
        stats.parse_failures += parse_failures;
        stats.drains_completed += 1;
        stats.last_drain_at = Some(Utc::now());
    }
}

/// Drive the WAL drainer until shutdown: drain on every tick or nudge, then
/// run one final drain so acknowledged records are not stranded. Optionally
/// prunes `processed` by age after each pass.
pub async fn run_drainer(
    wal: Arc<WriteAheadLog>,
    sink: Arc<dyn RecordSink>,
    interval: Duration,
    retention: Option<chrono::Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wal.drain_nudge.notified() => {}
            changed = shutdown.changed() => {
                // A dropped sender is shutdown too.
                if changed.is_err() || *shutdown.borrow() {
                    if let Err(e) = wal.drain_once(sink.as_ref()).await {
                        tracing::error!(error = %e, "final wal drain failed");
                    }
                    return;
                }
            }
        }
        if let Err(e) = wal.drain_once(sink.as_ref()).await {
            tracing::error!(error = %e, "wal drain failed");
        }
        if let Some(window) = retention {
            if let Err(e) = wal.prune_processed(window).await {
                tracing::error!(error = %e, "wal prune failed");
            }
        }
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, std::io::Error> {
    match File::open(path) {
        Ok(file) => BufReader::new(file)
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Rewrite `path` with `lines` via a sibling tempfile and rename, so a crash
/// mid-rewrite never leaves a partial file.
fn rewrite_atomic(dir: &Path, path: &Path, lines: &[String]) -> Result<(), WalError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    for line in lines {
        tmp.write_all(line.as_bytes())?;
        tmp.write_all(b"\n")?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| WalError::Io(e.error))?;
    Ok(())
}
