use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::canonical_record_hash;

/// Severity of an ingested log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level string is not one of the allowed severities.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid log level '{0}', expected one of DEBUG, INFO, WARNING, ERROR, CRITICAL")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// One ingested log record with its canonical content hash.
///
/// `batch_id`, `merkle_root` and `batched_at` are set exactly once, when the
/// scheduler tags the record into a Merkle batch. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Event timestamp as supplied by the caller, RFC3339.
    pub timestamp: String,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    /// Lowercase hex SHA-256 over the canonical field concatenation.
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batched_at: Option<DateTime<Utc>>,
}

impl LogRecord {
    /// Recompute the canonical hash from the record's own fields.
    pub fn compute_hash(&self) -> String {
        canonical_record_hash(
            &self.id,
            &self.timestamp,
            &self.source,
            self.level,
            &self.message,
            self.metadata.as_ref(),
            self.stacktrace.as_deref(),
        )
    }
}

/// Ledger-anchoring progress of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    PendingBatch,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::PendingBatch => "pending_batch",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid sync status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for SyncStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "pending_batch" => Ok(SyncStatus::PendingBatch),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Sidecar row tracking a record's path through batching and anchoring.
/// Exactly one exists per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncControl {
    pub record_id: String,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncControl {
    /// Fresh sidecar for a newly ingested record.
    pub fn new(record_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            record_id: record_id.into(),
            status: SyncStatus::Pending,
            batch_id: None,
            ledger_tx_id: None,
            created_at,
            synced_at: None,
            failed_at: None,
            last_error: None,
        }
    }
}

/// A group of records committed to one Merkle root and anchored under one
/// batch identifier. Materialized from the record rows; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleBatch {
    pub batch_id: String,
    pub merkle_root: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub record_ids: Vec<String>,
}
