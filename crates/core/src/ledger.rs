//! Contract between the anchoring scheduler and the external permissioned
//! ledger. Implementations live in the `ledger-gateway` crate; the scheduler
//! only sees this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload submitted when anchoring one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnchor {
    pub batch_id: String,
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub record_ids: Vec<String>,
}

/// Batch record as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBatchRecord {
    pub batch_id: String,
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub record_ids: Vec<String>,
}

/// Errors surfaced by ledger operations.
///
/// `Network` and `Timeout` are retriable: re-issuing the same call is
/// expected to eventually succeed. `Validation` is fatal and needs operator
/// action. `Duplicate` means the batch id already exists on the ledger; the
/// scheduler treats it as a successful anchor so that re-anchoring after a
/// partial failure stays idempotent.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Network(String),
    #[error("ledger call timed out: {0}")]
    Timeout(String),
    #[error("ledger rejected the request: {0}")]
    Validation(String),
    #[error("batch already anchored: {0}")]
    Duplicate(String),
}

impl LedgerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, LedgerError::Network(_) | LedgerError::Timeout(_))
    }
}

/// Client for the external ledger's anchor and query operations.
///
/// Implementations classify errors but never retry internally; retry policy
/// belongs to the scheduler.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit an anchor transaction, returning the ledger transaction id.
    async fn store_batch(&self, batch: &BatchAnchor) -> Result<String, LedgerError>;

    /// Fetch a previously anchored batch, `None` when unknown.
    async fn query_batch(&self, batch_id: &str)
        -> Result<Option<LedgerBatchRecord>, LedgerError>;

    async fn health_check(&self) -> Result<(), LedgerError>;
}
