//! Shared model, hashing primitives and the ledger client contract for the
//! log ingestion and anchoring service.

pub mod hash;
pub mod ledger;
pub mod merkle;
pub mod model;

pub use hash::{canonical_record_hash, sha256_hex};
pub use ledger::{BatchAnchor, LedgerBatchRecord, LedgerClient, LedgerError};
pub use merkle::merkle_root;
pub use model::{LogLevel, LogRecord, MerkleBatch, SyncControl, SyncStatus};
