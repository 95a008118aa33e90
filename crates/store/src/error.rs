//! Store error taxonomy and SQLite constraint-violation detection.

use std::time::Duration;

use sqlx::error::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate record id: {0}")]
    Duplicate(String),
    #[error("not found")]
    NotFound,
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("batch tag mismatch: expected {expected} records, matched {updated}")]
    TagMismatch { expected: usize, updated: usize },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether re-issuing the same operation can be expected to succeed.
    /// Timeouts and pool/transport failures are retriable; constraint and
    /// decode failures are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// True when a sqlx error is a unique/primary-key constraint violation.
///
/// SQLite reports extended codes 2067 (UNIQUE) and 1555 (PRIMARY KEY) when
/// `PRAGMA extended_result_codes = ON`; the generic code 19 needs message
/// confirmation to rule out CHECK/NOT NULL/FOREIGN KEY failures.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    let db_err: &dyn DatabaseError = match err {
        sqlx::Error::Database(e) => e.as_ref(),
        _ => return false,
    };
    if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation {
        return true;
    }
    let message = db_err.message().to_lowercase();
    if let Some(code) = db_err.code() {
        match code.as_ref() {
            "2067" | "1555" => return true,
            "19" => return message_is_unique(&message),
            _ => {}
        }
    }
    message_is_unique(&message)
}

fn message_is_unique(message: &str) -> bool {
    if message.contains("foreign key")
        || message.contains("not null")
        || message.contains("check constraint")
    {
        return false;
    }
    (message.contains("unique") && message.contains("constraint"))
        || (message.contains("unique") && message.contains("failed"))
        || (message.contains("primary key") && message.contains("failed"))
}
