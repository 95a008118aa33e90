//! Batch integrity verification: recompute the Merkle root of a stored batch
//! from the record fields themselves and compare it to the root stamped at
//! batch creation.

use ledgerlog_core::{merkle_root, LogRecord, MerkleBatch};
use ledgerlog_store::{RecordStore, StoreError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Integrity {
    Valid,
    Corrupted,
}

/// Verdict produced by [`verify_batch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub batch_id: String,
    pub num_records: usize,
    pub original_root: Option<String>,
    pub recomputed_root: String,
    pub is_valid: bool,
    pub integrity: Integrity,
    pub message: String,
}

/// Load a batch with its member records, in Merkle input order.
pub async fn batch_detail(
    store: &RecordStore,
    batch_id: &str,
) -> Result<(MerkleBatch, Vec<LogRecord>), StoreError> {
    let records = store.find_by_batch(batch_id).await?;
    let Some(first) = records.first() else {
        return Err(StoreError::NotFound);
    };
    let batch = MerkleBatch {
        batch_id: batch_id.to_string(),
        merkle_root: first.merkle_root.clone().unwrap_or_default(),
        created_at: first.batched_at.unwrap_or(first.created_at),
        record_count: records.len(),
        record_ids: records.iter().map(|r| r.id.clone()).collect(),
    };
    Ok((batch, records))
}

/// Recompute every member's canonical hash from its stored fields, reduce
/// them in batch order and compare against the stored root. Any tampered
/// field changes a leaf hash and therefore the recomputed root.
pub async fn verify_batch(
    store: &RecordStore,
    batch_id: &str,
) -> Result<VerificationReport, StoreError> {
    let records = store.find_by_batch(batch_id).await?;
    if records.is_empty() {
        return Err(StoreError::NotFound);
    }
    let num_records = records.len();

    let original_root = records[0].merkle_root.clone();
    let roots_agree = records
        .iter()
        .all(|record| record.merkle_root == original_root);

    let leaf_hashes: Vec<String> = records.iter().map(|r| r.compute_hash()).collect();
    let recomputed_root = merkle_root(&leaf_hashes).unwrap_or_default();

    if !roots_agree {
        return Ok(VerificationReport {
            batch_id: batch_id.to_string(),
            num_records,
            original_root,
            recomputed_root,
            is_valid: false,
            integrity: Integrity::Corrupted,
            message: "records disagree on the stored merkle root".to_string(),
        });
    }

    let is_valid = original_root.as_deref() == Some(recomputed_root.as_str());
    Ok(VerificationReport {
        batch_id: batch_id.to_string(),
        num_records,
        original_root,
        recomputed_root,
        is_valid,
        integrity: if is_valid {
            Integrity::Valid
        } else {
            Integrity::Corrupted
        },
        message: if is_valid {
            format!("batch {batch_id} verified: {num_records} records match the stored root")
        } else {
            format!("batch {batch_id} corrupted: recomputed root does not match the stored root")
        },
    })
}
