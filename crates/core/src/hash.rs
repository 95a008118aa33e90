use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::model::LogLevel;

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical content hash of a log record.
///
/// The input is the UTF-8 concatenation of id, timestamp, source, level,
/// message, then the metadata JSON when the map is non-empty, then the
/// stacktrace when non-empty. Metadata is a `BTreeMap`, so its JSON form has
/// a stable key order and the hash is reproducible across processes.
pub fn canonical_record_hash(
    id: &str,
    timestamp: &str,
    source: &str,
    level: LogLevel,
    message: &str,
    metadata: Option<&BTreeMap<String, String>>,
    stacktrace: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(level.as_str().as_bytes());
    hasher.update(message.as_bytes());
    if let Some(map) = metadata {
        if !map.is_empty() {
            let json = serde_json::to_string(map)
                .expect("string map serialization is infallible");
            hasher.update(json.as_bytes());
        }
    }
    if let Some(trace) = stacktrace {
        if !trace.is_empty() {
            hasher.update(trace.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}
