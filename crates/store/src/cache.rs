//! Invalidation contract for the external query-side cache.
//!
//! The cache implementation lives outside this service; the store only
//! promises that every record mutation invalidates the record's per-id entry
//! and all cached list queries for the record's source.

use async_trait::async_trait;

#[async_trait]
pub trait RecordCache: Send + Sync {
    async fn invalidate_record(&self, record_id: &str);
    async fn invalidate_source(&self, source: &str);
}

/// Default wiring for deployments without a cache.
pub struct NoopCache;

#[async_trait]
impl RecordCache for NoopCache {
    async fn invalidate_record(&self, _record_id: &str) {}
    async fn invalidate_source(&self, _source: &str) {}
}
