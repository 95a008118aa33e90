use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use ledgerlog_core::{LedgerClient, LogRecord};
use ledgerlog_scheduler::BatchScheduler;
use ledgerlog_store::{RecordCache, RecordStore, StoreError};
use ledgerlog_wal::{RecordSink, SinkError, WriteAheadLog};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

pub use config::Config;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RecordStore>,
    pub scheduler: Arc<BatchScheduler>,
    pub wal: Option<Arc<WriteAheadLog>>,
    pub sink: Arc<dyn RecordSink>,
    pub ledger: Option<Arc<dyn LedgerClient>>,
    pub cache: Arc<dyn RecordCache>,
}

/// Drain target: WAL entries are replayed into the record store. A record
/// that already made it in (the ingest handler inserts directly after the
/// WAL append) is reported as already accepted.
pub struct StoreSink {
    store: Arc<RecordStore>,
}

impl StoreSink {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecordSink for StoreSink {
    async fn accept(&self, record: LogRecord) -> Result<(), SinkError> {
        match self.store.ingest(&record).await {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate(_)) => Err(SinkError::AlreadyAccepted),
            Err(e) => Err(SinkError::Unavailable(e.to_string())),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/logs", post(handlers::post_log).get(handlers::list_logs))
        .route(
            "/logs/{id}",
            get(handlers::get_log).delete(handlers::delete_log),
        )
        .route("/merkle/batch", post(handlers::submit_batch))
        .route("/merkle/force-batch", post(handlers::force_batch))
        .route("/merkle/batch/{id}", get(handlers::get_batch))
        .route("/merkle/verify/{id}", post(handlers::verify_batch))
        .route("/merkle/batches", get(handlers::list_batches))
        .route("/merkle/stats", get(handlers::merkle_stats))
        .route("/wal/stats", get(handlers::wal_stats))
        .route("/wal/force-process", post(handlers::wal_force_process))
        .route("/wal/health", get(handlers::wal_health))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
