//! Shared test harness: an isolated in-memory store, a scheduler wired the
//! way the composition root wires it, and a real HTTP server on a free port.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ledgerlog_api::{build_app, AppState, StoreSink};
use ledgerlog_core::LedgerClient;
use ledgerlog_scheduler::{BatchScheduler, SchedulerConfig};
use ledgerlog_store::{ensure_schema, NoopCache, RecordStore};
use ledgerlog_wal::WriteAheadLog;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;

pub struct TestOptions {
    pub wal_dir: Option<PathBuf>,
    pub ledger: Option<Arc<dyn LedgerClient>>,
    pub start_scheduler: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            wal_dir: None,
            ledger: None,
            start_scheduler: true,
        }
    }
}

#[allow(dead_code)]
pub struct TestApp {
    pub base: String,
    pub store: Arc<RecordStore>,
    pub scheduler: Arc<BatchScheduler>,
    pub wal: Option<Arc<WriteAheadLog>>,
    pub server: tokio::task::JoinHandle<()>,
}

/// Isolated named in-memory store shared across pool connections.
#[allow(dead_code)]
pub async fn make_store() -> Arc<RecordStore> {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let url = format!("sqlite:file:api_test_{nanos}?mode=memory&cache=shared");
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("failed to open in-memory SQLite pool");
    ensure_schema(&pool).await.expect("ensure_schema failed");
    Arc::new(RecordStore::new(pool, Duration::from_secs(5)))
}

pub async fn spawn_app(options: TestOptions) -> TestApp {
    let store = make_store().await;
    let scheduler = Arc::new(BatchScheduler::new(
        store.clone(),
        options.ledger.clone(),
        SchedulerConfig {
            auto_batch_size: 10,
            // Long enough that only explicit submissions drive the tests.
            auto_batch_interval: Duration::from_secs(3600),
            worker_count: 1,
            max_queue_depth: 16,
            ledger_timeout: Duration::from_secs(5),
            verification_enabled: true,
        },
    ));
    if options.start_scheduler {
        scheduler.start().await.expect("scheduler start failed");
    }

    let wal = options.wal_dir.map(|dir| {
        Arc::new(WriteAheadLog::open(dir, None).expect("failed to open wal directory"))
    });

    let state = AppState {
        store: store.clone(),
        scheduler: scheduler.clone(),
        wal: wal.clone(),
        sink: Arc::new(StoreSink::new(store.clone())),
        ledger: options.ledger,
        cache: Arc::new(NoopCache),
    };
    let app = build_app(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server failed");
    });

    TestApp {
        base: format!("http://127.0.0.1:{port}"),
        store,
        scheduler,
        wal,
        server,
    }
}

/// Poll until `check` passes or the budget runs out.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
