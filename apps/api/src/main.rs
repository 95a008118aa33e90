use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ledger_gateway::{GatewayClient, GatewayTimeouts};
use ledgerlog_api::config::{Config, LogFormat, LoggingConfig, StoreConfig};
use ledgerlog_api::{build_app, AppState, StoreSink};
use ledgerlog_core::LedgerClient;
use ledgerlog_scheduler::{BatchScheduler, SchedulerConfig};
use ledgerlog_store::{ensure_schema, NoopCache, PoolSettings, RecordCache, RecordStore};
use ledgerlog_wal::{run_drainer, RecordSink, WriteAheadLog};
use sqlx::{Pool, Sqlite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.logging);
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        debug = config.server.debug,
        read_timeout_secs = config.server.read_timeout.as_secs(),
        write_timeout_secs = config.server.write_timeout.as_secs(),
        wal_enabled = config.wal.enabled,
        batching_enabled = config.batching.enabled,
        ledger_sync_enabled = config.ledger.sync_enabled,
        "ledgerlog starting"
    );

    let pool = connect_with_retry(&config.store).await?;
    ensure_schema(&pool)
        .await
        .context("store schema migration failed")?;

    let cache: Arc<dyn RecordCache> = Arc::new(NoopCache);
    if config.cache.enabled {
        // The read-through cache lives outside this service; only the
        // invalidation contract is wired here.
        tracing::info!(
            host = %config.cache.host,
            port = config.cache.port,
            ttl_secs = config.cache.ttl_seconds,
            "external query cache configured, invalidation contract active"
        );
    }
    let store = Arc::new(
        RecordStore::new(pool, config.store.selection_timeout).with_cache(cache.clone()),
    );

    let ledger: Option<Arc<dyn LedgerClient>> = if config.ledger.sync_enabled {
        let client = GatewayClient::new(
            config.ledger.url.clone(),
            config.ledger.channel.clone(),
            config.ledger.contract.clone(),
            GatewayTimeouts {
                invoke: config.ledger.invoke_timeout,
                query: config.ledger.query_timeout,
            },
        )
        .context("failed to build ledger gateway client")?;
        Some(Arc::new(client))
    } else {
        tracing::info!("ledger sync disabled, batches will be created but not anchored");
        None
    };

    let scheduler = Arc::new(BatchScheduler::new(
        store.clone(),
        ledger.clone(),
        SchedulerConfig {
            auto_batch_size: config.batching.auto_batch_size,
            auto_batch_interval: config.batching.auto_batch_interval,
            worker_count: config.batching.worker_count,
            max_queue_depth: config.batching.max_queue_depth,
            ledger_timeout: config.ledger.invoke_timeout,
            verification_enabled: config.batching.verification_enabled,
        },
    ));
    if config.batching.enabled {
        scheduler.start().await?;
    } else {
        tracing::info!("batching disabled, scheduler not started");
    }

    let sink: Arc<dyn RecordSink> = Arc::new(StoreSink::new(store.clone()));
    let (drainer_shutdown, drainer_shutdown_rx) = watch::channel(false);
    let mut drainer_handle = None;
    let wal = if config.wal.enabled {
        let wal = Arc::new(
            WriteAheadLog::open(&config.wal.directory, config.wal.max_file_size_mb)
                .with_context(|| {
                    format!("failed to open wal directory {}", config.wal.directory)
                })?,
        );
        let retention = config
            .wal
            .retention_days
            .map(|days| chrono::Duration::days(days as i64));
        drainer_handle = Some(tokio::spawn(run_drainer(
            wal.clone(),
            sink.clone(),
            config.wal.check_interval,
            retention,
            drainer_shutdown_rx,
        )));
        Some(wal)
    } else {
        tracing::warn!("wal disabled, ingest acknowledgements are only as durable as the store");
        None
    };

    let state = AppState {
        store,
        scheduler: scheduler.clone(),
        wal,
        sink,
        ledger,
        cache,
    };
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    if scheduler.is_running() {
        if let Err(e) = scheduler.stop(config.server.shutdown_timeout).await {
            tracing::error!(error = %e, "scheduler did not stop cleanly");
        }
    }
    let _ = drainer_shutdown.send(true);
    if let Some(handle) = drainer_handle {
        if tokio::time::timeout(config.server.shutdown_timeout, handle)
            .await
            .is_err()
        {
            tracing::warn!("wal drainer did not finish its final pass in time");
        }
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    if logging.stacktrace {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(logging.caller)
                    .with_line_number(logging.caller),
            )
            .init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(logging.caller)
                    .with_line_number(logging.caller),
            )
            .init(),
    }
}

/// Connect to the record store with a bounded exponential-backoff retry
/// budget. Exhausting the budget is fatal to startup.
async fn connect_with_retry(config: &StoreConfig) -> anyhow::Result<Pool<Sqlite>> {
    let settings = PoolSettings {
        min_connections: config.min_pool_size,
        max_connections: config.max_pool_size,
        idle_timeout: config.idle_timeout,
        acquire_timeout: config.selection_timeout,
    };
    let cap = Duration::from_secs(10);
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match ledgerlog_store::connect(&config.url, &settings).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt >= config.connect_attempts => {
                return Err(anyhow::anyhow!(
                    "record store unreachable after {attempt} attempts: {e}"
                ));
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "store connect failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
