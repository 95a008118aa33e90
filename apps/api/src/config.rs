//! Process configuration: typed sections with defaults, overridable through
//! `LEDGERLOG_*` environment variables, validated once at startup and
//! injected into every component from the composition root.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub wal: WalConfig,
    pub batching: BatchingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub idle_timeout: Duration,
    /// Deadline applied to every store operation.
    pub selection_timeout: Duration,
    /// Startup connect retry budget.
    pub connect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub pool_size: u32,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub url: String,
    pub channel: String,
    pub contract: String,
    pub sync_enabled: bool,
    pub max_workers: usize,
    pub invoke_timeout: Duration,
    pub query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub enabled: bool,
    pub directory: String,
    pub check_interval: Duration,
    pub max_file_size_mb: Option<u64>,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub auto_batch_size: usize,
    pub auto_batch_interval: Duration,
    pub worker_count: usize,
    pub max_queue_depth: usize,
    pub verification_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub caller: bool,
    pub stacktrace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            server: ServerConfig {
                host: env_string("LEDGERLOG_SERVER_HOST", "0.0.0.0"),
                port: env_parse("LEDGERLOG_SERVER_PORT", 5001),
                debug: env_bool("LEDGERLOG_SERVER_DEBUG", false),
                read_timeout: env_secs("LEDGERLOG_SERVER_READ_TIMEOUT_SECS", 30),
                write_timeout: env_secs("LEDGERLOG_SERVER_WRITE_TIMEOUT_SECS", 30),
                shutdown_timeout: env_secs("LEDGERLOG_SERVER_SHUTDOWN_TIMEOUT_SECS", 15),
            },
            store: StoreConfig {
                url: env_string("LEDGERLOG_STORE_URL", "sqlite://ledgerlog.sqlite3"),
                min_pool_size: env_parse("LEDGERLOG_STORE_MIN_POOL_SIZE", 10),
                max_pool_size: env_parse("LEDGERLOG_STORE_MAX_POOL_SIZE", 100),
                idle_timeout: env_secs("LEDGERLOG_STORE_IDLE_TIMEOUT_SECS", 300),
                selection_timeout: env_secs("LEDGERLOG_STORE_SELECTION_TIMEOUT_SECS", 30),
                connect_attempts: env_parse("LEDGERLOG_STORE_CONNECT_ATTEMPTS", 5),
            },
            cache: CacheConfig {
                enabled: env_bool("LEDGERLOG_CACHE_ENABLED", false),
                host: env_string("LEDGERLOG_CACHE_HOST", "127.0.0.1"),
                port: env_parse("LEDGERLOG_CACHE_PORT", 6379),
                pool_size: env_parse("LEDGERLOG_CACHE_POOL_SIZE", 10),
                ttl_seconds: env_parse("LEDGERLOG_CACHE_TTL_SECS", 600),
            },
            ledger: LedgerConfig {
                url: env_string("LEDGERLOG_LEDGER_URL", "http://127.0.0.1:7051"),
                channel: env_string("LEDGERLOG_LEDGER_CHANNEL", "audit-channel"),
                contract: env_string("LEDGERLOG_LEDGER_CONTRACT", "logbatch"),
                sync_enabled: env_bool("LEDGERLOG_LEDGER_SYNC_ENABLED", false),
                max_workers: env_parse("LEDGERLOG_LEDGER_MAX_WORKERS", 10),
                invoke_timeout: env_secs("LEDGERLOG_LEDGER_INVOKE_TIMEOUT_SECS", 30),
                query_timeout: env_secs("LEDGERLOG_LEDGER_QUERY_TIMEOUT_SECS", 10),
            },
            wal: WalConfig {
                enabled: env_bool("LEDGERLOG_WAL_ENABLED", true),
                directory: env_string("LEDGERLOG_WAL_DIR", "./wal"),
                check_interval: env_secs("LEDGERLOG_WAL_CHECK_INTERVAL_SECS", 5),
                max_file_size_mb: env_opt_parse("LEDGERLOG_WAL_MAX_FILE_SIZE_MB"),
                retention_days: env_opt_parse("LEDGERLOG_WAL_RETENTION_DAYS"),
            },
            batching: BatchingConfig {
                enabled: env_bool("LEDGERLOG_BATCH_ENABLED", true),
                auto_batch_size: env_parse("LEDGERLOG_BATCH_SIZE", 100),
                auto_batch_interval: env_secs("LEDGERLOG_BATCH_INTERVAL_SECS", 30),
                worker_count: env_parse("LEDGERLOG_BATCH_WORKER_COUNT", 5),
                max_queue_depth: env_parse("LEDGERLOG_BATCH_MAX_QUEUE_DEPTH", 100),
                verification_enabled: env_bool("LEDGERLOG_BATCH_VERIFICATION_ENABLED", true),
            },
            logging: LoggingConfig {
                level: env_string("LEDGERLOG_LOG_LEVEL", "info"),
                format: match env_string("LEDGERLOG_LOG_FORMAT", "text").as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Text,
                },
                caller: env_bool("LEDGERLOG_LOG_CALLER", false),
                stacktrace: env_bool("LEDGERLOG_LOG_STACKTRACE", false),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError("server port must be non-zero".into()));
        }
        if self.store.max_pool_size == 0 || self.store.min_pool_size > self.store.max_pool_size {
            return Err(ConfigError(format!(
                "store pool bounds invalid: min {} max {}",
                self.store.min_pool_size, self.store.max_pool_size
            )));
        }
        if self.batching.auto_batch_size == 0 {
            return Err(ConfigError("auto batch size must be at least 1".into()));
        }
        if self.batching.worker_count == 0 {
            return Err(ConfigError("batch worker count must be at least 1".into()));
        }
        if self.batching.max_queue_depth == 0 {
            return Err(ConfigError("batch queue depth must be at least 1".into()));
        }
        if self.batching.auto_batch_interval.is_zero() {
            return Err(ConfigError("batch interval must be positive".into()));
        }
        if self.wal.enabled && self.wal.directory.is_empty() {
            return Err(ConfigError("wal directory must be set when wal is enabled".into()));
        }
        if self.ledger.sync_enabled && self.ledger.url.is_empty() {
            return Err(ConfigError(
                "ledger url must be set when ledger sync is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_opt_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid value, ignoring");
            None
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => {
                tracing::warn!(key, value = other, "unrecognized boolean, using default");
                default
            }
        },
        Err(_) => default,
    }
}
