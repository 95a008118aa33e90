//! Versioned schema migrations for the record store.

use sqlx::{Pool, Row, Sqlite};

use crate::error::StoreError;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_log_records",
            sql: r#"
            CREATE TABLE IF NOT EXISTS log_records (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT,
                stacktrace TEXT,
                hash TEXT NOT NULL,
                created_ms INTEGER NOT NULL,
                batch_id TEXT,
                merkle_root TEXT,
                batched_ms INTEGER
            );
            "#,
        },
        Migration {
            version: 2,
            name: "add_log_record_indexes",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_records_timestamp ON log_records(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_records_source_ts ON log_records(source ASC, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_records_level_ts ON log_records(level ASC, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_records_source_level_ts ON log_records(source ASC, level ASC, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_records_created_ms ON log_records(created_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_records_batch_id ON log_records(batch_id ASC);
            "#,
        },
        Migration {
            version: 3,
            name: "create_sync_control",
            sql: r#"
            CREATE TABLE IF NOT EXISTS sync_control (
                record_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                batch_id TEXT,
                ledger_tx_id TEXT,
                created_ms INTEGER NOT NULL,
                synced_ms INTEGER,
                failed_ms INTEGER,
                last_error TEXT
            );
            "#,
        },
        Migration {
            version: 4,
            name: "add_sync_control_indexes",
            sql: r#"
            CREATE INDEX IF NOT EXISTS idx_sync_status ON sync_control(status ASC);
            CREATE INDEX IF NOT EXISTS idx_sync_created_ms ON sync_control(created_ms ASC);
            "#,
        },
    ]
}

/// Apply all pending migrations. Safe to call on every startup.
pub async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_ms INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    let current: i32 = sqlx::query("SELECT MAX(version) AS v FROM schema_migrations")
        .fetch_one(pool)
        .await?
        .get::<Option<i32>, _>("v")
        .unwrap_or(0);

    for migration in migrations() {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying store migration"
        );
        apply(pool, &migration).await?;
    }
    Ok(())
}

async fn apply(pool: &Pool<Sqlite>, migration: &Migration) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for statement in migration
        .sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_ms) VALUES (?1, ?2, ?3)",
    )
    .bind(migration.version)
    .bind(migration.name)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}
