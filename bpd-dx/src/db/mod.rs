//! Database access for bpd-dx
//!
//! Single SQLite database holding execution records and the
//! crash-recovery ledger.

pub mod executions;
pub mod ledger;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create bpd-dx tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            execution_id TEXT PRIMARY KEY,
            subject_brand TEXT NOT NULL,
            competitor_brands TEXT NOT NULL,
            providers TEXT NOT NULL,
            questions TEXT NOT NULL,
            concurrency_limit INTEGER NOT NULL,
            per_cell_timeout_seconds INTEGER NOT NULL,
            execution_timeout_seconds INTEGER NOT NULL,
            stage TEXT NOT NULL DEFAULT '"initializing"',
            progress_percent REAL NOT NULL DEFAULT 0.0,
            completed_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL,
            result TEXT,
            fail_reason TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_ledger (
            execution_id TEXT PRIMARY KEY,
            snapshot TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
