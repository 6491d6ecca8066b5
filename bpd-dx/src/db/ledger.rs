//! Crash-recovery ledger
//!
//! Best-effort durability log for in-flight executions. Each write
//! replaces the execution's entire snapshot (full-snapshot overwrite,
//! no incremental records), so a half-written row from a crash can
//! never leave the ledger internally inconsistent.
//!
//! Ledger writes are explicitly infallible from the caller's view: a
//! failed write is logged, counted, and otherwise ignored so that
//! durability problems degrade recovery rather than live progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bpd_common::types::{CellResult, DiagnosisStage};
use bpd_common::{Error, Result};

/// Interval between retention sweeps
const REAP_INTERVAL: Duration = Duration::from_secs(3600);

/// Point-in-time image of one execution's progress
///
/// Holds only terminal cells; pending work is derived at recovery time
/// as the question/provider matrix minus these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub execution_id: Uuid,
    pub stage: DiagnosisStage,
    pub completed_count: usize,
    pub total_count: usize,
    pub cells: Vec<CellResult>,
}

/// Best-effort crash-recovery log over the execution_ledger table
pub struct Ledger {
    pool: SqlitePool,
    retention: Duration,
    write_failures: AtomicU64,
}

impl Ledger {
    pub fn new(pool: SqlitePool, retention: Duration) -> Self {
        Self {
            pool,
            retention,
            write_failures: AtomicU64::new(0),
        }
    }

    /// Overwrite the execution's snapshot. Never fails: errors are
    /// logged and counted.
    pub async fn write(&self, snapshot: &LedgerSnapshot) {
        let serialized = match serde_json::to_string(snapshot) {
            Ok(s) => s,
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    execution_id = %snapshot.execution_id,
                    error = %e,
                    "Failed to serialize ledger snapshot"
                );
                return;
            }
        };

        let result = sqlx::query(
            r#"
            INSERT INTO execution_ledger (execution_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(execution_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(snapshot.execution_id.to_string())
        .bind(&serialized)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                execution_id = %snapshot.execution_id,
                error = %e,
                "Ledger write failed, continuing without durability"
            );
        }
    }

    /// Read the snapshot for one execution
    pub async fn read(&self, execution_id: Uuid) -> Result<Option<LedgerSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM execution_ledger WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let snapshot: String = row.get("snapshot");
                Ok(Some(decode_snapshot(&snapshot)?))
            }
            None => Ok(None),
        }
    }

    /// Read the snapshot for crash recovery, treating rows whose last
    /// write predates the retention window as absent. Idempotent:
    /// repeated calls with no intervening writes see the same snapshot.
    pub async fn recover(&self, execution_id: Uuid) -> Result<Option<LedgerSnapshot>> {
        let row = sqlx::query(
            "SELECT snapshot, updated_at FROM execution_ledger WHERE execution_id = ?",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let updated_at: String = row.get("updated_at");
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Internal(format!("Corrupt ledger timestamp: {}", e)))?
            .with_timezone(&Utc);
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::Internal(format!("Retention out of range: {}", e)))?;
        let age = Utc::now().signed_duration_since(updated_at);
        if age > retention {
            warn!(
                execution_id = %execution_id,
                age_seconds = age.num_seconds(),
                "Ledger snapshot older than the retention window, ignoring"
            );
            return Ok(None);
        }

        let snapshot: String = row.get("snapshot");
        Ok(Some(decode_snapshot(&snapshot)?))
    }

    /// Drop the execution's row. Best-effort, same as write.
    pub async fn remove(&self, execution_id: Uuid) {
        let result = sqlx::query("DELETE FROM execution_ledger WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            warn!(execution_id = %execution_id, error = %e, "Ledger cleanup failed");
        }
    }

    /// Delete rows whose last update predates the retention window.
    /// Returns the number of rows removed.
    pub async fn reap_stale(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| Error::Internal(format!("Retention out of range: {}", e)))?;

        let deleted = sqlx::query("DELETE FROM execution_ledger WHERE updated_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted > 0 {
            info!(deleted, "Reaped stale ledger rows");
        }
        Ok(deleted)
    }

    /// Count of writes dropped due to I/O or serialization failure
    pub fn write_failure_count(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Spawn the hourly retention sweep
    pub fn spawn_reaper(self: &Arc<Self>) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match ledger.reap_stale().await {
                    Ok(deleted) => debug!(deleted, "Ledger retention sweep complete"),
                    Err(e) => warn!(error = %e, "Ledger retention sweep failed"),
                }
            }
        });
    }
}

fn decode_snapshot(raw: &str) -> Result<LedgerSnapshot> {
    serde_json::from_str(raw).map_err(|e| Error::Internal(format!("Corrupt ledger snapshot: {}", e)))
}
