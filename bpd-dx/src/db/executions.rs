//! Execution record persistence
//!
//! The executions table is the durable source of truth consulted by the
//! pull (polling) transport; the dispatcher writes through to it after
//! every state transition.

use sqlx::{Row, SqlitePool};
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use bpd_common::types::DiagnosisStage;
use bpd_common::{Error, Result};

use crate::models::{ExecutionRecord, ExecutionResult};

/// Insert or overwrite an execution record
pub async fn save_execution(pool: &SqlitePool, record: &ExecutionRecord) -> Result<()> {
    // Serialize all columns BEFORE touching the pool
    let execution_id = record.execution_id.to_string();
    let competitor_brands = serde_json::to_string(&record.competitor_brands)
        .map_err(|e| Error::Internal(format!("Failed to serialize competitor_brands: {}", e)))?;
    let providers = serde_json::to_string(&record.providers)
        .map_err(|e| Error::Internal(format!("Failed to serialize providers: {}", e)))?;
    let questions = serde_json::to_string(&record.questions)
        .map_err(|e| Error::Internal(format!("Failed to serialize questions: {}", e)))?;
    let stage = serde_json::to_string(&record.stage)
        .map_err(|e| Error::Internal(format!("Failed to serialize stage: {}", e)))?;
    let result = record
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize result: {}", e)))?;
    let started_at = record.started_at.to_rfc3339();
    let ended_at = record.ended_at.map(|dt| dt.to_rfc3339());

    sqlx::query(
        r#"
        INSERT INTO executions (
            execution_id, subject_brand, competitor_brands, providers, questions,
            concurrency_limit, per_cell_timeout_seconds, execution_timeout_seconds,
            stage, progress_percent, completed_count, total_count,
            result, fail_reason, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(execution_id) DO UPDATE SET
            stage = excluded.stage,
            progress_percent = excluded.progress_percent,
            completed_count = excluded.completed_count,
            result = excluded.result,
            fail_reason = excluded.fail_reason,
            ended_at = excluded.ended_at
        "#,
    )
    .bind(&execution_id)
    .bind(&record.subject_brand)
    .bind(&competitor_brands)
    .bind(&providers)
    .bind(&questions)
    .bind(record.concurrency_limit as i64)
    .bind(record.per_cell_timeout_seconds as i64)
    .bind(record.execution_timeout_seconds as i64)
    .bind(&stage)
    .bind(record.progress_percent)
    .bind(record.completed_count as i64)
    .bind(record.total_count as i64)
    .bind(&result)
    .bind(&record.fail_reason)
    .bind(&started_at)
    .bind(&ended_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one execution record
pub async fn load_execution(pool: &SqlitePool, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
    let row = sqlx::query(
        r#"
        SELECT execution_id, subject_brand, competitor_brands, providers, questions,
               concurrency_limit, per_cell_timeout_seconds, execution_timeout_seconds,
               stage, progress_percent, completed_count, total_count,
               result, fail_reason, started_at, ended_at
        FROM executions
        WHERE execution_id = ?
        "#,
    )
    .bind(execution_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(record_from_row).transpose()
}

/// Load all executions stuck in a non-terminal stage (startup recovery)
pub async fn load_incomplete_executions(pool: &SqlitePool) -> Result<Vec<ExecutionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT execution_id, subject_brand, competitor_brands, providers, questions,
               concurrency_limit, per_cell_timeout_seconds, execution_timeout_seconds,
               stage, progress_percent, completed_count, total_count,
               result, fail_reason, started_at, ended_at
        FROM executions
        WHERE stage IN ('"initializing"', '"ai_fetching"', '"analyzing"')
        ORDER BY started_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(record_from_row).collect()
}

fn record_from_row(row: SqliteRow) -> Result<ExecutionRecord> {
    let execution_id: String = row.get("execution_id");
    let execution_id = Uuid::parse_str(&execution_id)
        .map_err(|e| Error::Internal(format!("Failed to parse execution_id: {}", e)))?;

    let competitor_brands: String = row.get("competitor_brands");
    let competitor_brands: Vec<String> = serde_json::from_str(&competitor_brands)
        .map_err(|e| Error::Internal(format!("Failed to deserialize competitor_brands: {}", e)))?;

    let providers: String = row.get("providers");
    let providers: Vec<String> = serde_json::from_str(&providers)
        .map_err(|e| Error::Internal(format!("Failed to deserialize providers: {}", e)))?;

    let questions: String = row.get("questions");
    let questions: Vec<String> = serde_json::from_str(&questions)
        .map_err(|e| Error::Internal(format!("Failed to deserialize questions: {}", e)))?;

    let stage: String = row.get("stage");
    let stage: DiagnosisStage = serde_json::from_str(&stage)
        .map_err(|e| Error::Internal(format!("Failed to deserialize stage: {}", e)))?;

    let result: Option<String> = row.get("result");
    let result: Option<ExecutionResult> = result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to deserialize result: {}", e)))?;

    let started_at: String = row.get("started_at");
    let started_at = chrono::DateTime::parse_from_rfc3339(&started_at)
        .map_err(|e| Error::Internal(format!("Failed to parse started_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let ended_at: Option<String> = row.get("ended_at");
    let ended_at = ended_at
        .as_deref()
        .map(chrono::DateTime::parse_from_rfc3339)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse ended_at: {}", e)))?
        .map(|dt| dt.with_timezone(&chrono::Utc));

    let concurrency_limit: i64 = row.get("concurrency_limit");
    let per_cell_timeout_seconds: i64 = row.get("per_cell_timeout_seconds");
    let execution_timeout_seconds: i64 = row.get("execution_timeout_seconds");
    let completed_count: i64 = row.get("completed_count");
    let total_count: i64 = row.get("total_count");

    Ok(ExecutionRecord {
        execution_id,
        subject_brand: row.get("subject_brand"),
        competitor_brands,
        providers,
        questions,
        concurrency_limit: concurrency_limit as usize,
        per_cell_timeout_seconds: per_cell_timeout_seconds as u64,
        execution_timeout_seconds: execution_timeout_seconds as u64,
        stage,
        progress_percent: row.get("progress_percent"),
        completed_count: completed_count as usize,
        total_count: total_count as usize,
        result,
        fail_reason: row.get("fail_reason"),
        started_at,
        ended_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_pool() -> SqlitePool {
        // Single connection: each pooled connection to sqlite::memory:
        // would otherwise see its own empty database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            "Acme".to_string(),
            vec!["Initech".to_string()],
            vec!["openai".to_string(), "anthropic".to_string()],
            vec!["How is {brand} perceived?".to_string()],
            4,
            Duration::from_secs(30),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let pool = test_pool().await;
        let record = record();
        save_execution(&pool, &record).await.unwrap();

        let loaded = load_execution(&pool, record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.execution_id, record.execution_id);
        assert_eq!(loaded.subject_brand, "Acme");
        assert_eq!(loaded.providers, record.providers);
        assert_eq!(loaded.stage, DiagnosisStage::Initializing);
        assert_eq!(loaded.total_count, 2);
        assert!(loaded.result.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_mutable_columns() {
        let pool = test_pool().await;
        let mut record = record();
        save_execution(&pool, &record).await.unwrap();

        record.stage = DiagnosisStage::AiFetching;
        record.completed_count = 1;
        record.progress_percent = 50.0;
        save_execution(&pool, &record).await.unwrap();

        let loaded = load_execution(&pool, record.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.stage, DiagnosisStage::AiFetching);
        assert_eq!(loaded.completed_count, 1);
        assert_eq!(loaded.progress_percent, 50.0);
    }

    #[tokio::test]
    async fn test_load_incomplete_skips_terminal() {
        let pool = test_pool().await;

        let running = record();
        save_execution(&pool, &running).await.unwrap();

        let mut done = record();
        done.stage = DiagnosisStage::Completed;
        done.ended_at = Some(chrono::Utc::now());
        save_execution(&pool, &done).await.unwrap();

        let incomplete = load_incomplete_executions(&pool).await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].execution_id, running.execution_id);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let pool = test_pool().await;
        assert!(load_execution(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}
