//! Diagnosis API handlers
//!
//! POST /diagnosis/start, GET /diagnosis/status, GET /diagnosis/result,
//! POST /diagnosis/cancel

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bpd_common::types::DiagnosisStage;

use crate::config::MAX_CONCURRENCY;
use crate::db::executions::{load_execution, save_execution};
use crate::error::{ApiError, ApiResult};
use crate::models::{ExecutionRecord, ExecutionResult};
use crate::services::recovery::spawn_execution;
use crate::AppState;

/// POST /diagnosis/start request
#[derive(Debug, Deserialize)]
pub struct StartDiagnosisRequest {
    pub subject_brand: String,
    #[serde(default)]
    pub competitor_brands: Vec<String>,
    pub providers: Vec<String>,
    pub questions: Vec<String>,
    pub concurrency_limit: Option<usize>,
    pub per_cell_timeout_seconds: Option<u64>,
    pub execution_timeout_seconds: Option<u64>,
}

/// POST /diagnosis/start response
#[derive(Debug, Serialize, Deserialize)]
pub struct StartDiagnosisResponse {
    pub execution_id: Uuid,
    pub total_cells: usize,
    pub stage: DiagnosisStage,
    pub started_at: DateTime<Utc>,
}

/// GET /diagnosis/status response
#[derive(Debug, Serialize, Deserialize)]
pub struct DiagnosisStatusResponse {
    pub execution_id: Uuid,
    pub stage: DiagnosisStage,
    pub progress_percent: f64,
    pub completed_count: usize,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Polling hint for pull clients, absent once terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_poll_interval_ms: Option<u64>,
}

/// GET /diagnosis/result response
#[derive(Debug, Serialize, Deserialize)]
pub struct DiagnosisResultResponse {
    pub execution_id: Uuid,
    pub stage: DiagnosisStage,
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// POST /diagnosis/cancel response
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelDiagnosisResponse {
    pub execution_id: Uuid,
    pub status: String,
}

/// Validation failure as a 400 through the shared error type
fn invalid(msg: impl Into<String>) -> ApiError {
    bpd_common::Error::InvalidInput(msg.into()).into()
}

/// POST /diagnosis/start
///
/// Validate the request, persist the execution record, and hand the
/// matrix to a background dispatch task. Returns 202 Accepted.
pub async fn start_diagnosis(
    State(state): State<AppState>,
    Json(request): Json<StartDiagnosisRequest>,
) -> ApiResult<(StatusCode, Json<StartDiagnosisResponse>)> {
    if request.subject_brand.trim().is_empty() {
        return Err(invalid("subject_brand must not be empty"));
    }
    if request.questions.is_empty() {
        return Err(invalid("questions must not be empty"));
    }
    if request.providers.is_empty() {
        return Err(invalid("providers must not be empty"));
    }
    for provider in &request.providers {
        if !state.known_provider(provider) {
            return Err(invalid(format!("Unknown provider: {}", provider)));
        }
    }
    if request.concurrency_limit == Some(0) {
        return Err(invalid("concurrency_limit must be at least 1"));
    }

    let concurrency_limit = request
        .concurrency_limit
        .unwrap_or(state.config.concurrency_limit)
        .clamp(1, MAX_CONCURRENCY);
    let per_cell_timeout = request
        .per_cell_timeout_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or(state.config.per_cell_timeout);
    let execution_timeout = request
        .execution_timeout_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or(state.config.execution_timeout);

    let record = ExecutionRecord::new(
        request.subject_brand,
        request.competitor_brands,
        request.providers,
        request.questions,
        concurrency_limit,
        per_cell_timeout,
        execution_timeout,
    );
    let response = StartDiagnosisResponse {
        execution_id: record.execution_id,
        total_cells: record.total_count,
        stage: record.stage,
        started_at: record.started_at,
    };

    save_execution(&state.db, &record).await?;

    tracing::info!(
        execution_id = %record.execution_id,
        subject_brand = %record.subject_brand,
        total_cells = record.total_count,
        concurrency_limit,
        "Diagnosis execution accepted"
    );

    spawn_execution(state, record, Vec::new());

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /diagnosis/status/{execution_id}
///
/// Pull transport: reads the same durable record the dispatcher writes
/// through to, so push subscribers and pollers never disagree.
pub async fn get_diagnosis_status(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<DiagnosisStatusResponse>> {
    let record = load_execution(&state.db, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution not found: {}", execution_id)))?;

    Ok(Json(DiagnosisStatusResponse {
        execution_id: record.execution_id,
        stage: record.stage,
        progress_percent: record.progress_percent,
        completed_count: record.completed_count,
        total_count: record.total_count,
        fail_reason: record.fail_reason,
        started_at: record.started_at,
        ended_at: record.ended_at,
        suggested_poll_interval_ms: suggested_poll_interval(record.stage, record.progress_percent),
    }))
}

/// GET /diagnosis/result/{execution_id}
///
/// 404 for unknown executions, 409 STILL_RUNNING before the terminal
/// stage, otherwise the aggregated result.
pub async fn get_diagnosis_result(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<DiagnosisResultResponse>> {
    let record = load_execution(&state.db, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution not found: {}", execution_id)))?;

    if !record.is_terminal() {
        return Err(ApiError::StillRunning(format!(
            "Execution {} is still in stage {}",
            execution_id, record.stage
        )));
    }

    Ok(Json(DiagnosisResultResponse {
        execution_id: record.execution_id,
        stage: record.stage,
        result: record.result,
        fail_reason: record.fail_reason,
        started_at: record.started_at,
        ended_at: record.ended_at,
    }))
}

/// POST /diagnosis/cancel/{execution_id}
///
/// Cooperative: signals the dispatch task and returns immediately; the
/// execution reaches its terminal stage through normal finalization.
pub async fn cancel_diagnosis(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelDiagnosisResponse>)> {
    let token = state
        .cancellation_tokens
        .read()
        .await
        .get(&execution_id)
        .cloned();

    match token {
        Some(token) => {
            token.cancel();
            tracing::info!(execution_id = %execution_id, "Cancellation requested");
            Ok((
                StatusCode::ACCEPTED,
                Json(CancelDiagnosisResponse {
                    execution_id,
                    status: "cancelling".to_string(),
                }),
            ))
        }
        None => {
            // No live task: either unknown or already finished
            let record = load_execution(&state.db, execution_id)
                .await?
                .ok_or_else(|| {
                    ApiError::NotFound(format!("Execution not found: {}", execution_id))
                })?;
            Err(ApiError::Conflict(format!(
                "Execution {} already reached stage {}",
                execution_id, record.stage
            )))
        }
    }
}

/// Polling hint: back off while the matrix is mostly unfinished,
/// tighten as completion approaches, stop once terminal
fn suggested_poll_interval(stage: DiagnosisStage, progress_percent: f64) -> Option<u64> {
    if stage.is_terminal() {
        return None;
    }
    Some(if progress_percent < 25.0 {
        5000
    } else if progress_percent < 75.0 {
        2000
    } else {
        1000
    })
}

/// Build diagnosis routes
pub fn diagnosis_routes() -> Router<AppState> {
    Router::new()
        .route("/diagnosis/start", post(start_diagnosis))
        .route("/diagnosis/status/:execution_id", get(get_diagnosis_status))
        .route("/diagnosis/result/:execution_id", get(get_diagnosis_result))
        .route("/diagnosis/cancel/:execution_id", post(cancel_diagnosis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_tracks_progress() {
        assert_eq!(
            suggested_poll_interval(DiagnosisStage::AiFetching, 0.0),
            Some(5000)
        );
        assert_eq!(
            suggested_poll_interval(DiagnosisStage::AiFetching, 50.0),
            Some(2000)
        );
        assert_eq!(
            suggested_poll_interval(DiagnosisStage::Analyzing, 90.0),
            Some(1000)
        );
        assert_eq!(suggested_poll_interval(DiagnosisStage::Completed, 100.0), None);
        assert_eq!(suggested_poll_interval(DiagnosisStage::Failed, 10.0), None);
    }
}
