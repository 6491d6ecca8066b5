//! Crash recovery at service startup
//!
//! Scans the executions table for runs a previous process left in a
//! non-terminal stage. Runs with a ledger snapshot younger than the
//! retention window resume with only their unfinished cells
//! re-enqueued; runs without one (or whose snapshot has aged out)
//! cannot be trusted and are failed with reason `lost_after_restart`.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bpd_common::events::DxEvent;
use bpd_common::types::{CellResult, DiagnosisStage};
use bpd_common::Result;

use crate::db::executions::{load_incomplete_executions, save_execution};
use crate::models::ExecutionRecord;
use crate::services::dispatcher::DiagnosisDispatcher;
use crate::AppState;

/// Resume or fail every execution the previous process left behind.
/// Returns the number of executions resumed.
pub async fn recover_on_startup(state: &AppState) -> Result<usize> {
    let incomplete = load_incomplete_executions(&state.db).await?;
    if incomplete.is_empty() {
        return Ok(0);
    }
    info!(count = incomplete.len(), "Found incomplete executions from previous run");

    let mut resumed = 0;
    for record in incomplete {
        let snapshot = match state.ledger.recover(record.execution_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    execution_id = %record.execution_id,
                    error = %e,
                    "Unreadable ledger snapshot, treating execution as lost"
                );
                None
            }
        };

        match snapshot {
            Some(snapshot) => {
                info!(
                    execution_id = %record.execution_id,
                    completed = snapshot.cells.len(),
                    total = record.total_count,
                    "Resuming execution"
                );
                spawn_execution(state.clone(), record, snapshot.cells);
                resumed += 1;
            }
            None => {
                mark_lost(state, record).await;
            }
        }
    }
    Ok(resumed)
}

/// Launch an execution in the background, tracking its cancellation
/// token in app state for the cancel endpoint
pub fn spawn_execution(state: AppState, record: ExecutionRecord, prior_results: Vec<CellResult>) {
    tokio::spawn(async move {
        let execution_id = record.execution_id;
        let cancel = CancellationToken::new();
        state
            .cancellation_tokens
            .write()
            .await
            .insert(execution_id, cancel.clone());

        let dispatcher = DiagnosisDispatcher::new(
            state.db.clone(),
            state.event_bus.clone(),
            state.ledger.clone(),
            state.executor.clone(),
        );
        let outcome = if prior_results.is_empty() {
            dispatcher.run(record, cancel).await
        } else {
            dispatcher.resume(record, prior_results, cancel).await
        };
        if let Err(e) = outcome {
            error!(execution_id = %execution_id, error = %e, "Execution task failed");
        }

        state.cancellation_tokens.write().await.remove(&execution_id);
    });
}

/// Fail an execution whose in-flight state did not survive the restart
async fn mark_lost(state: &AppState, mut record: ExecutionRecord) {
    warn!(
        execution_id = %record.execution_id,
        stage = %record.stage,
        "No ledger snapshot, marking execution lost"
    );

    record.stage = DiagnosisStage::Failed;
    record.fail_reason = Some("lost_after_restart".to_string());
    record.ended_at = Some(chrono::Utc::now());
    if let Err(e) = save_execution(&state.db, &record).await {
        error!(execution_id = %record.execution_id, error = %e, "Failed to persist lost execution");
        return;
    }

    state.ledger.remove(record.execution_id).await;
    state.event_bus.emit_lossy(DxEvent::ExecutionFailed {
        execution_id: record.execution_id,
        reason: "lost_after_restart".to_string(),
        timestamp: chrono::Utc::now(),
    });
}
