//! Question/provider matrix dispatcher
//!
//! Drives one diagnosis execution end to end: builds the N×M cell
//! matrix, fans it out over a bounded worker pool, and funnels every
//! terminal cell back to a single owner task that is the only writer
//! of execution state. Workers never touch the machine, the database,
//! or the ledger; they send completed cells over a channel and move on.
//!
//! Wall-clock budget handling is soft: when the execution deadline
//! passes, in-flight and queued cells are failed rather than the task
//! being killed, so the execution always reaches a terminal stage
//! through the same finalization path.
//!
//! External cancellation is cooperative and gentler still: workers stop
//! pulling queued cells but let calls already in flight run to their
//! own completion, so answers paid for are never discarded.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bpd_common::events::{DxEvent, EventBus};
use bpd_common::types::{CellResult, CellStatus, DiagnosisStage, ErrorKind, FinalStatus};
use bpd_common::Result;
use sqlx::SqlitePool;

use crate::db::executions::save_execution;
use crate::db::ledger::{Ledger, LedgerSnapshot};
use crate::models::{
    summarize_error_kinds, Cell, DiagnosisEvent, DiagnosisMachine, ExecutionRecord,
    ExecutionResult,
};
use crate::services::executor::{CallOutcome, FaultTolerantExecutor};

/// Matrix key: (question_idx, provider)
type CellKey = (usize, String);

/// Orchestrates diagnosis executions against the provider matrix
pub struct DiagnosisDispatcher {
    db: SqlitePool,
    event_bus: EventBus,
    ledger: Arc<Ledger>,
    executor: Arc<FaultTolerantExecutor>,
}

impl DiagnosisDispatcher {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        ledger: Arc<Ledger>,
        executor: Arc<FaultTolerantExecutor>,
    ) -> Self {
        Self {
            db,
            event_bus,
            ledger,
            executor,
        }
    }

    /// Run a fresh execution to a terminal stage
    pub async fn run(
        &self,
        record: ExecutionRecord,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        self.drive(record, Vec::new(), cancel).await
    }

    /// Resume a recovered execution, re-dispatching only the cells the
    /// prior run never finished
    pub async fn resume(
        &self,
        record: ExecutionRecord,
        prior_results: Vec<CellResult>,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        self.drive(record, prior_results, cancel).await
    }

    async fn drive(
        &self,
        mut record: ExecutionRecord,
        prior_results: Vec<CellResult>,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        let execution_id = record.execution_id;
        let total = record.total_count;
        let fresh = record.stage == DiagnosisStage::Initializing;

        // Single owner of all mutable execution state from here on
        let mut completed: BTreeMap<CellKey, CellResult> = prior_results
            .into_iter()
            .map(|r| ((r.question_idx, r.provider.clone()), r))
            .collect();

        let mut machine = if fresh {
            DiagnosisMachine::new(execution_id, total)
        } else {
            DiagnosisMachine::resume(execution_id, record.stage, completed.len(), total)
        };

        if fresh {
            self.event_bus.emit_lossy(DxEvent::ExecutionStarted {
                execution_id,
                subject_brand: record.subject_brand.clone(),
                total_cells: total,
                timestamp: chrono::Utc::now(),
            });
            self.transition(&mut record, &mut machine, DiagnosisEvent::BeginFetching)
                .await?;
        } else {
            info!(
                execution_id = %execution_id,
                prior_completed = completed.len(),
                total,
                "Resuming execution from ledger snapshot"
            );
        }

        // Build the pending side of the matrix
        let mut pending: VecDeque<Cell> = VecDeque::new();
        for (question_idx, question) in record.questions.iter().enumerate() {
            for provider in &record.providers {
                if completed.contains_key(&(question_idx, provider.clone())) {
                    continue;
                }
                pending.push_back(Cell::new(
                    question_idx,
                    provider.clone(),
                    record.render_prompt(question),
                ));
            }
        }

        let mut timed_out = false;
        if !pending.is_empty() {
            timed_out = self
                .dispatch_cells(&mut record, &mut machine, &mut completed, pending, &cancel)
                .await;
        }

        self.finalize(record, machine, completed, timed_out, &cancel)
            .await
    }

    /// Fan pending cells out over the worker pool and absorb every
    /// terminal cell. Returns true if the wall-clock budget expired.
    async fn dispatch_cells(
        &self,
        record: &mut ExecutionRecord,
        machine: &mut DiagnosisMachine,
        completed: &mut BTreeMap<CellKey, CellResult>,
        pending: VecDeque<Cell>,
        cancel: &CancellationToken,
    ) -> bool {
        let worker_count = record.concurrency_limit.min(pending.len()).max(1);
        let per_cell_timeout = record.per_cell_timeout();
        let queue = Arc::new(Mutex::new(pending));
        // Deadline expiry fails in-flight cells through its own token;
        // external cancellation only stops workers from taking more.
        let timeout_token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Cell>(worker_count * 2);

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let queue = Arc::clone(&queue);
            let executor = Arc::clone(&self.executor);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let timeout_token = timeout_token.clone();

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() || timeout_token.is_cancelled() {
                        break;
                    }
                    let cell = queue.lock().await.pop_front();
                    let Some(mut cell) = cell else { break };
                    cell.mark_in_flight();

                    tokio::select! {
                        outcome = executor.execute(&cell.provider, &cell.prompt, per_cell_timeout) => {
                            match outcome {
                                CallOutcome::Success { payload, attempts } => {
                                    cell.complete_success(payload, attempts);
                                }
                                CallOutcome::Failure { kind, attempts } => {
                                    cell.complete_failure(kind, attempts);
                                }
                            }
                        }
                        _ = timeout_token.cancelled() => {
                            cell.complete_failure(ErrorKind::Timeout, cell.attempt_count);
                        }
                    }

                    if tx.send(cell).await.is_err() {
                        break;
                    }
                }
            });
        }
        // Workers hold the remaining senders; the channel closes when
        // the last one exits.
        drop(tx);

        let deadline = tokio::time::Instant::now() + record.execution_timeout();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        let mut timed_out = false;

        loop {
            tokio::select! {
                maybe_cell = rx.recv() => {
                    match maybe_cell {
                        Some(cell) => {
                            self.absorb_cell(record, machine, completed, cell).await;
                            if completed.len() == record.total_count {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut sleep, if !timed_out => {
                    timed_out = true;
                    warn!(
                        execution_id = %record.execution_id,
                        completed = completed.len(),
                        total = record.total_count,
                        "Execution wall-clock budget expired"
                    );
                    timeout_token.cancel();
                    // Keep receiving: workers flush their in-flight
                    // cells as failures before exiting
                }
            }
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}

        // Cells still queued never reached a worker
        let leftover_kind = if timed_out {
            ErrorKind::Timeout
        } else {
            ErrorKind::Unknown
        };
        let mut queue = queue.lock().await;
        while let Some(mut cell) = queue.pop_front() {
            cell.complete_failure(leftover_kind, 0);
            self.absorb_cell(record, machine, completed, cell).await;
        }

        timed_out
    }

    /// Absorb one terminal cell: ledger first, then machine, then the
    /// durable record, then the push transport.
    async fn absorb_cell(
        &self,
        record: &mut ExecutionRecord,
        machine: &mut DiagnosisMachine,
        completed: &mut BTreeMap<CellKey, CellResult>,
        cell: Cell,
    ) {
        let Some(result) = cell.to_result() else {
            warn!(
                execution_id = %record.execution_id,
                question_idx = cell.question_idx,
                provider = %cell.provider,
                "Worker returned a non-terminal cell, dropping"
            );
            return;
        };

        let key = (result.question_idx, result.provider.clone());
        if completed.contains_key(&key) {
            // Benign race: first completion wins
            debug!(
                execution_id = %record.execution_id,
                question_idx = result.question_idx,
                provider = %result.provider,
                "Duplicate cell completion ignored"
            );
            return;
        }
        let status = result.status;
        let error_kind = result.error_kind;
        let question_idx = result.question_idx;
        let provider = result.provider.clone();
        completed.insert(key, result);

        self.ledger
            .write(&LedgerSnapshot {
                execution_id: record.execution_id,
                stage: machine.stage(),
                completed_count: completed.len(),
                total_count: record.total_count,
                cells: completed.values().cloned().collect(),
            })
            .await;

        if let Err(rejected) = machine.apply(DiagnosisEvent::CellCompleted {
            completed_count: completed.len(),
        }) {
            warn!(execution_id = %record.execution_id, %rejected, "Stale completion signal");
        }
        record.stage = machine.stage();
        record.completed_count = machine.completed_count();
        record.progress_percent = machine.progress_percent();

        if let Err(e) = save_execution(&self.db, record).await {
            // The pull transport lags until the next write succeeds
            warn!(execution_id = %record.execution_id, error = %e, "Progress persistence failed");
        }

        self.event_bus.emit_lossy(DxEvent::CellCompleted {
            execution_id: record.execution_id,
            question_idx,
            provider,
            status,
            error_kind,
            completed_count: machine.completed_count(),
            total_count: record.total_count,
            progress_percent: machine.progress_percent(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Drive the machine to its terminal stage, persist the aggregate
    /// result, and emit the terminal event.
    async fn finalize(
        &self,
        mut record: ExecutionRecord,
        mut machine: DiagnosisMachine,
        completed: BTreeMap<CellKey, CellResult>,
        timed_out: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionRecord> {
        let cells: Vec<CellResult> = completed.into_values().collect();
        let success_count = cells.iter().filter(|c| c.status == CellStatus::Success).count();

        let final_status = if timed_out && success_count == 0 {
            FinalStatus::Timeout
        } else if success_count == record.total_count {
            FinalStatus::Completed
        } else if success_count >= 1 {
            FinalStatus::PartialSuccess
        } else {
            FinalStatus::Failed
        };

        match final_status {
            FinalStatus::Completed | FinalStatus::PartialSuccess => {
                self.transition(&mut record, &mut machine, DiagnosisEvent::AllComplete)
                    .await?;
                self.transition(
                    &mut record,
                    &mut machine,
                    DiagnosisEvent::Finish {
                        status: final_status,
                    },
                )
                .await?;
            }
            FinalStatus::Timeout => {
                self.transition(&mut record, &mut machine, DiagnosisEvent::TimeoutExceeded)
                    .await?;
            }
            FinalStatus::Failed => {
                let reason = if cancel.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    "all_cells_failed".to_string()
                };
                self.transition(&mut record, &mut machine, DiagnosisEvent::Fail { reason })
                    .await?;
            }
        }

        record.result = Some(ExecutionResult {
            final_status,
            error_summary: summarize_error_kinds(&cells),
            cells,
        });
        record.fail_reason = machine.fail_reason().map(String::from);
        // A cancelled run that still salvaged successes ends
        // partial_success; the record keeps a note of the cancellation
        if record.fail_reason.is_none()
            && cancel.is_cancelled()
            && final_status == FinalStatus::PartialSuccess
        {
            record.fail_reason = Some("cancelled".to_string());
        }
        record.ended_at = Some(chrono::Utc::now());
        save_execution(&self.db, &record).await?;

        // Terminal executions no longer need crash recovery
        self.ledger.remove(record.execution_id).await;

        let duration_seconds = record
            .ended_at
            .map(|end| (end - record.started_at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let terminal_event = match final_status {
            FinalStatus::Completed | FinalStatus::PartialSuccess => DxEvent::ExecutionCompleted {
                execution_id: record.execution_id,
                final_status,
                completed_count: record.completed_count,
                total_count: record.total_count,
                duration_seconds,
                timestamp: chrono::Utc::now(),
            },
            FinalStatus::Failed => DxEvent::ExecutionFailed {
                execution_id: record.execution_id,
                reason: record.fail_reason.clone().unwrap_or_default(),
                timestamp: chrono::Utc::now(),
            },
            FinalStatus::Timeout => DxEvent::ExecutionTimedOut {
                execution_id: record.execution_id,
                completed_count: record.completed_count,
                total_count: record.total_count,
                timestamp: chrono::Utc::now(),
            },
        };
        self.event_bus.emit_lossy(terminal_event);

        info!(
            execution_id = %record.execution_id,
            status = %final_status.stage(),
            completed = record.completed_count,
            total = record.total_count,
            duration_seconds,
            "Execution finished"
        );
        Ok(record)
    }

    /// Apply one machine event, persist the record, and broadcast the
    /// stage change
    async fn transition(
        &self,
        record: &mut ExecutionRecord,
        machine: &mut DiagnosisMachine,
        event: DiagnosisEvent,
    ) -> Result<()> {
        let transition = match machine.apply(event) {
            Ok(t) => t,
            Err(rejected) => {
                warn!(execution_id = %record.execution_id, %rejected, "Transition rejected");
                return Ok(());
            }
        };

        record.stage = machine.stage();
        record.completed_count = machine.completed_count();
        record.progress_percent = machine.progress_percent();
        save_execution(&self.db, record).await?;

        self.event_bus.emit_lossy(DxEvent::StageChanged {
            execution_id: record.execution_id,
            old_stage: transition.old_stage,
            new_stage: transition.new_stage,
            timestamp: transition.transitioned_at,
        });
        debug!(
            execution_id = %record.execution_id,
            old_stage = %transition.old_stage,
            new_stage = %transition.new_stage,
            "Stage transition"
        );
        Ok(())
    }
}
