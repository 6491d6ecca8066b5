//! Diagnosis execution state machine
//!
//! Stage progression:
//! INITIALIZING → AI_FETCHING → ANALYZING → {COMPLETED | PARTIAL_SUCCESS | FAILED | TIMEOUT}
//!
//! Transitions are named events validated against a fixed adjacency
//! table. Illegal transitions (e.g. a stale cell-completion signal
//! arriving after the execution went terminal, which happens routinely
//! under concurrency) are rejected as no-ops so duplicate or
//! out-of-order signals can never corrupt externally visible progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use bpd_common::types::{DiagnosisStage, FinalStatus};

/// Named state-machine event
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosisEvent {
    /// Matrix built, workers starting
    BeginFetching,
    /// A cell reached a terminal status; carries the new completed count
    CellCompleted { completed_count: usize },
    /// Every cell is terminal; result assembly begins
    AllComplete,
    /// Result assembled with at least one success
    Finish { status: FinalStatus },
    /// Execution failed (zero successes, dispatch error, or lost state)
    Fail { reason: String },
    /// Soft wall-clock budget expired with zero successes
    TimeoutExceeded,
}

impl DiagnosisEvent {
    fn name(&self) -> &'static str {
        match self {
            DiagnosisEvent::BeginFetching => "begin_fetching",
            DiagnosisEvent::CellCompleted { .. } => "cell_completed",
            DiagnosisEvent::AllComplete => "all_complete",
            DiagnosisEvent::Finish { .. } => "finish",
            DiagnosisEvent::Fail { .. } => "fail",
            DiagnosisEvent::TimeoutExceeded => "timeout_exceeded",
        }
    }
}

/// Applied state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub execution_id: Uuid,
    pub old_stage: DiagnosisStage,
    pub new_stage: DiagnosisStage,
    pub transitioned_at: DateTime<Utc>,
}

/// Rejected transition; callers log this as a warning and move on
#[derive(Debug, Error)]
#[error("illegal transition: event '{event}' in stage '{stage}' for execution {execution_id}")]
pub struct TransitionRejected {
    pub execution_id: Uuid,
    pub stage: DiagnosisStage,
    pub event: &'static str,
}

/// Single source of truth for one execution's stage and progress
#[derive(Debug, Clone)]
pub struct DiagnosisMachine {
    execution_id: Uuid,
    stage: DiagnosisStage,
    progress_percent: f64,
    completed_count: usize,
    total_count: usize,
    fail_reason: Option<String>,
}

impl DiagnosisMachine {
    /// Fresh machine at progress 0
    pub fn new(execution_id: Uuid, total_count: usize) -> Self {
        Self {
            execution_id,
            stage: DiagnosisStage::Initializing,
            progress_percent: 0.0,
            completed_count: 0,
            total_count,
            fail_reason: None,
        }
    }

    /// Rehydrate a machine from persisted state (crash recovery)
    pub fn resume(
        execution_id: Uuid,
        stage: DiagnosisStage,
        completed_count: usize,
        total_count: usize,
    ) -> Self {
        let mut machine = Self::new(execution_id, total_count);
        machine.stage = stage;
        machine.completed_count = completed_count.min(total_count);
        machine.progress_percent = percent(machine.completed_count, total_count);
        machine
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn stage(&self) -> DiagnosisStage {
        self.stage
    }

    pub fn progress_percent(&self) -> f64 {
        self.progress_percent
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    /// Apply a named event against the adjacency table.
    ///
    /// Progress is monotonically non-decreasing and frozen once the
    /// machine is terminal.
    pub fn apply(&mut self, event: DiagnosisEvent) -> Result<StageTransition, TransitionRejected> {
        let old_stage = self.stage;

        let new_stage = match (old_stage, &event) {
            (DiagnosisStage::Initializing, DiagnosisEvent::BeginFetching) => {
                DiagnosisStage::AiFetching
            }
            (DiagnosisStage::AiFetching, DiagnosisEvent::CellCompleted { completed_count }) => {
                // Stale signals carrying an older count clamp upward,
                // keeping completed_count monotonic.
                self.completed_count =
                    self.completed_count.max((*completed_count).min(self.total_count));
                self.progress_percent = self
                    .progress_percent
                    .max(percent(self.completed_count, self.total_count));
                DiagnosisStage::AiFetching
            }
            (DiagnosisStage::AiFetching, DiagnosisEvent::AllComplete) => DiagnosisStage::Analyzing,
            (DiagnosisStage::Analyzing, DiagnosisEvent::Finish { status }) => match status {
                FinalStatus::Completed | FinalStatus::PartialSuccess => status.stage(),
                // Zero-success and timeout outcomes use their own events
                FinalStatus::Failed | FinalStatus::Timeout => {
                    return Err(self.reject(&event));
                }
            },
            (
                DiagnosisStage::Initializing
                | DiagnosisStage::AiFetching
                | DiagnosisStage::Analyzing,
                DiagnosisEvent::Fail { reason },
            ) => {
                self.fail_reason = Some(reason.clone());
                DiagnosisStage::Failed
            }
            (
                DiagnosisStage::Initializing
                | DiagnosisStage::AiFetching
                | DiagnosisStage::Analyzing,
                DiagnosisEvent::TimeoutExceeded,
            ) => DiagnosisStage::Timeout,
            _ => return Err(self.reject(&event)),
        };

        self.stage = new_stage;

        Ok(StageTransition {
            execution_id: self.execution_id,
            old_stage,
            new_stage,
            transitioned_at: Utc::now(),
        })
    }

    fn reject(&self, event: &DiagnosisEvent) -> TransitionRejected {
        TransitionRejected {
            execution_id: self.execution_id,
            stage: self.stage,
            event: event.name(),
        }
    }
}

fn percent(completed: usize, total: usize) -> f64 {
    if total > 0 {
        (completed as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
