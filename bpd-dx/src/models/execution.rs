//! Execution record: one end-to-end diagnosis run
//!
//! Persisted after every state transition so external status and
//! durable status never diverge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use bpd_common::types::{CellResult, DiagnosisStage, ErrorKind, FinalStatus};

/// Count of one error kind in a finished execution, used to summarize
/// degraded or failed runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorKindCount {
    pub kind: ErrorKind,
    pub count: usize,
}

/// Aggregated terminal result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub final_status: FinalStatus,
    /// Sorted by (question_idx, provider), independent of completion order
    pub cells: Vec<CellResult>,
    /// Dominant failure kinds, most frequent first
    pub error_summary: Vec<ErrorKindCount>,
}

/// Execution state (in-memory and persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub subject_brand: String,
    pub competitor_brands: Vec<String>,
    pub providers: Vec<String>,
    pub questions: Vec<String>,
    pub concurrency_limit: usize,
    pub per_cell_timeout_seconds: u64,
    pub execution_timeout_seconds: u64,
    pub stage: DiagnosisStage,
    pub progress_percent: f64,
    pub completed_count: usize,
    pub total_count: usize,
    pub result: Option<ExecutionResult>,
    pub fail_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subject_brand: String,
        competitor_brands: Vec<String>,
        providers: Vec<String>,
        questions: Vec<String>,
        concurrency_limit: usize,
        per_cell_timeout: Duration,
        execution_timeout: Duration,
    ) -> Self {
        let total_count = questions.len() * providers.len();
        Self {
            execution_id: Uuid::new_v4(),
            subject_brand,
            competitor_brands,
            providers,
            questions,
            concurrency_limit,
            per_cell_timeout_seconds: per_cell_timeout.as_secs(),
            execution_timeout_seconds: execution_timeout.as_secs(),
            stage: DiagnosisStage::Initializing,
            progress_percent: 0.0,
            completed_count: 0,
            total_count,
            result: None,
            fail_reason: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn per_cell_timeout(&self) -> Duration {
        Duration::from_secs(self.per_cell_timeout_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Render the prompt for one question.
    ///
    /// `{brand}` expands to the subject brand and `{competitors}` to a
    /// comma-separated competitor list; questions without placeholders
    /// pass through unchanged.
    pub fn render_prompt(&self, question: &str) -> String {
        question
            .replace("{brand}", &self.subject_brand)
            .replace("{competitors}", &self.competitor_brands.join(", "))
    }
}

/// Tally failure kinds across a result set, most frequent first.
/// Ties break on the kind's wire name for deterministic output.
pub fn summarize_error_kinds(cells: &[CellResult]) -> Vec<ErrorKindCount> {
    let mut counts: HashMap<ErrorKind, usize> = HashMap::new();
    for cell in cells {
        if let Some(kind) = cell.error_kind {
            *counts.entry(kind).or_insert(0) += 1;
        }
    }
    let mut summary: Vec<ErrorKindCount> = counts
        .into_iter()
        .map(|(kind, count)| ErrorKindCount { kind, count })
        .collect();
    summary.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.kind.to_string().cmp(&b.kind.to_string()))
    });
    summary
}
