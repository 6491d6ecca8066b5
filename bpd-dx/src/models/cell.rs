//! One (question, provider) unit of diagnostic work
//!
//! A cell's status only ever advances pending → in_flight →
//! {success, failed}; a second completion attempt is a no-op.

use chrono::{DateTime, Utc};

use bpd_common::types::{CellResult, CellStatus, ErrorKind};

/// In-flight dispatcher-owned cell
#[derive(Debug, Clone)]
pub struct Cell {
    pub question_idx: usize,
    pub provider: String,
    pub prompt: String,
    pub status: CellStatus,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Cell {
    pub fn new(question_idx: usize, provider: String, prompt: String) -> Self {
        Self {
            question_idx,
            provider,
            prompt,
            status: CellStatus::Pending,
            attempt_count: 0,
            last_error_kind: None,
            payload: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
        }
    }

    /// Unique matrix key
    pub fn key(&self) -> (usize, &str) {
        (self.question_idx, self.provider.as_str())
    }

    /// Advance pending → in_flight. Returns false from any other status.
    pub fn mark_in_flight(&mut self) -> bool {
        if self.status != CellStatus::Pending {
            return false;
        }
        self.status = CellStatus::InFlight;
        self.dispatched_at = Some(Utc::now());
        true
    }

    /// Terminal success. Duplicate completion signals are no-ops.
    pub fn complete_success(&mut self, payload: String, attempts: u32) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = CellStatus::Success;
        self.payload = Some(payload);
        self.attempt_count = attempts;
        self.last_error_kind = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Terminal failure. Duplicate completion signals are no-ops.
    pub fn complete_failure(&mut self, kind: ErrorKind, attempts: u32) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = CellStatus::Failed;
        self.last_error_kind = Some(kind);
        self.attempt_count = attempts;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Persistable result once terminal, None otherwise
    pub fn to_result(&self) -> Option<CellResult> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(CellResult {
            question_idx: self.question_idx,
            provider: self.provider.clone(),
            status: self.status,
            payload: self.payload.clone(),
            error_kind: self.last_error_kind,
            attempts: self.attempt_count,
            completed_at: self.completed_at.unwrap_or_else(Utc::now),
        })
    }
}
