//! Shared diagnosis domain types
//!
//! Carried by events, ledger snapshots, and the HTTP API, so they live
//! here rather than in the service crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Diagnosis execution stage
///
/// Progression: INITIALIZING → AI_FETCHING → ANALYZING → one of the
/// four terminal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStage {
    /// Execution accepted, matrix not yet dispatched
    Initializing,
    /// Cells in flight against the providers
    AiFetching,
    /// All cells terminal, assembling the final result
    Analyzing,
    /// Every cell succeeded
    Completed,
    /// At least one cell succeeded
    PartialSuccess,
    /// Zero cells succeeded
    Failed,
    /// Execution wall-clock budget expired before any success
    Timeout,
}

impl DiagnosisStage {
    /// Terminal stages never transition again and freeze progress
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DiagnosisStage::Completed
                | DiagnosisStage::PartialSuccess
                | DiagnosisStage::Failed
                | DiagnosisStage::Timeout
        )
    }
}

impl std::fmt::Display for DiagnosisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiagnosisStage::Initializing => "initializing",
            DiagnosisStage::AiFetching => "ai_fetching",
            DiagnosisStage::Analyzing => "analyzing",
            DiagnosisStage::Completed => "completed",
            DiagnosisStage::PartialSuccess => "partial_success",
            DiagnosisStage::Failed => "failed",
            DiagnosisStage::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a finished execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    PartialSuccess,
    Failed,
    Timeout,
}

impl FinalStatus {
    /// The terminal stage this final status maps onto
    pub fn stage(self) -> DiagnosisStage {
        match self {
            FinalStatus::Completed => DiagnosisStage::Completed,
            FinalStatus::PartialSuccess => DiagnosisStage::PartialSuccess,
            FinalStatus::Failed => DiagnosisStage::Failed,
            FinalStatus::Timeout => DiagnosisStage::Timeout,
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.stage().fmt(f)
    }
}

/// Provider call failure taxonomy
///
/// Every provider failure is classified into exactly one of these kinds
/// before it leaves the fault-tolerant executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCredentials,
    QuotaExhausted,
    RateLimited,
    ContentSafetyViolation,
    ServiceUnavailable,
    ServerError,
    CircuitOpen,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Whether the executor may retry a call that failed this way.
    ///
    /// Credential and content-safety failures repeat deterministically,
    /// and an open circuit already is the retry decision.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::InvalidCredentials
                | ErrorKind::ContentSafetyViolation
                | ErrorKind::CircuitOpen
        )
    }

    /// Circuit-breaker recovery window for a circuit tripped by this
    /// kind. `None` means the circuit never auto-recovers (operator
    /// reset only).
    pub fn recovery_timeout(self) -> Option<Duration> {
        match self {
            ErrorKind::InvalidCredentials => None,
            ErrorKind::QuotaExhausted => Some(Duration::from_secs(300)),
            ErrorKind::RateLimited => Some(Duration::from_secs(60)),
            ErrorKind::ServerError => Some(Duration::from_secs(120)),
            ErrorKind::ServiceUnavailable => Some(Duration::from_secs(60)),
            ErrorKind::ContentSafetyViolation => Some(Duration::from_secs(300)),
            ErrorKind::Timeout => Some(Duration::from_secs(30)),
            // An open circuit is never itself reported back to the breaker
            ErrorKind::CircuitOpen => Some(Duration::from_secs(60)),
            ErrorKind::Unknown => Some(Duration::from_secs(60)),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ContentSafetyViolation => "content_safety_violation",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ServerError => "server_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Status of one (question, provider) cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Pending,
    InFlight,
    Success,
    Failed,
}

impl CellStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CellStatus::Success | CellStatus::Failed)
    }
}

/// Terminal outcome of one cell, as persisted in ledger snapshots and
/// returned in the final result list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResult {
    pub question_idx: usize,
    pub provider: String,
    pub status: CellStatus,
    /// Provider response text (success only)
    pub payload: Option<String>,
    /// Failure classification (failed only)
    pub error_kind: Option<ErrorKind>,
    /// Provider call attempts consumed, including retries
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl CellResult {
    pub fn is_success(&self) -> bool {
        self.status == CellStatus::Success
    }

    /// Stable result ordering: (question_idx, provider), independent of
    /// completion order
    pub fn sort_key(&self) -> (usize, &str) {
        (self.question_idx, self.provider.as_str())
    }
}
