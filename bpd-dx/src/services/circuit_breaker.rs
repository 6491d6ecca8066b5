//! Per-provider circuit breakers
//!
//! One circuit per provider name for the process lifetime, shared by
//! every concurrent execution using that provider. A provider-wide
//! outage therefore trips the breaker for all executions at once.
//!
//! Transitions:
//! - closed → open at `FAILURE_THRESHOLD` consecutive failures
//! - open → half_open after the recovery timeout of the kind that
//!   tripped it (`invalid_credentials` never auto-recovers)
//! - half_open → closed on probe success (counter reset)
//! - half_open → open on probe failure
//!
//! While open, calls fail immediately as `circuit_open` with no network
//! I/O. Exactly one probe is admitted while half-open.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use bpd_common::types::ErrorKind;

/// Consecutive failures that open a closed circuit
pub const FAILURE_THRESHOLD: u32 = 5;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of consulting the breaker before a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Circuit closed, call freely
    Allowed,
    /// Circuit half-open and this caller holds the single probe slot
    Probe,
    /// Circuit open, fail fast as circuit_open
    Rejected,
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Error kind that tripped the circuit; selects the recovery window
    tripped_by: Option<ErrorKind>,
    probe_in_flight: bool,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            tripped_by: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, kind: ErrorKind) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.tripped_by = Some(kind);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.tripped_by = None;
        self.probe_in_flight = false;
    }
}

/// Registry of per-provider circuits, keyed by provider name.
///
/// The outer mutex guards only the map; each entry has its own lock so
/// providers never contend with each other. Entry locks are never held
/// across an await point.
pub struct CircuitBreakerRegistry {
    entries: Mutex<HashMap<String, Arc<Mutex<CircuitEntry>>>>,
    failure_threshold: u32,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_threshold(FAILURE_THRESHOLD)
    }

    pub fn with_threshold(failure_threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
        }
    }

    fn entry(&self, provider: &str) -> Arc<Mutex<CircuitEntry>> {
        let mut entries = self.entries.lock().expect("circuit registry poisoned");
        entries
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitEntry::new())))
            .clone()
    }

    /// Consult the breaker before a call, transitioning open → half_open
    /// when the recovery window has elapsed.
    pub fn check(&self, provider: &str) -> CallPermit {
        let entry = self.entry(provider);
        let mut entry = entry.lock().expect("circuit entry poisoned");

        match entry.state {
            CircuitState::Closed => CallPermit::Allowed,
            CircuitState::Open => {
                let recovery = entry.tripped_by.and_then(ErrorKind::recovery_timeout);
                match (entry.opened_at, recovery) {
                    (Some(opened_at), Some(window)) if opened_at.elapsed() >= window => {
                        entry.state = CircuitState::HalfOpen;
                        entry.probe_in_flight = true;
                        tracing::info!(provider, "Circuit half-open, admitting probe");
                        CallPermit::Probe
                    }
                    _ => CallPermit::Rejected,
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    CallPermit::Rejected
                } else {
                    entry.probe_in_flight = true;
                    CallPermit::Probe
                }
            }
        }
    }

    /// A call succeeded: close the circuit and reset the streak
    pub fn record_success(&self, provider: &str) {
        let entry = self.entry(provider);
        let mut entry = entry.lock().expect("circuit entry poisoned");
        if entry.state != CircuitState::Closed {
            tracing::info!(provider, "Circuit closed after successful call");
        }
        entry.close();
    }

    /// A call terminally failed with the given classification
    pub fn record_failure(&self, provider: &str, kind: ErrorKind) {
        let entry = self.entry(provider);
        let mut entry = entry.lock().expect("circuit entry poisoned");
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.probe_in_flight = false;

        match entry.state {
            CircuitState::HalfOpen => {
                tracing::warn!(provider, kind = %kind, "Probe failed, circuit re-opened");
                entry.open(kind);
            }
            CircuitState::Closed if entry.consecutive_failures >= self.failure_threshold => {
                tracing::warn!(
                    provider,
                    kind = %kind,
                    failures = entry.consecutive_failures,
                    "Failure threshold reached, circuit opened"
                );
                entry.open(kind);
            }
            _ => {}
        }
    }

    /// Operator action: force a circuit closed (e.g. after rotating a
    /// credential that tripped `invalid_credentials`)
    pub fn reset(&self, provider: &str) {
        let entry = self.entry(provider);
        entry.lock().expect("circuit entry poisoned").close();
        tracing::info!(provider, "Circuit reset by operator");
    }

    /// Current state, if the provider has ever been called
    pub fn state_of(&self, provider: &str) -> Option<CircuitState> {
        let entries = self.entries.lock().expect("circuit registry poisoned");
        entries
            .get(provider)
            .map(|e| e.lock().expect("circuit entry poisoned").state)
    }

    /// Providers whose circuits are currently open or half-open
    pub fn open_providers(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("circuit registry poisoned");
        let mut open: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                e.lock().expect("circuit entry poisoned").state != CircuitState::Closed
            })
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }
}
