//! Event types for the BPD event system
//!
//! Every state transition and cell completion of a diagnosis execution
//! is broadcast as a [`DxEvent`] over the [`EventBus`]; the SSE layer
//! forwards them to subscribed clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{CellStatus, DiagnosisStage, ErrorKind, FinalStatus};

/// BPD event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DxEvent {
    /// Execution accepted and matrix dispatch beginning
    ExecutionStarted {
        execution_id: Uuid,
        subject_brand: String,
        total_cells: usize,
        timestamp: DateTime<Utc>,
    },

    /// Execution stage transition
    StageChanged {
        execution_id: Uuid,
        old_stage: DiagnosisStage,
        new_stage: DiagnosisStage,
        timestamp: DateTime<Utc>,
    },

    /// One (question, provider) cell reached a terminal status
    CellCompleted {
        execution_id: Uuid,
        question_idx: usize,
        provider: String,
        status: CellStatus,
        error_kind: Option<ErrorKind>,
        completed_count: usize,
        total_count: usize,
        progress_percent: f64,
        timestamp: DateTime<Utc>,
    },

    /// Execution finished; the aggregated result is available
    ExecutionCompleted {
        execution_id: Uuid,
        final_status: FinalStatus,
        completed_count: usize,
        total_count: usize,
        duration_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    /// Execution failed before producing any successful cell
    ExecutionFailed {
        execution_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Execution wall-clock budget expired with zero successes
    ExecutionTimedOut {
        execution_id: Uuid,
        completed_count: usize,
        total_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DxEvent {
    /// Get event type as string for SSE event names and filtering
    pub fn event_type(&self) -> &str {
        match self {
            DxEvent::ExecutionStarted { .. } => "ExecutionStarted",
            DxEvent::StageChanged { .. } => "StageChanged",
            DxEvent::CellCompleted { .. } => "CellCompleted",
            DxEvent::ExecutionCompleted { .. } => "ExecutionCompleted",
            DxEvent::ExecutionFailed { .. } => "ExecutionFailed",
            DxEvent::ExecutionTimedOut { .. } => "ExecutionTimedOut",
        }
    }

    /// The execution this event belongs to
    pub fn execution_id(&self) -> Uuid {
        match self {
            DxEvent::ExecutionStarted { execution_id, .. }
            | DxEvent::StageChanged { execution_id, .. }
            | DxEvent::CellCompleted { execution_id, .. }
            | DxEvent::ExecutionCompleted { execution_id, .. }
            | DxEvent::ExecutionFailed { execution_id, .. }
            | DxEvent::ExecutionTimedOut { execution_id, .. } => *execution_id,
        }
    }

    /// Terminal events close per-execution subscriptions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DxEvent::ExecutionCompleted { .. }
                | DxEvent::ExecutionFailed { .. }
                | DxEvent::ExecutionTimedOut { .. }
        )
    }
}

/// Event bus for broadcasting diagnosis events across the service
///
/// Wraps `tokio::sync::broadcast`, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DxEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<DxEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: DxEvent) -> Result<usize, broadcast::error::SendError<DxEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Progress events are fire-and-forget: the pull transport reads the
    /// same persisted state, so a missed push costs nothing.
    pub fn emit_lossy(&self, event: DxEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(id: Uuid) -> DxEvent {
        DxEvent::CellCompleted {
            execution_id: id,
            question_idx: 0,
            provider: "openai".to_string(),
            status: CellStatus::Success,
            error_kind: None,
            completed_count: 1,
            total_count: 6,
            progress_percent: 16.7,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_broadcast() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let id = Uuid::new_v4();
        bus.emit(sample_event(id)).unwrap();

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.execution_id(), id);
        assert_eq!(e2.event_type(), "CellCompleted");
    }

    #[tokio::test]
    async fn test_emit_lossy_without_subscribers() {
        let bus = EventBus::new(16);
        // No subscribers: must not panic or error
        bus.emit_lossy(sample_event(Uuid::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_terminal_event_classification() {
        let id = Uuid::new_v4();
        assert!(!sample_event(id).is_terminal());

        let done = DxEvent::ExecutionCompleted {
            execution_id: id,
            final_status: FinalStatus::PartialSuccess,
            completed_count: 8,
            total_count: 8,
            duration_seconds: 12,
            timestamp: Utc::now(),
        };
        assert!(done.is_terminal());

        let timed_out = DxEvent::ExecutionTimedOut {
            execution_id: id,
            completed_count: 3,
            total_count: 8,
            timestamp: Utc::now(),
        };
        assert!(timed_out.is_terminal());
    }

    #[test]
    fn test_event_serialization_tagged() {
        let event = DxEvent::StageChanged {
            execution_id: Uuid::nil(),
            old_stage: DiagnosisStage::Initializing,
            new_stage: DiagnosisStage::AiFetching,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"StageChanged\""));
        assert!(json.contains("\"new_stage\":\"ai_fetching\""));

        let back: DxEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "StageChanged");
    }
}
