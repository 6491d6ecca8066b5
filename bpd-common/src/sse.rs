//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE stream construction for BPD services. The per-execution
//! stream is the push half of the progress distributor; the status
//! endpoint is the polling fallback, and both read the same persisted
//! execution state.

use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventBus;

/// Heartbeat / keep-alive interval for SSE connections
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Create a per-execution SSE event stream
///
/// Forwards every event for `execution_id` from the bus, interleaved
/// with heartbeat comments. The stream ends after the execution's
/// terminal event, closing the channel server-side.
pub fn execution_event_stream(
    bus: &EventBus,
    execution_id: Uuid,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(execution_id = %execution_id, "New SSE client connected to diagnosis events");

    let mut rx = bus.subscribe();

    let stream = async_stream::stream! {
        // Initial connected status so clients can detect a live channel,
        // plus the reconnect delay browsers should apply after a drop
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .retry(crate::backoff::BackoffPolicy::reconnect_default().delay(1))
            .data("connected"));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                result = rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            // Slow client; progress is recoverable via the
                            // status endpoint, so just note the gap.
                            warn!(execution_id = %execution_id, skipped, "SSE subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    if event.execution_id() != execution_id {
                        continue;
                    }

                    let terminal = event.is_terminal();
                    let event_type = event.event_type().to_string();

                    match serde_json::to_string(&event) {
                        Ok(event_json) => {
                            debug!(execution_id = %execution_id, event_type = %event_type, "SSE: Broadcasting event");
                            yield Ok(Event::default()
                                .event(event_type)
                                .data(event_json));
                        }
                        Err(e) => {
                            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }

                    if terminal {
                        info!(execution_id = %execution_id, "SSE: Terminal event delivered, closing stream");
                        break;
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
