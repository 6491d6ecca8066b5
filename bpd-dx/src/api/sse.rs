//! Per-execution SSE endpoint
//!
//! Push half of the progress distributor. Clients that cannot hold an
//! SSE connection poll GET /diagnosis/status instead; both surfaces
//! read from the same execution state.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use uuid::Uuid;

use crate::AppState;

/// GET /diagnosis/events/{execution_id}
pub async fn event_stream(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> impl IntoResponse {
    bpd_common::sse::execution_event_stream(&state.event_bus, execution_id)
}
