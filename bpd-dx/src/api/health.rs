//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status ("ok" or "degraded")
    pub status: String,
    /// Module name ("bpd-dx")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Providers whose circuit is currently open
    pub open_circuits: Vec<String>,
    /// Ledger writes dropped since startup
    pub ledger_write_failures: u64,
}

/// GET /health
///
/// Reports "degraded" while any provider circuit is open; the service
/// still accepts work either way.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let open_circuits = state.breakers.open_providers();
    let status = if open_circuits.is_empty() {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "bpd-dx".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        open_circuits,
        ledger_write_failures: state.ledger.write_failure_count(),
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
