//! bpd-dx library interface for testing
//!
//! Exposes public APIs for integration testing

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bpd_common::events::EventBus;

use crate::config::DxConfig;
use crate::db::ledger::Ledger;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::executor::FaultTolerantExecutor;
use crate::services::gateway::ProviderGateway;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Resolved runtime configuration
    pub config: Arc<DxConfig>,
    /// Process-wide circuit breakers, shared across all executions
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Fault-tolerant provider call wrapper
    pub executor: Arc<FaultTolerantExecutor>,
    /// Best-effort crash-recovery log
    pub ledger: Arc<Ledger>,
    /// Cancellation tokens for active executions
    pub cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        config: Arc<DxConfig>,
        gateway: Arc<dyn ProviderGateway>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let executor = Arc::new(FaultTolerantExecutor::new(gateway, breakers.clone()));
        let ledger = Arc::new(Ledger::new(db.clone(), config.ledger_retention));

        Self {
            db,
            event_bus,
            config,
            breakers,
            executor,
            ledger,
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
        }
    }

    /// Whether a provider name is configured and therefore dispatchable
    pub fn known_provider(&self, name: &str) -> bool {
        self.config.providers.contains_key(name)
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::diagnosis_routes())
        .route("/diagnosis/events/:execution_id", get(api::event_stream))
        .merge(api::health_routes())
        .with_state(state)
}
