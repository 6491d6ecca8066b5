//! Test helper utilities
//!
//! Shared scripted gateway and state construction for bpd-dx
//! integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bpd_common::config::ProviderConfig;
use bpd_common::events::EventBus;

use bpd_dx::config::DxConfig;
use bpd_dx::models::ExecutionRecord;
use bpd_dx::services::dispatcher::DiagnosisDispatcher;
use bpd_dx::services::executor::FaultTolerantExecutor;
use bpd_dx::services::gateway::{GatewayError, ProviderGateway};
use bpd_dx::AppState;

/// Per-provider scripted behavior
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Script {
    /// Every call succeeds with this payload
    Ok(String),
    /// Every call fails with this status and message
    Fail { status: Option<u16>, message: String },
    /// First `failures` calls fail, then calls succeed
    FailThenOk {
        failures: usize,
        status: Option<u16>,
        message: String,
        payload: String,
    },
    /// Calls take `delay` before succeeding with this payload
    SlowOk { delay: Duration, payload: String },
    /// Calls never return (until cancelled or timed out)
    Hang,
}

/// Gateway that replays a script per provider and counts calls
pub struct MockGateway {
    scripts: HashMap<String, Script>,
    calls: Mutex<HashMap<String, usize>>,
}

#[allow(dead_code)]
impl MockGateway {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(mut self, provider: &str, script: Script) -> Self {
        self.scripts.insert(provider.to_string(), script);
        self
    }

    pub fn call_count(&self, provider: &str) -> usize {
        *self.calls.lock().unwrap().get(provider).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ProviderGateway for MockGateway {
    async fn call(
        &self,
        provider: &str,
        _prompt: &str,
        _timeout: Duration,
    ) -> Result<String, GatewayError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(provider.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        match self.scripts.get(provider) {
            None => Err(GatewayError::new(None, "unscripted provider")),
            Some(Script::Ok(payload)) => Ok(payload.clone()),
            Some(Script::Fail { status, message }) => {
                Err(GatewayError::new(*status, message.clone()))
            }
            Some(Script::FailThenOk {
                failures,
                status,
                message,
                payload,
            }) => {
                if n <= *failures {
                    Err(GatewayError::new(*status, message.clone()))
                } else {
                    Ok(payload.clone())
                }
            }
            Some(Script::SlowOk { delay, payload }) => {
                tokio::time::sleep(*delay).await;
                Ok(payload.clone())
            }
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::new(None, "hung call returned"))
            }
        }
    }
}

/// App state over an in-memory database with the given providers
/// configured and near-zero retry backoff
pub async fn test_state(gateway: Arc<MockGateway>, providers: &[&str]) -> AppState {
    // Single connection: each pooled connection to sqlite::memory:
    // sees its own empty database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    bpd_dx::db::init_tables(&pool)
        .await
        .expect("Failed to initialize schema");

    let mut provider_map = HashMap::new();
    for name in providers {
        provider_map.insert(
            name.to_string(),
            ProviderConfig {
                base_url: format!("http://127.0.0.1:1/{}", name),
                api_key: Some("test-key".to_string()),
                model: None,
            },
        );
    }
    let config = Arc::new(DxConfig {
        providers: provider_map,
        per_cell_timeout: Duration::from_secs(60),
        execution_timeout: Duration::from_secs(30),
        ..DxConfig::default()
    });

    let mut state = AppState::new(pool, EventBus::new(100), config, gateway.clone());
    // Near-zero backoff keeps retry scenarios fast
    state.executor = Arc::new(
        FaultTolerantExecutor::new(gateway, state.breakers.clone()).with_backoff(
            bpd_common::backoff::BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                0.0,
            ),
        ),
    );
    state
}

/// Dispatcher wired to the state's pool, bus, ledger, and executor
#[allow(dead_code)]
pub fn dispatcher(state: &AppState) -> DiagnosisDispatcher {
    DiagnosisDispatcher::new(
        state.db.clone(),
        state.event_bus.clone(),
        state.ledger.clone(),
        state.executor.clone(),
    )
}

/// Execution record over `questions` generated questions and the given
/// providers, with long test-friendly timeouts
#[allow(dead_code)]
pub fn test_record(questions: usize, providers: &[&str]) -> ExecutionRecord {
    test_record_with_timeouts(
        questions,
        providers,
        Duration::from_secs(60),
        Duration::from_secs(30),
    )
}

#[allow(dead_code)]
pub fn test_record_with_timeouts(
    questions: usize,
    providers: &[&str],
    per_cell_timeout: Duration,
    execution_timeout: Duration,
) -> ExecutionRecord {
    ExecutionRecord::new(
        "Acme Widgets".to_string(),
        vec!["Initech".to_string()],
        providers.iter().map(|p| p.to_string()).collect(),
        (0..questions)
            .map(|i| format!("Question {} about {{brand}}", i))
            .collect(),
        4,
        per_cell_timeout,
        execution_timeout,
    )
}
