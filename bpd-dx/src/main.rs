//! bpd-dx - Brand Perception Diagnosis Engine
//!
//! **Module Identity:**
//! - Name: bpd-dx (Diagnosis Engine)
//! - Port: 5731
//!
//! Dispatches brand-perception question matrices across AI providers,
//! tracks execution progress through a validated state machine, and
//! serves progress over SSE push plus a polling fallback.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bpd_common::config::load_toml_config;
use bpd_common::events::EventBus;

use bpd_dx::config::DxConfig;
use bpd_dx::services::gateway::HttpProviderGateway;
use bpd_dx::services::recovery::recover_on_startup;
use bpd_dx::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting bpd-dx (Diagnosis Engine) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Resolve configuration: TOML layer plus environment overrides
    let toml = load_toml_config(None)?;
    let config = Arc::new(DxConfig::resolve(toml));
    info!("Port: {}", config.port);
    info!("Database: {}", config.database_path.display());

    let db_pool = bpd_dx::db::init_database_pool(&config.database_path).await?;
    info!("Database connection established");

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(100);

    let gateway = Arc::new(HttpProviderGateway::new(config.providers.clone())?);
    let state = AppState::new(db_pool, event_bus, config.clone(), gateway);

    // Pick up executions a previous process left behind
    match recover_on_startup(&state).await {
        Ok(resumed) if resumed > 0 => info!(resumed, "Crash recovery complete"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Crash recovery failed, continuing"),
    }

    // Hourly ledger retention sweep
    state.ledger.spawn_reaper();

    let app = bpd_dx::build_router(state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
