//! Runtime configuration resolution for bpd-dx
//!
//! Priority per field: environment variable → TOML config → compiled
//! default. Provider API keys additionally accept
//! `BPD_PROVIDER_<NAME>_API_KEY` overrides.

use bpd_common::config::{default_database_path, ProviderConfig, TomlConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Default listen port for the diagnosis engine
pub const DEFAULT_PORT: u16 = 5731;
/// Default bounded worker pool size per execution
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Worker pool size ceiling
pub const MAX_CONCURRENCY: usize = 16;
/// Default hard per-attempt provider call timeout
pub const DEFAULT_PER_CELL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default soft execution wall-clock budget
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);
/// Default ledger retention window
pub const DEFAULT_LEDGER_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct DxConfig {
    pub port: u16,
    pub database_path: PathBuf,
    pub concurrency_limit: usize,
    pub per_cell_timeout: Duration,
    pub execution_timeout: Duration,
    pub ledger_retention: Duration,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for DxConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: default_database_path(),
            concurrency_limit: DEFAULT_CONCURRENCY,
            per_cell_timeout: DEFAULT_PER_CELL_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            ledger_retention: DEFAULT_LEDGER_RETENTION,
            providers: HashMap::new(),
        }
    }
}

impl DxConfig {
    /// Resolve the runtime config from an optional TOML layer plus
    /// environment overrides.
    pub fn resolve(toml: Option<TomlConfig>) -> Self {
        let toml = toml.unwrap_or_default();
        let defaults = Self::default();

        let port = env_parse("BPD_PORT")
            .or(toml.port)
            .unwrap_or(defaults.port);
        let database_path = std::env::var("BPD_DATABASE_PATH")
            .ok()
            .map(PathBuf::from)
            .or(toml.database_path)
            .unwrap_or(defaults.database_path);
        let concurrency_limit = env_parse("BPD_CONCURRENCY_LIMIT")
            .or(toml.concurrency_limit)
            .unwrap_or(defaults.concurrency_limit)
            .clamp(1, MAX_CONCURRENCY);
        let per_cell_timeout = env_parse("BPD_PER_CELL_TIMEOUT_SECONDS")
            .or(toml.per_cell_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.per_cell_timeout);
        let execution_timeout = env_parse("BPD_EXECUTION_TIMEOUT_SECONDS")
            .or(toml.execution_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.execution_timeout);
        let ledger_retention = env_parse("BPD_LEDGER_RETENTION_HOURS")
            .or(toml.ledger_retention_hours)
            .map(|h: u64| Duration::from_secs(h * 3600))
            .unwrap_or(defaults.ledger_retention);

        let mut providers = toml.providers;
        for (name, provider) in providers.iter_mut() {
            let env_var = format!(
                "BPD_PROVIDER_{}_API_KEY",
                name.to_uppercase().replace('-', "_")
            );
            if let Ok(key) = std::env::var(&env_var) {
                if provider.api_key.is_some() {
                    warn!(provider = %name, "API key present in both TOML and environment, using environment");
                }
                provider.api_key = Some(key);
            }
        }

        if providers.is_empty() {
            warn!("No providers configured; diagnosis requests will be rejected");
        } else {
            info!(
                providers = %providers.keys().cloned().collect::<Vec<_>>().join(", "),
                "Provider endpoints configured"
            );
        }

        Self {
            port,
            database_path,
            concurrency_limit,
            per_cell_timeout,
            execution_timeout,
            ledger_retention,
            providers,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var, raw, "Ignoring unparseable environment override");
            None
        }
    }
}
