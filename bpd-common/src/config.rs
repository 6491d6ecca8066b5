//! Configuration loading and data-path resolution
//!
//! Resolution priority for the config file location:
//! 1. Explicit path argument (highest priority)
//! 2. `BPD_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/bpd/bpd-dx.toml` on Linux)
//! 4. `/etc/bpd/bpd-dx.toml` (Linux system-wide)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One external text-generation provider endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Completion endpoint URL
    pub base_url: String,
    /// Bearer token; `BPD_PROVIDER_<NAME>_API_KEY` overrides
    pub api_key: Option<String>,
    /// Model identifier passed through in the request body
    pub model: Option<String>,
}

/// On-disk TOML configuration for the diagnosis engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub concurrency_limit: Option<usize>,
    pub per_cell_timeout_seconds: Option<u64>,
    pub execution_timeout_seconds: Option<u64>,
    pub ledger_retention_hours: Option<u64>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Load the TOML config, resolving the file location by priority.
///
/// Returns `Ok(None)` when no config file exists anywhere in the search
/// path; the service then runs on compiled defaults (useful for tests,
/// useless for real diagnoses since no providers are configured).
pub fn load_toml_config(explicit: Option<&Path>) -> Result<Option<TomlConfig>> {
    let path = match resolve_config_path(explicit) {
        Some(p) => p,
        None => return Ok(None),
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Only a caller- or env-named path can be missing here;
            // the search locations are existence-checked
            return Err(Error::NotFound(format!("Config file {}", path.display())));
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "Read config failed ({}): {}",
                path.display(),
                e
            )));
        }
    };
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse config failed ({}): {}", path.display(), e)))?;

    tracing::info!(path = %path.display(), providers = config.providers.len(), "Loaded TOML config");
    Ok(Some(config))
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("BPD_CONFIG") {
        return Some(PathBuf::from(path));
    }

    if let Some(user_config) = dirs::config_dir().map(|d| d.join("bpd").join("bpd-dx.toml")) {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/bpd/bpd-dx.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bpd").join("bpd.db"))
        .unwrap_or_else(|| PathBuf::from("./bpd_data/bpd.db"))
}

/// Write a TOML config file (used by tests and provisioning tooling)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_toml_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bpd-dx.toml");

        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                base_url: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key: Some("sk-test".to_string()),
                model: Some("gpt-4o-mini".to_string()),
            },
        );
        let config = TomlConfig {
            port: Some(5731),
            concurrency_limit: Some(4),
            providers,
            ..Default::default()
        };

        write_toml_config(&config, &path).unwrap();

        let loaded = load_toml_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.port, Some(5731));
        assert_eq!(loaded.concurrency_limit, Some(4));
        assert_eq!(
            loaded.providers.get("openai").unwrap().model.as_deref(),
            Some("gpt-4o-mini")
        );
    }

    #[test]
    fn test_missing_explicit_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nope.toml");
        let err = load_toml_config(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_minimal_config_parses() {
        let config: TomlConfig = toml::from_str("port = 9000").unwrap();
        assert_eq!(config.port, Some(9000));
        assert!(config.providers.is_empty());
        assert!(config.database_path.is_none());
    }
}
