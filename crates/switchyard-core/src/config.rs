//! Orchestrator configuration loader.
//!
//! Reads a TOML file into [`OrchestratorConfig`]. [`load_config`] is lenient
//! and falls back to defaults when the file is missing, unreadable, malformed
//! or out of range. [`parse_config`] is the strict variant.

use std::path::Path;

use switchyard_types::config::OrchestratorConfig;
use switchyard_types::error::ConfigError;

/// Parse and validate a TOML configuration string.
pub fn parse_config(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path`.
///
/// - Missing file: defaults.
/// - Unreadable, malformed or invalid file: logs a warning and returns defaults.
pub async fn load_config(path: &Path) -> OrchestratorConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return OrchestratorConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return OrchestratorConfig::default();
        }
    };

    match parse_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to load {}: {err}, using defaults", path.display());
            OrchestratorConfig::default()
        }
    }
}
