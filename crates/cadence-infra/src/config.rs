//! Engine configuration loader for Cadence.
//!
//! Reads `config.toml` from the data directory (`~/.cadence/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::Path;

use cadence_types::config::EngineConfig;

use crate::filesystem::config_path;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
///
/// Safety floors are applied in every case.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return EngineConfig::default().normalized();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default().normalized();
        }
    };

    parse_engine_config(&content, &path).normalized()
}

fn parse_engine_config(content: &str, path: &Path) -> EngineConfig {
    match toml::from_str::<EngineConfig>(content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}
