//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stepflow/` by default)
//! into [`EngineConfig`]. A missing or malformed file yields the defaults.

use std::path::Path;

use stepflow_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Floor for the event bus capacity; a zero-capacity broadcast channel panics.
const MIN_EVENT_BUS_CAPACITY: usize = 1;

/// Load engine configuration from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            config.event_bus_capacity = config.event_bus_capacity.max(MIN_EVENT_BUS_CAPACITY);
            config
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}

/// The configured database URL, or the default location.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
