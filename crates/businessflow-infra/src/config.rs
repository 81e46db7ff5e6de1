//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.businessflow/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use businessflow_types::config::EngineConfig;
use thiserror::Error;

use crate::sqlite::pool::default_database_url;

/// Errors from reading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Read and validate a config file. Errors are returned, not swallowed.
pub async fn read_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable, malformed or invalid file: logs a warning, returns the default.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    match read_config(&config_path).await {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}

/// The database URL to open: the configured one, else the data-dir default.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.workers == 0 {
        return Err(ConfigError::Invalid("workers must be at least 1".into()));
    }
    if config.default_run_concurrency == 0 {
        return Err(ConfigError::Invalid(
            "default_run_concurrency must be at least 1".into(),
        ));
    }
    if config.default_step_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "default_step_timeout_ms must be positive".into(),
        ));
    }
    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
    }
    if config.reconcile_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "reconcile_interval_ms must be positive".into(),
        ));
    }
    if config.storage_retry_attempts == 0 {
        return Err(ConfigError::Invalid(
            "storage_retry_attempts must be at least 1".into(),
        ));
    }
    Ok(())
}
