//! Engine configuration types for BusinessFlow.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so an empty or missing file yields a working engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Loaded from `~/.businessflow/config.toml` (or `$BFLOW_DATA_DIR/config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global cap on simultaneously dispatched steps across all runs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-run cap on dispatched steps when the definition sets none.
    #[serde(default = "default_run_concurrency")]
    pub default_run_concurrency: u32,

    /// Attempt timeout when a step sets none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Upper bound on how long the dispatcher sleeps without a wake-up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Period of the sweep that advances runs left with no open attempt.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Attempts for a storage write before the error is surfaced.
    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,

    /// Base delay between storage write attempts.
    #[serde(default = "default_storage_retry_backoff_ms")]
    pub storage_retry_backoff_ms: u64,

    /// SQLite URL. Defaults to `sqlite://{data_dir}/businessflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Directory of workflow files published by `bflow publish` without a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<String>,

    #[serde(default)]
    pub http: HttpConnectorConfig,

    #[serde(default)]
    pub ai: AiConnectorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_workers() -> usize {
    8
}

fn default_run_concurrency() -> u32 {
    4
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

fn default_storage_retry_attempts() -> u32 {
    3
}

fn default_storage_retry_backoff_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_run_concurrency: default_run_concurrency(),
            default_step_timeout_ms: default_step_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            storage_retry_attempts: default_storage_retry_attempts(),
            storage_retry_backoff_ms: default_storage_retry_backoff_ms(),
            database_url: None,
            workflows_dir: None,
            http: HttpConnectorConfig::default(),
            ai: AiConnectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn storage_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_retry_backoff_ms)
    }
}

/// Settings for the `http` connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConnectorConfig {
    /// Client-level request timeout; the step timeout still applies on top.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    concat!("businessflow/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConnectorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// Settings for the `ai_inference` connector (OpenAI-compatible chat API).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConnectorConfig {
    /// Base URL of the chat completions API.
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,
    /// Model used when the step input names none.
    #[serde(default = "default_ai_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_ai_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_ai_max_tokens")]
    pub max_tokens: u32,
}

fn default_ai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_ai_max_tokens() -> u32 {
    1024
}

impl Default for AiConnectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ai_endpoint(),
            model: default_ai_model(),
            api_key_env: default_ai_api_key_env(),
            max_tokens: default_ai_max_tokens(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Export spans to stdout via OpenTelemetry.
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}
