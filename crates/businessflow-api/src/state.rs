//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over its store; `AppState` pins it to the SQLite
//! implementation and the default connector registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use businessflow_core::workflow::Engine;
use businessflow_infra::config::{load_config, resolve_database_url};
use businessflow_infra::connector::default_registry;
use businessflow_infra::sqlite::SqliteExecutionStore;
use businessflow_infra::sqlite::pool::data_dir;
use businessflow_types::config::EngineConfig;

/// Engine pinned to the SQLite store.
pub type ConcreteEngine = Engine<SqliteExecutionStore>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

/// Read the config before tracing is installed so `[logging]` can apply.
pub async fn read_engine_config() -> (PathBuf, EngineConfig) {
    let data_dir = data_dir();
    let config = load_config(&data_dir).await;
    (data_dir, config)
}

impl AppState {
    /// Open the database, build the connector registry and bind triggers.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db_url = resolve_database_url(&config);
        let store = SqliteExecutionStore::connect(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;
        let registry = default_registry(&config)?;
        tracing::debug!(capabilities = ?registry.capabilities(), "connectors registered");

        let engine = Arc::new(Engine::new(Arc::new(store), registry, config.clone()));
        engine.load_triggers().await?;

        Ok(Self {
            engine,
            config,
            data_dir,
        })
    }
}
