//! Connectors that reach outside the process: `http` and `ai_inference`.

pub mod ai;
pub mod http;

use std::sync::Arc;

use businessflow_core::workflow::connector::{ConnectorRegistry, DispatchError};
use businessflow_types::config::EngineConfig;
use thiserror::Error;

pub use ai::AiInferenceConnector;
pub use http::HttpConnector;

/// Errors from building the infrastructure connectors.
#[derive(Debug, Error)]
pub enum ConnectorSetupError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Registration(#[from] DispatchError),
}

/// Register `http` and `ai_inference` into `registry`.
pub fn register_infra_connectors(
    registry: &mut ConnectorRegistry,
    config: &EngineConfig,
) -> Result<(), ConnectorSetupError> {
    registry.register(Arc::new(HttpConnector::new(&config.http)?))?;
    registry.register(Arc::new(AiInferenceConnector::from_config(&config.ai)?))?;
    Ok(())
}

/// Built-in connectors plus the infrastructure ones.
pub fn default_registry(config: &EngineConfig) -> Result<ConnectorRegistry, ConnectorSetupError> {
    let mut registry = ConnectorRegistry::with_builtins();
    register_infra_connectors(&mut registry, config)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_capabilities() {
        let registry = default_registry(&EngineConfig::default()).unwrap();
        assert_eq!(
            registry.capabilities(),
            vec!["ai_inference", "delay", "http", "noop", "transform"]
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let config = EngineConfig::default();
        let mut registry = default_registry(&config).unwrap();
        assert!(matches!(
            register_infra_connectors(&mut registry, &config),
            Err(ConnectorSetupError::Registration(DispatchError::DuplicateCapability(name))) if name == "http"
        ));
    }
}
