//! Connector contract, registry, and built-in connectors.
//!
//! A connector executes one capability (`http`, `ai_inference`, `transform`,
//! ...) for a step attempt. Connectors are registered explicitly at startup
//! and looked up by capability name at dispatch time. They receive the
//! resolved input and a `ConnectorContext` carrying the attempt identity, the
//! timeout budget and a cancellation token.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use businessflow_types::execution::ConnectorErrorKind;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a connector.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {detail}")]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub detail: String,
}

impl ConnectorError {
    pub fn new(kind: ConnectorErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Transient, detail)
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Permanent, detail)
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::InvalidInput, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::RateLimited, detail)
    }
}

/// Errors from connector registration and lookup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("no connector registered for capability '{0}'")]
    UnknownCapability(String),

    #[error("a connector for capability '{0}' is already registered")]
    DuplicateCapability(String),
}

// ---------------------------------------------------------------------------
// Connector trait
// ---------------------------------------------------------------------------

/// Per-attempt information handed to a connector.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// Time budget for this attempt. The runner enforces it regardless.
    pub timeout: Duration,
    /// Cancelled when the run is cancelled or the worker shuts down.
    pub cancel: CancellationToken,
}

/// A pluggable step executor.
///
/// Object-safe: futures are boxed so connectors can live in a registry as
/// `Arc<dyn Connector>`.
pub trait Connector: Send + Sync {
    /// Capability name this connector serves.
    fn capability(&self) -> &str;

    /// Execute one attempt with an already resolved input.
    fn execute(
        &self,
        input: Value,
        ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of connectors, indexed by capability name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in `transform`, `delay` and `noop`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for connector in [
            Arc::new(TransformConnector) as Arc<dyn Connector>,
            Arc::new(DelayConnector),
            Arc::new(NoopConnector),
        ] {
            // Fresh registry, names are distinct.
            let _ = registry.register(connector);
        }
        registry
    }

    /// Register a connector under its capability name.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<(), DispatchError> {
        let name = connector.capability().to_string();
        if self.connectors.contains_key(&name) {
            return Err(DispatchError::DuplicateCapability(name));
        }
        tracing::debug!(capability = %name, "registered connector");
        self.connectors.insert(name, connector);
        Ok(())
    }

    /// Look up a connector by capability name.
    pub fn get(&self, capability: &str) -> Result<Arc<dyn Connector>, DispatchError> {
        self.connectors
            .get(capability)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownCapability(capability.to_string()))
    }

    /// All registered capability names, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in connectors
// ---------------------------------------------------------------------------

/// `transform`: evaluates `expression` (JEXL) over `{ data }`, or echoes the
/// input when no expression is given.
///
/// Input: `{ "expression": "data.items|length", "data": { ... } }`.
pub struct TransformConnector;

impl TransformConnector {
    fn transform(input: &Value) -> Result<Value, ConnectorError> {
        let Some(expression) = input.get("expression") else {
            return Ok(input.clone());
        };
        let expression = expression
            .as_str()
            .ok_or_else(|| ConnectorError::invalid_input("'expression' must be a string"))?;
        let data = input.get("data").cloned().unwrap_or(Value::Null);
        ExpressionEvaluator::new()
            .evaluate_value(expression, &json!({ "data": data }))
            .map_err(|e| ConnectorError::invalid_input(e.to_string()))
    }
}

impl Connector for TransformConnector {
    fn capability(&self) -> &str {
        "transform"
    }

    fn execute(
        &self,
        input: Value,
        _ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        let result = Self::transform(&input);
        Box::pin(async move { result })
    }
}

/// `delay`: sleeps for `duration_ms`, returning early if cancelled.
pub struct DelayConnector;

impl Connector for DelayConnector {
    fn capability(&self) -> &str {
        "delay"
    }

    fn execute(
        &self,
        input: Value,
        ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        Box::pin(async move {
            let duration_ms = input
                .get("duration_ms")
                .and_then(Value::as_u64)
                .ok_or_else(|| ConnectorError::invalid_input("'duration_ms' must be a non-negative integer"))?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    Ok(json!({ "slept_ms": duration_ms }))
                }
                _ = ctx.cancel.cancelled() => {
                    Err(ConnectorError::transient("delay interrupted by cancellation"))
                }
            }
        })
    }
}

/// `noop`: returns its input unchanged.
pub struct NoopConnector;

impl Connector for NoopConnector {
    fn capability(&self) -> &str {
        "noop"
    }

    fn execute(
        &self,
        input: Value,
        _ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        Box::pin(async move { Ok(input) })
    }
}

/// Connector backed by an async closure. Handy for embedding and tests.
pub struct FnConnector<F> {
    capability: String,
    handler: F,
}

impl<F, Fut> FnConnector<F>
where
    F: Fn(Value, ConnectorContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ConnectorError>> + Send + 'static,
{
    pub fn new(capability: impl Into<String>, handler: F) -> Self {
        Self {
            capability: capability.into(),
            handler,
        }
    }
}

impl<F, Fut> Connector for FnConnector<F>
where
    F: Fn(Value, ConnectorContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ConnectorError>> + Send + 'static,
{
    fn capability(&self) -> &str {
        &self.capability
    }

    fn execute(
        &self,
        input: Value,
        ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        Box::pin((self.handler)(input, ctx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnectorContext {
        ConnectorContext {
            run_id: Uuid::now_v7(),
            step_id: "s".to_string(),
            attempt: 1,
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn test_builtins_registered() {
        let registry = ConnectorRegistry::with_builtins();
        assert_eq!(registry.capabilities(), vec!["delay", "noop", "transform"]);
        assert!(registry.get("noop").is_ok());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ConnectorRegistry::with_builtins();
        let err = registry.register(Arc::new(NoopConnector)).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateCapability("noop".to_string()));
    }

    #[test]
    fn test_unknown_capability() {
        let registry = ConnectorRegistry::new();
        assert!(matches!(
            registry.get("fax"),
            Err(DispatchError::UnknownCapability(name)) if name == "fax"
        ));
    }

    // -----------------------------------------------------------------------
    // Built-ins
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_transform_expression() {
        let out = TransformConnector
            .execute(
                json!({ "expression": "data.amount * 2", "data": { "amount": 21 } }),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out.as_f64(), Some(42.0));
    }

    #[tokio::test]
    async fn test_transform_echo_and_invalid() {
        let input = json!({ "a": [1, 2] });
        assert_eq!(TransformConnector.execute(input.clone(), ctx()).await.unwrap(), input);

        let err = TransformConnector
            .execute(json!({ "expression": 5 }), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_sleeps_and_cancels() {
        let out = DelayConnector
            .execute(json!({ "duration_ms": 250 }), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({ "slept_ms": 250 }));

        let c = ctx();
        c.cancel.cancel();
        let err = DelayConnector
            .execute(json!({ "duration_ms": 60_000 }), c)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Transient);

        let err = DelayConnector.execute(json!({}), ctx()).await.unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_fn_connector() {
        let connector = FnConnector::new("echo_attempt", |_input, ctx: ConnectorContext| async move {
            Ok(json!({ "attempt": ctx.attempt }))
        });
        assert_eq!(connector.capability(), "echo_attempt");
        assert_eq!(
            connector.execute(Value::Null, ctx()).await.unwrap(),
            json!({ "attempt": 1 })
        );
    }
}
