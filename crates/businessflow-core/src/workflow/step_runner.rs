//! Step runner: executes one dispatched attempt.
//!
//! `StepRunner` resolves the attempt's input (or reuses the snapshot carried
//! over from the previous attempt), looks up the connector for the step's
//! capability and runs it under the step timeout and the run's cancellation
//! token. Handler problems never surface as errors: they become a
//! `StepExecutionError` on the outcome. Only storage failures are returned.

use std::sync::Arc;
use std::time::Duration;

use businessflow_types::config::EngineConfig;
use businessflow_types::error::StorageError;
use businessflow_types::event::EngineEvent;
use businessflow_types::execution::{StepExecution, StepExecutionError, StepStatus, StepTransition};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::SharedClock;
use super::connector::{ConnectorContext, ConnectorRegistry};
use super::context::{resolve_input, RunContext};
use super::dispatcher::DispatchedStep;
use super::retry::retry_storage;
use crate::event::EventBus;
use crate::repository::ExecutionStore;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of executing one attempt, before it is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Resolved input, when resolution got that far.
    pub input: Option<Value>,
    pub result: Result<Value, StepExecutionError>,
}

impl StepOutcome {
    pub fn succeeded(output: Value) -> Self {
        Self {
            input: None,
            result: Ok(output),
        }
    }

    pub fn failed(error: StepExecutionError) -> Self {
        Self {
            input: None,
            result: Err(error),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn status(&self) -> StepStatus {
        match self.result {
            Ok(_) => StepStatus::Succeeded,
            Err(_) => StepStatus::Failed,
        }
    }

    fn transition(&self, now: chrono::DateTime<chrono::Utc>) -> StepTransition {
        let mut transition = match &self.result {
            Ok(output) => StepTransition::to(StepStatus::Succeeded).with_output(output.clone()),
            Err(error) => StepTransition::to(StepStatus::Failed).with_error(error.clone()),
        };
        if let Some(input) = &self.input {
            transition = transition.with_input(input.clone());
        }
        transition.finished(now)
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Write an outcome with a compare-and-set `Dispatched -> terminal`.
///
/// Returns the updated row, or `None` when the attempt was no longer
/// `Dispatched` (already completed, or cancelled) and the outcome is stale.
pub async fn record_outcome<S: ExecutionStore>(
    store: &S,
    events: &EventBus,
    config: &EngineConfig,
    step_execution_id: Uuid,
    outcome: &StepOutcome,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<StepExecution>, StorageError> {
    let transition = outcome.transition(now);
    let applied = retry_storage(
        "record step outcome",
        config.storage_retry_attempts,
        config.storage_retry_backoff(),
        || store.transition_step(&step_execution_id, StepStatus::Dispatched, &transition),
    )
    .await?;
    if !applied {
        tracing::debug!(%step_execution_id, "stale step outcome discarded");
        return Ok(None);
    }

    let Some(row) = store.get_step_execution(&step_execution_id).await? else {
        return Err(StorageError::NotFound);
    };
    match &row.error {
        Some(error) => tracing::warn!(
            run_id = %row.run_id,
            step_id = %row.step_id,
            attempt = row.attempt,
            error = %error,
            "step attempt failed"
        ),
        None => tracing::debug!(
            run_id = %row.run_id,
            step_id = %row.step_id,
            attempt = row.attempt,
            "step attempt succeeded"
        ),
    }
    events.publish(EngineEvent::StepCompleted {
        run_id: row.run_id,
        step_id: row.step_id.clone(),
        attempt: row.attempt,
        status: row.status,
        error: row.error.as_ref().map(ToString::to_string),
    });
    Ok(Some(row))
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes dispatched attempts against the connector registry.
pub struct StepRunner<S> {
    store: Arc<S>,
    registry: Arc<ConnectorRegistry>,
    config: Arc<EngineConfig>,
    clock: SharedClock,
    events: EventBus,
}

impl<S: ExecutionStore> StepRunner<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<ConnectorRegistry>,
        config: Arc<EngineConfig>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
            events,
        }
    }

    /// Execute and record one attempt.
    ///
    /// Returns the terminal row, or `None` if the outcome was discarded
    /// because the attempt left `Dispatched` in the meantime.
    pub async fn run(
        &self,
        dispatched: &DispatchedStep,
        cancel: CancellationToken,
    ) -> Result<Option<StepExecution>, StorageError> {
        let outcome = self.execute(dispatched, cancel).await?;
        record_outcome(
            self.store.as_ref(),
            &self.events,
            &self.config,
            dispatched.execution.id,
            &outcome,
            self.clock.now(),
        )
        .await
    }

    /// Execute one attempt without recording it.
    pub async fn execute(
        &self,
        dispatched: &DispatchedStep,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, StorageError> {
        let execution = &dispatched.execution;
        let Some(step) = dispatched.definition.step(&execution.step_id) else {
            return Ok(StepOutcome::failed(StepExecutionError::InputMapping {
                detail: format!(
                    "step '{}' is not part of workflow version {}",
                    execution.step_id, dispatched.definition.version
                ),
            }));
        };

        let input = match &execution.input {
            Some(snapshot) => snapshot.clone(),
            None => {
                let Some(run) = self.store.get_run(&execution.run_id).await? else {
                    return Err(StorageError::NotFound);
                };
                let scope = RunContext::from_value(&run.context).scope(&run);
                match resolve_input(&step.input, &scope) {
                    Ok(input) => input,
                    Err(e) => {
                        return Ok(StepOutcome::failed(StepExecutionError::InputMapping {
                            detail: e.to_string(),
                        }));
                    }
                }
            }
        };

        let connector = match self.registry.get(&step.capability) {
            Ok(connector) => connector,
            Err(e) => {
                tracing::error!(
                    run_id = %execution.run_id,
                    step_id = %execution.step_id,
                    capability = %step.capability,
                    error = %e,
                    "no connector for step capability"
                );
                return Ok(StepOutcome::failed(StepExecutionError::UnknownCapability {
                    capability: step.capability.clone(),
                })
                .with_input(input));
            }
        };

        let timeout = step.timeout_or(self.config.default_step_timeout());
        let ctx = ConnectorContext {
            run_id: execution.run_id,
            step_id: execution.step_id.clone(),
            attempt: execution.attempt,
            timeout,
            cancel: cancel.child_token(),
        };

        tracing::debug!(
            run_id = %execution.run_id,
            step_id = %execution.step_id,
            attempt = execution.attempt,
            capability = %step.capability,
            timeout_ms = duration_ms(timeout),
            "executing step attempt"
        );

        let call = connector.execute(input.clone(), ctx);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepExecutionError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(StepExecutionError::Connector {
                    error_kind: e.kind,
                    detail: e.detail,
                }),
                Err(_) => Err(StepExecutionError::Timeout {
                    timeout_ms: duration_ms(timeout),
                }),
            },
        };

        Ok(StepOutcome {
            input: Some(input),
            result,
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
