//! Engine core: run lifecycle, the advance algorithm and the external
//! interface used by the CLI and embedders.
//!
//! All run state lives in the `ExecutionStore`. The engine keeps only
//! process-local helpers (per-run locks, cancellation tokens, a definition
//! cache), none of which are needed to resume after a crash: `recover()`
//! rebuilds everything from the store.
//!
//! `advance` is the single place that moves a run forward. It is derived
//! entirely from stored state, applied under a per-run async mutex, and
//! idempotent: replaying it for the same completion changes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use businessflow_types::config::EngineConfig;
use businessflow_types::error::StorageError;
use businessflow_types::event::EngineEvent;
use businessflow_types::execution::{
    ExecutionRun, RunFilter, RunPage, RunStatus, RunStatusView, StepExecution, StepExecutionError,
    StepStatus, StepTransition, StepView, TriggerEvent, WorkflowStats,
};
use businessflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::DefinitionCache;
use super::clock::{SharedClock, SystemClock};
use super::connector::ConnectorRegistry;
use super::context::RunContext;
use super::dag::topological_order;
use super::definition::{publish_definition, DefinitionError};
use super::dispatcher::{DispatchedStep, Dispatcher};
use super::expression::evaluate_condition;
use super::retry::{retry_storage, RetryHandler};
use super::scheduler::{CronCallback, CronScheduler, Schedule, SchedulerError};
use super::step_runner::{record_outcome, StepOutcome, StepRunner};
use super::trigger::{seed_context, TriggerError, TriggerRegistry};
use crate::event::EventBus;
use crate::repository::ExecutionStore;

/// Largest page `list_runs_by_workflow` returns.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Runs included in `WorkflowStats::recent_runs`.
const RECENT_RUNS: u32 = 10;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow definition {workflow_id} not found")]
    DefinitionNotFound { workflow_id: Uuid },

    #[error("workflow {workflow_id} has no version {requested} (latest is {latest})")]
    VersionMismatch {
        workflow_id: Uuid,
        requested: u32,
        latest: u32,
    },

    #[error("workflow {0} is inactive")]
    WorkflowInactive(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("step execution {0} not found")]
    StepExecutionNotFound(Uuid),

    #[error("trigger '{0}' not found")]
    TriggerNotFound(String),

    #[error("invalid page cursor '{0}'")]
    InvalidCursor(String),

    /// Stored state breaks an engine invariant. Processing of the run halts.
    #[error("invariant violation in run {run_id}: {detail}")]
    InvariantViolation { run_id: Uuid, detail: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Result of reporting a step completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The report won the compare-and-set; the run was advanced.
    Accepted { run_status: RunStatus },
    /// The attempt had already left `Dispatched`; the report was discarded.
    Stale,
}

/// Summary of a `recover()` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted_attempts: usize,
    pub runs_reconciled: usize,
    pub runs_failed_to_reconcile: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Durable workflow execution engine.
pub struct Engine<S: ExecutionStore> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
    clock: SharedClock,
    events: EventBus,
    cache: Arc<DefinitionCache>,
    dispatcher: Dispatcher<S>,
    runner: StepRunner<S>,
    triggers: TriggerRegistry,
    run_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    run_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: ExecutionStore> Engine<S> {
    /// Create an engine on the system clock.
    pub fn new(store: Arc<S>, registry: ConnectorRegistry, config: EngineConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        store: Arc<S>,
        registry: ConnectorRegistry,
        config: EngineConfig,
        clock: SharedClock,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::default();
        let cache = Arc::new(DefinitionCache::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&clock),
            events.clone(),
            config.workers,
            config.poll_interval(),
            config.default_run_concurrency,
        );
        let runner = StepRunner::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::clone(&config),
            Arc::clone(&clock),
            events.clone(),
        );
        Self {
            store,
            config,
            clock,
            events,
            cache,
            dispatcher,
            runner,
            triggers: TriggerRegistry::new(),
            run_locks: DashMap::new(),
            run_tokens: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    // -----------------------------------------------------------------------
    // Definitions and triggers
    // -----------------------------------------------------------------------

    /// Validate and publish a new definition version, then bind its triggers.
    pub async fn publish_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        let published = publish_definition(self.store.as_ref(), def).await?;
        self.cache.insert(published.clone());
        self.triggers.register_workflow(&published).await?;
        Ok(published)
    }

    /// Rebuild trigger bindings from the latest version of every definition.
    pub async fn load_triggers(&self) -> Result<usize, EngineError> {
        let defs = self.store.list_definitions().await?;
        let bound = self.triggers.rebuild(&defs).await;
        tracing::info!(definitions = defs.len(), triggers = bound, "trigger bindings loaded");
        Ok(bound)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run of `workflow_id` (latest version unless `version` is given)
    /// and queue its root steps.
    #[tracing::instrument(skip(self, seed), fields(%workflow_id))]
    pub async fn create_run(
        &self,
        workflow_id: Uuid,
        version: Option<u32>,
        seed: Value,
        correlation_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        self.start_run(workflow_id, version, seed, correlation_id, None)
            .await
    }

    async fn start_run(
        &self,
        workflow_id: Uuid,
        version: Option<u32>,
        seed: Value,
        correlation_id: Option<String>,
        trigger_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let latest = self
            .store
            .latest_definition(&workflow_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound { workflow_id })?;
        if !latest.is_active {
            return Err(EngineError::WorkflowInactive(workflow_id));
        }
        let latest_version = latest.version;
        let def = match version {
            None => self.cache.insert(latest),
            Some(v) if v == latest_version => self.cache.insert(latest),
            Some(v) => self
                .cache
                .definition(self.store.as_ref(), workflow_id, v)
                .await?
                .ok_or(EngineError::VersionMismatch {
                    workflow_id,
                    requested: v,
                    latest: latest_version,
                })?,
        };

        let now = self.clock.now();
        let run = ExecutionRun {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version: def.version,
            workflow_name: def.name.clone(),
            status: RunStatus::Pending,
            context: RunContext::seeded(seed).to_value(),
            correlation_id,
            trigger_id,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        self.with_storage_retry("create run", || self.store.create_run(&run))
            .await?;
        self.cache.bind_run(run.id, workflow_id, def.version);

        tracing::info!(
            run_id = %run.id,
            workflow = %def.name,
            version = def.version,
            correlation_id = run.correlation_id.as_deref(),
            "run created"
        );
        self.events.publish(EngineEvent::RunCreated {
            run_id: run.id,
            workflow_id,
            workflow_version: def.version,
            correlation_id: run.correlation_id.clone(),
        });

        self.advance(run.id, None).await?;
        Ok(run.id)
    }

    /// Move a run forward after `completed` (if any) reached a terminal status.
    ///
    /// Schedules retries, aborts on fatal failures, queues or skips steps whose
    /// dependencies are satisfied and derives the run status. Idempotent.
    #[tracing::instrument(skip(self), fields(%run_id))]
    pub async fn advance(
        &self,
        run_id: Uuid,
        completed: Option<Uuid>,
    ) -> Result<RunStatus, EngineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        self.advance_locked(run_id, completed).await
    }

    async fn advance_locked(
        &self,
        run_id: Uuid,
        completed: Option<Uuid>,
    ) -> Result<RunStatus, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        let def = self
            .cache
            .definition(self.store.as_ref(), run.workflow_id, run.workflow_version)
            .await?
            .ok_or(EngineError::DefinitionNotFound {
                workflow_id: run.workflow_id,
            })?;

        let rows = self.store.list_step_executions(&run_id).await?;
        if let Some(id) = completed {
            match rows.iter().find(|r| r.id == id) {
                None => return Err(EngineError::StepExecutionNotFound(id)),
                Some(row) if !row.status.is_terminal() => {
                    return Err(self.invariant(
                        run_id,
                        format!(
                            "attempt {} of step '{}' reported complete while {}",
                            row.attempt, row.step_id, row.status
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
        let mut latest = self.latest_attempts(run_id, &rows)?;
        let now = self.clock.now();

        // Fatal failures abort the run without waiting for other work.
        if let Some(fatal) = latest.values().find(|r| {
            r.status == StepStatus::Failed && r.error.as_ref().is_some_and(|e| e.is_fatal())
        }) {
            let error = describe_failure(fatal);
            return self.abort_run(&run, &rows, error, now).await;
        }

        let mut events = Vec::new();
        let mut queued_any = false;

        // Retries for failed attempts with budget left.
        let mut retries = Vec::new();
        for row in latest.values() {
            if row.status != StepStatus::Failed {
                continue;
            }
            let (Some(error), Some(step)) = (&row.error, def.step(&row.step_id)) else {
                continue;
            };
            if !RetryHandler::should_retry(&step.retry, row.attempt, error) {
                continue;
            }
            let delay = RetryHandler::backoff_delay(&step.retry, row.attempt);
            let not_before = add_delay(row.finished_at.unwrap_or(now), delay);
            tracing::warn!(
                step_id = %row.step_id,
                attempt = row.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "scheduling retry"
            );
            retries.push(StepExecution::queued(
                run_id,
                row.step_id.clone(),
                row.attempt + 1,
                row.input.clone(),
                Some(not_before),
                now,
            ));
        }
        for retry in retries {
            self.insert_attempt(&retry).await?;
            events.push(EngineEvent::StepRetryScheduled {
                run_id,
                step_id: retry.step_id.clone(),
                next_attempt: retry.attempt,
                not_before: retry.not_before.unwrap_or(now),
            });
            events.push(EngineEvent::StepQueued {
                run_id,
                step_id: retry.step_id.clone(),
                attempt: retry.attempt,
            });
            queued_any = true;
            latest.insert(retry.step_id.clone(), retry);
        }

        // Merge outputs of finished steps into the run context.
        let mut ctx = RunContext::from_value(&run.context);
        for row in latest.values() {
            match row.status {
                StepStatus::Succeeded => {
                    ctx.set_step_output(&row.step_id, row.output.clone().unwrap_or(Value::Null))
                }
                StepStatus::Skipped => ctx.set_step_output(&row.step_id, Value::Null),
                _ => {}
            }
        }

        // Queue or skip every ready step. A single pass in topological order
        // reaches the fixpoint: a skip is visible to its dependents within
        // the same pass. Once a step has failed for good no new work starts.
        let mut failed = latest.values().any(is_terminal_failure);
        let order = topological_order(&def.steps)?;
        for step_id in order {
            if failed {
                break;
            }
            if latest.contains_key(step_id) {
                continue;
            }
            let Some(step) = def.step(step_id) else {
                continue;
            };
            let ready = step.depends_on.iter().all(|dep| {
                latest
                    .get(dep.as_str())
                    .is_some_and(|r| r.status.satisfies_dependency())
            });
            if !ready {
                continue;
            }

            let condition = step
                .condition
                .as_deref()
                .map(|expr| evaluate_condition(expr, &ctx.scope(&run)));
            let row = match condition {
                None | Some(Ok(true)) => StepExecution::queued(run_id, step_id, 1, None, None, now),
                Some(Ok(false)) => StepExecution::skipped(run_id, step_id, now),
                Some(Err(e)) => StepExecution::failed_before_dispatch(
                    run_id,
                    step_id,
                    StepExecutionError::Condition {
                        detail: e.to_string(),
                    },
                    now,
                ),
            };
            self.insert_attempt(&row).await?;

            match row.status {
                StepStatus::Queued => {
                    tracing::debug!(step_id, "step queued");
                    events.push(EngineEvent::StepQueued {
                        run_id,
                        step_id: step_id.to_string(),
                        attempt: 1,
                    });
                    queued_any = true;
                }
                StepStatus::Skipped => {
                    tracing::debug!(step_id, "step skipped, condition is false");
                    ctx.set_step_output(step_id, Value::Null);
                    events.push(EngineEvent::StepSkipped {
                        run_id,
                        step_id: step_id.to_string(),
                    });
                }
                _ => {
                    tracing::warn!(step_id, error = ?row.error, "step condition failed");
                    events.push(EngineEvent::StepCompleted {
                        run_id,
                        step_id: step_id.to_string(),
                        attempt: 1,
                        status: row.status,
                        error: row.error.as_ref().map(ToString::to_string),
                    });
                    failed = true;
                }
            }
            latest.insert(step_id.to_string(), row);
        }

        // Derive the run status.
        let all_satisfied = def.steps.iter().all(|s| {
            latest
                .get(s.id.as_str())
                .is_some_and(|r| r.status.satisfies_dependency())
        });
        let active = latest.values().any(|r| !r.status.is_terminal());
        let (status, error) = if all_satisfied {
            (RunStatus::Succeeded, None)
        } else if active {
            (RunStatus::Running, None)
        } else if let Some(first) = latest
            .values()
            .filter(|r| is_terminal_failure(r))
            .min_by_key(|r| (r.finished_at, r.queued_at))
        {
            (RunStatus::Failed, Some(describe_failure(first)))
        } else {
            return Err(self.invariant(
                run_id,
                "no step is runnable and none has failed".to_string(),
            ));
        };

        let context = ctx.to_value();
        if status != run.status || context != run.context {
            let updated = self
                .with_storage_retry("update run", || {
                    self.store.update_run_status(
                        &run_id,
                        run.status,
                        status,
                        error.as_deref(),
                        Some(&context),
                        now,
                    )
                })
                .await?;
            if !updated {
                let current = self
                    .store
                    .get_run(&run_id)
                    .await?
                    .map(|r| r.status)
                    .ok_or(EngineError::RunNotFound(run_id))?;
                tracing::warn!(expected = %run.status, %current, "run changed concurrently, not advancing");
                return Ok(current);
            }
        }

        for event in events {
            self.events.publish(event);
        }
        if queued_any {
            self.dispatcher.wake();
        }
        if status.is_terminal() {
            self.finish_run(run_id, status, error);
        } else if status != run.status {
            tracing::info!(from = %run.status, to = %status, "run status changed");
        }
        Ok(status)
    }

    /// Fail a run immediately: cancel its open attempts, interrupt in-flight
    /// connector calls and mark it `Failed`.
    async fn abort_run(
        &self,
        run: &ExecutionRun,
        rows: &[StepExecution],
        error: String,
        now: DateTime<Utc>,
    ) -> Result<RunStatus, EngineError> {
        tracing::error!(run_id = %run.id, %error, "aborting run");
        self.cancel_open_attempts(rows, now).await?;
        if let Some((_, token)) = self.run_tokens.remove(&run.id) {
            token.cancel();
        }
        let updated = self
            .with_storage_retry("fail run", || {
                self.store.update_run_status(
                    &run.id,
                    run.status,
                    RunStatus::Failed,
                    Some(error.as_str()),
                    None,
                    now,
                )
            })
            .await?;
        if !updated {
            return Ok(self
                .store
                .get_run(&run.id)
                .await?
                .map(|r| r.status)
                .ok_or(EngineError::RunNotFound(run.id))?);
        }
        self.finish_run(run.id, RunStatus::Failed, Some(error));
        Ok(RunStatus::Failed)
    }

    async fn cancel_open_attempts(
        &self,
        rows: &[StepExecution],
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let cancel = StepTransition::to(StepStatus::Cancelled)
            .with_error(StepExecutionError::Cancelled)
            .finished(now);
        let mut cancelled = 0;
        for row in rows.iter().filter(|r| !r.status.is_terminal()) {
            // A worker may claim the row between the read and the CAS; follow
            // it until it is terminal. Statuses only move forward, so this
            // ends after Queued -> Dispatched -> terminal at most.
            let mut expected = row.status;
            loop {
                let applied = self
                    .with_storage_retry("cancel attempt", || {
                        self.store.transition_step(&row.id, expected, &cancel)
                    })
                    .await?;
                if applied {
                    cancelled += 1;
                    tracing::debug!(step_id = %row.step_id, attempt = row.attempt, from = %expected, "attempt cancelled");
                    break;
                }
                let current = self
                    .store
                    .get_step_execution(&row.id)
                    .await?
                    .ok_or(EngineError::StepExecutionNotFound(row.id))?;
                if current.status.is_terminal() {
                    break;
                }
                tracing::debug!(
                    step_id = %row.step_id,
                    attempt = row.attempt,
                    from = %expected,
                    to = %current.status,
                    "attempt moved during cancel, retrying"
                );
                expected = current.status;
            }
        }
        Ok(cancelled)
    }

    /// Bookkeeping once a run is terminal.
    fn finish_run(&self, run_id: Uuid, status: RunStatus, error: Option<String>) {
        tracing::info!(%run_id, %status, error = error.as_deref(), "run finished");
        self.run_tokens.remove(&run_id);
        self.run_locks.remove(&run_id);
        self.cache.release_run(&run_id);
        let event = match status {
            RunStatus::Cancelled => EngineEvent::RunCancelled { run_id },
            _ => EngineEvent::RunFinished {
                run_id,
                status,
                error,
            },
        };
        self.events.publish(event);
    }

    // -----------------------------------------------------------------------
    // Completion reporting and worker entry point
    // -----------------------------------------------------------------------

    /// Report the outcome of a dispatched attempt.
    ///
    /// Exactly one of several concurrent reports for the same attempt is
    /// `Accepted`; the others are `Stale`.
    #[tracing::instrument(skip(self, outcome))]
    pub async fn report_completion(
        &self,
        step_execution_id: Uuid,
        outcome: StepOutcome,
    ) -> Result<CompletionOutcome, EngineError> {
        let recorded = match record_outcome(
            self.store.as_ref(),
            &self.events,
            &self.config,
            step_execution_id,
            &outcome,
            self.clock.now(),
        )
        .await
        {
            Ok(recorded) => recorded,
            Err(StorageError::NotFound) => {
                return Err(EngineError::StepExecutionNotFound(step_execution_id));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(row) = recorded else {
            return Ok(CompletionOutcome::Stale);
        };
        let run_status = self.advance(row.run_id, Some(row.id)).await?;
        Ok(CompletionOutcome::Accepted { run_status })
    }

    /// Execute a dispatched attempt, record it and advance its run.
    ///
    /// Returns `None` when the attempt was not executed (its run finished or
    /// it left `Dispatched` first) or its outcome was discarded.
    pub async fn process(&self, dispatched: DispatchedStep) -> Result<Option<RunStatus>, EngineError> {
        let run_id = dispatched.run_id();
        let Some(token) = self.claim_run_token(&dispatched).await? else {
            return Ok(None);
        };
        let recorded = self.runner.run(&dispatched, token).await?;
        // Release the worker permit before advancing.
        drop(dispatched);
        match recorded {
            Some(row) => Ok(Some(self.advance(run_id, Some(row.id)).await?)),
            None => Ok(None),
        }
    }

    /// Crash recovery. Attempts left `Dispatched` by a previous process are
    /// failed as interrupted (retryable) and every active run is advanced.
    ///
    /// Must run before workers start; it assumes no other process is
    /// executing attempts against the same store.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for row in self.store.list_dispatched().await? {
            let outcome = StepOutcome::failed(StepExecutionError::Interrupted {
                detail: "worker stopped before the attempt completed".to_string(),
            });
            let recorded = record_outcome(
                self.store.as_ref(),
                &self.events,
                &self.config,
                row.id,
                &outcome,
                self.clock.now(),
            )
            .await?;
            if recorded.is_some() {
                tracing::warn!(
                    run_id = %row.run_id,
                    step_id = %row.step_id,
                    attempt = row.attempt,
                    "interrupted attempt marked failed"
                );
                report.interrupted_attempts += 1;
            }
        }

        for run in self.store.list_active_runs().await? {
            match self.advance(run.id, None).await {
                Ok(_) => report.runs_reconciled += 1,
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "failed to reconcile run");
                    report.runs_failed_to_reconcile += 1;
                }
            }
        }

        tracing::info!(
            interrupted = report.interrupted_attempts,
            reconciled = report.runs_reconciled,
            failed = report.runs_failed_to_reconcile,
            "recovery complete"
        );
        self.dispatcher.wake();
        Ok(report)
    }

    /// Advance every active run with no open attempt.
    ///
    /// A run whose last attempt was recorded while its `advance` failed (for
    /// example on a storage outage) has nothing left for the dispatcher to
    /// claim; this picks it up again. Returns how many runs were advanced.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_stalled(&self) -> Result<usize, EngineError> {
        let mut advanced = 0;
        for run in self.store.list_active_runs().await? {
            let rows = self.store.list_step_executions(&run.id).await?;
            if rows.iter().any(|r| !r.status.is_terminal()) {
                continue;
            }
            match self.advance(run.id, None).await {
                Ok(status) => {
                    tracing::info!(run_id = %run.id, %status, "stalled run advanced");
                    advanced += 1;
                }
                Err(e) => tracing::error!(run_id = %run.id, error = %e, "failed to advance stalled run"),
            }
        }
        if advanced > 0 {
            self.dispatcher.wake();
        }
        Ok(advanced)
    }

    // -----------------------------------------------------------------------
    // External interface
    // -----------------------------------------------------------------------

    /// Run plus one entry per definition step, in definition order.
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunStatusView, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let rows = self.store.list_step_executions(&run_id).await?;
        let def = self
            .cache
            .definition(self.store.as_ref(), run.workflow_id, run.workflow_version)
            .await?;

        let mut step_ids: Vec<String> = match &def {
            Some(def) => def.steps.iter().map(|s| s.id.clone()).collect(),
            None => Vec::new(),
        };
        for row in &rows {
            if !step_ids.contains(&row.step_id) {
                step_ids.push(row.step_id.clone());
            }
        }

        let steps = step_ids
            .into_iter()
            .map(|step_id| {
                let attempts: Vec<&StepExecution> =
                    rows.iter().filter(|r| r.step_id == step_id).collect();
                let last = attempts.iter().max_by_key(|r| r.attempt);
                StepView {
                    status: last.map(|r| r.status),
                    attempts: attempts.len() as u32,
                    last_error: attempts
                        .iter()
                        .filter(|r| r.error.is_some())
                        .max_by_key(|r| r.attempt)
                        .and_then(|r| r.error.clone()),
                    output: last.and_then(|r| r.output.clone()),
                    step_id,
                }
            })
            .collect();

        Ok(RunStatusView { run, steps })
    }

    /// Cancel a run. No-op when it is already terminal.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            tracing::debug!(status = %run.status, "run already terminal, nothing to cancel");
            return Ok(run.status);
        }

        let now = self.clock.now();
        let rows = self.store.list_step_executions(&run_id).await?;
        let cancelled = self.cancel_open_attempts(&rows, now).await?;
        if let Some((_, token)) = self.run_tokens.remove(&run_id) {
            token.cancel();
        }

        let updated = self
            .with_storage_retry("cancel run", || {
                self.store.update_run_status(
                    &run_id,
                    run.status,
                    RunStatus::Cancelled,
                    None,
                    None,
                    now,
                )
            })
            .await?;
        if !updated {
            return Ok(self
                .store
                .get_run(&run_id)
                .await?
                .map(|r| r.status)
                .ok_or(EngineError::RunNotFound(run_id))?);
        }
        tracing::debug!(cancelled_attempts = cancelled, "open attempts cancelled");
        self.finish_run(run_id, RunStatus::Cancelled, None);
        Ok(RunStatus::Cancelled)
    }

    /// One page of a workflow's runs, newest first.
    ///
    /// `cursor` is the `next_cursor` of the previous page. The sequence is
    /// finite and can be restarted from any cursor.
    pub async fn list_runs_by_workflow(
        &self,
        workflow_id: Uuid,
        filter: &RunFilter,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RunPage, EngineError> {
        let before = cursor
            .map(|c| Uuid::parse_str(c).map_err(|_| EngineError::InvalidCursor(c.to_string())))
            .transpose()?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut runs = self
            .store
            .list_runs(&workflow_id, filter, before, limit + 1)
            .await?;
        let next_cursor = if runs.len() > limit as usize {
            runs.truncate(limit as usize);
            runs.last().map(|r| r.id.to_string())
        } else {
            None
        };
        Ok(RunPage { runs, next_cursor })
    }

    /// Aggregate run counts and recent runs of a workflow.
    pub async fn workflow_stats(&self, workflow_id: Uuid) -> Result<WorkflowStats, EngineError> {
        let counts = self.store.run_status_counts(&workflow_id).await?;
        let count_of = |status: RunStatus| {
            counts
                .iter()
                .find(|(s, _)| *s == status)
                .map_or(0, |(_, n)| *n)
        };
        let succeeded = count_of(RunStatus::Succeeded);
        let finished = succeeded + count_of(RunStatus::Failed) + count_of(RunStatus::Cancelled);

        let recent_runs = self
            .store
            .list_runs(&workflow_id, &RunFilter::default(), None, RECENT_RUNS)
            .await?;

        Ok(WorkflowStats {
            workflow_id,
            total_runs: counts.iter().map(|(_, n)| n).sum(),
            by_status: counts
                .iter()
                .map(|(s, n)| (s.as_str().to_string(), *n))
                .collect(),
            success_rate: (finished > 0).then(|| succeeded as f64 / finished as f64),
            recent_runs,
        })
    }

    /// Deliver a trigger event. Returns the run it created, the run an
    /// earlier delivery of the same occurrence created, or `None` when the
    /// `when` clause suppressed it.
    #[tracing::instrument(skip(self, event), fields(trigger_id = %event.trigger_id))]
    pub async fn fire_trigger(&self, event: TriggerEvent) -> Result<Option<Uuid>, EngineError> {
        let binding = self
            .triggers
            .get(&event.trigger_id)
            .await
            .ok_or_else(|| EngineError::TriggerNotFound(event.trigger_id.clone()))?;

        if !binding.evaluate_when(&event)? {
            tracing::warn!(workflow = %binding.workflow_name, "trigger suppressed by when clause");
            return Ok(None);
        }

        let correlation_id = event.correlation_id();
        let filter = RunFilter {
            correlation_id: Some(correlation_id.clone()),
            ..RunFilter::default()
        };
        if let Some(existing) = self
            .store
            .list_runs(&binding.workflow_id, &filter, None, 1)
            .await?
            .into_iter()
            .next()
        {
            tracing::debug!(run_id = %existing.id, "occurrence already delivered");
            return Ok(Some(existing.id));
        }

        let started = self
            .start_run(
                binding.workflow_id,
                Some(binding.workflow_version),
                seed_context(event.event_data),
                Some(correlation_id),
                Some(event.trigger_id),
            )
            .await;
        match started {
            Ok(run_id) => Ok(Some(run_id)),
            // A concurrent delivery of the same occurrence won the insert.
            Err(EngineError::Storage(StorageError::Conflict(detail))) => {
                let existing = self
                    .store
                    .list_runs(&binding.workflow_id, &filter, None, 1)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(EngineError::Storage(StorageError::Conflict(detail)))?;
                tracing::debug!(run_id = %existing.id, "occurrence delivered concurrently");
                Ok(Some(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver `event_data` to the webhook trigger serving `path`.
    pub async fn fire_webhook(&self, path: &str, event_data: Value) -> Result<Option<Uuid>, EngineError> {
        let binding = self
            .triggers
            .resolve_webhook(path)
            .await
            .ok_or_else(|| EngineError::TriggerNotFound(path.to_string()))?;
        self.fire_trigger(TriggerEvent::new(binding.trigger.id, event_data))
            .await
    }

    /// Wait until a run is terminal and return it.
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<ExecutionRun, EngineError> {
        let mut rx = self.events.subscribe();
        loop {
            let run = self
                .store
                .get_run(&run_id)
                .await?
                .ok_or(EngineError::RunNotFound(run_id))?;
            if run.status.is_terminal() {
                return Ok(run);
            }

            // Re-check the store on the run's terminal event, on lag, or
            // after one poll interval (another process may own the run).
            let recheck = tokio::time::sleep(self.config.poll_interval());
            tokio::pin!(recheck);
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) if event.run_id() == run_id && event.is_run_terminal() => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => break,
                    },
                    _ = &mut recheck => break,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cron integration
    // -----------------------------------------------------------------------

    /// Register every bound schedule trigger with `scheduler`.
    pub async fn schedule_triggers(
        self: &Arc<Self>,
        scheduler: &CronScheduler,
    ) -> Result<usize, EngineError> {
        let schedules = self.triggers.schedule_triggers().await;
        for (trigger_id, cron) in &schedules {
            let engine = Arc::clone(self);
            let callback: CronCallback = Arc::new(move |trigger_id, fired_at| {
                let engine = Arc::clone(&engine);
                Box::pin(async move {
                    engine.fire_scheduled(trigger_id, fired_at).await;
                }) as BoxFuture<'static, ()>
            });
            scheduler.schedule_trigger(trigger_id, cron, callback).await?;
        }
        Ok(schedules.len())
    }

    /// Fire each schedule trigger once for its most recent occurrence missed
    /// since the last run it created. Returns how many catch-up runs fired.
    pub async fn catch_up_missed_fires(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut fired = 0;
        for (trigger_id, cron) in self.triggers.schedule_triggers().await {
            let Some(binding) = self.triggers.get(&trigger_id).await else {
                continue;
            };
            let schedule = match Schedule::parse(&cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(%trigger_id, error = %e, "skipping missed-fire check");
                    continue;
                }
            };
            let filter = RunFilter {
                trigger_id: Some(trigger_id.clone()),
                ..RunFilter::default()
            };
            // No earlier run means no baseline to catch up from.
            let Some(last_fired) = self
                .store
                .list_runs(&binding.workflow_id, &filter, None, 1)
                .await?
                .into_iter()
                .next()
                .map(|run| run.created_at)
            else {
                continue;
            };

            let missed = schedule.occurrences_between(last_fired, now);
            let Some(occurred_at) = missed.last().copied() else {
                continue;
            };
            tracing::warn!(
                %trigger_id,
                missed = missed.len(),
                %occurred_at,
                "catching up missed schedule"
            );
            self.fire_scheduled(trigger_id, occurred_at).await;
            fired += 1;
        }
        Ok(fired)
    }

    async fn fire_scheduled(&self, trigger_id: String, occurred_at: DateTime<Utc>) {
        let event = TriggerEvent {
            trigger_id,
            occurred_at,
            event_data: json!({ "scheduled_at": occurred_at.to_rfc3339() }),
        };
        let trigger_id = event.trigger_id.clone();
        match self.fire_trigger(event).await {
            Ok(Some(run_id)) => tracing::info!(%trigger_id, %run_id, "schedule fired"),
            Ok(None) => {}
            Err(e) => tracing::error!(%trigger_id, error = %e, "schedule fire failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn run_lock(&self, run_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.run_locks.entry(run_id).or_default().value())
    }

    /// Token for a dispatched attempt about to execute, shared by every
    /// in-flight attempt of its run. `None` when the run is already terminal
    /// or the attempt has left `Dispatched`; such an attempt must not run.
    async fn claim_run_token(
        &self,
        dispatched: &DispatchedStep,
    ) -> Result<Option<CancellationToken>, EngineError> {
        let run_id = dispatched.run_id();
        let row_id = dispatched.execution.id;
        let lock = self.run_lock(run_id);
        let guard = lock.lock().await;

        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            let cancel = StepTransition::to(StepStatus::Cancelled)
                .with_error(StepExecutionError::Cancelled)
                .finished(self.clock.now());
            let applied = self
                .with_storage_retry("cancel attempt", || {
                    self.store
                        .transition_step(&row_id, StepStatus::Dispatched, &cancel)
                })
                .await?;
            tracing::debug!(%run_id, status = %run.status, cancelled = applied, "run finished before attempt started");
            drop(guard);
            drop(lock);
            self.run_locks
                .remove_if(&run_id, |_, l| Arc::strong_count(l) == 1);
            return Ok(None);
        }

        let current = self
            .store
            .get_step_execution(&row_id)
            .await?
            .ok_or(EngineError::StepExecutionNotFound(row_id))?;
        if current.status != StepStatus::Dispatched {
            tracing::debug!(%run_id, status = %current.status, "attempt no longer dispatched, skipping");
            return Ok(None);
        }
        Ok(Some(self.run_tokens.entry(run_id).or_default().value().clone()))
    }

    /// Latest attempt per step. More than one open attempt is an invariant
    /// violation.
    fn latest_attempts(
        &self,
        run_id: Uuid,
        rows: &[StepExecution],
    ) -> Result<HashMap<String, StepExecution>, EngineError> {
        let mut latest: HashMap<String, StepExecution> = HashMap::new();
        let mut open: HashMap<&str, u32> = HashMap::new();
        for row in rows {
            if !row.status.is_terminal() {
                let n = open.entry(row.step_id.as_str()).or_default();
                *n += 1;
                if *n > 1 {
                    return Err(self.invariant(
                        run_id,
                        format!("step '{}' has more than one open attempt", row.step_id),
                    ));
                }
            }
            match latest.get(&row.step_id) {
                Some(current) if current.attempt >= row.attempt => {}
                _ => {
                    latest.insert(row.step_id.clone(), row.clone());
                }
            }
        }
        Ok(latest)
    }

    async fn insert_attempt(&self, row: &StepExecution) -> Result<(), EngineError> {
        match self
            .with_storage_retry("insert step execution", || {
                self.store.insert_step_execution(row)
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict(detail)) => Err(self.invariant(
                row.run_id,
                format!(
                    "attempt {} of step '{}' rejected: {detail}",
                    row.attempt, row.step_id
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn with_storage_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        retry_storage(
            what,
            self.config.storage_retry_attempts,
            self.config.storage_retry_backoff(),
            op,
        )
        .await
    }

    fn invariant(&self, run_id: Uuid, detail: String) -> EngineError {
        tracing::error!(%run_id, %detail, "invariant violation, halting run processing");
        EngineError::InvariantViolation { run_id, detail }
    }
}

impl<S: ExecutionStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dispatcher", &self.dispatcher)
            .field("active_runs", &self.run_tokens.len())
            .finish_non_exhaustive()
    }
}

fn is_terminal_failure(row: &StepExecution) -> bool {
    matches!(row.status, StepStatus::Failed | StepStatus::Cancelled)
}

fn describe_failure(row: &StepExecution) -> String {
    match &row.error {
        Some(error) => format!("step '{}' failed: {error}", row.step_id),
        None => format!("step '{}' {}", row.step_id, row.status),
    }
}

fn add_delay(at: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionStore;
    use businessflow_types::workflow::{RetryPolicy, StepDefinition};

    fn engine() -> Engine<InMemoryExecutionStore> {
        Engine::new(
            Arc::new(InMemoryExecutionStore::new()),
            ConnectorRegistry::with_builtins(),
            EngineConfig::default(),
        )
    }

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            version: 0,
            name: "engine-unit".into(),
            description: None,
            is_active: true,
            concurrency: None,
            triggers: vec![],
            steps,
            metadata: Default::default(),
        }
    }

    fn step(id: &str, deps: &[&str], condition: Option<&str>) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            name: id.into(),
            capability: "noop".into(),
            input: json!({}),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: condition.map(str::to_string),
            retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    #[test]
    fn test_add_delay_saturates() {
        let at = Utc::now();
        assert_eq!(
            add_delay(at, std::time::Duration::from_secs(1)),
            at + TimeDelta::seconds(1)
        );
        assert_eq!(
            add_delay(at, std::time::Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn test_create_run_queues_roots_only() {
        let engine = engine();
        let def = engine
            .publish_definition(definition(vec![step("a", &[], None), step("b", &["a"], None)]))
            .await
            .unwrap();

        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();
        let view = engine.get_run_status(run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Running);
        assert_eq!(view.steps[0].status, Some(StepStatus::Queued));
        assert_eq!(view.steps[1].status, None);
        assert_eq!(view.steps[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_skipped_dependency_satisfies_dependents() {
        let engine = engine();
        let def = engine
            .publish_definition(definition(vec![
                step("a", &[], Some("context.enabled == true")),
                step("b", &["a"], None),
            ]))
            .await
            .unwrap();
        let run_id = engine
            .create_run(def.id, None, json!({ "enabled": false }), None)
            .await
            .unwrap();
        let view = engine.get_run_status(run_id).await.unwrap();
        assert_eq!(view.steps[0].status, Some(StepStatus::Skipped));
        assert_eq!(view.steps[1].status, Some(StepStatus::Queued));
    }

    #[tokio::test]
    async fn test_all_skipped_run_succeeds_immediately() {
        let engine = engine();
        let def = engine
            .publish_definition(definition(vec![step("a", &[], Some("context.enabled == true"))]))
            .await
            .unwrap();
        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();
        let run = engine.wait_for_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.context["steps"]["a"]["output"], Value::Null);
    }

    #[tokio::test]
    async fn test_create_run_errors() {
        let engine = engine();
        let missing = Uuid::now_v7();
        assert!(matches!(
            engine.create_run(missing, None, json!({}), None).await,
            Err(EngineError::DefinitionNotFound { workflow_id }) if workflow_id == missing
        ));

        let def = engine
            .publish_definition(definition(vec![step("a", &[], None)]))
            .await
            .unwrap();
        assert!(matches!(
            engine.create_run(def.id, Some(7), json!({}), None).await,
            Err(EngineError::VersionMismatch { requested: 7, latest: 1, .. })
        ));

        let mut inactive = def.clone();
        inactive.is_active = false;
        engine.publish_definition(inactive).await.unwrap();
        assert!(matches!(
            engine.create_run(def.id, Some(1), json!({}), None).await,
            Err(EngineError::WorkflowInactive(_))
        ));
    }

    #[tokio::test]
    async fn test_condition_error_fails_run() {
        let engine = engine();
        // Stored directly: publishing rejects the malformed condition.
        let mut def = definition(vec![
            step("a", &[], Some("context.count >")),
            step("b", &["a"], None),
        ]);
        def.version = 1;
        engine.store().insert_definition(&def).await.unwrap();

        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();
        let view = engine.get_run_status(run_id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Failed);
        assert_eq!(view.steps[0].status, Some(StepStatus::Failed));
        assert!(matches!(
            view.steps[0].last_error,
            Some(StepExecutionError::Condition { .. })
        ));
        assert_eq!(view.steps[1].attempts, 0);
        assert!(view.run.error.unwrap().contains("step 'a'"));
    }

    #[tokio::test]
    async fn test_cursor_validation() {
        let engine = engine();
        assert!(matches!(
            engine
                .list_runs_by_workflow(Uuid::now_v7(), &RunFilter::default(), Some("nope"), 10)
                .await,
            Err(EngineError::InvalidCursor(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_step_execution_reported() {
        let engine = engine();
        let id = Uuid::now_v7();
        assert!(matches!(
            engine.report_completion(id, StepOutcome::succeeded(json!(1))).await,
            Err(EngineError::StepExecutionNotFound(missing)) if missing == id
        ));
    }

    // -----------------------------------------------------------------------
    // Attempts claimed around a cancel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_process_skips_attempt_of_finished_run() {
        let engine = engine();
        let def = engine
            .publish_definition(definition(vec![step("a", &[], None)]))
            .await
            .unwrap();
        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();

        let shutdown = CancellationToken::new();
        let dispatched = engine.dispatcher().dispatch_next(&shutdown).await.unwrap().unwrap();
        let attempt_id = dispatched.execution.id;
        assert_eq!(engine.cancel_run(run_id).await.unwrap(), RunStatus::Cancelled);

        assert_eq!(engine.process(dispatched).await.unwrap(), None);
        assert!(engine.run_tokens.is_empty());
        assert!(engine.run_locks.is_empty());
        let row = engine.store().get_step_execution(&attempt_id).await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Cancelled);
        assert!(row.output.is_none());
    }

    #[tokio::test]
    async fn test_process_skips_attempt_no_longer_dispatched() {
        let engine = engine();
        let def = engine
            .publish_definition(definition(vec![step("a", &[], None)]))
            .await
            .unwrap();
        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();

        let shutdown = CancellationToken::new();
        let dispatched = engine.dispatcher().dispatch_next(&shutdown).await.unwrap().unwrap();
        let attempt_id = dispatched.execution.id;
        let timed_out = StepTransition::to(StepStatus::Failed)
            .with_error(StepExecutionError::Timeout { timeout_ms: 1 })
            .finished(Utc::now());
        assert!(engine
            .store()
            .transition_step(&attempt_id, StepStatus::Dispatched, &timed_out)
            .await
            .unwrap());

        assert_eq!(engine.process(dispatched).await.unwrap(), None);
        assert!(engine.run_tokens.is_empty());
        let row = engine.store().get_step_execution(&attempt_id).await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Failed);
        let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    // -----------------------------------------------------------------------
    // Stalled runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconcile_stalled_advances_idle_runs_only() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let config = EngineConfig {
            storage_retry_attempts: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::new(Arc::clone(&store), ConnectorRegistry::with_builtins(), config);
        let def = engine
            .publish_definition(definition(vec![step("a", &[], None)]))
            .await
            .unwrap();
        let stalled = engine.create_run(def.id, None, json!({}), None).await.unwrap();

        let shutdown = CancellationToken::new();
        let dispatched = engine.dispatcher().dispatch_next(&shutdown).await.unwrap().unwrap();
        let attempt_id = dispatched.execution.id;
        drop(dispatched);
        record_outcome(
            store.as_ref(),
            engine.events(),
            engine.config(),
            attempt_id,
            &StepOutcome::succeeded(json!({ "done": true })),
            Utc::now(),
        )
        .await
        .unwrap();
        store.fail_next_writes(10);
        assert!(engine.advance(stalled, Some(attempt_id)).await.is_err());
        store.fail_next_writes(0);

        // A run with a queued attempt is not stalled.
        let busy = engine.create_run(def.id, None, json!({}), None).await.unwrap();

        assert_eq!(engine.reconcile_stalled().await.unwrap(), 1);
        let run = engine.store().get_run(&stalled).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.context["steps"]["a"]["output"], json!({ "done": true }));
        let run = engine.store().get_run(&busy).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);

        assert_eq!(engine.reconcile_stalled().await.unwrap(), 0);
    }

    // -----------------------------------------------------------------------
    // Schedule catch-up
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_fires_latest_missed_occurrence_once() {
        use super::super::clock::InstantClock;
        use businessflow_types::workflow::{TriggerDefinition, TriggerKind};

        let anchor: DateTime<Utc> = "2026-03-01T09:00:30Z".parse().unwrap();
        let engine = Engine::with_clock(
            Arc::new(InMemoryExecutionStore::new()),
            ConnectorRegistry::with_builtins(),
            EngineConfig::default(),
            Arc::new(InstantClock::anchored_at(anchor)),
        );
        let mut def = definition(vec![step("a", &[], None)]);
        def.triggers = vec![TriggerDefinition {
            id: "minutely-sync".into(),
            kind: TriggerKind::Schedule {
                cron: "every minute".into(),
                timezone: None,
            },
            when: None,
        }];
        let def = engine.publish_definition(def).await.unwrap();

        // No run yet: nothing to catch up from.
        assert_eq!(engine.catch_up_missed_fires().await.unwrap(), 0);

        engine
            .fire_trigger(TriggerEvent {
                trigger_id: "minutely-sync".into(),
                occurred_at: "2026-03-01T09:00:00Z".parse().unwrap(),
                event_data: json!({}),
            })
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(std::time::Duration::from_secs(300)).await;

        assert_eq!(engine.catch_up_missed_fires().await.unwrap(), 1);
        let page = engine
            .list_runs_by_workflow(def.id, &RunFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(page.runs.len(), 2);
        let latest_missed = TriggerEvent {
            trigger_id: "minutely-sync".into(),
            occurred_at: "2026-03-01T09:05:00Z".parse().unwrap(),
            event_data: Value::Null,
        };
        let filter = RunFilter {
            correlation_id: Some(latest_missed.correlation_id()),
            ..RunFilter::default()
        };
        let caught_up = engine
            .list_runs_by_workflow(def.id, &filter, None, 10)
            .await
            .unwrap();
        assert_eq!(caught_up.runs.len(), 1);

        assert_eq!(engine.catch_up_missed_fires().await.unwrap(), 0);
    }
}
