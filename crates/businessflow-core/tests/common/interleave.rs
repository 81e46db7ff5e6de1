//! Store wrapper that forces interleavings the scheduler would only hit under
//! real contention: a worker claiming an attempt between a cancel's read and
//! its compare-and-set, and a concurrent trigger delivery winning the insert.

use std::sync::atomic::{AtomicBool, Ordering};

use businessflow_core::repository::{ExecutionStore, InMemoryExecutionStore};
use businessflow_types::error::StorageError;
use businessflow_types::execution::{
    ExecutionRun, RunFilter, RunStatus, StepExecution, StepStatus, StepTransition,
};
use businessflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Default)]
pub struct InterleavingStore {
    inner: InMemoryExecutionStore,
    claim_before_cancel: AtomicBool,
    hide_next_occurrence: AtomicBool,
}

impl InterleavingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryExecutionStore {
        &self.inner
    }

    /// The next Queued -> Cancelled transition finds the row already claimed
    /// by a worker (Queued -> Dispatched happens first).
    pub fn claim_before_next_cancel(&self) {
        self.claim_before_cancel.store(true, Ordering::SeqCst);
    }

    /// The next run lookup by correlation id sees nothing, as if a concurrent
    /// delivery inserted its run right after the lookup.
    pub fn hide_next_occurrence_lookup(&self) {
        self.hide_next_occurrence.store(true, Ordering::SeqCst);
    }
}

impl ExecutionStore for InterleavingStore {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StorageError> {
        self.inner.insert_definition(def).await
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StorageError> {
        self.inner.get_definition(id, version).await
    }

    async fn latest_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StorageError> {
        self.inner.latest_definition(id).await
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StorageError> {
        self.inner.list_definitions().await
    }

    async fn create_run(&self, run: &ExecutionRun) -> Result<(), StorageError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ExecutionRun>, StorageError> {
        self.inner.get_run(run_id).await
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        expected: RunStatus,
        new: RunStatus,
        error: Option<&str>,
        context: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.inner
            .update_run_status(run_id, expected, new, error, context, now)
            .await
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        filter: &RunFilter,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ExecutionRun>, StorageError> {
        if filter.correlation_id.is_some() && self.hide_next_occurrence.swap(false, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        self.inner.list_runs(workflow_id, filter, before, limit).await
    }

    async fn list_active_runs(&self) -> Result<Vec<ExecutionRun>, StorageError> {
        self.inner.list_active_runs().await
    }

    async fn run_status_counts(&self, workflow_id: &Uuid) -> Result<Vec<(RunStatus, u64)>, StorageError> {
        self.inner.run_status_counts(workflow_id).await
    }

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<(), StorageError> {
        self.inner.insert_step_execution(step).await
    }

    async fn transition_step(
        &self,
        id: &Uuid,
        expected: StepStatus,
        update: &StepTransition,
    ) -> Result<bool, StorageError> {
        if expected == StepStatus::Queued
            && update.status == Some(StepStatus::Cancelled)
            && self.claim_before_cancel.swap(false, Ordering::SeqCst)
        {
            let claim = StepTransition::to(StepStatus::Dispatched).started(Utc::now());
            self.inner.transition_step(id, StepStatus::Queued, &claim).await?;
        }
        self.inner.transition_step(id, expected, update).await
    }

    async fn get_step_execution(&self, id: &Uuid) -> Result<Option<StepExecution>, StorageError> {
        self.inner.get_step_execution(id).await
    }

    async fn list_step_executions(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, StorageError> {
        self.inner.list_step_executions(run_id).await
    }

    async fn due_step_executions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        exclude_runs: &[Uuid],
    ) -> Result<Vec<StepExecution>, StorageError> {
        self.inner.due_step_executions(now, limit, exclude_runs).await
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.inner.next_due_at().await
    }

    async fn count_in_flight(&self, run_id: &Uuid) -> Result<u32, StorageError> {
        self.inner.count_in_flight(run_id).await
    }

    async fn list_dispatched(&self) -> Result<Vec<StepExecution>, StorageError> {
        self.inner.list_dispatched().await
    }
}
