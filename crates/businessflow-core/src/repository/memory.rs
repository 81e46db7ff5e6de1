//! In-memory implementation of `ExecutionStore`.
//!
//! Provides the same semantics as the SQLite implementation (attempt
//! invariant, compare-and-set transitions, due ordering) behind
//! `parking_lot` locks. Used by tests and by embedders that do not need
//! durability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use businessflow_types::error::StorageError;
use businessflow_types::execution::{
    ExecutionRun, RunFilter, RunStatus, StepExecution, StepStatus, StepTransition,
};
use businessflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::execution::ExecutionStore;

/// In-memory execution store.
///
/// # Example
///
/// ```
/// use businessflow_core::repository::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryExecutionStore {
    definitions: RwLock<HashMap<(Uuid, u32), WorkflowDefinition>>,
    runs: RwLock<HashMap<Uuid, ExecutionRun>>,
    steps: RwLock<HashMap<Uuid, StepExecution>>,
    /// Remaining write operations that fail with a transient error.
    failing_writes: AtomicU32,
}

impl InMemoryExecutionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Number of stored runs.
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Make the next `n` write operations fail with a connection error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StorageError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Connection("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StorageError> {
        self.check_write()?;
        let mut defs = self.definitions.write();
        let key = (def.id, def.version);
        if defs.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "definition {} version {} already exists",
                def.id, def.version
            )));
        }
        defs.insert(key, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StorageError> {
        Ok(self.definitions.read().get(&(*id, version)).cloned())
    }

    async fn latest_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StorageError> {
        Ok(self
            .definitions
            .read()
            .values()
            .filter(|d| d.id == *id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StorageError> {
        let defs = self.definitions.read();
        let mut latest: HashMap<Uuid, &WorkflowDefinition> = HashMap::new();
        for def in defs.values() {
            let entry = latest.entry(def.id).or_insert(def);
            if def.version > entry.version {
                *entry = def;
            }
        }
        let mut result: Vec<WorkflowDefinition> = latest.into_values().cloned().collect();
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &ExecutionRun) -> Result<(), StorageError> {
        self.check_write()?;
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StorageError::Conflict(format!("run {} already exists", run.id)));
        }
        if let (Some(correlation_id), Some(_)) = (&run.correlation_id, &run.trigger_id) {
            let delivered = runs.values().any(|r| {
                r.workflow_id == run.workflow_id
                    && r.trigger_id.is_some()
                    && r.correlation_id.as_ref() == Some(correlation_id)
            });
            if delivered {
                return Err(StorageError::Conflict(format!(
                    "occurrence {correlation_id} already has a run"
                )));
            }
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ExecutionRun>, StorageError> {
        Ok(self.runs.read().get(run_id).cloned())
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
        self.check_write()?;
        let mut runs = self.runs.write();
        let run = runs.get_mut(run_id).ok_or(StorageError::NotFound)?;
        if run.status != expected {
            return Ok(false);
        }
        run.status = new;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        if let Some(context) = context {
            run.context = context.clone();
        }
        run.updated_at = now;
        if new.is_terminal() {
            run.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        filter: &RunFilter,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ExecutionRun>, StorageError> {
        let runs = self.runs.read();
        let mut result: Vec<ExecutionRun> = runs
            .values()
            .filter(|r| r.workflow_id == *workflow_id)
            .filter(|r| before.is_none_or(|b| r.id < b))
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.id.cmp(&a.id));
        result.truncate(limit as usize);
        Ok(result)
    }

    async fn list_active_runs(&self) -> Result<Vec<ExecutionRun>, StorageError> {
        let mut result: Vec<ExecutionRun> = self
            .runs
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|r| r.id);
        Ok(result)
    }

    async fn run_status_counts(&self, workflow_id: &Uuid) -> Result<Vec<(RunStatus, u64)>, StorageError> {
        let mut counts: HashMap<RunStatus, u64> = HashMap::new();
        for run in self.runs.read().values().filter(|r| r.workflow_id == *workflow_id) {
            *counts.entry(run.status).or_default() += 1;
        }
        let mut result: Vec<(RunStatus, u64)> = counts.into_iter().collect();
        result.sort_by_key(|(s, _)| s.as_str());
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    async fn insert_step_execution(&self, step: &StepExecution) -> Result<(), StorageError> {
        self.check_write()?;
        let mut steps = self.steps.write();
        for existing in steps
            .values()
            .filter(|s| s.run_id == step.run_id && s.step_id == step.step_id)
        {
            if existing.attempt >= step.attempt {
                return Err(StorageError::Conflict(format!(
                    "step '{}' of run {} already has attempt {}",
                    step.step_id, step.run_id, existing.attempt
                )));
            }
            if !existing.status.is_terminal() && !step.status.is_terminal() {
                return Err(StorageError::Conflict(format!(
                    "step '{}' of run {} already has a non-terminal attempt",
                    step.step_id, step.run_id
                )));
            }
        }
        steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn transition_step(
        &self,
        id: &Uuid,
        expected: StepStatus,
        update: &StepTransition,
    ) -> Result<bool, StorageError> {
        self.check_write()?;
        let mut steps = self.steps.write();
        let row = steps.get_mut(id).ok_or(StorageError::NotFound)?;
        if row.status != expected || expected.is_terminal() {
            return Ok(false);
        }
        update.apply(row);
        Ok(true)
    }

    async fn get_step_execution(&self, id: &Uuid) -> Result<Option<StepExecution>, StorageError> {
        Ok(self.steps.read().get(id).cloned())
    }

    async fn list_step_executions(&self, run_id: &Uuid) -> Result<Vec<StepExecution>, StorageError> {
        let mut result: Vec<StepExecution> = self
            .steps
            .read()
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then(a.attempt.cmp(&b.attempt))
                .then(a.id.cmp(&b.id))
        });
        Ok(result)
    }

    async fn due_step_executions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        exclude_runs: &[Uuid],
    ) -> Result<Vec<StepExecution>, StorageError> {
        let mut result: Vec<StepExecution> = self
            .steps
            .read()
            .values()
            .filter(|s| s.is_due(now) && !exclude_runs.contains(&s.run_id))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        result.truncate(limit as usize);
        Ok(result)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .steps
            .read()
            .values()
            .filter(|s| s.status == StepStatus::Queued)
            .map(|s| s.not_before.unwrap_or(s.queued_at))
            .min())
    }

    async fn count_in_flight(&self, run_id: &Uuid) -> Result<u32, StorageError> {
        Ok(self
            .steps
            .read()
            .values()
            .filter(|s| s.run_id == *run_id && s.status == StepStatus::Dispatched)
            .count() as u32)
    }

    async fn list_dispatched(&self) -> Result<Vec<StepExecution>, StorageError> {
        let mut result: Vec<StepExecution> = self
            .steps
            .read()
            .values()
            .filter(|s| s.status == StepStatus::Dispatched)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.id);
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
