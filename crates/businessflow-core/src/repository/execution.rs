//! Execution store trait definition.
//!
//! Defines the storage interface for workflow definitions, execution runs,
//! and per-attempt step executions. The infrastructure layer
//! (businessflow-infra) implements this trait with SQLite persistence; the
//! in-memory implementation in this crate backs tests and embedded use.

use businessflow_types::error::StorageError;
use businessflow_types::execution::{
    ExecutionRun, RunFilter, RunStatus, StepExecution, StepStatus, StepTransition,
};
use businessflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Repository trait for engine persistence.
///
/// Covers three entity families:
/// - **Definitions:** append-only, versioned workflow definitions.
/// - **Runs:** create, compare-and-set status updates, keyset listing.
/// - **Step executions:** one row per attempt, compare-and-set transitions,
///   and the "queued and due" index the dispatcher scans.
///
/// Implementations must enforce that at most one attempt per (run, step) is
/// non-terminal and that attempt numbers strictly increase; violating inserts
/// fail with [`StorageError::Conflict`].
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a definition version. `Conflict` if (id, version) exists.
    fn insert_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Get one definition version.
    fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StorageError>> + Send;

    /// Get the highest published version of a definition.
    fn latest_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StorageError>> + Send;

    /// List the latest version of every definition, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &ExecutionRun,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRun>, StorageError>> + Send;

    /// Compare-and-set a run's status.
    ///
    /// Applies only when the stored status equals `expected`; `expected ==
    /// new` updates context/error without a status change. Sets `finished_at`
    /// when `new` is terminal. Returns whether the row was updated.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        expected: RunStatus,
        new: RunStatus,
        error: Option<&str>,
        context: Option<&Value>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;

    /// List runs of a workflow, newest first, strictly older than `before`.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        filter: &RunFilter,
        before: Option<Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRun>, StorageError>> + Send;

    /// Runs left in `Pending` or `Running` (crash recovery).
    fn list_active_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRun>, StorageError>> + Send;

    /// Number of runs per status for a workflow.
    fn run_status_counts(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<(RunStatus, u64)>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Insert a new attempt row.
    fn insert_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Compare-and-set an attempt's status and write the accompanying fields.
    ///
    /// Returns whether the stored status equaled `expected` and the update
    /// was applied. Terminal rows are never modified.
    fn transition_step(
        &self,
        id: &Uuid,
        expected: StepStatus,
        update: &StepTransition,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;

    /// Get an attempt by its UUID.
    fn get_step_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, StorageError>> + Send;

    /// All attempts of a run, ordered by (queued_at, attempt).
    fn list_step_executions(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, StorageError>> + Send;

    /// Queued attempts whose `not_before` has passed, oldest first
    /// (ordered by queued_at, then id). Attempts of `exclude_runs` are
    /// skipped before `limit` applies.
    fn due_step_executions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        exclude_runs: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, StorageError>> + Send;

    /// Earliest time any queued attempt becomes due.
    fn next_due_at(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>, StorageError>> + Send;

    /// Number of dispatched attempts of a run.
    fn count_in_flight(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, StorageError>> + Send;

    /// Every attempt currently in `Dispatched` (crash recovery).
    fn list_dispatched(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, StorageError>> + Send;
}
