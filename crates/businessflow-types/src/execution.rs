//! Execution-side types: runs, per-attempt step executions, statuses and the
//! read models returned by the engine's external interface.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of an execution run.
///
/// `Pending -> Running -> {Succeeded, Failed, Cancelled}`; `Pending` may also
/// move straight to `Cancelled`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Status of a single step attempt.
///
/// `Queued -> Dispatched -> {Succeeded, Failed}`. `Skipped` rows are written
/// directly when a condition is false and are never dispatched. `Queued` and
/// `Dispatched` rows become `Cancelled` when their run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Queued | StepStatus::Dispatched)
    }

    /// Succeeded or skipped: downstream steps may proceed.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Dispatched => "dispatched",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(StepStatus::Queued),
            "dispatched" => Ok(StepStatus::Dispatched),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution Run
// ---------------------------------------------------------------------------

/// One execution of a specific workflow definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    /// Run ID (UUIDv7, time-sortable).
    pub id: Uuid,
    /// Workflow ID.
    pub workflow_id: Uuid,
    /// Definition version this run executes. Never changes.
    pub workflow_version: u32,
    /// Workflow name at the time of creation.
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// Run context: seeded at start, step outputs added under `steps`.
    pub context: Value,
    /// Trigger occurrence or caller-supplied correlation ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Trigger that created the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// Most specific known failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last status or context change.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Step Execution
// ---------------------------------------------------------------------------

/// One attempt at running one step of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Attempt ID.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Step ID within the definition.
    pub step_id: String,
    /// 1-based attempt number. Strictly increasing per (run, step).
    pub attempt: u32,
    /// Attempt status.
    pub status: StepStatus,
    /// Resolved input snapshot. None until first dispatch; retries copy it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Connector output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepExecutionError>,
    /// Earliest dispatch time (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// When the attempt row was created.
    pub queued_at: DateTime<Utc>,
    /// When the attempt was claimed by a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// A new queued attempt.
    pub fn queued(
        run_id: Uuid,
        step_id: impl Into<String>,
        attempt: u32,
        input: Option<Value>,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id: step_id.into(),
            attempt,
            status: StepStatus::Queued,
            input,
            output: None,
            error: None,
            not_before,
            queued_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// A row recording that the step was skipped. Never dispatched.
    pub fn skipped(run_id: Uuid, step_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Skipped,
            finished_at: Some(now),
            ..Self::queued(run_id, step_id, 1, None, None, now)
        }
    }

    /// A row recording a failure that happened before the step could be queued.
    pub fn failed_before_dispatch(
        run_id: Uuid,
        step_id: impl Into<String>,
        error: StepExecutionError,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error),
            finished_at: Some(now),
            ..Self::queued(run_id, step_id, 1, None, None, now)
        }
    }

    /// Whether the attempt may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Queued && self.not_before.is_none_or(|nb| nb <= now)
    }
}

/// Fields written together with a status compare-and-set on a step attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepTransition {
    pub status: Option<StepStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<StepExecutionError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepTransition {
    pub fn to(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: StepExecutionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Apply onto a row. Unset fields keep their current value.
    pub fn apply(&self, row: &mut StepExecution) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(input) = &self.input {
            row.input = Some(input.clone());
        }
        if let Some(output) = &self.output {
            row.output = Some(output.clone());
        }
        if let Some(error) = &self.error {
            row.error = Some(error.clone());
        }
        if let Some(at) = self.started_at {
            row.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            row.finished_at = Some(at);
        }
    }
}

// ---------------------------------------------------------------------------
// Failure causes
// ---------------------------------------------------------------------------

/// Classification reported by a connector alongside a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    /// Network blips, 5xx responses. Retried.
    Transient,
    /// The request can never succeed. Not retried.
    Permanent,
    /// The resolved input was rejected. Not retried.
    InvalidInput,
    /// Upstream throttling. Retried.
    RateLimited,
}

impl ConnectorErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ConnectorErrorKind::Transient | ConnectorErrorKind::RateLimited
        )
    }
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorErrorKind::Transient => "transient",
            ConnectorErrorKind::Permanent => "permanent",
            ConnectorErrorKind::InvalidInput => "invalid_input",
            ConnectorErrorKind::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

/// Why a step attempt failed. Stored on the attempt row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepExecutionError {
    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connector error ({error_kind}): {detail}")]
    Connector {
        error_kind: ConnectorErrorKind,
        detail: String,
    },

    #[error("input mapping failed: {detail}")]
    InputMapping { detail: String },

    #[error("condition evaluation failed: {detail}")]
    Condition { detail: String },

    #[error("no connector registered for capability '{capability}'")]
    UnknownCapability { capability: String },

    #[error("attempt interrupted: {detail}")]
    Interrupted { detail: String },

    #[error("attempt cancelled")]
    Cancelled,
}

impl StepExecutionError {
    /// Whether another attempt may be scheduled for this cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepExecutionError::Timeout { .. } | StepExecutionError::Interrupted { .. } => true,
            StepExecutionError::Connector { error_kind, .. } => error_kind.is_retryable(),
            StepExecutionError::InputMapping { .. }
            | StepExecutionError::Condition { .. }
            | StepExecutionError::UnknownCapability { .. }
            | StepExecutionError::Cancelled => false,
        }
    }

    /// Whether this cause aborts the whole run immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepExecutionError::UnknownCapability { .. })
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Filter for run listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &ExecutionRun) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| run.correlation_id.as_deref() == Some(c))
            && self
                .trigger_id
                .as_deref()
                .is_none_or(|t| run.trigger_id.as_deref() == Some(t))
    }
}

/// One page of runs, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    pub runs: Vec<ExecutionRun>,
    /// Pass back to continue after the last run of this page. None = done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Per-step summary inside a [`RunStatusView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub step_id: String,
    /// Status of the latest attempt, None when the step has not started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    /// Number of attempt rows (skipped rows count as one).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Run plus a per-step summary in definition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run: ExecutionRun,
    pub steps: Vec<StepView>,
}

/// Aggregate run statistics for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflow_id: Uuid,
    pub total_runs: u64,
    pub by_status: BTreeMap<String, u64>,
    /// Succeeded / finished, None when nothing finished yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// Ten most recent runs, newest first.
    pub recent_runs: Vec<ExecutionRun>,
}

// ---------------------------------------------------------------------------
// Trigger events
// ---------------------------------------------------------------------------

/// An external occurrence delivered to a trigger binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub event_data: Value,
}

impl TriggerEvent {
    pub fn new(trigger_id: impl Into<String>, event_data: Value) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            occurred_at: Utc::now(),
            event_data,
        }
    }

    /// Correlation ID for runs created by this event: `{trigger_id}@{occurred_at}`.
    pub fn correlation_id(&self) -> String {
        format!("{}@{}", self.trigger_id, self.occurred_at.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_status_terminal_and_transitions() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());

        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in ["queued", "dispatched", "succeeded", "failed", "skipped", "cancelled"] {
            let status: StepStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
            assert_eq!(serde_json::to_value(status).unwrap(), json!(s));
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_error_retryability() {
        let transient = StepExecutionError::Connector {
            error_kind: ConnectorErrorKind::Transient,
            detail: "502".into(),
        };
        let permanent = StepExecutionError::Connector {
            error_kind: ConnectorErrorKind::Permanent,
            detail: "404".into(),
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(StepExecutionError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!StepExecutionError::InputMapping { detail: "x".into() }.is_retryable());

        let unknown = StepExecutionError::UnknownCapability {
            capability: "fax".into(),
        };
        assert!(unknown.is_fatal());
        assert!(!unknown.is_retryable());
        assert!(!transient.is_fatal());
    }

    #[test]
    fn test_error_serialized_with_kind_tag() {
        let err = StepExecutionError::Connector {
            error_kind: ConnectorErrorKind::RateLimited,
            detail: "slow down".into(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({ "kind": "connector", "error_kind": "rate_limited", "detail": "slow down" })
        );
        let back: StepExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
        assert_eq!(
            serde_json::to_value(StepExecutionError::Cancelled).unwrap(),
            json!({ "kind": "cancelled" })
        );
    }

    #[test]
    fn test_step_execution_due() {
        let now = Utc::now();
        let mut row = StepExecution::queued(Uuid::now_v7(), "a", 1, None, None, now);
        assert!(row.is_due(now));

        row.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!row.is_due(now));
        assert!(row.is_due(now + chrono::Duration::seconds(5)));

        let skipped = StepExecution::skipped(Uuid::now_v7(), "b", now);
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(!skipped.is_due(now));
    }

    #[test]
    fn test_transition_apply_keeps_unset_fields() {
        let now = Utc::now();
        let mut row = StepExecution::queued(Uuid::now_v7(), "a", 1, Some(json!({"x": 1})), None, now);
        StepTransition::to(StepStatus::Dispatched)
            .started(now)
            .apply(&mut row);
        assert_eq!(row.status, StepStatus::Dispatched);
        assert_eq!(row.input, Some(json!({"x": 1})));
        assert_eq!(row.started_at, Some(now));
        assert!(row.finished_at.is_none());
    }

    #[test]
    fn test_run_filter() {
        let now = Utc::now();
        let run = ExecutionRun {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_version: 1,
            workflow_name: "wf".into(),
            status: RunStatus::Running,
            context: json!({}),
            correlation_id: Some("c-1".into()),
            trigger_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        assert!(RunFilter::default().matches(&run));
        assert!(RunFilter {
            status: Some(RunStatus::Running),
            correlation_id: Some("c-1".into()),
            trigger_id: None,
        }
        .matches(&run));
        assert!(!RunFilter {
            trigger_id: Some("nightly".into()),
            ..Default::default()
        }
        .matches(&run));
        assert!(!RunFilter {
            status: Some(RunStatus::Failed),
            ..Default::default()
        }
        .matches(&run));
    }

    #[test]
    fn test_trigger_event_correlation_id() {
        let event = TriggerEvent {
            trigger_id: "nightly".into(),
            occurred_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            event_data: json!(null),
        };
        assert_eq!(event.correlation_id(), "nightly@2026-01-02T03:04:05+00:00");
    }
}
