//! Workflow definition types for BusinessFlow.
//!
//! `WorkflowDefinition` is the canonical, versioned representation of a
//! workflow: an ordered set of steps whose `depends_on` lists form a DAG, plus
//! the triggers that start new runs. Definitions are immutable once published;
//! editing a workflow publishes a new version under the same ID.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A published (or about to be published) workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow ID shared by every version.
    pub id: Uuid,
    /// Monotonic version per ID. Assigned by the definition store on publish,
    /// so any value supplied by the author is overwritten.
    #[serde(default)]
    pub version: u32,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inactive workflows keep their history but refuse new runs.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Maximum number of simultaneously dispatched steps within one run
    /// (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Trigger bindings that create runs of this version.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Free-form metadata carried along with the definition.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_active() -> bool {
    true
}

impl WorkflowDefinition {
    /// Look up a step by its ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Steps with no upstream dependencies.
    pub fn root_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| s.depends_on.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "fetch-invoice"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// Name of the connector capability that executes this step
    /// (e.g. "http", "ai_inference", "transform", "delay").
    pub capability: String,
    /// Input mapping. String leaves may contain `{{ context.<field> }}` and
    /// `{{ steps.<id>.output }}` placeholders resolved at dispatch time.
    #[serde(default)]
    pub input: Value,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional JEXL expression; when it evaluates false the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Retry policy for failed attempts.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt timeout in milliseconds (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    /// The attempt timeout, falling back to `default` when unset.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry budget and exponential backoff for a step.
///
/// Delays between attempts never shrink. They grow strictly only with
/// `multiplier > 1.0` and until `backoff_cap_ms` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds (default 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Growth factor applied per further attempt (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for a single delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_cap_ms: Option<u64>,
    /// Random jitter as a fraction of the delay, in `[0, 1]` (default 0).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            multiplier: default_multiplier(),
            backoff_cap_ms: None,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Definition
// ---------------------------------------------------------------------------

/// An external event binding that creates runs of the owning definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Trigger ID, unique across all workflows (e.g. "nightly-invoices").
    pub id: String,
    /// What kind of event fires the trigger.
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// Optional JEXL filter over `{ trigger, event }`; false suppresses the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

/// Trigger binding parameters.
///
/// Internally tagged by `type`:
/// ```yaml
/// triggers:
///   - id: nightly
///     type: schedule
///     cron: "0 2 * * *"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Started explicitly by an operator or API caller.
    Manual {},
    /// Cron schedule (5 or 6 fields, or phrases like "every 5 minutes").
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Inbound HTTP request on `path`, delivered by the request layer.
    Webhook { path: String },
}

impl TriggerKind {
    /// Short lowercase name of the trigger kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual {} => "manual",
            TriggerKind::Schedule { .. } => "schedule",
            TriggerKind::Webhook { .. } => "webhook",
        }
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
    fn test_definition_yaml_defaults() {
        let yaml = r#"
id: "01938e90-0000-7000-8000-000000000001"
name: invoice-followup
steps:
  - id: fetch
    capability: http
    input:
      method: GET
      url: "https://erp.example.com/invoices/{{ context.invoice_id }}"
  - id: summarize
    capability: ai_inference
    depends_on: [fetch]
    condition: "steps.fetch.output.status == 200"
    retry:
      max_attempts: 5
      backoff_base_ms: 250
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, 0, "version is assigned on publish");
        assert!(def.is_active);
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].retry, RetryPolicy::default());
        assert_eq!(def.steps[1].retry.max_attempts, 5);
        assert_eq!(def.steps[1].retry.backoff_base_ms, 250);
        assert!((def.steps[1].retry.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(def.steps[1].depends_on, vec!["fetch"]);
        assert_eq!(def.steps[0].input["method"], json!("GET"));
    }

    #[test]
    fn test_root_steps_and_lookup() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "name": "wf",
            "steps": [
                { "id": "a", "capability": "noop" },
                { "id": "b", "capability": "noop", "depends_on": ["a"] },
                { "id": "c", "capability": "noop" }
            ]
        }))
        .unwrap();

        let roots: Vec<&str> = def.root_steps().map(|s| s.id.as_str()).collect();
        assert_eq!(roots, vec!["a", "c"]);
        assert_eq!(def.step("b").unwrap().depends_on, vec!["a"]);
        assert!(def.step("missing").is_none());
    }

    #[test]
    fn test_trigger_kinds_flattened() {
        let yaml = r#"
- id: by-hand
  type: manual
- id: nightly
  type: schedule
  cron: "0 2 * * *"
- id: crm-hook
  type: webhook
  path: /hooks/crm
  when: "event.stage == 'won'"
"#;
        let triggers: Vec<TriggerDefinition> = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(triggers.len(), 3);
        assert_eq!(triggers[0].kind, TriggerKind::Manual {});
        assert!(matches!(
            &triggers[1].kind,
            TriggerKind::Schedule { cron, timezone: None } if cron == "0 2 * * *"
        ));
        assert_eq!(triggers[2].kind.as_str(), "webhook");
        assert_eq!(triggers[2].when.as_deref(), Some("event.stage == 'won'"));
    }

    #[test]
    fn test_step_timeout_fallback() {
        let step: StepDefinition =
            serde_json::from_value(json!({ "id": "a", "capability": "noop" })).unwrap();
        assert_eq!(
            step.timeout_or(Duration::from_secs(30)),
            Duration::from_secs(30)
        );

        let step: StepDefinition = serde_json::from_value(
            json!({ "id": "a", "capability": "noop", "timeout_ms": 1500 }),
        )
        .unwrap();
        assert_eq!(
            step.timeout_or(Duration::from_secs(30)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_base_ms, 1_000);
    }
}
