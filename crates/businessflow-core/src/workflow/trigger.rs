//! Trigger registry and `when` clause evaluation.
//!
//! `TriggerRegistry` maps trigger IDs (and webhook paths) to the workflow
//! definition they start. It is rebuilt from the latest active version of
//! every definition and updated on publish. The engine consults it when a
//! `TriggerEvent` fires; the cron scheduler and the CLI feed events in.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use businessflow_types::execution::TriggerEvent;
use businessflow_types::workflow::{TriggerDefinition, TriggerKind, WorkflowDefinition};

use super::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during trigger operations.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Trigger ID already bound by another workflow.
    #[error("trigger '{trigger_id}' is already bound to workflow {workflow_id}")]
    AlreadyBound { trigger_id: String, workflow_id: Uuid },

    /// Webhook path already served by another trigger.
    #[error("webhook path '{path}' is already served by trigger '{trigger_id}'")]
    WebhookPathInUse { path: String, trigger_id: String },

    /// When-clause evaluation failed.
    #[error("when clause evaluation failed: {0}")]
    WhenClauseError(String),
}

// ---------------------------------------------------------------------------
// TriggerBinding
// ---------------------------------------------------------------------------

/// A trigger bound to the definition version it starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerBinding {
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub workflow_name: String,
    pub trigger: TriggerDefinition,
}

impl TriggerBinding {
    /// JSON object for `when` clause evaluation:
    /// `{ "trigger": { id, type, workflow_id, occurred_at }, "event": <data> }`.
    pub fn eval_context(&self, event: &TriggerEvent) -> Value {
        json!({
            "trigger": {
                "id": self.trigger.id,
                "type": self.trigger.kind.as_str(),
                "workflow_id": self.workflow_id.to_string(),
                "occurred_at": event.occurred_at.to_rfc3339(),
            },
            "event": event.event_data,
        })
    }

    /// Evaluate the trigger's `when` clause. No clause always passes.
    pub fn evaluate_when(&self, event: &TriggerEvent) -> Result<bool, TriggerError> {
        match self.trigger.when.as_deref() {
            None => Ok(true),
            Some(expr) => ExpressionEvaluator::new()
                .evaluate_bool(expr, &self.eval_context(event))
                .map_err(|e| TriggerError::WhenClauseError(e.to_string())),
        }
    }
}

/// Seed context for a run started by `event_data`: objects are used as-is,
/// `null` becomes `{}`, anything else is wrapped as `{ "event": data }`.
pub fn seed_context(event_data: Value) -> Value {
    match event_data {
        Value::Object(_) => event_data,
        Value::Null => Value::Object(Map::new()),
        other => json!({ "event": other }),
    }
}

// ---------------------------------------------------------------------------
// TriggerRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Bindings {
    by_id: HashMap<String, TriggerBinding>,
    /// webhook path -> trigger ID
    by_path: HashMap<String, String>,
}

impl Bindings {
    fn remove_workflow(&mut self, workflow_id: Uuid) -> usize {
        let before = self.by_id.len();
        self.by_id.retain(|_, b| b.workflow_id != workflow_id);
        let by_id = &self.by_id;
        self.by_path.retain(|_, trigger_id| by_id.contains_key(trigger_id));
        before - self.by_id.len()
    }
}

/// Registry of trigger bindings, indexed by trigger ID and webhook path.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    inner: Arc<RwLock<Bindings>>,
}

impl TriggerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every trigger of `def`, replacing the workflow's previous bindings.
    ///
    /// Inactive definitions only drop their old bindings. Fails without
    /// changing anything if a trigger ID or webhook path belongs to another
    /// workflow.
    pub async fn register_workflow(&self, def: &WorkflowDefinition) -> Result<usize, TriggerError> {
        let mut inner = self.inner.write().await;

        for trigger in &def.triggers {
            if let Some(existing) = inner.by_id.get(&trigger.id) {
                if existing.workflow_id != def.id {
                    return Err(TriggerError::AlreadyBound {
                        trigger_id: trigger.id.clone(),
                        workflow_id: existing.workflow_id,
                    });
                }
            }
            if let TriggerKind::Webhook { path } = &trigger.kind {
                if let Some(owner) = inner.by_path.get(path) {
                    let same_workflow = inner
                        .by_id
                        .get(owner)
                        .is_some_and(|b| b.workflow_id == def.id);
                    if !same_workflow {
                        return Err(TriggerError::WebhookPathInUse {
                            path: path.clone(),
                            trigger_id: owner.clone(),
                        });
                    }
                }
            }
        }

        inner.remove_workflow(def.id);
        if !def.is_active {
            tracing::info!(workflow_id = %def.id, "workflow inactive, triggers unbound");
            return Ok(0);
        }

        for trigger in &def.triggers {
            if let TriggerKind::Webhook { path } = &trigger.kind {
                inner.by_path.insert(path.clone(), trigger.id.clone());
            }
            inner.by_id.insert(
                trigger.id.clone(),
                TriggerBinding {
                    workflow_id: def.id,
                    workflow_version: def.version,
                    workflow_name: def.name.clone(),
                    trigger: trigger.clone(),
                },
            );
        }

        tracing::info!(
            workflow_id = %def.id,
            version = def.version,
            trigger_count = def.triggers.len(),
            "registered workflow triggers"
        );
        Ok(def.triggers.len())
    }

    /// Drop every binding of a workflow. Returns how many were removed.
    pub async fn unregister_workflow(&self, workflow_id: Uuid) -> usize {
        self.inner.write().await.remove_workflow(workflow_id)
    }

    /// Replace all bindings with those of `defs` (latest versions).
    ///
    /// Conflicting definitions are logged and skipped.
    pub async fn rebuild(&self, defs: &[WorkflowDefinition]) -> usize {
        *self.inner.write().await = Bindings::default();
        let mut total = 0;
        for def in defs {
            match self.register_workflow(def).await {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::warn!(workflow_id = %def.id, error = %e, "skipping trigger bindings");
                }
            }
        }
        total
    }

    /// Binding for a trigger ID.
    pub async fn get(&self, trigger_id: &str) -> Option<TriggerBinding> {
        self.inner.read().await.by_id.get(trigger_id).cloned()
    }

    /// Binding serving a webhook path.
    pub async fn resolve_webhook(&self, path: &str) -> Option<TriggerBinding> {
        let inner = self.inner.read().await;
        inner
            .by_path
            .get(path)
            .and_then(|trigger_id| inner.by_id.get(trigger_id))
            .cloned()
    }

    /// All schedule triggers as `(trigger_id, cron)`, sorted by trigger ID.
    pub async fn schedule_triggers(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().await;
        let mut result: Vec<(String, String)> = inner
            .by_id
            .values()
            .filter_map(|b| match &b.trigger.kind {
                TriggerKind::Schedule { cron, .. } => Some((b.trigger.id.clone(), cron.clone())),
                _ => None,
            })
            .collect();
        result.sort();
        result
    }

    /// Number of bound triggers.
    pub async fn trigger_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
