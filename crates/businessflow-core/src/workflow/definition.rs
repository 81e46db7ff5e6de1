//! Workflow definition parsing, validation, publishing, and discovery.
//!
//! Converts YAML or JSON files into the canonical `WorkflowDefinition`,
//! validates structural constraints (unique IDs, known dependencies, acyclic
//! graph, legal references, retry policies, trigger bindings), and publishes
//! immutable, monotonically versioned definitions to an `ExecutionStore`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use businessflow_types::error::StorageError;
use businessflow_types::workflow::{RetryPolicy, TriggerKind, WorkflowDefinition};
use thiserror::Error;

use super::context::{classify_reference, placeholder_paths, Reference};
use super::dag::{upstream_steps, validate_dag};
use super::expression::{check_syntax, referenced_steps};
use super::scheduler::Schedule;
use crate::repository::ExecutionStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading, validating or publishing a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("{0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// An input mapping or condition refers to something it cannot see.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Another publish assigned the same version first.
    #[error("version {version} of workflow {workflow_id} was published concurrently")]
    VersionConflict { workflow_id: uuid::Uuid, version: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON) string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty, at least one step exists
/// - Step IDs are unique and contain only alphanumerics, `-` and `_`
/// - The `depends_on` graph references known steps and is acyclic
/// - Input mappings and conditions only reference `context`, `run`, or
///   transitive upstream steps
/// - Retry policies, timeouts and concurrency are in range
/// - Trigger IDs are unique and bindings are well-formed
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty()
            || !step
                .id
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DefinitionError::ValidationError(format!(
                "step ID '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.capability.trim().is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}' has no capability",
                step.id
            )));
        }
        if step.timeout_ms == Some(0) {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}': timeout must be > 0",
                step.id
            )));
        }
        validate_retry(&step.id, &step.retry)?;
    }

    validate_dag(&def.steps)?;

    for step in &def.steps {
        let upstream = upstream_steps(&step.id, &def.steps);

        let paths = placeholder_paths(&step.input).map_err(|e| {
            DefinitionError::InvalidReference(format!("step '{}': {e}", step.id))
        })?;
        for path in &paths {
            match classify_reference(path) {
                Ok(Reference::Context | Reference::Run) => {}
                Ok(Reference::Step(id)) if upstream.contains(id) => {}
                Ok(Reference::Step(id)) => {
                    return Err(DefinitionError::InvalidReference(format!(
                        "step '{}' input references step '{id}', which is not upstream",
                        step.id
                    )));
                }
                Err(e) => {
                    return Err(DefinitionError::InvalidReference(format!(
                        "step '{}': {e}",
                        step.id
                    )));
                }
            }
        }

        if let Some(condition) = &step.condition {
            check_syntax(condition).map_err(|e| {
                DefinitionError::ValidationError(format!("step '{}' condition: {e}", step.id))
            })?;
            for id in referenced_steps(condition) {
                if !upstream.contains(id.as_str()) {
                    return Err(DefinitionError::InvalidReference(format!(
                        "step '{}' condition references step '{id}', which is not upstream",
                        step.id
                    )));
                }
            }
        }
    }

    if def.concurrency == Some(0) {
        return Err(DefinitionError::ValidationError(
            "concurrency must be >= 1".to_string(),
        ));
    }

    let mut trigger_ids = HashSet::new();
    for trigger in &def.triggers {
        if trigger.id.trim().is_empty() {
            return Err(DefinitionError::ValidationError(
                "trigger ID must not be empty".to_string(),
            ));
        }
        if !trigger_ids.insert(trigger.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate trigger ID: '{}'",
                trigger.id
            )));
        }
        match &trigger.kind {
            TriggerKind::Manual {} => {}
            TriggerKind::Schedule { cron, timezone } => {
                Schedule::parse(cron).map_err(|e| {
                    DefinitionError::ValidationError(format!("trigger '{}': {e}", trigger.id))
                })?;
                if let Some(tz) = timezone.as_deref().filter(|tz| !tz.eq_ignore_ascii_case("utc")) {
                    return Err(DefinitionError::ValidationError(format!(
                        "trigger '{}': only UTC schedules are supported, got '{tz}'",
                        trigger.id
                    )));
                }
            }
            TriggerKind::Webhook { path } => {
                if !path.starts_with('/') {
                    return Err(DefinitionError::ValidationError(format!(
                        "trigger '{}': webhook path must start with '/', got '{path}'",
                        trigger.id
                    )));
                }
            }
        }
        if let Some(when) = &trigger.when {
            check_syntax(when).map_err(|e| {
                DefinitionError::ValidationError(format!("trigger '{}' when: {e}", trigger.id))
            })?;
        }
    }

    Ok(())
}

fn validate_retry(step_id: &str, retry: &RetryPolicy) -> Result<(), DefinitionError> {
    let invalid = |msg: &str| {
        Err(DefinitionError::ValidationError(format!(
            "step '{step_id}' retry policy: {msg}"
        )))
    };
    if retry.max_attempts < 1 {
        return invalid("max_attempts must be >= 1");
    }
    if retry.multiplier < 1.0 || !retry.multiplier.is_finite() {
        return invalid("multiplier must be >= 1.0");
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return invalid("jitter must be within [0, 1]");
    }
    if retry.backoff_cap_ms.is_some_and(|cap| cap < retry.backoff_base_ms) {
        return invalid("backoff_cap_ms must be >= backoff_base_ms");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Validate and publish a definition as the next version of its ID.
///
/// The stored version is `latest + 1` (1 for a new ID). Trigger IDs must not
/// be bound by the latest version of any other workflow. A concurrent publish
/// that claims the same version first yields `VersionConflict`.
pub async fn publish_definition<S: ExecutionStore>(
    store: &S,
    mut def: WorkflowDefinition,
) -> Result<WorkflowDefinition, DefinitionError> {
    validate_definition(&def)?;

    let existing = store.list_definitions().await?;
    let bound: HashMap<&str, &WorkflowDefinition> = existing
        .iter()
        .filter(|other| other.id != def.id)
        .flat_map(|other| other.triggers.iter().map(move |t| (t.id.as_str(), other)))
        .collect();
    for trigger in &def.triggers {
        if let Some(owner) = bound.get(trigger.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "trigger ID '{}' is already bound to workflow '{}' ({})",
                trigger.id, owner.name, owner.id
            )));
        }
    }

    let latest = store.latest_definition(&def.id).await?;
    def.version = latest.map(|d| d.version + 1).unwrap_or(1);

    match store.insert_definition(&def).await {
        Ok(()) => {
            tracing::info!(
                workflow_id = %def.id,
                version = def.version,
                workflow = %def.name,
                steps = def.steps.len(),
                "published workflow definition"
            );
            Ok(def)
        }
        Err(StorageError::Conflict(_)) => Err(DefinitionError::VersionConflict {
            workflow_id: def.id,
            version: def.version,
        }),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML or JSON file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

/// Discover all workflow definition files under `base_dir`.
///
/// Scans for `.yaml`, `.yml` and `.json` files recursively. Files that fail
/// to parse are logged and skipped.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
        {
            match load_definition_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping invalid workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
