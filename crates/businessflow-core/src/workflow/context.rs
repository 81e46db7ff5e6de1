//! Run context with step output tracking and input mapping resolution.
//!
//! `RunContext` is the JSON state that flows through a run. It holds the seed
//! context supplied at creation and the outputs of completed steps, and is
//! persisted on the run row so a restarted process can continue without any
//! in-memory state.
//!
//! Input mappings are JSON values whose string leaves may contain
//! `{{ <path> }}` placeholders. A string that is exactly one placeholder is
//! replaced by the referenced value with its JSON type preserved; placeholders
//! embedded in longer strings are interpolated as text.

use businessflow_types::execution::ExecutionRun;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output kept in the run context (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while resolving an input mapping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    #[error("unterminated placeholder in '{0}'")]
    UnterminatedPlaceholder(String),

    #[error("invalid reference '{0}'")]
    InvalidReference(String),
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Persistent run context.
///
/// Stored on the run as:
/// ```json
/// { "context": { ...seed... }, "steps": { "<step_id>": { "output": <value> } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Seed context supplied when the run was created.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Outputs of succeeded steps keyed by step ID.
    #[serde(default)]
    pub steps: Map<String, Value>,
}

impl RunContext {
    /// Create a context from seed data. `null` becomes an empty object and
    /// other non-object values are kept under `value`.
    pub fn seeded(seed: Value) -> Self {
        let context = match seed {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            context,
            steps: Map::new(),
        }
    }

    /// Restore a context from the JSON stored on a run.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "run context malformed, treating it as seed data");
            Self::seeded(value.clone())
        })
    }

    /// Serialize for persistence.
    pub fn to_value(&self) -> Value {
        json!({ "context": self.context, "steps": self.steps })
    }

    /// Record the output of a succeeded step.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` are replaced by a marker;
    /// the full value stays on the attempt row.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) {
        let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        let output = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating in run context"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            output
        };
        self.steps
            .insert(step_id.to_string(), json!({ "output": output }));
    }

    /// Output of a completed step, if recorded.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|s| s.get("output"))
    }

    /// Build the evaluation scope for conditions and input mappings.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "context": { ... },
    ///   "steps": { "<step_id>": { "output": <value> } },
    ///   "run": { "id": "...", "workflow": "...", "version": 1, "correlation_id": "..." }
    /// }
    /// ```
    pub fn scope(&self, run: &ExecutionRun) -> Value {
        json!({
            "context": self.context,
            "steps": self.steps,
            "run": {
                "id": run.id.to_string(),
                "workflow_id": run.workflow_id.to_string(),
                "workflow": run.workflow_name,
                "version": run.workflow_version,
                "correlation_id": run.correlation_id,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Input mapping
// ---------------------------------------------------------------------------

/// Resolve every placeholder in `mapping` against `scope`.
pub fn resolve_input(mapping: &Value, scope: &Value) -> Result<Value, MappingError> {
    match mapping {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_input(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve_input(value, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(template: &str, scope: &Value) -> Result<Value, MappingError> {
    let trimmed = template.trim();
    if let Some(path) = sole_placeholder(trimmed) {
        return lookup(scope, path)
            .cloned()
            .ok_or_else(|| MappingError::UnresolvedReference(path.to_string()));
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| MappingError::UnterminatedPlaceholder(template.to_string()))?;
        let path = after[..end].trim();
        let value =
            lookup(scope, path).ok_or_else(|| MappingError::UnresolvedReference(path.to_string()))?;
        result.push_str(&value_to_string(value));
        rest = &after[end + CLOSE.len()..];
    }
    result.push_str(rest);
    Ok(Value::String(result))
}

/// If `s` is exactly one placeholder, return its trimmed path.
fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

/// Walk a dotted path (`steps.fetch.output.items.0.id`) through a JSON value.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Collect every placeholder path in a mapping.
pub fn placeholder_paths(mapping: &Value) -> Result<Vec<String>, MappingError> {
    let mut paths = Vec::new();
    collect_paths(mapping, &mut paths)?;
    Ok(paths)
}

fn collect_paths(value: &Value, paths: &mut Vec<String>) -> Result<(), MappingError> {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find(OPEN) {
                let after = &rest[start + OPEN.len()..];
                let end = after
                    .find(CLOSE)
                    .ok_or_else(|| MappingError::UnterminatedPlaceholder(s.clone()))?;
                paths.push(after[..end].trim().to_string());
                rest = &after[end + CLOSE.len()..];
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, paths)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_paths(item, paths)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// What a placeholder path points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference<'a> {
    Context,
    Run,
    Step(&'a str),
}

/// Classify a placeholder path by its root segment.
pub fn classify_reference(path: &str) -> Result<Reference<'_>, MappingError> {
    let mut segments = path.split('.');
    match segments.next() {
        Some("context") => Ok(Reference::Context),
        Some("run") => Ok(Reference::Run),
        Some("steps") => match (segments.next(), segments.next()) {
            (Some(step_id), Some("output")) if !step_id.is_empty() => Ok(Reference::Step(step_id)),
            _ => Err(MappingError::InvalidReference(path.to_string())),
        },
        _ => Err(MappingError::InvalidReference(path.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value to a display string for interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
