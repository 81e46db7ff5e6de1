//! Event types for the BusinessFlow engine event bus.
//!
//! `EngineEvent` is broadcast as runs and step attempts change state.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{RunStatus, StepStatus};

/// Events emitted by the engine core, dispatcher and step runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was created for a definition version.
    RunCreated {
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    /// An attempt was queued (first attempt or retry).
    StepQueued {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    /// A step was skipped because its condition evaluated false.
    StepSkipped { run_id: Uuid, step_id: String },

    /// An attempt was claimed by a worker.
    StepDispatched {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    /// An attempt reached a terminal status.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A retry was scheduled after a failed attempt.
    StepRetryScheduled {
        run_id: Uuid,
        step_id: String,
        next_attempt: u32,
        not_before: DateTime<Utc>,
    },

    /// A run reached `Succeeded` or `Failed`.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A run was cancelled.
    RunCancelled { run_id: Uuid },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunCreated { run_id, .. }
            | EngineEvent::StepQueued { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::StepDispatched { run_id, .. }
            | EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepRetryScheduled { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. }
            | EngineEvent::RunCancelled { run_id } => *run_id,
        }
    }

    /// Whether this event marks the end of its run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::RunFinished { .. } | EngineEvent::RunCancelled { .. }
        )
    }
}
