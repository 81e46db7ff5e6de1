//! Workflow engine core: definitions, DAG scheduling, dispatch and execution.
//!
//! - `definition` -- YAML/JSON parsing, validation, versioned publishing
//! - `dag` -- DAG builder, cycle detection, topological order
//! - `context` -- run context with step outputs and input mapping
//! - `expression` -- JEXL evaluator for conditions and trigger filters
//! - `retry` -- step backoff policy and transient storage retries
//! - `connector` -- connector trait, registry and built-in capabilities
//! - `cache` -- definition version cache
//! - `dispatcher` -- claims due attempts under worker and run limits
//! - `step_runner` -- executes one attempt and records its outcome
//! - `engine` -- run lifecycle, advance, recovery and queries
//! - `worker` -- worker pool driving the dispatcher
//! - `trigger` -- trigger bindings and `when` filters
//! - `scheduler` -- cron schedules for schedule triggers
//! - `clock` -- time sources

pub mod cache;
pub mod clock;
pub mod connector;
pub mod context;
pub mod dag;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod expression;
pub mod retry;
pub mod scheduler;
pub mod step_runner;
pub mod trigger;
pub mod worker;

pub use engine::{CompletionOutcome, Engine, EngineError, RecoveryReport};
pub use step_runner::StepOutcome;
pub use worker::WorkerPool;
