//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

mod interleave;

use std::sync::Arc;
use std::time::Duration;

pub use businessflow_core::repository::ExecutionStore;
use businessflow_core::repository::InMemoryExecutionStore;
use businessflow_core::workflow::clock::InstantClock;
use businessflow_core::workflow::connector::{
    Connector, ConnectorContext, ConnectorError, ConnectorRegistry, FnConnector,
};
use businessflow_core::workflow::{Engine, WorkerPool};
use businessflow_types::config::EngineConfig;
use businessflow_types::execution::ExecutionRun;
use businessflow_types::workflow::{RetryPolicy, StepDefinition, WorkflowDefinition};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use interleave::InterleavingStore;

pub type TestEngine = Engine<InMemoryExecutionStore>;

pub fn step(id: &str, capability: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition {
        id: id.into(),
        name: id.into(),
        capability: capability.into(),
        input: json!({}),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        condition: None,
        retry: RetryPolicy::default(),
        timeout_ms: None,
    }
}

pub fn retry(max_attempts: u32, backoff_base_ms: u64, multiplier: f64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base_ms,
        multiplier,
        backoff_cap_ms: None,
        jitter: 0.0,
    }
}

pub fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        version: 0,
        name: name.into(),
        description: None,
        is_active: true,
        concurrency: None,
        triggers: vec![],
        steps,
        metadata: Default::default(),
    }
}

/// Engine over an in-memory store, on the tokio clock.
pub fn engine_with(registry: ConnectorRegistry) -> Arc<TestEngine> {
    engine_on(Arc::new(InMemoryExecutionStore::new()), registry)
}

/// Engine over `store`, on the tokio clock.
pub fn engine_on<S: ExecutionStore>(store: Arc<S>, registry: ConnectorRegistry) -> Arc<Engine<S>> {
    let config = EngineConfig {
        workers: 4,
        ..EngineConfig::default()
    };
    Arc::new(Engine::with_clock(store, registry, config, Arc::new(InstantClock::new())))
}

/// Spawn a worker pool. Cancel the token and await the handle to stop it.
pub fn start_workers<S: ExecutionStore>(engine: &Arc<Engine<S>>) -> (CancellationToken, JoinHandle<usize>) {
    let pool = WorkerPool::new(Arc::clone(engine));
    let shutdown = pool.shutdown_token();
    let handle = tokio::spawn(async move { pool.run().await });
    (shutdown, handle)
}

pub async fn run_to_end<S: ExecutionStore>(engine: &Engine<S>, run_id: Uuid) -> ExecutionRun {
    tokio::time::timeout(Duration::from_secs(600), engine.wait_for_run(run_id))
        .await
        .expect("run did not finish in time")
        .expect("run lookup failed")
}

// ---------------------------------------------------------------------------
// Call recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Call {
    pub step_id: String,
    pub attempt: u32,
    pub at: tokio::time::Instant,
}

/// Log of connector invocations.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<Call>>>);

impl Calls {
    pub fn record(&self, ctx: &ConnectorContext) {
        self.0.lock().push(Call {
            step_id: ctx.step_id.clone(),
            attempt: ctx.attempt,
            at: tokio::time::Instant::now(),
        });
    }

    pub fn count(&self, step_id: &str) -> usize {
        self.0.lock().iter().filter(|c| c.step_id == step_id).count()
    }

    pub fn total(&self) -> usize {
        self.0.lock().len()
    }

    pub fn for_step(&self, step_id: &str) -> Vec<Call> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.step_id == step_id)
            .cloned()
            .collect()
    }
}

/// Connector for `capability` that logs each call and answers with `behaviour`.
pub fn recording<F>(capability: &str, calls: Calls, behaviour: F) -> Arc<dyn Connector>
where
    F: Fn(&Value, &ConnectorContext) -> Result<Value, ConnectorError> + Send + Sync + 'static,
{
    Arc::new(FnConnector::new(capability, move |input: Value, ctx: ConnectorContext| {
        calls.record(&ctx);
        let result = behaviour(&input, &ctx);
        async move { result }
    }))
}
