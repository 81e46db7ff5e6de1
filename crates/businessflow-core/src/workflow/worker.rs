//! Worker pool: pulls dispatched attempts and executes them on tokio tasks.
//!
//! Concurrency is bounded by the dispatcher's permits, not by the pool. On
//! shutdown the pool stops claiming and waits for in-flight attempts. A
//! background sweep periodically advances runs left with no open attempt.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::Engine;
use crate::repository::ExecutionStore;

pub struct WorkerPool<S: ExecutionStore> {
    engine: Arc<Engine<S>>,
    shutdown: CancellationToken,
}

impl<S: ExecutionStore> WorkerPool<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Claim and execute attempts until shutdown, then drain.
    ///
    /// Returns the number of attempts processed.
    pub async fn run(&self) -> usize {
        let dispatcher = self.engine.dispatcher();
        let mut tasks = JoinSet::new();
        let mut processed = 0usize;
        tracing::info!(workers = self.engine.config().workers, "worker pool started");
        let sweep = tokio::spawn(Self::sweep(Arc::clone(&self.engine), self.shutdown.clone()));

        loop {
            while let Some(joined) = tasks.try_join_next() {
                processed += Self::reap(joined);
            }

            match dispatcher.dispatch_next(&self.shutdown).await {
                Ok(Some(step)) => {
                    let engine = Arc::clone(&self.engine);
                    tasks.spawn(async move {
                        let run_id = step.run_id();
                        let step_id = step.execution.step_id.clone();
                        if let Err(e) = engine.process(step).await {
                            tracing::error!(%run_id, %step_id, error = %e, "step processing failed");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "due-attempt scan failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.engine.config().poll_interval()) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "worker pool draining");
        while let Some(joined) = tasks.join_next().await {
            processed += Self::reap(joined);
        }
        if let Err(e) = sweep.await {
            tracing::error!(error = %e, "reconcile sweep panicked");
        }
        tracing::info!(processed, "worker pool stopped");
        processed
    }

    async fn sweep(engine: Arc<Engine<S>>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(engine.config().reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; recovery already covered it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            match engine.reconcile_stalled().await {
                Ok(0) => {}
                Ok(advanced) => tracing::info!(advanced, "reconcile sweep advanced stalled runs"),
                Err(e) => tracing::error!(error = %e, "reconcile sweep failed"),
            }
        }
    }

    fn reap(joined: Result<(), tokio::task::JoinError>) -> usize {
        match joined {
            Ok(()) => 1,
            Err(e) => {
                tracing::error!(error = %e, "worker task panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionStore;
    use crate::workflow::clock::InstantClock;
    use crate::workflow::connector::ConnectorRegistry;
    use crate::workflow::step_runner::{record_outcome, StepOutcome};
    use businessflow_types::config::EngineConfig;
    use businessflow_types::execution::RunStatus;
    use businessflow_types::workflow::{RetryPolicy, StepDefinition, WorkflowDefinition};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_pool_runs_workflow_and_drains() {
        let engine = Arc::new(Engine::new(
            Arc::new(InMemoryExecutionStore::new()),
            ConnectorRegistry::with_builtins(),
            EngineConfig::default(),
        ));
        let def = engine
            .publish_definition(WorkflowDefinition {
                id: Uuid::now_v7(),
                version: 0,
                name: "pool".into(),
                description: None,
                is_active: true,
                concurrency: None,
                triggers: vec![],
                steps: ["a", "b"]
                    .iter()
                    .enumerate()
                    .map(|(i, id)| StepDefinition {
                        id: id.to_string(),
                        name: id.to_string(),
                        capability: "noop".into(),
                        input: json!({}),
                        depends_on: if i == 0 { vec![] } else { vec!["a".into()] },
                        condition: None,
                        retry: RetryPolicy::default(),
                        timeout_ms: None,
                    })
                    .collect(),
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let pool = WorkerPool::new(Arc::clone(&engine));
        let shutdown = pool.shutdown_token();
        let handle = tokio::spawn(async move { pool.run().await });

        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();
        let run = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_run(run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_finishes_run_whose_advance_failed() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let config = EngineConfig {
            reconcile_interval_ms: 1_000,
            storage_retry_attempts: 1,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::with_clock(
            Arc::clone(&store),
            ConnectorRegistry::with_builtins(),
            config,
            Arc::new(InstantClock::new()),
        ));
        let def = engine
            .publish_definition(one_step_workflow("sweep"))
            .await
            .unwrap();
        let run_id = engine.create_run(def.id, None, json!({}), None).await.unwrap();

        // Complete the only attempt while every write after it fails, so the
        // run is left Running with nothing queued.
        let shutdown = CancellationToken::new();
        let dispatched = engine.dispatcher().dispatch_next(&shutdown).await.unwrap().unwrap();
        let attempt_id = dispatched.execution.id;
        drop(dispatched);
        record_outcome(
            store.as_ref(),
            engine.events(),
            engine.config(),
            attempt_id,
            &StepOutcome::succeeded(json!({ "ok": true })),
            chrono::Utc::now(),
        )
        .await
        .unwrap();
        store.fail_next_writes(10);
        assert!(engine.advance(run_id, Some(attempt_id)).await.is_err());
        store.fail_next_writes(0);
        let stuck = store.get_run(&run_id).await.unwrap().unwrap();
        assert!(!stuck.status.is_terminal());

        let pool = WorkerPool::new(Arc::clone(&engine));
        let stop = pool.shutdown_token();
        let handle = tokio::spawn(async move { pool.run().await });

        let run = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_run(run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        stop.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    fn one_step_workflow(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            version: 0,
            name: name.into(),
            description: None,
            is_active: true,
            concurrency: None,
            triggers: vec![],
            steps: vec![StepDefinition {
                id: "only".into(),
                name: "only".into(),
                capability: "noop".into(),
                input: json!({}),
                depends_on: vec![],
                condition: None,
                retry: RetryPolicy::default(),
                timeout_ms: None,
            }],
            metadata: Default::default(),
        }
    }
}
