//! `bflow worker`: the long-running execution process.
//!
//! Startup order: recover interrupted attempts, register schedules and
//! catch up missed fires, then run the worker pool until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use businessflow_core::repository::ExecutionStore;
use businessflow_core::workflow::scheduler::CronScheduler;
use businessflow_core::workflow::{Engine, RecoveryReport, WorkerPool};
use console::style;

use crate::state::AppState;

pub async fn handle_worker(state: &AppState, no_schedules: bool, quiet: bool) -> Result<()> {
    let engine = Arc::clone(&state.engine);
    let (report, scheduler) = start_services(&engine, no_schedules).await?;

    let pool = WorkerPool::new(Arc::clone(&engine));
    let shutdown = pool.shutdown_token();
    let worker = tokio::spawn(async move { pool.run().await });

    if !quiet {
        println!();
        println!(
            "  {} Worker running ({} slots, {} interrupted attempts recovered)",
            style("*").green().bold(),
            state.config.workers,
            report.interrupted_attempts
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining in-flight steps");

    if let Some(scheduler) = &scheduler {
        if let Err(e) = scheduler.stop().await {
            tracing::warn!(error = %e, "cron scheduler did not stop cleanly");
        }
    }
    shutdown.cancel();
    let processed = worker.await.context("worker pool panicked")?;

    if !quiet {
        println!();
        println!("  Worker stopped after {processed} steps.");
    }
    Ok(())
}

/// Recover, then register schedules and catch up missed fires. The engine
/// logs its own recovery summary.
async fn start_services<S: ExecutionStore>(
    engine: &Arc<Engine<S>>,
    no_schedules: bool,
) -> Result<(RecoveryReport, Option<CronScheduler>)> {
    let report = engine.recover().await.context("recovery failed")?;
    if no_schedules {
        return Ok((report, None));
    }
    let scheduler = CronScheduler::new();
    scheduler.start().await?;
    let scheduled = engine.schedule_triggers(&scheduler).await?;
    let caught_up = engine.catch_up_missed_fires().await?;
    tracing::info!(scheduled, caught_up, "schedules registered");
    Ok((report, Some(scheduler)))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use businessflow_core::repository::InMemoryExecutionStore;
    use businessflow_core::workflow::connector::ConnectorRegistry;
    use businessflow_types::config::EngineConfig;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts events whose message equals `message`.
    struct MessageCount {
        message: &'static str,
        hits: Arc<AtomicUsize>,
    }

    struct Message(String);

    impl Visit for Message {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for MessageCount {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
            let mut message = Message(String::new());
            event.record(&mut message);
            if message.0 == self.message {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_startup_logs_recovery_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(MessageCount {
            message: "recovery complete",
            hits: Arc::clone(&hits),
        });
        let _guard = tracing::subscriber::set_default(subscriber);

        let engine = Arc::new(Engine::new(
            Arc::new(InMemoryExecutionStore::new()),
            ConnectorRegistry::with_builtins(),
            EngineConfig::default(),
        ));
        let (report, scheduler) = start_services(&engine, true).await.unwrap();
        assert_eq!(report.interrupted_attempts, 0);
        assert!(scheduler.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
