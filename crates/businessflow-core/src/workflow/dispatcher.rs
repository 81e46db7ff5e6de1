//! Dispatcher: hands due step attempts to workers.
//!
//! A global semaphore bounds the number of attempts executing at once. Each
//! call to [`Dispatcher::dispatch_next`] first takes a permit, then claims the
//! oldest due `Queued` attempt whose run is below its concurrency limit with a
//! compare-and-set to `Dispatched`. When nothing is claimable it suspends
//! until woken, until the earliest retry becomes due, or for one poll
//! interval, whichever comes first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use businessflow_types::error::StorageError;
use businessflow_types::event::EngineEvent;
use businessflow_types::execution::{StepExecution, StepStatus, StepTransition};
use businessflow_types::workflow::WorkflowDefinition;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::DefinitionCache;
use super::clock::{until, SharedClock};
use crate::event::EventBus;
use crate::repository::ExecutionStore;

/// Maximum number of due attempts examined per scan.
const DUE_SCAN_LIMIT: u32 = 256;

/// A claimed attempt, holding one global worker permit until dropped.
#[derive(Debug)]
pub struct DispatchedStep {
    pub execution: StepExecution,
    pub definition: Arc<WorkflowDefinition>,
    _permit: OwnedSemaphorePermit,
}

impl DispatchedStep {
    pub fn run_id(&self) -> Uuid {
        self.execution.run_id
    }
}

/// Claims due attempts for workers.
pub struct Dispatcher<S> {
    store: Arc<S>,
    cache: Arc<DefinitionCache>,
    clock: SharedClock,
    events: EventBus,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
    poll_interval: Duration,
    default_run_concurrency: u32,
}

impl<S: ExecutionStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<DefinitionCache>,
        clock: SharedClock,
        events: EventBus,
        workers: usize,
        poll_interval: Duration,
        default_run_concurrency: u32,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            events,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            wake: Arc::new(Notify::new()),
            poll_interval,
            default_run_concurrency: default_run_concurrency.max(1),
        }
    }

    /// Signal that new work may be due.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Number of free worker permits.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit and a claimable attempt. `None` once `shutdown` fires.
    pub async fn dispatch_next(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<DispatchedStep>, StorageError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(None),
            },
            _ = shutdown.cancelled() => return Ok(None),
        };

        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let now = self.clock.now();
            let mut blocked: HashSet<Uuid> = HashSet::new();
            let mut in_flight: HashMap<Uuid, u32> = HashMap::new();

            // Rescan past runs found blocked so a full page of one saturated
            // run cannot hide claimable attempts of others.
            loop {
                let exclude: Vec<Uuid> = blocked.iter().copied().collect();
                let due = self
                    .store
                    .due_step_executions(now, DUE_SCAN_LIMIT, &exclude)
                    .await?;
                let page_full = due.len() >= DUE_SCAN_LIMIT as usize;
                let blocked_before = blocked.len();

                for execution in due {
                    let run_id = execution.run_id;
                    if blocked.contains(&run_id) {
                        continue;
                    }
                    let Some(definition) = self.cache.for_run(self.store.as_ref(), run_id).await? else {
                        tracing::warn!(%run_id, step_id = %execution.step_id, "queued attempt has no run, skipping");
                        blocked.insert(run_id);
                        continue;
                    };

                    let limit = definition
                        .concurrency
                        .unwrap_or(self.default_run_concurrency)
                        .max(1);
                    let running = match in_flight.get(&run_id) {
                        Some(n) => *n,
                        None => {
                            let n = self.store.count_in_flight(&run_id).await?;
                            in_flight.insert(run_id, n);
                            n
                        }
                    };
                    if running >= limit {
                        tracing::debug!(%run_id, running, limit, "run at concurrency limit");
                        blocked.insert(run_id);
                        continue;
                    }

                    let claim = StepTransition::to(StepStatus::Dispatched).started(now);
                    if !self
                        .store
                        .transition_step(&execution.id, StepStatus::Queued, &claim)
                        .await?
                    {
                        // Claimed elsewhere or cancelled since the scan.
                        continue;
                    }

                    let mut execution = execution;
                    claim.apply(&mut execution);
                    tracing::debug!(
                        %run_id,
                        step_id = %execution.step_id,
                        attempt = execution.attempt,
                        "dispatched step attempt"
                    );
                    self.events.publish(EngineEvent::StepDispatched {
                        run_id,
                        step_id: execution.step_id.clone(),
                        attempt: execution.attempt,
                    });
                    return Ok(Some(DispatchedStep {
                        execution,
                        definition,
                        _permit: permit,
                    }));
                }

                if !page_full || blocked.len() == blocked_before {
                    break;
                }
                tracing::debug!(blocked = blocked.len(), "due page exhausted by blocked runs, rescanning");
            }

            let wait = if blocked.is_empty() {
                match self.store.next_due_at().await? {
                    Some(due_at) => until(self.clock.as_ref(), due_at).min(self.poll_interval),
                    None => self.poll_interval,
                }
            } else {
                self.poll_interval
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => return Ok(None),
            }
        }
    }
}

impl<S> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available_permits", &self.permits.available_permits())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
