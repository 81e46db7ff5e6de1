//! Cron scheduling for `schedule` triggers, wrapping `tokio-cron-scheduler`.
//!
//! A trigger's `cron` field is parsed once into a [`Schedule`]: a 5-field or
//! 6-field cron expression, or one of a few English phrases. Whatever the
//! input form, the resulting 6-field expression is validated by croner
//! before it is accepted, so publish-time validation and the job scheduler
//! agree on what a schedule means.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Upper bound on occurrences returned for one catch-up window.
pub const MAX_MISSED_FIRES: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    JobError(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("trigger '{0}' not registered in scheduler")]
    TriggerNotFound(String),
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A validated trigger schedule.
///
/// Accepted inputs (phrases are case-insensitive):
///
/// | input                                   | fires                       |
/// |-----------------------------------------|-----------------------------|
/// | `m h dom mon dow`                       | as cron, at second 0        |
/// | `s m h dom mon dow`                     | as cron                     |
/// | `hourly`, `every hour`                  | at minute 0                 |
/// | `minutely`, `every minute`              | at second 0                 |
/// | `daily`, `every day`                    | at 00:00                    |
/// | `daily at HH:MM`, `every day at HH:MM`  | once a day                  |
/// | `weekdays at HH:MM`, `every weekday at HH:MM` | Monday to Friday      |
/// | `every N seconds` / `minutes` / `hours` | on multiples of N           |
///
/// Intervals are limited to 1-59 seconds or minutes and 1-23 hours; longer
/// periods need a cron expression.
pub struct Schedule {
    expr: String,
    cron: croner::Cron,
}

impl Schedule {
    pub fn parse(input: &str) -> Result<Self, SchedulerError> {
        let input = input.trim();
        let expr = cron_expr(input)?;
        let cron = expr
            .parse::<croner::Cron>()
            .map_err(|e| SchedulerError::InvalidSchedule(format!("'{input}': {e}")))?;
        Ok(Self { expr, cron })
    }

    /// The 6-field cron expression (seconds first).
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Occurrences strictly after `after` and strictly before `before`,
    /// oldest first, at most [`MAX_MISSED_FIRES`].
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.cron
            .iter_after(after)
            .take_while(|next| *next < before)
            .take(MAX_MISSED_FIRES)
            .collect()
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Schedule").field(&self.expr).finish()
    }
}

fn cron_expr(input: &str) -> Result<String, SchedulerError> {
    let lower = input.to_ascii_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let invalid = |why: &str| SchedulerError::InvalidSchedule(format!("'{input}': {why}"));

    let expr = match words.as_slice() {
        ["hourly"] | ["every", "hour"] => "0 0 * * * *".to_string(),
        ["minutely"] | ["every", "minute"] => "0 * * * * *".to_string(),
        ["daily"] | ["every", "day"] => "0 0 0 * * *".to_string(),
        ["daily", "at", time] | ["every", "day", "at", time] => {
            let (hour, minute) = time_of_day(time).ok_or_else(|| invalid("expected HH:MM"))?;
            format!("0 {minute} {hour} * * *")
        }
        ["weekdays", "at", time] | ["every", "weekday", "at", time] => {
            let (hour, minute) = time_of_day(time).ok_or_else(|| invalid("expected HH:MM"))?;
            format!("0 {minute} {hour} * * MON-FRI")
        }
        ["every", n, unit] => {
            let n: u32 = n.parse().map_err(|_| invalid("interval must be a number"))?;
            let (max, expr) = match unit.trim_end_matches('s') {
                "second" => (59, format!("*/{n} * * * * *")),
                "minute" => (59, format!("0 */{n} * * * *")),
                "hour" => (23, format!("0 0 */{n} * * *")),
                _ => return Err(invalid("unit must be seconds, minutes or hours")),
            };
            if !(1..=max).contains(&n) {
                return Err(invalid(&format!("interval must be between 1 and {max}")));
            }
            expr
        }
        fields if fields.len() == 5 => format!("0 {}", fields_of(input)),
        fields if fields.len() == 6 => fields_of(input),
        _ => return Err(invalid("not a cron expression or a known phrase")),
    };
    Ok(expr)
}

/// Cron fields with runs of whitespace collapsed, original case kept.
fn fields_of(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn time_of_day(time: &str) -> Option<(u32, u32)> {
    let (hour, minute) = time.split_once(':')?;
    if minute.len() != 2 {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Callback invoked with the trigger ID and fire time when a job fires.
pub type CronCallback =
    Arc<dyn Fn(String, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledJob {
    job_id: Uuid,
    expr: String,
    last_fired: Option<DateTime<Utc>>,
}

/// One `tokio-cron-scheduler` job per schedule trigger, keyed by trigger ID.
/// Scheduling an already scheduled trigger replaces its job.
pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the job scheduler. Triggers can only be scheduled afterwards.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Stop the job scheduler and forget every job.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.jobs.write().await.clear();
        Ok(())
    }

    pub async fn schedule_trigger(
        &self,
        trigger_id: &str,
        schedule: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let schedule = Schedule::parse(schedule)?;

        if self.jobs.read().await.contains_key(trigger_id) {
            self.unschedule_trigger(trigger_id).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::JobError("scheduler not started".to_string()))?;

        let fired_trigger = trigger_id.to_string();
        let jobs = Arc::clone(&self.jobs);
        let job = Job::new_async(schedule.expr(), move |_uuid, _lock| {
            let callback = Arc::clone(&callback);
            let trigger_id = fired_trigger.clone();
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                let fired_at = Utc::now();
                tracing::debug!(%trigger_id, %fired_at, "schedule fired");
                if let Some(job) = jobs.write().await.get_mut(&trigger_id) {
                    job.last_fired = Some(fired_at);
                }
                callback(trigger_id, fired_at).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        tracing::info!(trigger_id, %job_id, cron = schedule.expr(), "trigger scheduled");
        self.jobs.write().await.insert(
            trigger_id.to_string(),
            ScheduledJob {
                job_id,
                expr: schedule.expr,
                last_fired: None,
            },
        );
        Ok(())
    }

    pub async fn unschedule_trigger(&self, trigger_id: &str) -> Result<(), SchedulerError> {
        let job = self
            .jobs
            .write()
            .await
            .remove(trigger_id)
            .ok_or_else(|| SchedulerError::TriggerNotFound(trigger_id.to_string()))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&job.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }
        tracing::info!(trigger_id, "trigger unscheduled");
        Ok(())
    }

    /// Cron expression and last fire time of a scheduled trigger.
    pub async fn trigger_info(&self, trigger_id: &str) -> Option<(String, Option<DateTime<Utc>>)> {
        self.jobs
            .read()
            .await
            .get(trigger_id)
            .map(|job| (job.expr.clone(), job.last_fired))
    }

    pub async fn trigger_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}
