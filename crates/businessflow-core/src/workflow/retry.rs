//! Retry decisions and exponential backoff.
//!
//! Two concerns share this module:
//! - **Step retries**: whether a failed attempt gets another one and how long
//!   it must wait (`not_before`).
//! - **Storage retries**: bounded re-execution of transient store failures
//!   before the error is surfaced.

use std::future::Future;
use std::time::Duration;

use businessflow_types::error::StorageError;
use businessflow_types::execution::StepExecutionError;
use businessflow_types::workflow::RetryPolicy;
use rand::Rng;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// No internal state; all logic is in associated functions that take the
/// policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether attempt `attempt` (1-based) failing with `error` earns another attempt.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &StepExecutionError) -> bool {
        error.is_retryable() && attempt < policy.max_attempts
    }

    /// Deterministic delay after attempt `attempt` failed:
    /// `min(base * multiplier^(attempt-1), cap)`.
    ///
    /// Non-decreasing in `attempt` for every valid policy. Strictly increasing
    /// only while `multiplier > 1` and the cap is not reached; `multiplier ==
    /// 1.0` gives a constant delay and a cap flattens the tail.
    pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = policy.backoff_base_ms as f64 * policy.multiplier.powi(exponent);
        let capped = match policy.backoff_cap_ms {
            Some(cap) => raw.min(cap as f64),
            None => raw,
        };
        // Saturate instead of overflowing for absurd exponents.
        let millis = if capped.is_finite() {
            capped.min(u64::MAX as f64) as u64
        } else {
            u64::MAX
        };
        Duration::from_millis(millis)
    }

    /// Delay after attempt `attempt` failed, with the policy's jitter applied.
    ///
    /// Jitter `j` scales the base delay by a random factor in `[1 - j, 1 + j]`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = Self::base_delay(policy, attempt);
        if policy.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - policy.jitter)..=(1.0 + policy.jitter));
        base.mul_f64(factor.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Storage retries
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, fails permanently, or `attempts` is exhausted.
///
/// Only transient errors (`StorageError::is_transient`) are retried; the wait
/// doubles from `backoff` after each failure.
pub async fn retry_storage<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "transient storage error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(operation = what, attempt, error = %e, "storage operation failed");
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
