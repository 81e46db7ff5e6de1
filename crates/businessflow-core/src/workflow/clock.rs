//! Time source for the engine.
//!
//! All timestamps written by the engine (queued/started/finished times,
//! retry `not_before`) come from a `Clock`, and the dispatcher converts
//! wall-clock deadlines back into tokio sleeps through it. `InstantClock`
//! derives wall time from `tokio::time::Instant`, so paused-time tests
//! advance both together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of "now" for the engine.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared, type-erased clock.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time anchored to the tokio clock.
///
/// Reports `anchor + (tokio::time::Instant::now() - start)`.
#[derive(Debug, Clone)]
pub struct InstantClock {
    anchor: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl InstantClock {
    /// Anchor at the current wall-clock time.
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor at a fixed wall-clock time.
    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            start: tokio::time::Instant::now(),
        }
    }

    /// Time elapsed on the tokio clock since the anchor.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.start.elapsed())
            .ok()
            .and_then(|elapsed| self.anchor.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// How long until `deadline`, or zero if it has passed.
pub fn until(clock: &dyn Clock, deadline: DateTime<Utc>) -> Duration {
    (deadline - clock.now()).to_std().unwrap_or(Duration::ZERO)
}
