//! # Clock & Time
//!
//! Provides monotonic "now" and UTC instant handling behind a small trait so
//! the cadence/latency/scheduler algorithms can be driven by synthetic time
//! in tests instead of real sleeps, the same way the teacher's upstream loop
//! reads `tokio::time::Instant::now()` directly — here that read is
//! indirected through `Clock` so it can be substituted.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// A monotonic instant, used for scheduling and bracketing polls.
    fn now_instant(&self) -> Instant;
    /// The current UTC wall-clock time, used for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the real system/tokio clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that starts at a fixed instant and only advances when told to.
///
/// Used by the cadence/latency/scheduler unit tests and the end-to-end
/// scenario tests in `tests/scenarios.rs` to drive deterministic time
/// without real sleeps.
#[derive(Clone)]
pub struct StepClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset_secs: Arc<AtomicI64>,
}

impl StepClock {
    pub fn starting_at(base_utc: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc,
            offset_secs: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Advance both the monotonic and wall-clock readings by `secs`.
    pub fn advance_secs(&self, secs: i64) {
        self.offset_secs.fetch_add(secs, Ordering::SeqCst);
    }

    fn offset(&self) -> i64 {
        self.offset_secs.load(Ordering::SeqCst)
    }
}

impl Clock for StepClock {
    fn now_instant(&self) -> Instant {
        self.base_instant + std::time::Duration::from_secs(self.offset().max(0) as u64)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.base_utc + chrono::Duration::seconds(self.offset())
    }
}
