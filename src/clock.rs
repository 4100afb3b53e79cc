//! Monotonic time source and bounded-operation deadlines
//!
//! Every wait loop in kindling reads time through a [`Clock`] so tests can
//! drive hours of polling in microseconds with a fake clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Source of monotonic time plus the ability to wait on it
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by tokio's timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Start instant plus timeout for a bounded operation.
///
/// Immutable once created; `elapsed`, `remaining` and `expired` are pure
/// queries against the clock it was started on.
#[derive(Clone)]
pub struct Deadline {
    clock: Arc<dyn Clock>,
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Start a deadline of `timeout` from the clock's current instant
    pub fn start(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            timeout,
        }
    }

    /// The configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The instant the deadline was started
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Time since start
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    /// True once elapsed has reached the timeout
    pub fn expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Time since `instant`, measured on this deadline's clock
    pub fn since(&self, instant: Instant) -> Duration {
        self.clock.now().saturating_duration_since(instant)
    }

    /// Current instant on this deadline's clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClock;

    #[tokio::test]
    async fn deadline_tracks_fake_time() {
        let clock = Arc::new(FakeClock::new());
        let deadline = Deadline::start(clock.clone(), Duration::from_secs(600));

        assert_eq!(deadline.elapsed(), Duration::ZERO);
        assert_eq!(deadline.remaining(), Duration::from_secs(600));
        assert!(!deadline.expired());

        clock.sleep(Duration::from_secs(599)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(1));
        assert!(!deadline.expired());

        clock.sleep(Duration::from_secs(1)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn remaining_saturates_past_expiry() {
        let clock = Arc::new(FakeClock::default());
        let deadline = Deadline::start(clock.clone(), Duration::from_secs(10));
        clock.advance(Duration::from_secs(25));
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert_eq!(deadline.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test]
    async fn since_measures_on_the_same_clock() {
        let clock = Arc::new(FakeClock::new());
        let deadline = Deadline::start(clock.clone(), Duration::from_secs(60));
        let mark = deadline.now();
        clock.advance(Duration::from_secs(30));
        assert_eq!(deadline.since(mark), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_sleeps_on_tokio_time() {
        let clock = SystemClock;
        let before = tokio::time::Instant::now();
        clock.sleep(Duration::from_secs(5)).await;
        assert!(before.elapsed() >= Duration::from_secs(5));
    }
}
