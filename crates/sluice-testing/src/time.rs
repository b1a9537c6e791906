//! Deterministic time control for tests.
//!
//! Provides a controllable clock whose `sleep` advances virtual time
//! immediately and records the requested duration, so backoff sequences and
//! rate-limiter waits can be asserted without real delays.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use sluice_core::Clock;

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to a component
/// under test can be advanced from the test body.
#[derive(Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since start
    monotonic_ns: Arc<AtomicU64>,
    /// System time in nanoseconds since UNIX_EPOCH
    system_ns: Arc<AtomicU64>,
    /// Base instant for monotonic time calculations
    base_instant: Instant,
    /// Durations passed to `sleep`, in call order
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl TestClock {
    /// Creates a new test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific system time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            base_instant: Instant::now(),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the current instant in test time.
    pub fn now_instant(&self) -> Instant {
        let elapsed_ns = self.monotonic_ns.load(Ordering::Acquire);
        self.base_instant + Duration::from_nanos(elapsed_ns)
    }

    /// Returns the current system time in test time.
    pub fn now_system_time(&self) -> SystemTime {
        let ns = self.system_ns.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_nanos(ns)
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_nanos(duration);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.system_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Returns elapsed test time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    /// Returns every duration passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleep log poisoned").clone()
    }

    /// Clears the recorded sleep log.
    pub fn clear_recorded_sleeps(&self) {
        self.sleeps.lock().expect("sleep log poisoned").clear();
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.now_instant()
    }

    fn now_system(&self) -> SystemTime {
        self.now_system_time()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // In tests, sleep advances the clock instead of waiting
        self.sleeps.lock().expect("sleep log poisoned").push(duration);
        self.advance(duration);
        // Yield so other tasks get a chance to observe the new time
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances() {
        let clock = TestClock::new();
        let start = clock.now_instant();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now_instant().duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn system_time_tracks_advance() {
        let start = UNIX_EPOCH + Duration::from_secs(1000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_system_time(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_system_time(), start + Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn sleep_advances_and_records() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep(Duration::from_millis(250)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_millis(5250));
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_secs(5), Duration::from_millis(250)]
        );
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let observer = clock.clone();

        clock.advance(Duration::from_secs(3));

        assert_eq!(observer.elapsed(), Duration::from_secs(3));
    }
}
