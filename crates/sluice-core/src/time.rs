//! Time abstractions for testable timing behavior.
//!
//! Every component that reads the clock or sleeps does so through [`Clock`],
//! so rate-limit refills, breaker recovery windows, and retry backoff can be
//! driven deterministically in tests.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant, SystemTime},
};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject a controllable
/// implementation. Monotonic readings come from `now()` so wall-clock
/// adjustments never produce negative elapsed time.
pub trait Clock: Send + Sync {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`. Dropping the returned
    /// future cancels the sleep.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation backed by system time and tokio sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
