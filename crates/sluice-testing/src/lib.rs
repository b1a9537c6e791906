//! Test utilities for deterministic timing in the sluice workspace.
//!
//! The production crates read time exclusively through `sluice_core::Clock`,
//! so injecting [`TestClock`] makes rate-limiter refills, circuit-breaker
//! recovery windows, and retry backoff fully deterministic in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod time;

pub use sluice_core::Clock;
pub use time::TestClock;
