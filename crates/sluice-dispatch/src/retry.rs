//! Retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] is a pure configuration value; [`run`](RetryPolicy::run)
//! drives a fallible operation through it. Classification is set-based:
//! error kinds in `exclude_errors` are re-raised untouched, kinds in
//! `retry_errors` sleep and retry, everything else re-raises immediately.
//! Jitter randomizes each delay to keep synchronized clients from retrying
//! in lockstep.

use std::{collections::HashSet, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, Clock, ErrorKind, Result};
use tracing::info;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to every delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Whether to randomize delays.
    pub jitter: bool,
    /// Jitter half-width as a fraction of the delay, in [0, 1].
    pub jitter_factor: f64,
    /// Error kinds that are retried.
    pub retry_errors: HashSet<ErrorKind>,
    /// Error kinds that are re-raised without ever retrying.
    pub exclude_errors: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.2,
            retry_errors: [
                ErrorKind::Transport,
                ErrorKind::Timeout,
                ErrorKind::RateLimit,
                ErrorKind::Server,
            ]
            .into_iter()
            .collect(),
            exclude_errors: [ErrorKind::Auth, ErrorKind::NotFound, ErrorKind::BadRequest]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a max delay below the base delay, a
    /// backoff factor below 1, or a jitter factor outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(ApiError::invalid_argument("max_delay must be at least base_delay"));
        }
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(ApiError::invalid_argument("backoff_factor must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ApiError::invalid_argument("jitter_factor must be in [0, 1]"));
        }
        Ok(())
    }

    /// Runs `op`, retrying per this policy.
    ///
    /// `op` is invoked at least once and at most `max_retries + 1` times.
    /// Backoff sleeps go through `clock`; dropping the returned future
    /// during a sleep aborts the retry without re-invoking `op`.
    ///
    /// # Errors
    ///
    /// Returns the final error once retries are exhausted, or the first
    /// error whose kind is excluded or not retryable.
    pub async fn run<F, Fut, T>(&self, clock: &dyn Clock, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.base_delay.min(self.max_delay);

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let kind = error.kind();
            if self.exclude_errors.contains(&kind) {
                return Err(error);
            }
            if attempt >= self.max_retries {
                return Err(error);
            }
            if !self.retry_errors.contains(&kind) {
                return Err(error);
            }

            let sleep_for = self.effective_delay(delay, &error);
            info!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_secs = sleep_for.as_secs_f64(),
                error = %error,
                "retrying after backoff"
            );

            clock.sleep(sleep_for).await;

            attempt += 1;
            delay = mul_capped(delay, self.backoff_factor, self.max_delay);
        }
    }

    /// Computes the delay actually slept for one retry.
    ///
    /// A provider Retry-After hint wins over the computed backoff when it
    /// fits under `max_delay`; otherwise the jittered exponential delay is
    /// used, capped at `max_delay`.
    fn effective_delay(&self, delay: Duration, error: &ApiError) -> Duration {
        if let Some(hint_secs) = error.retry_after_seconds() {
            if hint_secs >= 0.0 {
                let hinted = Duration::from_secs_f64(hint_secs);
                if hinted <= self.max_delay {
                    return hinted;
                }
            }
        }

        let jittered = if self.jitter && self.jitter_factor > 0.0 {
            let factor = rand::rng()
                .random_range((1.0 - self.jitter_factor)..=(1.0 + self.jitter_factor));
            delay.mul_f64(factor)
        } else {
            delay
        };

        jittered.min(self.max_delay)
    }
}

fn mul_capped(delay: Duration, factor: f64, cap: Duration) -> Duration {
    let scaled = delay.as_secs_f64() * factor;
    if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(scaled)
    }
}
