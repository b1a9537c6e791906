//! Token-bucket rate limiting for outbound API calls.
//!
//! The bucket holds fractional tokens refilled continuously from a monotonic
//! clock; each admission debits an integral public cost. [`acquire`] never
//! sleeps: it either debits immediately or reports the exact wait for the
//! deficit, leaving the sleep to the caller so cancellation can never strand
//! debited tokens. [`EndpointLimiter`] keeps one bucket per endpoint key,
//! created lazily from defaults.
//!
//! [`acquire`]: TokenBucketLimiter::acquire

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, Clock, RealClock, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Configuration for a token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens refilled per period.
    pub rate: f64,
    /// Refill period.
    pub period: Duration,
    /// Bucket capacity; defaults to `rate` when unset.
    pub max_tokens: Option<f64>,
}

impl LimiterConfig {
    /// Creates a config with capacity defaulting to the rate.
    pub fn new(rate: f64, period: Duration) -> Self {
        Self { rate, period, max_tokens: None }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for non-positive rate or period, or a
    /// capacity below the rate.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ApiError::invalid_argument("limiter rate must be positive"));
        }
        if self.period.is_zero() {
            return Err(ApiError::invalid_argument("limiter period must be positive"));
        }
        if let Some(max) = self.max_tokens {
            if !max.is_finite() || max < self.rate {
                return Err(ApiError::invalid_argument(
                    "limiter max_tokens must be at least the rate",
                ));
            }
        }
        Ok(())
    }

    fn capacity(&self) -> f64 {
        self.max_tokens.unwrap_or(self.rate)
    }
}

/// Mutable bucket state, protected by a single mutex.
///
/// Rate and capacity live here too so adaptive updates swap them atomically
/// with respect to refills.
#[derive(Debug)]
struct BucketState {
    rate: f64,
    period: Duration,
    max_tokens: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Adds tokens for the time elapsed since the last refill, capped at
    /// capacity. Idempotent under an unchanged clock reading.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let new_tokens = elapsed.as_secs_f64() * self.rate / self.period.as_secs_f64();

        if new_tokens > 0.0 {
            self.tokens = (self.tokens + new_tokens).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

/// Rate limiter using the token bucket algorithm.
///
/// Allows bursts up to the bucket capacity while holding the long-term rate
/// to `rate / period`. Shared across callers behind `Arc`; all state changes
/// happen under one internal lock.
pub struct TokenBucketLimiter {
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter").field("state", &self.state).finish_non_exhaustive()
    }
}

impl TokenBucketLimiter {
    /// Creates a limiter with capacity equal to the rate.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the parameters fail validation.
    pub fn new(rate: f64, period: Duration) -> Result<Self> {
        Self::with_config(LimiterConfig::new(rate, period), Arc::new(RealClock))
    }

    /// Creates a limiter from a full configuration and an injected clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn with_config(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity();

        debug!(
            rate = config.rate,
            period_secs = config.period.as_secs_f64(),
            max_tokens = capacity,
            "token bucket limiter created"
        );

        Ok(Self {
            state: Mutex::new(BucketState {
                rate: config.rate,
                period: config.period,
                max_tokens: capacity,
                tokens: capacity,
                last_refill: clock.now(),
            }),
            clock,
        })
    }

    /// Attempts to take `tokens` from the bucket.
    ///
    /// Refills first, then either debits and returns [`Duration::ZERO`], or
    /// returns the exact wait until the deficit refills without debiting
    /// anything. Callers sleep and retry; see [`execute`](Self::execute).
    pub async fn acquire(&self, tokens: f64) -> Duration {
        let mut state = self.state.lock().await;
        state.refill(self.clock.now());

        // A cost above capacity can never be satisfied in one refill window;
        // clamp so callers make progress instead of waiting forever.
        let requested = if tokens > state.max_tokens {
            warn!(
                requested = tokens,
                capacity = state.max_tokens,
                "token cost exceeds bucket capacity, clamping"
            );
            state.max_tokens
        } else {
            tokens
        };

        if state.tokens >= requested {
            state.tokens -= requested;
            return Duration::ZERO;
        }

        let deficit = requested - state.tokens;
        Duration::from_secs_f64(deficit * state.period.as_secs_f64() / state.rate)
    }

    /// Runs `op` once `tokens` have been paid to the bucket.
    ///
    /// Loops acquire → sleep → retry until admitted. Dropping the returned
    /// future while sleeping cancels the wait; nothing was debited, so no
    /// refund is needed. Once debited, the cost is considered spent even if
    /// `op` itself fails or is cancelled.
    pub async fn execute<F, Fut, T>(&self, tokens: f64, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        loop {
            let wait = self.acquire(tokens).await;
            if wait.is_zero() {
                break;
            }
            debug!(wait_secs = wait.as_secs_f64(), "rate limited, waiting for tokens");
            self.clock.sleep(wait).await;
        }

        op().await
    }

    /// Returns the tokens currently available, after a refill.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.clock.now());
        state.tokens
    }

    /// Returns the current refill rate.
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    /// Replaces rate, period, or capacity atomically.
    ///
    /// Outstanding waits computed before the update complete against their
    /// previously quoted delays; every later acquisition sees the new
    /// parameters. `reset_tokens` refills the bucket to the new capacity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the resulting parameters are invalid.
    pub async fn configure(
        &self,
        rate: Option<f64>,
        period: Option<Duration>,
        max_tokens: Option<f64>,
        reset_tokens: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        // Settle the balance under the old parameters first
        state.refill(self.clock.now());

        let new_rate = rate.unwrap_or(state.rate);
        let new_period = period.unwrap_or(state.period);
        let new_max = max_tokens.unwrap_or(state.max_tokens);

        if !new_rate.is_finite() || new_rate <= 0.0 {
            return Err(ApiError::invalid_argument("limiter rate must be positive"));
        }
        if new_period.is_zero() {
            return Err(ApiError::invalid_argument("limiter period must be positive"));
        }
        if !new_max.is_finite() || new_max <= 0.0 {
            return Err(ApiError::invalid_argument("limiter max_tokens must be positive"));
        }

        state.rate = new_rate;
        state.period = new_period;
        state.max_tokens = new_max;
        state.tokens = if reset_tokens { new_max } else { state.tokens.min(new_max) };

        debug!(
            rate = new_rate,
            period_secs = new_period.as_secs_f64(),
            max_tokens = new_max,
            reset_tokens,
            "limiter reconfigured"
        );
        Ok(())
    }
}

/// Keyed registry of token buckets, one per endpoint.
///
/// Buckets are created lazily from the default rate and period the first
/// time a key is seen, and can be reconfigured per key without dropping
/// in-flight acquisitions.
pub struct EndpointLimiter {
    default_rate: f64,
    default_period: Duration,
    limiters: Mutex<HashMap<String, Arc<TokenBucketLimiter>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EndpointLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLimiter")
            .field("default_rate", &self.default_rate)
            .field("default_period", &self.default_period)
            .finish_non_exhaustive()
    }
}

impl EndpointLimiter {
    /// Creates a registry whose buckets default to `rate` per `period`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the defaults fail validation.
    pub fn new(default_rate: f64, default_period: Duration) -> Result<Self> {
        Self::with_clock(default_rate, default_period, Arc::new(RealClock))
    }

    /// Creates a registry with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the defaults fail validation.
    pub fn with_clock(
        default_rate: f64,
        default_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        LimiterConfig::new(default_rate, default_period).validate()?;
        Ok(Self { default_rate, default_period, limiters: Mutex::new(HashMap::new()), clock })
    }

    /// Returns the limiter for `key`, creating it from defaults on first use.
    pub async fn limiter_for(&self, key: &str) -> Arc<TokenBucketLimiter> {
        let mut limiters = self.limiters.lock().await;
        if let Some(limiter) = limiters.get(key) {
            return limiter.clone();
        }

        // Defaults were validated at construction, so this cannot fail.
        let limiter = TokenBucketLimiter::with_config(
            LimiterConfig::new(self.default_rate, self.default_period),
            self.clock.clone(),
        )
        .unwrap_or_else(|_| unreachable!("registry defaults are validated at construction"));
        let limiter = Arc::new(limiter);

        debug!(endpoint = key, rate = self.default_rate, "created endpoint limiter");
        limiters.insert(key.to_string(), limiter.clone());
        limiter
    }

    /// Reconfigures the limiter for `key`.
    ///
    /// In-flight acquisitions complete under the parameters they were quoted;
    /// new acquisitions use the updated ones.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the resulting parameters are invalid.
    pub async fn update(
        &self,
        key: &str,
        rate: Option<f64>,
        period: Option<Duration>,
        max_tokens: Option<f64>,
        reset_tokens: bool,
    ) -> Result<()> {
        let limiter = self.limiter_for(key).await;
        limiter.configure(rate, period, max_tokens, reset_tokens).await
    }

    /// Runs `op` under the rate limit of `key`.
    pub async fn execute<F, Fut, T>(&self, key: &str, tokens: f64, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let limiter = self.limiter_for(key).await;
        limiter.execute(tokens, op).await
    }

    /// Returns the number of registered endpoint keys.
    pub async fn endpoint_count(&self) -> usize {
        self.limiters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use sluice_testing::TestClock;

    use super::*;

    #[test]
    fn construction_rejects_invalid_parameters() {
        assert!(TokenBucketLimiter::new(0.0, Duration::from_secs(1)).is_err());
        assert!(TokenBucketLimiter::new(-1.0, Duration::from_secs(1)).is_err());
        assert!(TokenBucketLimiter::new(10.0, Duration::ZERO).is_err());

        let config = LimiterConfig {
            rate: 10.0,
            period: Duration::from_secs(1),
            max_tokens: Some(5.0),
        };
        assert!(TokenBucketLimiter::with_config(config, Arc::new(RealClock)).is_err());
    }

    #[tokio::test]
    async fn acquire_debits_when_tokens_available() {
        let limiter = TokenBucketLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        let wait = limiter.acquire(3.0).await;

        assert_eq!(wait, Duration::ZERO);
        assert!((limiter.available().await - 7.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn acquire_quotes_exact_deficit_wait_without_debiting() {
        let limiter = TokenBucketLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        // Drain the bucket to 3 tokens
        assert_eq!(limiter.acquire(7.0).await, Duration::ZERO);

        // Need 5, have ~3: deficit 2 at 10/s is 0.2s
        let wait = limiter.acquire(5.0).await;
        assert!((wait.as_secs_f64() - 0.2).abs() < 0.01, "wait was {wait:?}");

        // Nothing was debited by the failed acquire
        assert!((limiter.available().await - 3.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn burst_up_to_capacity_then_limited() {
        let limiter = TokenBucketLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        for _ in 0..10 {
            assert_eq!(limiter.acquire(1.0).await, Duration::ZERO);
        }

        let wait = limiter.acquire(1.0).await;
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn refill_caps_at_capacity() {
        let clock = Arc::new(TestClock::new());
        let config = LimiterConfig {
            rate: 10.0,
            period: Duration::from_secs(1),
            max_tokens: Some(15.0),
        };
        let limiter = TokenBucketLimiter::with_config(config, clock.clone()).unwrap();

        assert_eq!(limiter.acquire(15.0).await, Duration::ZERO);

        // Two periods would refill 20 tokens; capacity holds it at 15
        clock.advance(Duration::from_secs(2));
        assert!((limiter.available().await - 15.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn execute_sleeps_for_the_quoted_wait() {
        let clock = Arc::new(TestClock::new());
        let limiter = TokenBucketLimiter::with_config(
            LimiterConfig::new(2.0, Duration::from_secs(1)),
            clock.clone(),
        )
        .unwrap();

        // Drain the burst
        assert_eq!(limiter.acquire(2.0).await, Duration::ZERO);

        let value = limiter.execute(1.0, || async { 42 }).await;

        assert_eq!(value, 42);
        // One token at 2/s is half a second of virtual time
        assert!(clock.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn oversized_cost_is_clamped_to_capacity() {
        let limiter = TokenBucketLimiter::new(5.0, Duration::from_secs(1)).unwrap();

        // Cost above capacity still admits once the bucket is full
        assert_eq!(limiter.acquire(50.0).await, Duration::ZERO);
        assert!(limiter.available().await < 1e-6);
    }

    #[tokio::test]
    async fn configure_updates_parameters() {
        let limiter = TokenBucketLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        limiter
            .configure(Some(5.0), Some(Duration::from_secs(2)), Some(15.0), true)
            .await
            .unwrap();

        assert!((limiter.current_rate().await - 5.0).abs() < 1e-6);
        assert!((limiter.available().await - 15.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn configure_without_reset_keeps_balance() {
        let limiter = TokenBucketLimiter::new(10.0, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.acquire(8.0).await, Duration::ZERO);

        limiter.configure(Some(5.0), None, None, false).await.unwrap();

        assert!(limiter.available().await < 3.0);
    }

    #[tokio::test]
    async fn endpoint_limiter_creates_lazily_and_reuses() {
        let registry = EndpointLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        assert_eq!(registry.endpoint_count().await, 0);

        let first = registry.limiter_for("api/v1/users").await;
        let second = registry.limiter_for("api/v1/users").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.endpoint_count().await, 1);
    }

    #[tokio::test]
    async fn endpoint_limiter_update_is_scoped_to_key() {
        let registry = EndpointLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        registry.update("slow", Some(2.0), None, None, false).await.unwrap();

        assert!((registry.limiter_for("slow").await.current_rate().await - 2.0).abs() < 1e-6);
        assert!((registry.limiter_for("fast").await.current_rate().await - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn endpoint_limiter_executes_under_keyed_bucket() {
        let registry = EndpointLimiter::new(10.0, Duration::from_secs(1)).unwrap();

        let result = registry.execute("api/v1/users", 1.0, || async { "ok" }).await;

        assert_eq!(result, "ok");
        assert!((registry.limiter_for("api/v1/users").await.available().await - 9.0).abs() < 0.1);
    }
}
