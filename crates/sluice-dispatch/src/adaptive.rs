//! Adaptive rate adjustment from provider response headers.
//!
//! Providers advertise their quota through `X-RateLimit-*` or `RateLimit-*`
//! headers. [`AdaptiveLimiter`] reads those hints off responses and lowers
//! the wrapped bucket's refill rate before the provider starts returning
//! 429s, keeping a configurable safety margin below the advertised limit.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, Result};
use tracing::debug;

use crate::limiter::TokenBucketLimiter;

/// Tuning for adaptive rate updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Fraction of the advertised limit to actually use, in (0, 1].
    pub safety_factor: f64,
    /// Floor below which the rate is never lowered.
    pub min_rate: f64,
    /// Permits raising the rate above the bucket's original configured rate.
    pub allow_exceed: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self { safety_factor: 1.0, min_rate: 1.0, allow_exceed: false }
    }
}

impl AdaptiveConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a safety factor outside (0, 1] or a
    /// non-positive minimum rate.
    pub fn validate(&self) -> Result<()> {
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(ApiError::invalid_argument("safety_factor must be in (0, 1]"));
        }
        if !self.min_rate.is_finite() || self.min_rate < 1.0 {
            return Err(ApiError::invalid_argument("min_rate must be at least 1"));
        }
        Ok(())
    }
}

/// Wraps a [`TokenBucketLimiter`] and retunes its rate from header feedback.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    inner: Arc<TokenBucketLimiter>,
    config: AdaptiveConfig,
    /// The wrapped bucket's rate at wrap time; updates never exceed it
    /// unless `allow_exceed` is set.
    ceiling: f64,
}

impl AdaptiveLimiter {
    /// Wraps `inner`, capturing its current rate as the update ceiling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub async fn wrap(inner: Arc<TokenBucketLimiter>, config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        let ceiling = inner.current_rate().await;
        Ok(Self { inner, config, ceiling })
    }

    /// Returns the wrapped limiter.
    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.inner
    }

    /// Adjusts the wrapped bucket's rate from response headers.
    ///
    /// Recognizes both the `X-RateLimit-*` and `RateLimit-*` families
    /// (case-insensitive) plus `Retry-After`. A `Retry-After` throttles the
    /// bucket to the configured floor. A credible `*-Limit` becomes the new
    /// effective rate after safety scaling and clamping into
    /// `[min_rate, ceiling]`. Responses without recognizable headers leave
    /// the rate untouched.
    pub async fn update_from_headers(&self, headers: &HashMap<String, String>) {
        if let Some(retry_after) = parse_header(headers, &["retry-after"]) {
            debug!(retry_after, new_rate = self.config.min_rate, "provider asked to back off");
            self.apply(self.config.min_rate).await;
            return;
        }

        let Some(limit) = parse_header(headers, &["x-ratelimit-limit", "ratelimit-limit"]) else {
            return;
        };
        if limit <= 0.0 {
            return;
        }

        // Remaining/reset are advisory; the advertised limit is the credible
        // sustained rate. They still go into the structured log for operators.
        let remaining = parse_header(headers, &["x-ratelimit-remaining", "ratelimit-remaining"]);
        let reset = parse_header(headers, &["x-ratelimit-reset", "ratelimit-reset"]);

        let ceiling = if self.config.allow_exceed { f64::INFINITY } else { self.ceiling };
        let new_rate = (limit * self.config.safety_factor)
            .clamp(self.config.min_rate, ceiling.max(self.config.min_rate));

        debug!(limit, ?remaining, ?reset, new_rate, "adaptive rate update from headers");
        self.apply(new_rate).await;
    }

    async fn apply(&self, rate: f64) {
        if let Err(error) = self.inner.configure(Some(rate), None, None, false).await {
            // Clamping keeps the rate positive, so this only fires on NaN-ish
            // header arithmetic; keep the old rate.
            debug!(%error, "adaptive rate update rejected");
        }
    }
}

/// Case-insensitive numeric header lookup across name variants.
fn parse_header(headers: &HashMap<String, String>, names: &[&str]) -> Option<f64> {
    for (key, value) in headers {
        let lowered = key.to_ascii_lowercase();
        if names.contains(&lowered.as_str()) {
            if let Ok(parsed) = value.trim().parse::<f64>() {
                return Some(parsed);
            }
        }
    }
    None
}
