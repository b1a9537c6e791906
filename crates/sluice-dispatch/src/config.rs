//! Layered configuration for the dispatch stack.
//!
//! Settings are loaded in priority order: environment variables (highest),
//! a `sluice.toml` file, then built-in defaults. The serde mirror types use
//! second-denominated floats so the file and environment stay human
//! friendly; the converter methods produce the validated component configs.
//!
//! Environment overrides use the `SLUICE_` prefix with `__` as the section
//! separator, e.g. `SLUICE_LIMITER__RATE=50`.

use std::{collections::HashMap, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, ErrorKind, Result};

use crate::{
    adaptive::AdaptiveConfig,
    circuit::BreakerConfig,
    endpoint::{ApiKey, AuthScheme, ClientOptions, EndpointConfig, TransportKind},
    limiter::LimiterConfig,
    queue::QueueConfig,
    retry::RetryPolicy,
};

const CONFIG_FILE: &str = "sluice.toml";

/// Complete dispatch configuration with defaults, file, and environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Token bucket limiter settings.
    pub limiter: LimiterSettings,
    /// Circuit breaker settings.
    pub breaker: BreakerSettings,
    /// Retry policy settings.
    pub retry: RetrySettings,
    /// Bounded queue settings.
    pub queue: QueueSettings,
    /// Endpoint settings.
    pub endpoint: EndpointSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limiter: LimiterSettings::default(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
            endpoint: EndpointSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from defaults, `sluice.toml`, and `SLUICE_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a layer fails to parse.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("SLUICE_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| ApiError::invalid_argument(format!("configuration error: {e}")))
    }
}

/// Serde mirror of [`LimiterConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Tokens refilled per period.
    pub rate: f64,
    /// Refill period in seconds.
    pub period_seconds: f64,
    /// Bucket capacity; defaults to the rate.
    pub max_tokens: Option<f64>,
    /// Adaptive safety factor in (0, 1].
    pub safety_factor: f64,
    /// Adaptive rate floor.
    pub min_rate: f64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self { rate: 10.0, period_seconds: 1.0, max_tokens: None, safety_factor: 1.0, min_rate: 1.0 }
    }
}

impl LimiterSettings {
    /// Converts into a validated [`LimiterConfig`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        let config = LimiterConfig {
            rate: self.rate,
            period: duration_from_secs(self.period_seconds, "limiter.period_seconds")?,
            max_tokens: self.max_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    /// Converts into a validated [`AdaptiveConfig`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn adaptive_config(&self) -> Result<AdaptiveConfig> {
        let config = AdaptiveConfig {
            safety_factor: self.safety_factor,
            min_rate: self.min_rate,
            allow_exceed: false,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Serde mirror of [`BreakerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Open-state duration in seconds before probing.
    pub recovery_time_seconds: f64,
    /// Maximum concurrent half-open probes.
    pub half_open_max_calls: u32,
    /// Error kinds that never count as failures.
    pub excluded_errors: Vec<ErrorKind>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time_seconds: 30.0,
            half_open_max_calls: 1,
            excluded_errors: Vec::new(),
        }
    }
}

impl BreakerSettings {
    /// Converts into a validated [`BreakerConfig`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn breaker_config(&self) -> Result<BreakerConfig> {
        let config = BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_time: duration_from_secs(
                self.recovery_time_seconds,
                "breaker.recovery_time_seconds",
            )?,
            half_open_max_calls: self.half_open_max_calls,
            excluded_errors: self.excluded_errors.iter().copied().collect(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Serde mirror of [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_seconds: f64,
    /// Delay ceiling in seconds.
    pub max_delay_seconds: f64,
    /// Backoff multiplier.
    pub backoff_factor: f64,
    /// Whether delays are randomized.
    pub jitter: bool,
    /// Jitter half-width fraction.
    pub jitter_factor: f64,
    /// Error kinds that are retried.
    pub retry_errors: Vec<ErrorKind>,
    /// Error kinds that never retry.
    pub exclude_errors: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_seconds: policy.base_delay.as_secs_f64(),
            max_delay_seconds: policy.max_delay.as_secs_f64(),
            backoff_factor: policy.backoff_factor,
            jitter: policy.jitter,
            jitter_factor: policy.jitter_factor,
            retry_errors: policy.retry_errors.into_iter().collect(),
            exclude_errors: policy.exclude_errors.into_iter().collect(),
        }
    }
}

impl RetrySettings {
    /// Converts into a validated [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let policy = RetryPolicy {
            max_retries: self.max_retries,
            base_delay: duration_from_secs(self.base_delay_seconds, "retry.base_delay_seconds")?,
            max_delay: duration_from_secs(self.max_delay_seconds, "retry.max_delay_seconds")?,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            jitter_factor: self.jitter_factor,
            retry_errors: self.retry_errors.iter().copied().collect(),
            exclude_errors: self.exclude_errors.iter().copied().collect(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Serde mirror of [`QueueConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Hard buffer capacity.
    pub capacity: usize,
    /// Bounded enqueue wait in seconds.
    pub enqueue_timeout_seconds: f64,
    /// Optional ceiling on simultaneously running calls.
    pub concurrency_limit: Option<usize>,
    /// Worker task count.
    pub worker_count: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            enqueue_timeout_seconds: 0.1,
            concurrency_limit: None,
            worker_count: 1,
        }
    }
}

impl QueueSettings {
    /// Converts into a validated [`QueueConfig`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn queue_config(&self) -> Result<QueueConfig> {
        let config = QueueConfig {
            capacity: self.capacity,
            enqueue_timeout: duration_from_secs(
                self.enqueue_timeout_seconds,
                "queue.enqueue_timeout_seconds",
            )?,
            concurrency_limit: self.concurrency_limit,
            worker_count: self.worker_count,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Serde mirror of [`EndpointConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Provider name.
    pub provider: String,
    /// Transport kind.
    pub transport: TransportKind,
    /// Base URL for the HTTP transport.
    pub base_url: Option<String>,
    /// Path appended to the base URL.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Request content type.
    pub content_type: String,
    /// Auth scheme.
    pub auth: AuthScheme,
    /// Headers sent with every request.
    pub default_headers: HashMap<String, String>,
    /// Per-call timeout in seconds.
    pub timeout_seconds: f64,
    /// Advisory retry budget.
    pub max_retries: u32,
    /// HTTP client construction options.
    pub client_options: ClientOptions,
    /// Environment variable holding the API key; the literal value is used
    /// when no such variable is set.
    pub api_key: Option<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            transport: TransportKind::Http,
            base_url: None,
            path: String::new(),
            method: "POST".to_string(),
            content_type: "application/json".to_string(),
            auth: AuthScheme::None,
            default_headers: HashMap::new(),
            timeout_seconds: 300.0,
            max_retries: 3,
            client_options: ClientOptions::default(),
            api_key: None,
        }
    }
}

impl EndpointSettings {
    /// Converts into a validated [`EndpointConfig`], resolving the API key
    /// through the environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the parameters are invalid.
    pub fn endpoint_config(&self) -> Result<EndpointConfig> {
        let config = EndpointConfig {
            provider: self.provider.clone(),
            transport: self.transport,
            base_url: self.base_url.clone(),
            path: self.path.clone(),
            method: self.method.clone(),
            content_type: self.content_type.clone(),
            auth: self.auth,
            default_headers: self.default_headers.clone(),
            timeout: duration_from_secs(self.timeout_seconds, "endpoint.timeout_seconds")?,
            max_retries_hint: self.max_retries,
            client_options: self.client_options.clone(),
            api_key: self.api_key.as_deref().map(ApiKey::from_env_or_literal),
        };
        config.validate()?;
        Ok(config)
    }
}

fn duration_from_secs(seconds: f64, field: &str) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ApiError::invalid_argument(format!("{field} must be a non-negative number")));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_convert_cleanly() {
        let settings = Settings::default();

        assert!(settings.limiter.limiter_config().is_ok());
        assert!(settings.limiter.adaptive_config().is_ok());
        assert!(settings.breaker.breaker_config().is_ok());
        assert!(settings.retry.retry_policy().is_ok());
        assert!(settings.queue.queue_config().is_ok());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sluice.toml",
                r#"
                [limiter]
                rate = 50.0
                period_seconds = 2.0

                [queue]
                capacity = 7
                worker_count = 3

                [retry]
                max_retries = 1
                jitter = false
                "#,
            )?;

            let settings = Settings::load().expect("settings should load");
            assert!((settings.limiter.rate - 50.0).abs() < 1e-6);
            assert_eq!(settings.queue.capacity, 7);
            assert_eq!(settings.queue.worker_count, 3);
            assert_eq!(settings.retry.max_retries, 1);
            assert!(!settings.retry.jitter);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("sluice.toml", "[limiter]\nrate = 50.0\n")?;
            jail.set_env("SLUICE_LIMITER__RATE", "75");
            jail.set_env("SLUICE_BREAKER__FAILURE_THRESHOLD", "2");

            let settings = Settings::load().expect("settings should load");
            assert!((settings.limiter.rate - 75.0).abs() < 1e-6);
            assert_eq!(settings.breaker.failure_threshold, 2);
            Ok(())
        });
    }

    #[test]
    fn invalid_values_fail_conversion() {
        let mut settings = Settings::default();
        settings.limiter.rate = 0.0;
        assert!(settings.limiter.limiter_config().is_err());

        let mut settings = Settings::default();
        settings.queue.capacity = 0;
        assert!(settings.queue.queue_config().is_err());

        let mut settings = Settings::default();
        settings.retry.max_delay_seconds = 0.001;
        assert!(settings.retry.retry_policy().is_err());
    }

    #[test]
    fn endpoint_settings_resolve_key_material() {
        Jail::expect_with(|jail| {
            jail.set_env("PROVIDER_KEY", "sk-secret");

            let mut settings = EndpointSettings::default();
            settings.provider = "example".to_string();
            settings.base_url = Some("https://api.example.com".to_string());
            settings.path = "/v1/chat".to_string();
            settings.auth = AuthScheme::Bearer;
            settings.api_key = Some("PROVIDER_KEY".to_string());

            let config = settings.endpoint_config().expect("config should convert");
            assert!(config.api_key.is_some());
            // The secret stays redacted in debug output
            assert!(!format!("{config:?}").contains("sk-secret"));
            Ok(())
        });
    }
}
