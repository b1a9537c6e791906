//! High-level entry point for sending requests to a provider.
//!
//! A [`Model`] binds one endpoint to a rate-limited executor and the
//! optional resilience layers, then exposes two call styles: [`send`]
//! returns the tracked [`ApiCall`] for callers that poll or multiplex, and
//! [`call`] awaits the terminal state and re-raises the captured error at
//! the await point. Composition order is fixed: retry wraps the endpoint
//! call, the circuit breaker wraps the retry sequence, and the token bucket
//! gates everything at the executor.
//!
//! [`send`]: Model::send
//! [`call`]: Model::call

use std::sync::Arc;

use serde_json::Value;
use sluice_core::{ApiError, CallStatus, Result};
use tracing::debug;

use crate::{
    call::ApiCall,
    circuit::CircuitBreaker,
    endpoint::Endpoint,
    executor::{ExecutorStats, RateLimitedExecutor, Resilience},
    retry::RetryPolicy,
};

/// Per-call options for [`Model::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Forwarded to the endpoint as a cache hint.
    pub cache_control: bool,
    /// Whether the call pays tokens to the rate limiter.
    pub requires_tokens: bool,
    /// Explicit token cost; implies `requires_tokens` when set.
    pub token_cost: Option<u32>,
}

/// Façade composing an endpoint, a rate-limited executor, and optional
/// resilience layers.
///
/// The model shares the endpoint with its calls but owns neither caller
/// state nor results: callers keep the [`ApiCall`] handles they receive.
#[derive(Debug)]
pub struct Model {
    endpoint: Arc<Endpoint>,
    executor: RateLimitedExecutor,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryPolicy>,
}

impl Model {
    /// Creates a model over an endpoint and executor.
    pub fn new(endpoint: Arc<Endpoint>, executor: RateLimitedExecutor) -> Self {
        Self { endpoint, executor, breaker: None, retry: None }
    }

    /// Adds a circuit breaker around the retry sequence.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Adds a retry policy around the endpoint call.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The endpoint this model dispatches to.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// The executor running this model's calls.
    pub fn executor(&self) -> &RateLimitedExecutor {
        &self.executor
    }

    /// Starts the executor with the configured resilience installed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the executor was already stopped.
    pub fn start(&self) -> Result<()> {
        self.executor.executor().set_resilience(Resilience {
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
        });
        self.executor.start()
    }

    /// Stops the executor, draining pending calls first.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when workers outlive the shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        self.executor.stop().await
    }

    /// Runs `f` with the model started, stopping on the way out on both
    /// success and error return paths.
    pub async fn scope<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        self.start()?;
        let result = f().await;
        self.stop().await?;
        Ok(result)
    }

    /// Builds a call bound to this model's endpoint.
    pub fn create_call(&self, request: Value, options: &SendOptions) -> Arc<ApiCall> {
        let mut call = ApiCall::new(self.endpoint.clone(), request)
            .with_cache_control(options.cache_control)
            .with_requires_tokens(options.requires_tokens || options.token_cost.is_some());
        if let Some(cost) = options.token_cost {
            call = call.with_token_cost(cost);
        }
        Arc::new(call)
    }

    /// Submits a request and returns the tracked call.
    ///
    /// The caller observes progress through the handle: poll
    /// [`status`](ApiCall::status) or await [`wait`](ApiCall::wait).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the model is not running.
    pub async fn send(&self, request: Value, options: SendOptions) -> Result<Arc<ApiCall>> {
        let call = self.create_call(request, &options);
        debug!(call_id = %call.id(), provider = %self.endpoint.config().provider, "sending call");
        self.executor.submit(call.clone()).await?;
        Ok(call)
    }

    /// Submits a request and awaits its result.
    ///
    /// Transient failures are retried inside the worker; the error that
    /// survives retries and breaker admission is re-raised here.
    /// `CircuitOpen` and `Backpressure` surface unchanged.
    ///
    /// # Errors
    ///
    /// Returns the call's captured terminal error.
    pub async fn call(&self, request: Value) -> Result<Value> {
        self.call_with(request, SendOptions::default()).await
    }

    /// [`call`](Self::call) with explicit per-call options.
    ///
    /// # Errors
    ///
    /// Returns the call's captured terminal error.
    pub async fn call_with(&self, request: Value, options: SendOptions) -> Result<Value> {
        let call = self.send(request, options).await?;
        let execution = call.wait().await;
        // The terminal state is recorded; drop our tracking entry.
        self.executor.executor().pop(call.id());

        match execution.status {
            CallStatus::Succeeded => Ok(execution.result.unwrap_or(Value::Null)),
            CallStatus::Failed | CallStatus::Cancelled => Err(execution
                .error
                .unwrap_or_else(|| ApiError::invalid_state("terminal call without an error"))),
            CallStatus::Pending | CallStatus::Running => {
                Err(ApiError::invalid_state("call resolved without a terminal state"))
            },
        }
    }

    /// Snapshot of the executor counters.
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }
}
