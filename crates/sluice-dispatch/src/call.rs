//! The API call event: one unit of work bound to an endpoint.
//!
//! An [`ApiCall`] carries the opaque request payload, the flags the
//! executors consult (token requirements, cache hint), and the execution
//! record the invoking worker fills in. The terminal state is write-once;
//! callers observe it through snapshots or [`wait`](ApiCall::wait), never by
//! catching an exception out of a worker.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_core::{ApiError, CallId, CallStatus, Execution, Result};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;

/// One API call: request payload, owning endpoint, and execution state.
///
/// Created by callers, registered with an executor, and mutated only by the
/// worker that invokes it. The endpoint is shared, not owned: the call holds
/// a reference and must not outlive the endpoint's scope.
#[derive(Debug)]
pub struct ApiCall {
    id: CallId,
    created_at: DateTime<Utc>,
    endpoint: Arc<Endpoint>,
    request: Value,
    cache_control: bool,
    requires_tokens: bool,
    /// Write-once-before-run cost; executors read 1 when unset.
    token_cost: OnceLock<u32>,
    execution: Mutex<Execution>,
    done: Notify,
}

impl ApiCall {
    /// Creates a pending call against `endpoint`.
    pub fn new(endpoint: Arc<Endpoint>, request: Value) -> Self {
        Self {
            id: CallId::new(),
            created_at: Utc::now(),
            endpoint,
            request,
            cache_control: false,
            requires_tokens: false,
            token_cost: OnceLock::new(),
            execution: Mutex::new(Execution::default()),
            done: Notify::new(),
        }
    }

    /// Sets the cache hint forwarded to the endpoint.
    pub fn with_cache_control(mut self, cache_control: bool) -> Self {
        self.cache_control = cache_control;
        self
    }

    /// Marks the call as subject to rate limiting.
    pub fn with_requires_tokens(mut self, requires_tokens: bool) -> Self {
        self.requires_tokens = requires_tokens;
        self
    }

    /// Sets an explicit token cost (implies `requires_tokens`).
    pub fn with_token_cost(mut self, cost: u32) -> Self {
        self.requires_tokens = true;
        let _ = self.token_cost.set(cost);
        self
    }

    /// Unique call id.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The endpoint this call is bound to.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// The opaque request payload.
    pub fn request(&self) -> &Value {
        &self.request
    }

    /// Whether the endpoint may serve this call from cache.
    pub fn cache_control(&self) -> bool {
        self.cache_control
    }

    /// Whether executors must consult a rate limiter for this call.
    pub fn requires_tokens(&self) -> bool {
        self.requires_tokens
    }

    /// Token cost paid to the limiter; 1 when never set.
    pub fn token_cost(&self) -> u32 {
        self.token_cost.get().copied().unwrap_or(1)
    }

    /// Sets the token cost once, before the call runs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the cost was already set or the call has
    /// left the pending state.
    pub fn set_token_cost(&self, cost: u32) -> Result<()> {
        if self.status() != CallStatus::Pending {
            return Err(ApiError::invalid_state("token cost must be set before the call runs"));
        }
        self.token_cost
            .set(cost)
            .map_err(|_| ApiError::invalid_state("token cost is write-once"))
    }

    /// Current lifecycle status.
    pub fn status(&self) -> CallStatus {
        self.execution.lock().expect("execution lock poisoned").status
    }

    /// Snapshot of the execution record.
    pub fn execution(&self) -> Execution {
        self.execution.lock().expect("execution lock poisoned").clone()
    }

    /// Invokes the endpoint directly.
    ///
    /// Transitions Pending → Running, executes, and records the terminal
    /// state. Call failures are captured into the execution record, never
    /// raised; the returned status mirrors the record.
    pub async fn invoke(&self) -> CallStatus {
        self.invoke_via(|| async { self.endpoint.call(&self.request, self.cache_control).await })
            .await
    }

    /// Runs `op` through the call's state machine instead of the bare
    /// endpoint call, for retry- or breaker-wrapped execution.
    pub async fn invoke_via<F, Fut>(&self, op: F) -> CallStatus
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        if !self.begin() {
            let status = self.status();
            warn!(call_id = %self.id, %status, "invoke skipped: call is not pending");
            return status;
        }

        let result = op().await;
        self.finish(result)
    }

    /// Counts one invocation attempt. Called by the work closure on every
    /// try so retries are visible in the execution record.
    pub fn note_attempt(&self) {
        self.execution.lock().expect("execution lock poisoned").attempts += 1;
    }

    /// Fails a pending call without running it (backpressure, teardown).
    ///
    /// Returns false when the call already left the pending state.
    pub fn fail_with(&self, error: ApiError) -> bool {
        let mut execution = self.execution.lock().expect("execution lock poisoned");
        if execution.status != CallStatus::Pending {
            return false;
        }
        execution.status = CallStatus::Failed;
        execution.error = Some(error);
        execution.completed_at = Some(Utc::now());
        drop(execution);
        self.done.notify_waiters();
        true
    }

    /// Cancels a pending call. Tokens already debited are not refunded.
    ///
    /// Returns false when the call already left the pending state.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut execution = self.execution.lock().expect("execution lock poisoned");
        if execution.status != CallStatus::Pending {
            return false;
        }
        execution.status = CallStatus::Cancelled;
        execution.error = Some(ApiError::cancelled(reason.into()));
        execution.completed_at = Some(Utc::now());
        drop(execution);
        self.done.notify_waiters();
        true
    }

    /// Resolves once the call reaches a terminal state.
    pub async fn wait(&self) -> Execution {
        loop {
            let done = self.done.notified();
            {
                let execution = self.execution.lock().expect("execution lock poisoned");
                if execution.status.is_terminal() {
                    return execution.clone();
                }
            }
            done.await;
        }
    }

    /// Pending → Running, or false when the call was already claimed.
    fn begin(&self) -> bool {
        let mut execution = self.execution.lock().expect("execution lock poisoned");
        if execution.status != CallStatus::Pending {
            return false;
        }
        execution.status = CallStatus::Running;
        execution.started_at = Some(Utc::now());
        true
    }

    /// Records the terminal state; write-once even if a cancel raced in.
    fn finish(&self, result: Result<Value>) -> CallStatus {
        let mut execution = self.execution.lock().expect("execution lock poisoned");
        if execution.status != CallStatus::Running {
            return execution.status;
        }

        match result {
            Ok(value) => {
                execution.status = CallStatus::Succeeded;
                execution.result = Some(value);
            },
            Err(error) => {
                execution.status = if error.kind() == sluice_core::ErrorKind::Cancelled {
                    CallStatus::Cancelled
                } else {
                    CallStatus::Failed
                };
                execution.error = Some(error);
            },
        }
        execution.completed_at = Some(Utc::now());
        let status = execution.status;
        drop(execution);

        debug!(call_id = %self.id, %status, "call reached terminal state");
        self.done.notify_waiters();
        status
    }
}
