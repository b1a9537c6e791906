//! Executors: submit API calls under concurrency and rate ceilings.
//!
//! [`Executor`] owns a bounded queue and its workers, tracks every submitted
//! call in an event map, and runs the worker path: Pending → Running →
//! terminal, with failures captured into the call instead of escaping the
//! worker. [`RateLimitedExecutor`] composes a token bucket in front of the
//! worker path so every execution pays its token cost first.
//!
//! Resilience (retry innermost, circuit breaker outermost) is applied in the
//! worker path when configured, so breaker state reflects retry-exhausted
//! failures rather than individual attempts.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use sluice_core::{
    ApiError, CallFailed, CallId, CallObserver, CallOutcome, CallStatus, CallSucceeded, Clock,
    NoOpObserver, RealClock, Result,
};
use tracing::{debug, warn};

use crate::{
    call::ApiCall,
    circuit::CircuitBreaker,
    limiter::TokenBucketLimiter,
    queue::{BoundedQueue, QueueConfig, QueueMetrics, QueueStatus, DEFAULT_SHUTDOWN_TIMEOUT},
    retry::RetryPolicy,
};

/// Optional resilience layers applied in the worker path.
///
/// The retry policy wraps the endpoint call; the breaker wraps the whole
/// retry sequence, so one exhausted sequence counts as one breaker failure.
#[derive(Debug, Clone, Default)]
pub struct Resilience {
    /// Circuit breaker shared across calls, outermost layer.
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Retry policy applied to each call, innermost layer.
    pub retry: Option<RetryPolicy>,
}

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Calls registered via `append`.
    pub submitted: u64,
    /// Calls that reached `Succeeded`.
    pub succeeded: u64,
    /// Calls that reached `Failed`.
    pub failed: u64,
    /// Calls that reached `Cancelled`.
    pub cancelled: u64,
    /// Calls currently executing in workers.
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct StatCells {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicU64,
}

impl StatCells {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.submitted.load(Ordering::Acquire),
            succeeded: self.succeeded.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}

/// State shared between the executor handle and its worker tasks.
struct ExecutorShared {
    events: Mutex<HashMap<CallId, Arc<ApiCall>>>,
    pending: Mutex<VecDeque<CallId>>,
    resilience: Mutex<Resilience>,
    limiter: Mutex<Option<Arc<TokenBucketLimiter>>>,
    observer: Mutex<Arc<dyn CallObserver>>,
    clock: Mutex<Arc<dyn Clock>>,
    stats: StatCells,
}

impl ExecutorShared {
    /// The worker path for one call: pay tokens if required, execute under
    /// the configured resilience, record the terminal state, and notify
    /// observers. Nothing propagates out of the worker.
    async fn process(self: Arc<Self>, call: Arc<ApiCall>) {
        self.stats.in_flight.fetch_add(1, Ordering::AcqRel);

        let limiter = self.limiter.lock().expect("executor lock poisoned").clone();
        let run = {
            let shared = self.clone();
            let call = call.clone();
            move || async move { shared.run_call(call).await }
        };

        match (limiter, call.requires_tokens()) {
            (Some(limiter), true) => {
                limiter.execute(f64::from(call.token_cost()), run).await;
            },
            _ => run().await,
        }

        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.finalize(&call).await;
    }

    /// Executes the call through the state machine, composing the configured
    /// resilience layers around the endpoint invocation.
    async fn run_call(&self, call: Arc<ApiCall>) {
        let resilience = self.resilience.lock().expect("executor lock poisoned").clone();
        let clock = self.clock.lock().expect("executor lock poisoned").clone();

        // Each attempt flows through this closure so retries are counted on
        // the call's execution record.
        let base = {
            let call = call.clone();
            move || {
                let call = call.clone();
                async move {
                    call.note_attempt();
                    call.endpoint().call(call.request(), call.cache_control()).await
                }
            }
        };

        match (resilience.breaker, resilience.retry) {
            (Some(breaker), Some(retry)) => {
                call.invoke_via(move || async move {
                    breaker.execute(|| retry.run(clock.as_ref(), base)).await
                })
                .await;
            },
            (Some(breaker), None) => {
                call.invoke_via(move || async move { breaker.execute(base).await }).await;
            },
            (None, Some(retry)) => {
                call.invoke_via(move || async move { retry.run(clock.as_ref(), base).await })
                    .await;
            },
            (None, None) => {
                call.invoke_via(base).await;
            },
        }
    }

    /// Updates terminal counters and notifies the observer.
    async fn finalize(&self, call: &ApiCall) {
        let execution = call.execution();
        let provider = call.endpoint().config().provider.clone();

        let outcome = match execution.status {
            CallStatus::Succeeded => {
                self.stats.succeeded.fetch_add(1, Ordering::AcqRel);
                CallOutcome::Succeeded(CallSucceeded {
                    call_id: call.id(),
                    provider,
                    attempts: execution.attempts,
                    completed_at: execution.completed_at.unwrap_or_else(chrono::Utc::now),
                })
            },
            CallStatus::Failed | CallStatus::Cancelled => {
                if execution.status == CallStatus::Cancelled {
                    self.stats.cancelled.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.stats.failed.fetch_add(1, Ordering::AcqRel);
                }
                let error = execution
                    .error
                    .unwrap_or_else(|| ApiError::invalid_state("failed call without an error"));
                CallOutcome::Failed(CallFailed {
                    call_id: call.id(),
                    provider,
                    attempts: execution.attempts,
                    failed_at: execution.completed_at.unwrap_or_else(chrono::Utc::now),
                    error_kind: error.kind(),
                    error_message: error.to_string(),
                    is_retryable: error.is_retryable(),
                })
            },
            // Non-terminal records happen when a second invoke was skipped;
            // there is nothing to report.
            CallStatus::Pending | CallStatus::Running => return,
        };

        let observer = self.observer.lock().expect("executor lock poisoned").clone();
        observer.on_outcome(outcome).await;
    }
}

/// Executor owning a bounded queue and the workers that serve it.
///
/// Every submitted call terminates exactly once in the event map; teardown
/// drains pending work before stopping the workers.
pub struct Executor {
    shared: Arc<ExecutorShared>,
    queue: BoundedQueue<Arc<ApiCall>>,
    worker_count: usize,
    shutdown_timeout: Duration,
}

impl Executor {
    /// Creates an executor from a queue configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let worker_count = config.worker_count;
        Ok(Self {
            shared: Arc::new(ExecutorShared {
                events: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                resilience: Mutex::new(Resilience::default()),
                limiter: Mutex::new(None),
                observer: Mutex::new(Arc::new(NoOpObserver)),
                clock: Mutex::new(Arc::new(RealClock)),
                stats: StatCells::default(),
            }),
            queue: BoundedQueue::new(config)?,
            worker_count,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// Installs an observer for terminal outcomes.
    pub fn with_observer(self, observer: Arc<dyn CallObserver>) -> Self {
        *self.shared.observer.lock().expect("executor lock poisoned") = observer;
        self
    }

    /// Injects the clock used for retry backoff.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.set_clock(clock);
        self
    }

    /// Replaces the clock used for retry backoff.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self.shared.clock.lock().expect("executor lock poisoned") = clock;
    }

    /// Installs resilience layers for the worker path.
    pub fn with_resilience(self, resilience: Resilience) -> Self {
        self.set_resilience(resilience);
        self
    }

    /// Installs a token bucket consulted before every execution.
    pub fn with_limiter(self, limiter: Arc<TokenBucketLimiter>) -> Self {
        *self.shared.limiter.lock().expect("executor lock poisoned") = Some(limiter);
        self
    }

    /// Replaces the resilience layers.
    pub fn set_resilience(&self, resilience: Resilience) {
        *self.shared.resilience.lock().expect("executor lock poisoned") = resilience;
    }

    /// Overrides the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Registers a call in the event map and marks it pending dispatch.
    pub fn append(&self, call: Arc<ApiCall>) {
        let id = call.id();
        self.shared.events.lock().expect("executor lock poisoned").insert(id, call);
        self.shared.pending.lock().expect("executor lock poisoned").push_back(id);
        self.shared.stats.submitted.fetch_add(1, Ordering::AcqRel);
        debug!(call_id = %id, "call appended");
    }

    /// Removes and returns a call from the event map.
    pub fn pop(&self, id: CallId) -> Option<Arc<ApiCall>> {
        self.shared.events.lock().expect("executor lock poisoned").remove(&id)
    }

    /// Drains pending calls into the queue.
    ///
    /// An enqueue that times out fails the call with `Backpressure`; the
    /// failure is observable on the event, and the caller may resubmit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the queue is not processing.
    pub async fn forward(&self) -> Result<()> {
        loop {
            let next = self.shared.pending.lock().expect("executor lock poisoned").pop_front();
            let Some(id) = next else {
                return Ok(());
            };
            let call = self.shared.events.lock().expect("executor lock poisoned").get(&id).cloned();
            let Some(call) = call else {
                continue;
            };

            match self.queue.put(call.clone()).await {
                Ok(true) => {},
                Ok(false) => {
                    warn!(call_id = %id, "dispatch queue full, failing call with backpressure");
                    if call.fail_with(ApiError::backpressure("dispatch queue full")) {
                        self.shared.finalize(&call).await;
                    }
                },
                Err(error) => {
                    if call.fail_with(error.clone()) {
                        self.shared.finalize(&call).await;
                    }
                    return Err(error);
                },
            }
        }
    }

    /// True when nothing is pending, buffered, or running, and every tracked
    /// call has reached a terminal state.
    pub fn is_all_processed(&self) -> bool {
        let pending_empty =
            self.shared.pending.lock().expect("executor lock poisoned").is_empty();
        let all_terminal = self
            .shared
            .events
            .lock()
            .expect("executor lock poisoned")
            .values()
            .all(|call| call.status().is_terminal());
        pending_empty && self.queue.is_empty() && all_terminal
    }

    /// Starts the queue and spawns the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the executor was already stopped.
    pub fn start(&self) -> Result<()> {
        self.queue.start()?;
        let shared = self.shared.clone();
        self.queue.start_workers(self.worker_count, move |call: Arc<ApiCall>| {
            let shared = shared.clone();
            async move {
                shared.process(call).await;
                Ok(())
            }
        })
    }

    /// Drains pending work, waits for acknowledgements, then stops the
    /// workers. Idempotent once stopped.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when workers outlive the shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        if self.queue.status() == QueueStatus::Processing {
            self.forward().await?;
            self.queue.join().await?;
        }
        self.queue.stop(self.shutdown_timeout).await
    }

    /// Runs `f` with the executor started, stopping it on the way out on
    /// both success and error return paths.
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

    /// Snapshot of the executor counters.
    pub fn stats(&self) -> ExecutorStats {
        self.shared.stats.snapshot()
    }

    /// Snapshot of the underlying queue counters.
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Current queue lifecycle status.
    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("worker_count", &self.worker_count)
            .field("status", &self.queue.status())
            .finish_non_exhaustive()
    }
}

/// Executor that pays a token bucket before every execution.
///
/// Calls with `requires_tokens` unset bypass the limiter entirely. The token
/// cost comes from the call (default 1).
#[derive(Debug)]
pub struct RateLimitedExecutor {
    executor: Executor,
    limiter: Arc<TokenBucketLimiter>,
}

impl RateLimitedExecutor {
    /// Creates a rate-limited executor over `limiter`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the queue configuration fails validation.
    pub fn new(config: QueueConfig, limiter: Arc<TokenBucketLimiter>) -> Result<Self> {
        let executor = Executor::new(config)?.with_limiter(limiter.clone());
        Ok(Self { executor, limiter })
    }

    /// Registers and immediately forwards one call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the executor is not running.
    pub async fn submit(&self, call: Arc<ApiCall>) -> Result<()> {
        self.executor.append(call);
        self.executor.forward().await
    }

    /// The wrapped executor.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The token bucket consulted before executions.
    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    /// Starts the underlying executor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when already stopped.
    pub fn start(&self) -> Result<()> {
        self.executor.start()
    }

    /// Stops the underlying executor, draining pending work first.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when workers outlive the shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        self.executor.stop().await
    }

    /// Runs `f` with the executor started, stopping it on the way out.
    pub async fn scope<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        self.executor.scope(f).await
    }

    /// Snapshot of the executor counters.
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }
}
