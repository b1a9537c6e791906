//! Circuit breaker protecting a downstream provider.
//!
//! Gates calls by health state so a failing provider is not hammered by
//! retries. The breaker trips after a run of consecutive failures, rejects
//! everything for a recovery window, then admits a bounded number of probes
//! to test recovery.
//!
//! # State machine
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │          CLOSED          │
//!                 │    (normal operation)    │
//!                 └──────────────────────────┘
//!                   │                      ▲
//!     F consecutive │                      │ probe
//!          failures │                      │ succeeds
//!                   ▼                      │
//!   ┌─────────────────────┐  recovery   ┌───────────────────────┐
//!   │        OPEN         │  elapsed    │       HALF-OPEN       │
//!   │     (fail fast)     │ ──────────▶ │  (≤ H bounded probes) │
//!   └─────────────────────┘             └───────────────────────┘
//!                   ▲                      │
//!                   └──────────────────────┘
//!                        any probe fails
//! ```
//!
//! The state read and the transition decision happen in one critical
//! section, so two racing calls can never both act on a stale state.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, Clock, ErrorKind, RealClock, Result};
use tracing::{info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting probes.
    pub recovery_time: Duration,
    /// Maximum concurrent probes while half-open.
    pub half_open_max_calls: u32,
    /// Error kinds that neither count as failures nor trip the breaker.
    pub excluded_errors: HashSet<ErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
            half_open_max_calls: 1,
            excluded_errors: HashSet::new(),
        }
    }
}

impl BreakerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero threshold, zero recovery time,
    /// or zero probe allowance.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ApiError::invalid_argument("failure_threshold must be at least 1"));
        }
        if self.recovery_time.is_zero() {
            return Err(ApiError::invalid_argument("recovery_time must be positive"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ApiError::invalid_argument("half_open_max_calls must be at least 1"));
        }
        Ok(())
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all requests admitted.
    Closed,
    /// Provider unhealthy, requests rejected immediately.
    Open,
    /// Testing recovery with a bounded number of probes.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Callback invoked with (old, new) on every state transition.
pub type StateListener = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Circuit breaker gating calls to one downstream dependency.
///
/// All state lives under a single lock whose critical sections never await,
/// so admission decisions are atomic. Wrap calls with
/// [`execute`](Self::execute).
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    listener: Option<StateListener>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn new(config: BreakerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(RealClock))
    }

    /// Creates a breaker with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_in_flight: 0,
            }),
            clock,
            listener: None,
        })
    }

    /// Registers a callback for state transitions.
    pub fn with_state_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Runs `op` under circuit protection.
    ///
    /// Rejected calls fail with `CircuitOpen` without invoking `op`. Errors
    /// whose kind is in `excluded_errors` pass through without counting as
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` when rejected, otherwise whatever `op` returns.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut probe = self.admit()?;

        let result = op().await;

        match &result {
            Ok(_) => self.on_success(&mut probe),
            Err(error) => self.on_failure(&mut probe, error),
        }

        result
    }

    /// Returns the current state, applying the open → half-open timeout.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let transition = self.refresh_state(&mut inner);
            (inner.state, transition)
        };
        if let Some((old, new)) = transition {
            self.notify(old, new);
        }
        state
    }

    /// Returns the consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").consecutive_failures
    }

    /// Forces the breaker into a specific state (admin/testing escape hatch).
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let old = inner.state;
        inner.state = state;
        inner.half_open_in_flight = 0;
        if state == CircuitState::Open {
            inner.last_failure_at = Some(self.clock.now());
        }
        if state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
        drop(inner);
        self.notify(old, state);
    }

    /// Admission decision under one lock: read state, apply the recovery
    /// timeout, reserve a probe slot when half-open.
    fn admit(&self) -> Result<ProbeTicket<'_>> {
        let (decision, transition) = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let transition = self.refresh_state(&mut inner);

            let decision = match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let remaining = inner
                        .last_failure_at
                        .map(|at| {
                            self.config
                                .recovery_time
                                .saturating_sub(self.clock.now().saturating_duration_since(at))
                        })
                        .unwrap_or(self.config.recovery_time);
                    warn!(
                        retry_after_secs = remaining.as_secs_f64(),
                        "circuit open, rejecting call"
                    );
                    Err(ApiError::circuit_open(remaining.as_secs_f64()))
                },
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        Ok(true)
                    } else {
                        Err(ApiError::circuit_open(0.0))
                    }
                },
            };
            (decision, transition)
        };

        // Listener fires outside the lock so it may safely query the breaker
        if let Some((old, new)) = transition {
            self.notify(old, new);
        }

        decision.map(|half_open| ProbeTicket { breaker: self, half_open, settled: false })
    }

    /// Applies the open → half-open transition once the recovery window has
    /// elapsed, returning the transition for the caller to announce after
    /// releasing the lock. Caller holds the lock.
    fn refresh_state(&self, inner: &mut BreakerInner) -> Option<(CircuitState, CircuitState)> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let recovered = inner.last_failure_at.is_some_and(|at| {
            self.clock.now().saturating_duration_since(at) >= self.config.recovery_time
        });
        if recovered {
            info!("circuit transitioning from open to half-open after recovery window");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            return Some((CircuitState::Open, CircuitState::HalfOpen));
        }
        None
    }

    fn on_success(&self, probe: &mut ProbeTicket<'_>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        probe.settle(&mut inner);
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            info!("probe succeeded, circuit closing");
            inner.state = CircuitState::Closed;
            inner.half_open_in_flight = 0;
            drop(inner);
            self.notify(CircuitState::HalfOpen, CircuitState::Closed);
        }
    }

    fn on_failure(&self, probe: &mut ProbeTicket<'_>, error: &ApiError) {
        let kind = error.kind();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        probe.settle(&mut inner);

        if self.config.excluded_errors.contains(&kind) {
            return;
        }

        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(self.clock.now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;

        if should_open && inner.state != CircuitState::Open {
            let old = inner.state;
            warn!(
                consecutive_failures = inner.consecutive_failures,
                error_kind = %kind,
                "circuit opening"
            );
            inner.state = CircuitState::Open;
            inner.half_open_in_flight = 0;
            drop(inner);
            self.notify(old, CircuitState::Open);
        }
    }

    fn notify(&self, old: CircuitState, new: CircuitState) {
        if old == new {
            return;
        }
        if let Some(listener) = &self.listener {
            listener(old, new);
        }
    }
}

/// Tracks one admitted call so a half-open probe slot is always released,
/// including when the call future is dropped mid-flight.
struct ProbeTicket<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    settled: bool,
}

impl ProbeTicket<'_> {
    fn settle(&mut self, inner: &mut BreakerInner) {
        if self.half_open && !self.settled {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        self.settled = true;
    }
}

impl Drop for ProbeTicket<'_> {
    fn drop(&mut self) {
        if self.half_open && !self.settled {
            let mut inner = self.breaker.inner.lock().expect("breaker lock poisoned");
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}
