//! Call identity, execution records, and terminal-outcome observation.
//!
//! An API call is tracked as an event: it carries a unique id, a status that
//! moves `Pending → Running → {Succeeded, Failed, Cancelled}`, and an
//! execution record the invoking worker fills in. Observers subscribe to
//! terminal outcomes without the workers knowing who is listening.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::error;
use uuid::Uuid;

use crate::error::{ApiError, ErrorKind};

/// Strongly-typed call identifier.
///
/// Wraps a UUID to prevent mixing with other id types. The id is assigned at
/// creation and follows the call through its entire lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Creates a new random call id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CallId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle status of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Created but not yet picked up by a worker.
    Pending,
    /// A worker is executing the call.
    Running,
    /// The call completed and produced a result.
    Succeeded,
    /// The call completed with a classified error.
    Failed,
    /// The call was cancelled before completion.
    Cancelled,
}

impl CallStatus {
    /// Returns true once the status can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Execution record of one API call.
///
/// Mutated only by the worker that invokes the call; the terminal state is
/// write-once. Consumers read snapshots of this record.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Current lifecycle status.
    pub status: CallStatus,
    /// When the worker began executing the call.
    pub started_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of invocation attempts (retries included).
    pub attempts: u32,
    /// Decoded response payload on success.
    pub result: Option<Value>,
    /// Classified error on failure.
    pub error: Option<ApiError>,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            status: CallStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            result: None,
            error: None,
        }
    }
}

/// Terminal outcomes emitted by the execution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallOutcome {
    /// The call produced a result.
    Succeeded(CallSucceeded),
    /// The call ended with a classified error or was cancelled.
    Failed(CallFailed),
}

impl CallOutcome {
    /// Returns the call id for any variant.
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Succeeded(o) => o.call_id,
            Self::Failed(o) => o.call_id,
        }
    }
}

/// Outcome details for a successful call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSucceeded {
    /// Id of the completed call.
    pub call_id: CallId,
    /// Provider the call was dispatched to.
    pub provider: String,
    /// Invocation attempts consumed.
    pub attempts: u32,
    /// When the call completed.
    pub completed_at: DateTime<Utc>,
}

/// Outcome details for a failed or cancelled call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFailed {
    /// Id of the failed call.
    pub call_id: CallId,
    /// Provider the call was dispatched to.
    pub provider: String,
    /// Invocation attempts consumed.
    pub attempts: u32,
    /// When the call failed.
    pub failed_at: DateTime<Utc>,
    /// Classification of the final error.
    pub error_kind: ErrorKind,
    /// Human-readable error message.
    pub error_message: String,
    /// Whether the final error was in the retryable class.
    pub is_retryable: bool,
}

/// Trait for observing terminal call outcomes.
///
/// The execution pipeline notifies observers at every terminal transition.
/// Implementations must not block workers: slow handling belongs in a
/// detached task, which [`MulticastObserver`] already provides.
#[async_trait::async_trait]
pub trait CallObserver: Send + Sync + fmt::Debug {
    /// Handles a terminal call outcome.
    async fn on_outcome(&self, outcome: CallOutcome);
}

/// Observer that discards all outcomes.
#[derive(Debug, Default)]
pub struct NoOpObserver;

impl NoOpObserver {
    /// Creates a new no-op observer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CallObserver for NoOpObserver {
    async fn on_outcome(&self, _outcome: CallOutcome) {}
}

/// Observer that fans outcomes out to multiple subscribers.
///
/// Each subscriber runs in a detached, timeout-guarded task so a slow,
/// deadlocked, or panicking subscriber cannot stall or crash a worker.
#[derive(Debug, Clone, Default)]
pub struct MulticastObserver {
    observers: Vec<Arc<dyn CallObserver>>,
}

impl MulticastObserver {
    /// Creates a new multicast observer with no subscribers.
    pub fn new() -> Self {
        Self { observers: Vec::new() }
    }

    /// Adds a subscriber to receive terminal outcomes.
    pub fn add_subscriber(&mut self, observer: Arc<dyn CallObserver>) {
        self.observers.push(observer);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }
}

#[async_trait::async_trait]
impl CallObserver for MulticastObserver {
    async fn on_outcome(&self, outcome: CallOutcome) {
        const OBSERVER_TIMEOUT: Duration = Duration::from_secs(30);

        for observer in &self.observers {
            let observer = observer.clone();
            let outcome = outcome.clone();

            tokio::spawn(async move {
                if tokio::time::timeout(OBSERVER_TIMEOUT, observer.on_outcome(outcome.clone()))
                    .await
                    .is_err()
                {
                    error!(
                        observer = ?observer,
                        call_id = %outcome.call_id(),
                        timeout_secs = OBSERVER_TIMEOUT.as_secs(),
                        "call observer timed out"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingObserver {
        seen: Arc<AtomicUsize>,
    }

    impl CountingObserver {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(0));
            (Self { seen: counter.clone() }, counter)
        }
    }

    #[async_trait::async_trait]
    impl CallObserver for CountingObserver {
        async fn on_outcome(&self, _outcome: CallOutcome) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct PanickingObserver;

    #[async_trait::async_trait]
    impl CallObserver for PanickingObserver {
        #[allow(clippy::panic)] // Controlled use to verify fault isolation
        async fn on_outcome(&self, _outcome: CallOutcome) {
            panic!("simulated subscriber failure");
        }
    }

    fn succeeded_outcome() -> CallOutcome {
        CallOutcome::Succeeded(CallSucceeded {
            call_id: CallId::new(),
            provider: "example".to_string(),
            attempts: 1,
            completed_at: Utc::now(),
        })
    }

    #[test]
    fn status_terminality() {
        assert!(!CallStatus::Pending.is_terminal());
        assert!(!CallStatus::Running.is_terminal());
        assert!(CallStatus::Succeeded.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(CallStatus::Cancelled.is_terminal());
    }

    #[test]
    fn execution_starts_pending() {
        let execution = Execution::default();
        assert_eq!(execution.status, CallStatus::Pending);
        assert_eq!(execution.attempts, 0);
        assert!(execution.result.is_none());
        assert!(execution.error.is_none());
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let mut multicast = MulticastObserver::new();
        let (first, first_count) = CountingObserver::new();
        let (second, second_count) = CountingObserver::new();
        multicast.add_subscriber(Arc::new(first));
        multicast.add_subscriber(Arc::new(second));

        assert_eq!(multicast.subscriber_count(), 2);

        multicast.on_outcome(succeeded_outcome()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_stop_others() {
        let mut multicast = MulticastObserver::new();
        let (normal, counter) = CountingObserver::new();
        multicast.add_subscriber(Arc::new(PanickingObserver));
        multicast.add_subscriber(Arc::new(normal));

        multicast.on_outcome(succeeded_outcome()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_op_observer_discards_outcomes() {
        NoOpObserver::new().on_outcome(succeeded_outcome()).await;
    }
}
