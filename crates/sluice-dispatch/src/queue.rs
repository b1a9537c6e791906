//! Bounded FIFO work queue with backpressure and a supervised worker pool.
//!
//! The queue holds at most `capacity` items. Enqueueing waits a short,
//! configurable time for space and then reports backpressure by returning
//! `false` instead of erroring, so producers can shed, retry, or fail the
//! work item explicitly. Consumers acknowledge every dequeued item exactly
//! once; `join` completes when all accepted work has been acknowledged.
//!
//! Workers are cooperative tasks supervised through a cancellation token:
//! `stop` cancels them, awaits them within a timeout, and leaves the queue
//! unusable. Dropping a queue with live workers cancels them as a backstop.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sluice_core::{ApiError, Result};
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default bounded wait for an enqueue before reporting backpressure.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default timeout for awaiting workers during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Hard capacity of the buffer.
    pub capacity: usize,
    /// Bounded wait applied to each enqueue.
    pub enqueue_timeout: Duration,
    /// Ceiling on simultaneously running work items, independent of the
    /// worker count. `None` means unbounded.
    pub concurrency_limit: Option<usize>,
    /// Number of worker tasks to spawn.
    pub worker_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            concurrency_limit: None,
            worker_count: 1,
        }
    }
}

impl QueueConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero capacity, timeout, worker count,
    /// or concurrency limit.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ApiError::invalid_argument("queue capacity must be at least 1"));
        }
        if self.enqueue_timeout.is_zero() {
            return Err(ApiError::invalid_argument("enqueue_timeout must be positive"));
        }
        if self.worker_count == 0 {
            return Err(ApiError::invalid_argument("worker_count must be at least 1"));
        }
        if self.concurrency_limit == Some(0) {
            return Err(ApiError::invalid_argument("concurrency_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Lifecycle status of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Created but not started; operations are rejected.
    Idle,
    /// Accepting and serving work.
    Processing,
    /// Stopped; operations are rejected permanently.
    Stopped,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Items accepted by `put`.
    pub enqueued: u64,
    /// Items a worker completed successfully.
    pub processed: u64,
    /// Items whose worker invocation failed.
    pub errors: u64,
    /// Enqueue attempts that timed out.
    pub backpressure_events: u64,
}

#[derive(Debug, Default)]
struct MetricCells {
    enqueued: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    backpressure_events: AtomicU64,
}

impl MetricCells {
    fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            enqueued: self.enqueued.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            backpressure_events: self.backpressure_events.load(Ordering::Acquire),
        }
    }
}

/// Shared queue state, usable from detached worker tasks.
#[derive(Debug)]
struct QueueShared<T> {
    buffer: Mutex<VecDeque<T>>,
    /// Permits for free buffer slots; acquired by `put`.
    space: Semaphore,
    /// Permits for buffered items; acquired by `get`.
    items: Semaphore,
    status: Mutex<QueueStatus>,
    /// Accepted items not yet acknowledged.
    unfinished: AtomicU64,
    drained: Notify,
    metrics: MetricCells,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl<T> QueueShared<T> {
    fn status(&self) -> QueueStatus {
        *self.status.lock().expect("queue status lock poisoned")
    }

    fn ensure_processing(&self, operation: &str) -> Result<()> {
        let status = self.status();
        if status == QueueStatus::Processing {
            Ok(())
        } else {
            Err(ApiError::invalid_state(format!("cannot {operation} while queue is {status}")))
        }
    }

    async fn get(&self) -> Result<T> {
        self.ensure_processing("get")?;

        let permit = self
            .items
            .acquire()
            .await
            .map_err(|_| ApiError::invalid_state("cannot get while queue is stopped"))?;
        permit.forget();

        let item = self
            .buffer
            .lock()
            .expect("queue buffer lock poisoned")
            .pop_front()
            .ok_or_else(|| ApiError::invalid_state("queue buffer empty despite item permit"))?;
        self.space.add_permits(1);
        Ok(item)
    }

    fn task_done(&self) {
        let remaining = self.unfinished.fetch_sub(1, Ordering::AcqRel);
        if remaining == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Bounded FIFO queue with lifecycle, metrics, and a worker pool.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    shared: Arc<QueueShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: tokio_util::sync::CancellationToken,
    concurrency: Option<Arc<Semaphore>>,
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates a queue from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(QueueShared {
                buffer: Mutex::new(VecDeque::with_capacity(config.capacity)),
                space: Semaphore::new(config.capacity),
                items: Semaphore::new(0),
                status: Mutex::new(QueueStatus::Idle),
                unfinished: AtomicU64::new(0),
                drained: Notify::new(),
                metrics: MetricCells::default(),
                capacity: config.capacity,
                enqueue_timeout: config.enqueue_timeout,
            }),
            workers: Mutex::new(Vec::new()),
            cancel: tokio_util::sync::CancellationToken::new(),
            concurrency: config.concurrency_limit.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// Moves the queue from Idle to Processing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the queue was already stopped.
    pub fn start(&self) -> Result<()> {
        let mut status = self.shared.status.lock().expect("queue status lock poisoned");
        match *status {
            QueueStatus::Idle => {
                *status = QueueStatus::Processing;
                debug!(capacity = self.shared.capacity, "queue started");
                Ok(())
            },
            QueueStatus::Processing => Ok(()),
            QueueStatus::Stopped => {
                Err(ApiError::invalid_state("cannot start a stopped queue"))
            },
        }
    }

    /// Attempts to enqueue an item within the configured bounded wait.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` when the queue stayed
    /// full for the whole wait (a backpressure event, counted in metrics).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside Processing.
    pub async fn put(&self, item: T) -> Result<bool> {
        self.shared.ensure_processing("put")?;

        let acquired =
            tokio::time::timeout(self.shared.enqueue_timeout, self.shared.space.acquire()).await;

        match acquired {
            Err(_elapsed) => {
                self.shared.metrics.backpressure_events.fetch_add(1, Ordering::AcqRel);
                debug!(
                    timeout_ms = self.shared.enqueue_timeout.as_millis() as u64,
                    "enqueue timed out, applying backpressure"
                );
                Ok(false)
            },
            Ok(Err(_closed)) => {
                Err(ApiError::invalid_state("cannot put while queue is stopped"))
            },
            Ok(Ok(permit)) => {
                permit.forget();
                self.shared
                    .buffer
                    .lock()
                    .expect("queue buffer lock poisoned")
                    .push_back(item);
                self.shared.unfinished.fetch_add(1, Ordering::AcqRel);
                self.shared.metrics.enqueued.fetch_add(1, Ordering::AcqRel);
                self.shared.items.add_permits(1);
                Ok(true)
            },
        }
    }

    /// Dequeues the next item, waiting until one is available.
    ///
    /// Every successful `get` must be matched by exactly one
    /// [`task_done`](Self::task_done) or `join` never completes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside Processing.
    pub async fn get(&self) -> Result<T> {
        self.shared.get().await
    }

    /// Acknowledges one previously dequeued item.
    pub fn task_done(&self) {
        self.shared.task_done();
    }

    /// Waits until every accepted item has been acknowledged and the buffer
    /// is empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside Processing.
    pub async fn join(&self) -> Result<()> {
        self.shared.ensure_processing("join")?;
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.unfinished.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            drained.await;
        }
    }

    /// Spawns `workers` cooperative tasks pulling items through `op`.
    ///
    /// Failed invocations count in `errors`; successful ones in `processed`;
    /// both acknowledge the item. Workers run until the queue stops.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside Processing or `InvalidArgument` for a
    /// zero worker count.
    pub fn start_workers<F, Fut>(&self, workers: usize, op: F) -> Result<()>
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        self.spawn_workers(workers, op, None::<fn(ApiError, T) -> std::future::Ready<()>>)
    }

    /// Like [`start_workers`](Self::start_workers), with an error handler
    /// invoked as `handler(error, item)` before the error is counted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside Processing or `InvalidArgument` for a
    /// zero worker count.
    pub fn start_workers_with_handler<F, Fut, H, HFut>(
        &self,
        workers: usize,
        op: F,
        handler: H,
    ) -> Result<()>
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
        H: Fn(ApiError, T) -> HFut + Send + Sync + Clone + 'static,
        HFut: std::future::Future<Output = ()> + Send,
    {
        self.spawn_workers(workers, op, Some(handler))
    }

    fn spawn_workers<F, Fut, H, HFut>(
        &self,
        workers: usize,
        op: F,
        handler: Option<H>,
    ) -> Result<()>
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
        H: Fn(ApiError, T) -> HFut + Send + Sync + Clone + 'static,
        HFut: std::future::Future<Output = ()> + Send,
    {
        if workers == 0 {
            return Err(ApiError::invalid_argument("worker count must be at least 1"));
        }
        self.shared.ensure_processing("start workers")?;

        let mut handles = self.workers.lock().expect("queue worker lock poisoned");
        for worker_id in 0..workers {
            let shared = self.shared.clone();
            let cancel = self.cancel.clone();
            let concurrency = self.concurrency.clone();
            let op = op.clone();
            let handler = handler.clone();

            handles.push(tokio::spawn(async move {
                debug!(worker_id, "queue worker starting");
                loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => break,
                        dequeued = shared.get() => match dequeued {
                            Ok(item) => item,
                            Err(_) => break,
                        },
                    };

                    let permit = match &concurrency {
                        Some(semaphore) => match semaphore.clone().acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_closed) => break,
                        },
                        None => None,
                    };

                    match op(item.clone()).await {
                        Ok(()) => {
                            shared.metrics.processed.fetch_add(1, Ordering::AcqRel);
                        },
                        Err(item_error) => {
                            if let Some(handler) = &handler {
                                handler(item_error, item).await;
                            } else {
                                warn!(error = %item_error, "queue worker item failed");
                            }
                            shared.metrics.errors.fetch_add(1, Ordering::AcqRel);
                        },
                    }

                    drop(permit);
                    shared.task_done();
                }
                debug!(worker_id, "queue worker stopped");
            }));
        }

        debug!(spawned = workers, total = handles.len(), "queue workers spawned");
        Ok(())
    }

    /// Stops the queue: cancels workers, awaits them within `timeout`, and
    /// rejects all further operations. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if workers were still running when the timeout
    /// expired; stragglers are left to finish their current item detached.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        {
            let mut status = self.shared.status.lock().expect("queue status lock poisoned");
            if *status == QueueStatus::Stopped {
                return Ok(());
            }
            *status = QueueStatus::Stopped;
        }

        self.cancel.cancel();
        // Wake blocked producers and consumers so they observe the stop
        self.shared.space.close();
        self.shared.items.close();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("queue worker lock poisoned");
            workers.drain(..).collect()
        };

        if handles.is_empty() {
            debug!("queue stopped with no workers");
            return Ok(());
        }

        let worker_count = handles.len();
        let joined = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(join_error) = handle.await {
                    if join_error.is_panic() {
                        error!(error = %join_error, "queue worker panicked");
                    }
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                debug!(worker_count, "queue stopped");
                Ok(())
            },
            Err(_elapsed) => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "queue worker shutdown timed out"
                );
                Err(ApiError::timeout(timeout.as_secs()))
            },
        }
    }

    /// Runs `f` with the queue started, stopping it on the way out.
    ///
    /// Teardown runs on both success and error return paths. If the scope
    /// future itself is dropped, the `Drop` backstop cancels workers.
    pub async fn scope<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        self.start()?;
        let result = f().await;
        self.stop(DEFAULT_SHUTDOWN_TIMEOUT).await?;
        Ok(result)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> QueueStatus {
        self.shared.status()
    }

    /// Number of worker tasks that have not finished.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .expect("queue worker lock poisoned")
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Number of buffered items.
    pub fn size(&self) -> usize {
        self.shared.buffer.lock().expect("queue buffer lock poisoned").len()
    }

    /// True when no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.size() >= self.shared.capacity
    }

    /// Snapshot of the queue counters.
    pub fn metrics(&self) -> QueueMetrics {
        self.shared.metrics.snapshot()
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        let workers = self.workers.lock().expect("queue worker lock poisoned");
        let active = workers.iter().filter(|handle| !handle.is_finished()).count();
        if active > 0 && !self.cancel.is_cancelled() {
            warn!(
                active_workers = active,
                "queue dropped with live workers, cancelling them; call stop() for a clean shutdown"
            );
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_queue(capacity: usize) -> BoundedQueue<&'static str> {
        BoundedQueue::new(QueueConfig {
            capacity,
            enqueue_timeout: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn construction_rejects_zero_capacity() {
        let config = QueueConfig { capacity: 0, ..Default::default() };
        assert!(matches!(
            BoundedQueue::<u32>::new(config),
            Err(ApiError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn initial_state_is_idle_and_empty() {
        let queue = small_queue(10);

        assert_eq!(queue.status(), QueueStatus::Idle);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(queue.metrics(), QueueMetrics::default());
    }

    #[tokio::test]
    async fn put_get_preserves_fifo_order() {
        let queue = small_queue(2);
        queue.start().unwrap();

        assert!(queue.put("first").await.unwrap());
        assert!(queue.put("second").await.unwrap());
        assert!(queue.is_full());

        assert_eq!(queue.get().await.unwrap(), "first");
        queue.task_done();
        assert_eq!(queue.get().await.unwrap(), "second");
        queue.task_done();

        assert!(queue.is_empty());
        assert_eq!(queue.metrics().enqueued, 2);

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let queue = small_queue(1);
        queue.start().unwrap();

        assert!(queue.put("a").await.unwrap());
        assert!(!queue.put("b").await.unwrap());
        assert_eq!(queue.metrics().backpressure_events, 1);

        // Space frees after acknowledgement, then the retry succeeds
        assert_eq!(queue.get().await.unwrap(), "a");
        queue.task_done();
        assert!(queue.put("b").await.unwrap());

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn operations_rejected_outside_processing() {
        let queue = small_queue(10);

        assert!(matches!(queue.put("x").await, Err(ApiError::InvalidState { .. })));
        assert!(matches!(queue.get().await, Err(ApiError::InvalidState { .. })));
        assert!(matches!(queue.join().await, Err(ApiError::InvalidState { .. })));

        queue.start().unwrap();
        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();

        assert!(matches!(queue.put("x").await, Err(ApiError::InvalidState { .. })));
        assert!(matches!(queue.get().await, Err(ApiError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_after_stop_fails() {
        let queue = small_queue(10);
        queue.start().unwrap();

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();

        assert!(matches!(queue.start(), Err(ApiError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn join_waits_for_acknowledgements() {
        let queue = Arc::new(small_queue(10));
        queue.start().unwrap();

        queue.put("one").await.unwrap();
        queue.put("two").await.unwrap();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    queue.get().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    queue.task_done();
                }
            })
        };

        queue.join().await.unwrap();
        assert!(queue.is_empty());

        consumer.await.unwrap();
        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn workers_process_items() {
        let queue: BoundedQueue<String> = BoundedQueue::new(QueueConfig::default()).unwrap();
        queue.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue
            .start_workers(2, move |item: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(item);
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(queue.worker_count(), 2);

        for i in 0..5 {
            assert!(queue.put(format!("item{i}")).await.unwrap());
        }
        queue.join().await.unwrap();

        let mut processed = seen.lock().unwrap().clone();
        processed.sort();
        assert_eq!(processed, vec!["item0", "item1", "item2", "item3", "item4"]);
        assert_eq!(queue.metrics().processed, 5);
        assert_eq!(queue.metrics().errors, 0);

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        assert_eq!(queue.worker_count(), 0);
    }

    #[tokio::test]
    async fn worker_errors_reach_the_handler_and_still_acknowledge() {
        let queue: BoundedQueue<&'static str> =
            BoundedQueue::new(QueueConfig::default()).unwrap();
        queue.start().unwrap();

        let failures = Arc::new(Mutex::new(Vec::new()));
        let log = failures.clone();
        queue
            .start_workers_with_handler(
                1,
                |item: &'static str| async move {
                    if item == "poison" {
                        Err(ApiError::server(500, "boom"))
                    } else {
                        Ok(())
                    }
                },
                move |error, item| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push((error.kind(), item));
                    }
                },
            )
            .unwrap();

        queue.put("fine").await.unwrap();
        queue.put("poison").await.unwrap();
        queue.put("also-fine").await.unwrap();
        queue.join().await.unwrap();

        let failures = failures.lock().unwrap().clone();
        assert_eq!(failures, vec![(sluice_core::ErrorKind::Server, "poison")]);

        let metrics = queue.metrics();
        assert_eq!(metrics.enqueued, 3);
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.errors, 1);

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn worker_errors_without_handler_only_count() {
        let queue: BoundedQueue<&'static str> =
            BoundedQueue::new(QueueConfig::default()).unwrap();
        queue.start().unwrap();

        queue
            .start_workers(1, |item: &'static str| async move {
                if item == "poison" {
                    Err(ApiError::server(500, "boom"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        queue.put("poison").await.unwrap();
        queue.join().await.unwrap();

        assert_eq!(queue.metrics().errors, 1);
        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn zero_workers_rejected() {
        let queue = small_queue(10);
        queue.start().unwrap();

        let result = queue.start_workers(0, |_item| async { Ok(()) });
        assert!(matches!(result, Err(ApiError::InvalidArgument { .. })));

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn scope_starts_and_always_stops() {
        let queue = small_queue(10);

        let value = queue
            .scope(|| async {
                assert_eq!(queue.status(), QueueStatus::Processing);
                queue.put("scoped").await.unwrap();
                queue.get().await.unwrap()
            })
            .await
            .unwrap();

        assert_eq!(value, "scoped");
        assert_eq!(queue.status(), QueueStatus::Stopped);
    }

    #[tokio::test]
    async fn metrics_conservation_under_worker_load() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(QueueConfig {
            capacity: 4,
            enqueue_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        queue.start().unwrap();

        queue
            .start_workers(3, |n: u32| async move {
                if n % 5 == 0 {
                    Err(ApiError::server(500, "boom"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let mut accepted = 0u64;
        for n in 0..50u32 {
            if queue.put(n).await.unwrap() {
                accepted += 1;
            }
        }
        queue.join().await.unwrap();

        let metrics = queue.metrics();
        assert_eq!(metrics.enqueued, accepted);
        assert_eq!(metrics.processed + metrics.errors, accepted);

        queue.stop(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }
}
