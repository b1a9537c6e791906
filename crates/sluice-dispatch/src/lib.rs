//! Rate-limited, resilient dispatch of outbound API calls.
//!
//! This crate is the resource-control core that mediates every outbound
//! HTTP/SDK call: it decides when a call may run, how failures are retried,
//! and how a sick provider is quarantined, while the caller only ever sees
//! an opaque request in and a classified response out.
//!
//! # Pipeline
//!
//! ```text
//!  caller
//!    │  Model::send / Model::call
//!    ▼
//!  ┌──────────────────────────┐
//!  │    RateLimitedExecutor   │  append → forward (bounded queue, τ wait,
//!  │  ┌────────────────────┐  │  backpressure surfaces as a failed call)
//!  │  │    BoundedQueue    │  │
//!  │  └────────────────────┘  │
//!  │        worker pool       │  each worker pays the token bucket, then:
//!  └──────────────────────────┘
//!    │
//!    ▼
//!  CircuitBreaker ▶ RetryPolicy ▶ Endpoint::call ──▶ provider
//!   (outermost)     (backoff+jitter)  (one session, classified errors)
//!    │
//!    ▼
//!  ApiCall reaches a terminal state; observers are notified
//! ```
//!
//! There is no global ordering across the limiter, queue, and breaker: a
//! submission delayed by rate limiting may be overtaken by a later one.
//! Callers needing ordering serialize at submission (one worker, one
//! in-flight call).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptive;
pub mod call;
pub mod circuit;
pub mod config;
pub mod endpoint;
pub mod executor;
pub mod limiter;
pub mod model;
pub mod queue;
pub mod retry;

pub use adaptive::{AdaptiveConfig, AdaptiveLimiter};
pub use call::ApiCall;
pub use circuit::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::Settings;
pub use endpoint::{
    ApiKey, AuthScheme, ClientOptions, Endpoint, EndpointConfig, SdkClient, TransportKind,
};
pub use executor::{Executor, ExecutorStats, RateLimitedExecutor, Resilience};
pub use limiter::{EndpointLimiter, LimiterConfig, TokenBucketLimiter};
pub use model::{Model, SendOptions};
pub use queue::{BoundedQueue, QueueConfig, QueueMetrics, QueueStatus};
pub use retry::RetryPolicy;
pub use sluice_core::{ApiError, CallId, CallStatus, ErrorKind, Result};

/// Default number of queue workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = queue::DEFAULT_CAPACITY;
