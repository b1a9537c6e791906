//! Foundation types for the sluice resource-control core.
//!
//! Provides the error taxonomy shared by every stage of the outbound-call
//! pipeline, the clock abstraction that makes timing behavior injectable,
//! and the call event model (identity, execution record, terminal-outcome
//! observation). The moving parts live in `sluice-dispatch`; this crate is
//! pure types with no I/O of its own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod time;

pub use error::{ApiError, ErrorKind, Result};
pub use event::{
    CallFailed, CallId, CallObserver, CallOutcome, CallStatus, CallSucceeded, Execution,
    MulticastObserver, NoOpObserver,
};
pub use time::{Clock, RealClock};
