use thiserror::Error;
use crate::request::RequestState;

/// Faults raised by a [`WorkQueue`](crate::queue::WorkQueue) implementation.
///
/// Queue faults are infrastructure-level and transient: the formation loop
/// responds by backing off and retrying, never by failing requests that are
/// already admitted or running.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue backend cannot currently be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Per-request terminal faults.
///
/// These are always scoped to a single request. A fault handling one request
/// never aborts its batch siblings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The request did not complete within its own deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The executor reported a failure for this request.
    #[error("executor error: {0}")]
    Executor(String),

    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
}

/// Top-level crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The dispatcher configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request was asked to move between lifecycle states out of order.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: RequestState,
        to: RequestState,
    },

    /// The dispatcher has been shut down and accepts no new work.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// An underlying queue fault.
    #[error(transparent)]
    Queue(#[from] QueueError),
}
