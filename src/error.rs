use thiserror::Error;

use crate::store::StoreError;

/// Error kinds surfaced by the matching engine.
///
/// `LeaseLost` is terminal for the queue manager that produced it; the engine
/// re-creates the manager with a fresh lease on the next request. Forwarding
/// failures never reach callers - the matcher falls back to the local path.
#[derive(Debug, Error)]
pub enum MatchingError {
    /// A conditional write failed because another instance took over the
    /// queue's range lease.
    #[error("queue lease lost to another writer")]
    LeaseLost,

    /// Transient overload; the caller may retry.
    #[error("request throttled")]
    Throttled,

    /// The queue manager is shutting down; retrying re-creates it.
    #[error("queue manager is gone")]
    Gone,

    /// The operation ran out of budget. Polls translate this into an empty
    /// response.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The operation was cancelled before completing.
    #[error("cancelled")]
    Cancelled,

    /// The sticky queue's bound worker has stopped polling; the producer
    /// should fall back to the normal queue.
    #[error("sticky worker unavailable")]
    StickyWorkerUnavailable,

    /// Malformed task or queue identity; not retryable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No pending query with the given id.
    #[error("query {0} is not pending")]
    QueryNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MatchingError {
    /// Whether a caller may retry the operation and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatchingError::Throttled | MatchingError::Gone | MatchingError::DeadlineExceeded
        )
    }
}
