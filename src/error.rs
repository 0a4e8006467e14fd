//! Warden error abstractions.

use std::time::Duration;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_DECODE_RECORD: &str = "error decoding database record from storage";
pub const ERR_DECODE_STATUS: &str = "error decoding periodic backup status from storage";

/// Application errors which callers are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The command was submitted to a node which is no longer the leader.
    #[error("{0}")]
    NotLeading(String),
    /// An optimistic concurrency check failed.
    #[error("concurrency violation: {0}")]
    Concurrency(String),
    /// The operation was cancelled via its cancellation token.
    #[error("the operation was cancelled")]
    Cancelled,
    /// There is no known leader to forward the command to.
    #[error("the cluster is currently unreachable: {0}")]
    ClusterDown(String),
    /// A configuration was found to be invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The operation may not start now and should be retried after the given delay.
    #[error("{reason}")]
    BackupDelay { delay: Duration, reason: String },
    /// The resource specified does not exist.
    #[error("the resource specified does not exist: {0}")]
    ResourceNotFound(String),
    /// A configuration script failed to produce usable output.
    #[error("{0}")]
    ScriptFailure(String),
}

/// Check whether the given error represents a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::Cancelled)))
}

/// Check whether the given error was raised because this node lost leadership.
pub fn is_not_leading(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::NotLeading(_))))
}

/// Check whether the given error is an optimistic concurrency failure.
pub fn is_concurrency(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::Concurrency(_))))
}

/// Extract the retry delay of a `BackupDelay` error, if that is what this error is.
pub fn backup_delay(err: &anyhow::Error) -> Option<Duration> {
    err.chain().find_map(|cause| match cause.downcast_ref::<AppError>() {
        Some(AppError::BackupDelay { delay, .. }) => Some(*delay),
        _ => None,
    })
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
