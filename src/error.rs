//! Error taxonomy for asynchronous channel operations.
//!
//! Validation failures (closed channel, already-pending operation, invalid
//! argument) surface synchronously as an immediately failed result. Errors
//! discovered while an operation is in flight (I/O failure, timeout, close)
//! are delivered through the same completion path as success, with the
//! failure stored in place of the value.

use crate::channel::OpKind;

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure cause carried by a completed operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The channel is closed, or was closed while the operation was pending.
    #[error("channel is closed")]
    Closed,

    /// An operation of the same kind is already pending on this channel.
    #[error("{0:?} operation is already pending on this channel")]
    AlreadyPending(OpKind),

    /// A read or write was attempted before the channel finished connecting.
    #[error("channel is not connected")]
    NotConnected,

    /// A connect was attempted on an already connected channel.
    #[error("channel is already connected")]
    AlreadyConnected,

    /// A connect was attempted while an earlier connect is still pending.
    #[error("a connect is already in progress")]
    ConnectionPending,

    /// The caller-supplied timeout elapsed before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// The operation was cancelled via its future.
    #[error("operation was cancelled")]
    Cancelled,

    /// The event port is shutting down and cannot accept new work.
    #[error("event port is shut down")]
    Shutdown,

    /// An argument failed validation before any state was created.
    #[error("invalid argument: {0}")]
    InvalidInput(&'static str),

    /// Underlying operating system error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this failure was produced by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this failure was produced by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}
