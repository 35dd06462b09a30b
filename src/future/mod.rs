//! Operation futures returned by channel calls.
//!
//! Every asynchronous channel operation returns an [`IoFuture`]:
//! - [`CompletedResult`] when the synchronous fast path finished the I/O on
//!   the calling thread
//! - [`PendingResult`] when the operation would block and was parked on the
//!   channel until the event port reports readiness
//!
//! Completion is a message delivered exactly once. It can be consumed either
//! by blocking on [`IoFuture::get`] or through the completion handler passed
//! to the `*_with` channel methods, both backed by the same once-only state.

pub mod completed;
pub mod pending;

pub use completed::CompletedResult;
pub use pending::PendingResult;

use crate::error::Result;

use std::sync::Arc;
use std::time::Duration;

/// Completion callback attached to an operation. The caller-supplied
/// attachment rides inside the closure capture.
pub(crate) type Handler<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// The result of initiating an asynchronous channel operation.
pub enum IoFuture<T> {
    /// The operation finished on the calling thread.
    Completed(CompletedResult<T>),
    /// The operation is in flight and will be completed by the event port.
    Pending(Arc<PendingResult<T>>),
}

impl<T: Send + 'static> IoFuture<T> {
    /// Blocks until the operation completes and takes its outcome.
    ///
    /// Only valid when no completion handler was supplied; with a handler
    /// attached the outcome belongs to the handler and this returns an
    /// `InvalidInput` failure instead.
    pub fn get(&self) -> Result<T> {
        match self {
            IoFuture::Completed(result) => result.take(),
            IoFuture::Pending(result) => result.get(),
        }
    }

    /// Like [`get`](Self::get), but waits at most `timeout`.
    ///
    /// An elapsed wait fails with `TimedOut` without affecting the operation
    /// itself, which stays in flight.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        match self {
            IoFuture::Completed(result) => result.take(),
            IoFuture::Pending(result) => result.get_timeout(timeout),
        }
    }

    /// Attempts to cancel the operation.
    ///
    /// Returns true if this call settled the outcome as cancelled. A race
    /// with natural completion is resolved by the once-only contract: the
    /// first writer wins and this simply returns false.
    pub fn cancel(&self) -> bool {
        match self {
            IoFuture::Completed(_) => false,
            IoFuture::Pending(result) => result.cancel(),
        }
    }

    /// Whether the operation has completed.
    pub fn is_done(&self) -> bool {
        match self {
            IoFuture::Completed(_) => true,
            IoFuture::Pending(result) => result.is_done(),
        }
    }

    /// Whether the operation was settled by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            IoFuture::Completed(_) => false,
            IoFuture::Pending(result) => result.is_cancelled(),
        }
    }

    /// Whether the operation completed on the synchronous fast path.
    pub fn completed_synchronously(&self) -> bool {
        matches!(self, IoFuture::Completed(_))
    }
}
