//! Asynchronous channel types and the surfaces the event port drives.
//!
//! - [`tcp`]: stream channel with connect/read/write
//! - [`listener`]: accepting channel
//! - [`udp`]: datagram channel with receive/send
//! - [`file`]: positional file channel executed on pool threads

pub mod file;
pub mod listener;
pub mod tcp;
pub mod udp;

use crate::error::Result;
use crate::future::{CompletedResult, Handler, IoFuture};
use crate::invoker;
use crate::port::EventPort;

use std::sync::Arc;

/// The kinds of asynchronous operation a channel can have in flight.
///
/// At most one pending operation of a given kind may exist per channel; a
/// second request of the same kind fails fast with `AlreadyPending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Connect,
    Read,
    Write,
    Accept,
    Receive,
}

/// Callback surface the poll loop drives when a registered descriptor
/// becomes ready.
///
/// An error-or-hangup condition on the descriptor is reported with both
/// flags set, so both directions get a chance to observe the error.
pub(crate) trait PollableChannel: Send + Sync {
    fn on_event(&self, readable: bool, writable: bool);

    /// Forced close during `EventPort::shutdown_now`; must fail every
    /// still-pending operation.
    fn force_close(&self);
}

/// Cancellation capability implemented per channel type.
///
/// Invoked by [`PendingResult::cancel`](crate::PendingResult::cancel) after
/// it won the completion race. `token` identifies the cancelled future so a
/// racing replacement operation in the same slot is left untouched.
pub(crate) trait Abortable: Send + Sync {
    fn abort(&self, kind: OpKind, token: usize);
}

/// Wraps a synchronously resolved outcome as a completed future, routing it
/// through the invoker when a handler was supplied.
pub(crate) fn deliver_completed<T: Send + 'static>(
    port: &Arc<EventPort>,
    handler: Option<Handler<T>>,
    outcome: Result<T>,
) -> IoFuture<T> {
    match handler {
        Some(handler) => {
            invoker::invoke_handler(port, handler, outcome);
            IoFuture::Completed(CompletedResult::consumed())
        }
        None => IoFuture::Completed(match outcome {
            Ok(value) => CompletedResult::with_result(value),
            Err(error) => CompletedResult::with_failure(error),
        }),
    }
}
