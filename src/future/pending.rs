//! Mutable, thread-safe future for an in-flight operation.
//!
//! A `PendingResult` is created when a channel operation would block. It is
//! settled exactly once, by whichever of these gets there first:
//! - the poll loop finishing the I/O after a readiness event
//! - the timeout task scheduled with the operation
//! - explicit cancellation through the future
//! - the channel being closed with the operation still outstanding
//!
//! All later attempts to settle are no-ops that return false, so racing
//! completers always agree on a single observed outcome.

use crate::channel::{Abortable, OpKind};
use crate::error::{Error, Result};
use crate::future::Handler;
use crate::invoker;
use crate::port::EventPort;
use crate::port::timer::TimerHandle;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

enum Outcome<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

struct Inner<T> {
    outcome: Outcome<T>,
    handler: Option<Handler<T>>,
    timeout_task: Option<TimerHandle>,
}

/// An in-flight asynchronous operation.
///
/// Holds the operation kind, a back-reference to the owning channel for
/// cancellation, the optional completion handler, and the write-once
/// outcome. Blocking pulls via [`get`](Self::get) re-check completion under
/// the lock so a wake-up between check and wait cannot be missed.
pub struct PendingResult<T> {
    kind: OpKind,
    channel: Weak<dyn Abortable>,
    port: Weak<EventPort>,
    inner: Mutex<Inner<T>>,
    done: Condvar,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> PendingResult<T> {
    pub(crate) fn new(
        kind: OpKind,
        channel: Weak<dyn Abortable>,
        port: &Arc<EventPort>,
        handler: Option<Handler<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            channel,
            port: Arc::downgrade(port),
            inner: Mutex::new(Inner {
                outcome: Outcome::Pending,
                handler,
                timeout_task: None,
            }),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    /// The kind of operation this future tracks.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Settles the future with a value. Returns true if this call performed
    /// the transition from incomplete to complete.
    pub(crate) fn set_result(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the future with a failure. Same once-only contract as
    /// [`set_result`](Self::set_result).
    pub(crate) fn set_failure(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let timeout_task = {
            let mut inner = self.inner.lock();
            if !matches!(inner.outcome, Outcome::Pending) {
                return false;
            }
            inner.outcome = Outcome::Ready(outcome);
            inner.timeout_task.take()
        };
        // The timer loses the race; a second firing is a no-op anyway.
        if let Some(task) = timeout_task {
            task.cancel();
        }
        self.done.notify_all();
        true
    }

    /// Stores the handle of the timeout task guarding this operation. If the
    /// operation already completed the timer is cancelled on the spot.
    pub(crate) fn set_timeout_task(&self, task: TimerHandle) {
        let mut inner = self.inner.lock();
        if matches!(inner.outcome, Outcome::Pending) {
            inner.timeout_task = Some(task);
        } else {
            drop(inner);
            task.cancel();
        }
    }

    /// Takes the handler together with the ready outcome for dispatch.
    ///
    /// Returns `None` when there is no handler (blocking-pull usage) or when
    /// another dispatcher already claimed the completion.
    pub(crate) fn take_dispatch(&self) -> Option<(Handler<T>, Result<T>)> {
        let mut inner = self.inner.lock();
        if inner.handler.is_none() {
            return None;
        }
        match std::mem::replace(&mut inner.outcome, Outcome::Taken) {
            Outcome::Ready(outcome) => {
                let handler = inner.handler.take()?;
                Some((handler, outcome))
            }
            previous => {
                inner.outcome = previous;
                None
            }
        }
    }

    /// Blocks until the operation completes and takes its outcome.
    pub fn get(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        if inner.handler.is_some() {
            return Err(Error::InvalidInput(
                "a completion handler was supplied; the outcome is delivered to it",
            ));
        }
        loop {
            match std::mem::replace(&mut inner.outcome, Outcome::Taken) {
                Outcome::Ready(outcome) => return outcome,
                Outcome::Taken => {
                    return Err(Error::InvalidInput("result was already taken"));
                }
                Outcome::Pending => {
                    inner.outcome = Outcome::Pending;
                    self.done.wait(&mut inner);
                }
            }
        }
    }

    /// Blocks for at most `timeout` waiting for completion.
    ///
    /// An elapsed wait returns `TimedOut` without settling the operation.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        if inner.handler.is_some() {
            return Err(Error::InvalidInput(
                "a completion handler was supplied; the outcome is delivered to it",
            ));
        }
        loop {
            match std::mem::replace(&mut inner.outcome, Outcome::Taken) {
                Outcome::Ready(outcome) => return outcome,
                Outcome::Taken => {
                    return Err(Error::InvalidInput("result was already taken"));
                }
                Outcome::Pending => {
                    inner.outcome = Outcome::Pending;
                    if self.done.wait_until(&mut inner, deadline).timed_out() {
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    /// Attempts to cancel the operation.
    ///
    /// On winning the race against natural completion this settles the
    /// outcome as `Cancelled`, asks the owning channel to abort the
    /// underlying wait, and delivers the completion. Returns false when the
    /// operation already completed.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if !self.set_failure(Error::Cancelled) {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(channel) = self.channel.upgrade() {
            channel.abort(self.kind, Arc::as_ptr(self) as *const () as usize);
        }
        if let Some(port) = self.port.upgrade() {
            invoker::invoke_indirectly(&port, self);
        }
        true
    }

    /// Token identifying this future inside the channel's pending slots.
    pub(crate) fn token(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    /// Whether the operation has completed.
    pub fn is_done(&self) -> bool {
        !matches!(self.inner.lock().outcome, Outcome::Pending)
    }

    /// Whether the operation was settled by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
