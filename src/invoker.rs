//! Direct vs. indirect dispatch of completion handlers.
//!
//! A handler may run on the thread that observed completion only when that
//! thread belongs to the event port's pool and the nesting depth stays below
//! a fixed bound. This keeps chained completions (operations initiated from
//! inside other handlers) from growing the call stack without bound, while
//! letting a fixed-size pool service its own fast-path completions instead
//! of starving behind its own queue. Everything else is submitted to the
//! pool, with the nesting count reset in the new task.

use crate::error::Result;
use crate::future::{Handler, PendingResult};
use crate::port::EventPort;

use std::cell::Cell;
use std::sync::Arc;

/// Upper bound on handler nesting before dispatch falls back to the pool.
const MAX_HANDLER_INVOKE_COUNT: u32 = 16;

thread_local! {
    /// (port id, nested invoke count) for threads running pooled tasks.
    static PORT_AND_INVOKE_COUNT: Cell<Option<(u64, u32)>> = const { Cell::new(None) };
}

/// Marks the current thread as running a pooled task for `port_id`, with the
/// invoke count reset. Returns the previous binding for restoration.
pub(crate) fn enter_pooled_task(port_id: u64) -> Option<(u64, u32)> {
    PORT_AND_INVOKE_COUNT.with(|cell| cell.replace(Some((port_id, 1))))
}

/// Restores the binding saved by [`enter_pooled_task`].
pub(crate) fn leave_pooled_task(previous: Option<(u64, u32)>) {
    PORT_AND_INVOKE_COUNT.with(|cell| cell.set(previous));
}

/// Whether the current thread may run a handler for `port` directly.
pub(crate) fn may_invoke_direct(port: &EventPort) -> bool {
    PORT_AND_INVOKE_COUNT.with(|cell| match cell.get() {
        Some((id, count)) => id == port.id() && count < MAX_HANDLER_INVOKE_COUNT,
        None => false,
    })
}

/// Delivers a pending result's completion, directly when permitted.
pub(crate) fn invoke<T: Send + 'static>(port: &Arc<EventPort>, result: &Arc<PendingResult<T>>) {
    if may_invoke_direct(port) {
        if let Some((handler, outcome)) = result.take_dispatch() {
            run_nested(handler, outcome);
        }
    } else {
        invoke_indirectly(port, result);
    }
}

/// Delivers a pending result's completion on a pool thread.
pub(crate) fn invoke_indirectly<T: Send + 'static>(
    port: &Arc<EventPort>,
    result: &Arc<PendingResult<T>>,
) {
    let Some((handler, outcome)) = result.take_dispatch() else {
        return;
    };
    submit(port, handler, outcome);
}

/// Delivers a synchronously completed outcome to its handler, directly when
/// permitted.
pub(crate) fn invoke_handler<T: Send + 'static>(
    port: &Arc<EventPort>,
    handler: Handler<T>,
    outcome: Result<T>,
) {
    if may_invoke_direct(port) {
        run_nested(handler, outcome);
    } else {
        submit(port, handler, outcome);
    }
}

fn submit<T: Send + 'static>(port: &Arc<EventPort>, handler: Handler<T>, outcome: Result<T>) {
    let task = Box::new(move || handler(outcome));
    if let Err(task) = port.execute(task) {
        // The pool is draining; the completion still runs, inline.
        tracing::warn!("pool rejected completion dispatch, running inline");
        task();
    }
}

fn run_nested<T>(handler: Handler<T>, outcome: Result<T>) {
    let previous = PORT_AND_INVOKE_COUNT.with(|cell| {
        let previous = cell.get();
        if let Some((id, count)) = previous {
            cell.set(Some((id, count + 1)));
        }
        previous
    });
    handler(outcome);
    PORT_AND_INVOKE_COUNT.with(|cell| cell.set(previous));
}
