//! Deadline scheduling for operation timeouts.
//!
//! A single timer thread owns a min-heap of deadlines and runs each task
//! when its deadline is reached. Cancellation is a flag checked right before
//! the task runs: cancelling a timeout whose task already started is safe
//! because the pending result it races against settles exactly once.

use crate::pool::Task;

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Handle to a scheduled timeout task.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevents the task from running if it has not started yet.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

// BinaryHeap is a max-heap; order entries so the nearest deadline wins.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    next_sequence: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Time-ordered executor for timeout tasks.
pub(crate) struct TimerQueue {
    inner: Arc<TimerInner>,
}

impl TimerQueue {
    pub(crate) fn start() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let loop_inner = inner.clone();
        let _ = thread::Builder::new()
            .name("evport-timer".into())
            .spawn(move || timer_loop(loop_inner));

        Self { inner }
    }

    /// Schedules `task` to run after `delay`. The returned handle cancels
    /// the task if it has not fired yet.
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.state.lock();
        if state.shutdown {
            // Nothing will fire after shutdown; report the task as cancelled.
            cancelled.store(true, Ordering::SeqCst);
            return TimerHandle { cancelled };
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.push(TimerEntry {
            deadline: Instant::now() + delay,
            sequence,
            cancelled: cancelled.clone(),
            task,
        });
        drop(state);
        self.inner.changed.notify_one();
        TimerHandle { cancelled }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.entries.clear();
        drop(state);
        self.inner.changed.notify_one();
    }
}

fn timer_loop(inner: Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let next_deadline = state.entries.peek().map(|entry| entry.deadline);
        match next_deadline {
            None => {
                inner.changed.wait(&mut state);
            }
            Some(deadline) if deadline <= Instant::now() => {
                if let Some(entry) = state.entries.pop() {
                    drop(state);
                    if !entry.cancelled.load(Ordering::SeqCst) {
                        (entry.task)();
                    }
                    state = inner.state.lock();
                }
            }
            Some(deadline) => {
                let _ = inner.changed.wait_until(&mut state, deadline);
            }
        }
    }
}
