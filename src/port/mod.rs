//! Event port: the channel group that owns the thread pool and poll loop.
//!
//! The port keeps the mapping from native descriptor to channel, runs the
//! dedicated poll thread that blocks on the platform readiness primitive,
//! schedules timeout tasks, and carries the group lifecycle:
//!
//! - `Active`: registrations and poll requests accepted
//! - `ShutdownRequested`: new registrations fail with `Shutdown`, existing
//!   pending operations drain (or are force-failed by `shutdown_now`)
//! - `Terminated`: poll loop, timer thread, and pool have stopped

pub mod builder;
pub(crate) mod poller;
pub(crate) mod timer;

pub use builder::EventPortBuilder;

use crate::channel::PollableChannel;
use crate::error::{Error, Result};
use crate::pool::{Task, ThreadPool};
use crate::port::poller::{Interest, Poller, ReadyEvent, platform_poller};
use crate::port::timer::{TimerHandle, TimerQueue};
use crate::invoker;

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);
static DEFAULT_PORT: OnceLock<Arc<EventPort>> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Active,
    ShutdownRequested,
    Terminated,
}

struct PortState {
    lifecycle: Lifecycle,
    registry: HashMap<RawFd, Arc<dyn PollableChannel>>,
}

/// Owner of a set of registered channels, their poll loop, and the pool
/// that runs their completion handlers.
pub struct EventPort {
    id: u64,
    pool: ThreadPool,
    poller: Box<dyn Poller>,
    state: Mutex<PortState>,
    terminated: Condvar,
    timers: TimerQueue,
}

impl EventPort {
    /// Creates a port around the given pool and starts its poll thread.
    pub fn new(pool: ThreadPool) -> io::Result<Arc<EventPort>> {
        let poller = platform_poller()?;
        let port = Arc::new(EventPort {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            poller,
            state: Mutex::new(PortState {
                lifecycle: Lifecycle::Active,
                registry: HashMap::new(),
            }),
            terminated: Condvar::new(),
            timers: TimerQueue::start(),
        });

        let weak = Arc::downgrade(&port);
        thread::Builder::new()
            .name("evport-poll".into())
            .spawn(move || poll_loop(weak))?;

        Ok(port)
    }

    /// The process-wide default port, created on first use with the default
    /// pool. It lives until process exit; use [`EventPort::new`] with an
    /// explicit pool when test isolation or teardown is needed.
    ///
    /// # Panics
    /// Panics if the platform poller cannot be created.
    pub fn default_port() -> Arc<EventPort> {
        DEFAULT_PORT
            .get_or_init(|| {
                EventPort::new(ThreadPool::default_pool())
                    .expect("failed to create default event port")
            })
            .clone()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_fixed_pool(&self) -> bool {
        self.pool.is_fixed()
    }

    /// Adds the descriptor-to-channel mapping. Fails with `Shutdown` once
    /// the group stops accepting new channels.
    pub(crate) fn register(&self, fd: RawFd, channel: Arc<dyn PollableChannel>) -> Result<()> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Active {
            return Err(Error::Shutdown);
        }
        state.registry.insert(fd, channel);
        tracing::debug!(fd, "channel registered");
        Ok(())
    }

    /// Removes the mapping on channel close. The last channel leaving a
    /// shutdown-requested group terminates it.
    pub(crate) fn unregister(&self, fd: RawFd) {
        self.poller.disarm(fd);
        let mut state = self.state.lock();
        state.registry.remove(&fd);
        tracing::debug!(fd, "channel unregistered");
        if state.lifecycle == Lifecycle::ShutdownRequested && state.registry.is_empty() {
            drop(state);
            self.terminate();
        }
    }

    /// Arms one-shot readiness interest for a registered descriptor.
    pub(crate) fn start_poll(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poller.arm(fd, interest)
    }

    /// Schedules a timeout task.
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        self.timers.schedule(delay, task)
    }

    /// Submits a task to the pool, bound to this port for the invoker's
    /// direct-dispatch accounting. Hands the task back when the pool is no
    /// longer accepting work.
    pub(crate) fn execute(&self, task: Task) -> std::result::Result<(), Task> {
        let id = self.id;
        let wrapped: Task = Box::new(move || {
            let previous = invoker::enter_pooled_task(id);
            task();
            invoker::leave_pooled_task(previous);
        });
        self.pool.execute(wrapped)
    }

    /// Requests a graceful shutdown: no new channels are accepted, existing
    /// pending operations drain naturally, and the group terminates once the
    /// last channel closes.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Active => {
                state.lifecycle = Lifecycle::ShutdownRequested;
                tracing::debug!(port = self.id, "shutdown requested");
                if state.registry.is_empty() {
                    drop(state);
                    self.terminate();
                }
            }
            Lifecycle::ShutdownRequested | Lifecycle::Terminated => {}
        }
    }

    /// Shuts down forcibly: every registered channel is closed, which fails
    /// all of their pending operations with `Closed`, then the group
    /// terminates.
    pub fn shutdown_now(&self) {
        let channels: Vec<Arc<dyn PollableChannel>> = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Terminated {
                return;
            }
            state.lifecycle = Lifecycle::ShutdownRequested;
            state.registry.drain().map(|(_, channel)| channel).collect()
        };
        tracing::debug!(port = self.id, channels = channels.len(), "forced shutdown");
        for channel in channels {
            channel.force_close();
        }
        let state = self.state.lock();
        if state.lifecycle == Lifecycle::ShutdownRequested && state.registry.is_empty() {
            drop(state);
            self.terminate();
        }
    }

    fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Terminated {
                return;
            }
            state.lifecycle = Lifecycle::Terminated;
        }
        tracing::debug!(port = self.id, "terminated");
        self.terminated.notify_all();
        self.timers.shutdown();
        self.pool.shutdown();
        self.poller.wakeup();
    }

    /// Whether shutdown has been requested (or completed).
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().lifecycle != Lifecycle::Active
    }

    /// Whether the group has fully terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Terminated
    }

    /// Blocks until the group terminates or `timeout` elapses. Returns true
    /// if the group terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        while state.lifecycle != Lifecycle::Terminated {
            if self.terminated.wait_for(&mut state, timeout).timed_out() {
                return state.lifecycle == Lifecycle::Terminated;
            }
        }
        true
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<dyn PollableChannel>> {
        self.state.lock().registry.get(&fd).cloned()
    }
}

/// Dedicated poll thread: blocks on the readiness primitive, claims the
/// channels behind ready descriptors, and lets them finish their pending
/// operations. The thread only ever blocks on the poller, never on I/O.
fn poll_loop(port: Weak<EventPort>) {
    let mut events: Vec<ReadyEvent> = Vec::with_capacity(64);
    loop {
        let Some(port) = port.upgrade() else {
            break;
        };
        if port.is_terminated() {
            break;
        }

        events.clear();
        if let Err(err) = port.poller.wait(&mut events) {
            tracing::warn!(error = %err, "poller wait failed");
            break;
        }

        for event in &events {
            if let Some(channel) = port.lookup(event.fd) {
                tracing::trace!(
                    fd = event.fd,
                    readable = event.readable,
                    writable = event.writable,
                    "descriptor ready"
                );
                channel.on_event(event.readable, event.writable);
            }
        }
    }
    tracing::debug!("poll loop exited");
}
