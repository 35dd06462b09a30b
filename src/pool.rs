//! Worker pool that runs completion handlers and pooled tasks.
//!
//! The pool wraps an [`Executor`], either caller-supplied or the built-in
//! crossbeam-channel worker pool. Whether the pool is fixed-size or
//! unbounded is recorded once at construction, because it feeds the
//! invoker's direct-dispatch policy.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// A unit of work submitted to the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task-running collaborator consumed by the event port.
pub trait Executor: Send + Sync + 'static {
    /// Runs `task` on some pool thread. Hands the task back when the
    /// executor is no longer accepting work.
    fn execute(&self, task: Task) -> Result<(), Task>;

    /// Stops accepting new tasks. Already-queued tasks still run.
    fn shutdown(&self);
}

/// Whether the pool has a hard upper bound on concurrent workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// Fixed-size pool; queueing a completion behind the queue can starve it.
    Fixed,
    /// Unbounded (cached) pool.
    Cached,
}

/// The thread pool owned by an event port.
pub struct ThreadPool {
    executor: Arc<dyn Executor>,
    kind: PoolKind,
    pool_size: usize,
}

impl ThreadPool {
    /// Creates a fixed-size pool with `workers` threads.
    pub fn fixed(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            executor: WorkerPool::start(workers),
            kind: PoolKind::Fixed,
            pool_size: workers,
        }
    }

    /// Creates an unbounded-flavor pool sized to `workers` threads.
    pub fn cached(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            executor: WorkerPool::start(workers),
            kind: PoolKind::Cached,
            pool_size: workers,
        }
    }

    /// Wraps a caller-supplied executor.
    pub fn with_executor(executor: Arc<dyn Executor>, kind: PoolKind, pool_size: usize) -> Self {
        Self {
            executor,
            kind,
            pool_size,
        }
    }

    /// Creates the default pool: cached flavor, sized from the
    /// `EVPORT_POOL_SIZE` environment variable or the number of CPUs.
    pub fn default_pool() -> Self {
        let workers = std::env::var("EVPORT_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
        Self::cached(workers)
    }

    /// Whether this is a fixed-size pool.
    pub fn is_fixed(&self) -> bool {
        self.kind == PoolKind::Fixed
    }

    /// The number of worker threads the pool was sized for.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub(crate) fn execute(&self, task: Task) -> Result<(), Task> {
        self.executor.execute(task)
    }

    pub(crate) fn shutdown(&self) {
        self.executor.shutdown();
    }
}

/// Built-in executor: worker threads draining an unbounded channel.
struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
}

impl WorkerPool {
    fn start(workers: usize) -> Arc<Self> {
        let (sender, receiver) = unbounded::<Task>();
        for index in 0..workers {
            let receiver: Receiver<Task> = receiver.clone();
            let _ = thread::Builder::new()
                .name(format!("evport-worker-{index}"))
                .spawn(move || worker_loop(receiver));
        }
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
        })
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), Task> {
        match &*self.sender.lock() {
            Some(sender) => sender.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    fn shutdown(&self) {
        // Dropping the sender disconnects the channel; workers drain what is
        // already queued and exit.
        self.sender.lock().take();
    }
}

fn worker_loop(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("completion handler panicked on pool thread");
        }
    }
}
