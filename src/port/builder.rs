//! Fluent builder for event port construction.

use crate::pool::{Executor, PoolKind, ThreadPool};
use crate::port::EventPort;

use std::io;
use std::sync::Arc;

/// Builder for [`EventPort`] instances.
///
/// # Example
/// ```ignore
/// let port = EventPortBuilder::new().fixed_pool(4).build()?;
/// ```
pub struct EventPortBuilder {
    pool: Option<ThreadPool>,
}

impl Default for EventPortBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPortBuilder {
    /// Creates a new builder. Without further configuration, [`build`]
    /// uses the default cached pool.
    ///
    /// [`build`]: Self::build
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Uses a fixed-size pool with `workers` threads.
    pub fn fixed_pool(mut self, workers: usize) -> Self {
        self.pool = Some(ThreadPool::fixed(workers));
        self
    }

    /// Uses a cached-flavor pool with `workers` threads.
    pub fn cached_pool(mut self, workers: usize) -> Self {
        self.pool = Some(ThreadPool::cached(workers));
        self
    }

    /// Uses a caller-supplied executor. `kind` tells the invoker whether the
    /// executor is bounded.
    pub fn executor(mut self, executor: Arc<dyn Executor>, kind: PoolKind, pool_size: usize) -> Self {
        self.pool = Some(ThreadPool::with_executor(executor, kind, pool_size));
        self
    }

    /// Builds the port and starts its poll thread.
    pub fn build(self) -> io::Result<Arc<EventPort>> {
        let pool = self.pool.unwrap_or_else(ThreadPool::default_pool);
        EventPort::new(pool)
    }
}
