//! Completion-based asynchronous channel core.
//!
//! This crate turns non-blocking descriptors into completion-style
//! asynchronous operations: connect, read, write, accept, and receive, with
//! timeouts, cancellation, and group-wide shutdown. It includes an event
//! port, worker pool, exactly-once futures, and the channel types built on
//! them.
//!
//! # Architecture
//!
//! - **EventPort**: owns the descriptor registry, the poll thread blocking
//!   on the platform readiness primitive, and the timeout scheduler
//! - **ThreadPool**: runs completion handlers and pooled transfers
//! - **IoFuture / PendingResult / CompletedResult**: exactly-once operation
//!   results, consumable by blocking pull or completion handler
//! - **Invoker**: bounds handler nesting and decides direct vs. pool dispatch
//! - **TcpChannel / TcpListener / UdpChannel / FileChannel**: the channel
//!   types driven by the port
//!
//! Operations attempt their syscall synchronously first; only when the OS
//! reports it would block is a pending result parked on the channel and
//! readiness interest armed. The poll loop finishes parked operations and
//! routes their completions through the invoker.

mod channel;
mod error;
mod future;
mod invoker;
mod pool;
mod port;
mod sys;

pub use channel::OpKind;
pub use channel::file::FileChannel;
pub use channel::listener::TcpListener;
pub use channel::tcp::TcpChannel;
pub use channel::udp::UdpChannel;
pub use error::{Error, Result};
pub use future::{CompletedResult, IoFuture, PendingResult};
pub use pool::{Executor, PoolKind, Task, ThreadPool};
pub use port::{EventPort, EventPortBuilder};
