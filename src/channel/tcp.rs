//! Asynchronous TCP stream channel.
//!
//! Every operation follows the same template: validate the channel state,
//! attempt the syscall on the calling thread, and either complete on the
//! spot or park a [`PendingResult`] on the channel and arm readiness
//! interest with the event port. The poll loop finishes parked operations
//! when the descriptor becomes ready.
//!
//! # Example
//!
//! ```ignore
//! use evport::{EventPort, TcpChannel};
//! use bytes::BytesMut;
//!
//! let port = EventPort::default_port();
//! let channel = TcpChannel::open(&port)?;
//! channel.connect("127.0.0.1:8080".parse()?).get()?;
//! let (n, buf) = channel.read(BytesMut::with_capacity(1024), None).get()?;
//! ```

use crate::channel::{Abortable, OpKind, PollableChannel, deliver_completed};
use crate::error::{Error, Result};
use crate::future::{Handler, IoFuture, PendingResult};
use crate::invoker;
use crate::port::EventPort;
use crate::port::poller::Interest;
use crate::sys::{self, IoOutcome};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Unconnected,
    Pending,
    Connected,
    Closed,
}

struct ConnState {
    stage: Stage,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    pending_remote: Option<SocketAddr>,
}

/// A parked read, tagged by buffer shape because the completion value's
/// numeric width differs: a single-buffer read completes with `usize`, a
/// scattering read with the aggregate `u64` count.
enum PendingRead {
    Single {
        result: Arc<PendingResult<(usize, BytesMut)>>,
        buf: BytesMut,
    },
    Scattering {
        result: Arc<PendingResult<(u64, Vec<BytesMut>)>>,
        bufs: Vec<BytesMut>,
    },
}

impl PendingRead {
    fn token(&self) -> usize {
        match self {
            PendingRead::Single { result, .. } => result.token(),
            PendingRead::Scattering { result, .. } => result.token(),
        }
    }

    fn fail(self, port: &Arc<EventPort>, error: Error) {
        match self {
            PendingRead::Single { result, .. } => {
                if result.set_failure(error) {
                    invoker::invoke_indirectly(port, &result);
                }
            }
            PendingRead::Scattering { result, .. } => {
                if result.set_failure(error) {
                    invoker::invoke_indirectly(port, &result);
                }
            }
        }
    }
}

/// A parked write, with the same single/gathering width distinction.
enum PendingWrite {
    Single {
        result: Arc<PendingResult<usize>>,
        buf: Bytes,
    },
    Gathering {
        result: Arc<PendingResult<u64>>,
        bufs: Vec<Bytes>,
    },
}

impl PendingWrite {
    fn token(&self) -> usize {
        match self {
            PendingWrite::Single { result, .. } => result.token(),
            PendingWrite::Gathering { result, .. } => result.token(),
        }
    }

    fn fail(self, port: &Arc<EventPort>, error: Error) {
        match self {
            PendingWrite::Single { result, .. } => {
                if result.set_failure(error) {
                    invoker::invoke_indirectly(port, &result);
                }
            }
            PendingWrite::Gathering { result, .. } => {
                if result.set_failure(error) {
                    invoker::invoke_indirectly(port, &result);
                }
            }
        }
    }
}

#[derive(Default)]
struct PendingOps {
    connect: Option<Arc<PendingResult<()>>>,
    read: Option<PendingRead>,
    write: Option<PendingWrite>,
    // busy flags span the whole operation, from the slot reservation through
    // the finishing I/O, so a same-kind request fails fast the entire time
    read_busy: bool,
    write_busy: bool,
}

/// Asynchronous TCP stream channel registered with an [`EventPort`].
///
/// At most one connect, one read, and one write may be in flight at a time;
/// reads and writes of different kinds proceed independently. Closing the
/// channel completes every outstanding operation with a `Closed` failure.
pub struct TcpChannel {
    fd: RawFd,
    port: Arc<EventPort>,
    open: RwLock<bool>,
    state: Mutex<ConnState>,
    pending: Mutex<PendingOps>,
}

impl TcpChannel {
    /// Opens an unconnected IPv4 channel and registers it with the port.
    pub fn open(port: &Arc<EventPort>) -> Result<Arc<TcpChannel>> {
        Self::open_family(port, false)
    }

    /// Opens an unconnected IPv6 channel and registers it with the port.
    pub fn open_v6(port: &Arc<EventPort>) -> Result<Arc<TcpChannel>> {
        Self::open_family(port, true)
    }

    fn open_family(port: &Arc<EventPort>, v6: bool) -> Result<Arc<TcpChannel>> {
        let fd = sys::tcp_socket(v6)?;
        let channel = Arc::new(TcpChannel {
            fd,
            port: port.clone(),
            open: RwLock::new(true),
            state: Mutex::new(ConnState {
                stage: Stage::Unconnected,
                local: None,
                remote: None,
                pending_remote: None,
            }),
            pending: Mutex::new(PendingOps::default()),
        });
        if let Err(error) = port.register(fd, channel.clone()) {
            sys::close_fd(fd);
            *channel.open.write() = false;
            channel.state.lock().stage = Stage::Closed;
            return Err(error);
        }
        Ok(channel)
    }

    /// Wraps a descriptor produced by an accepting channel.
    pub(crate) fn from_accepted(
        port: &Arc<EventPort>,
        fd: RawFd,
        remote: SocketAddr,
    ) -> Result<Arc<TcpChannel>> {
        let local = sys::local_addr(fd).ok();
        let channel = Arc::new(TcpChannel {
            fd,
            port: port.clone(),
            open: RwLock::new(true),
            state: Mutex::new(ConnState {
                stage: Stage::Connected,
                local,
                remote: Some(remote),
                pending_remote: None,
            }),
            pending: Mutex::new(PendingOps::default()),
        });
        if let Err(error) = port.register(fd, channel.clone()) {
            sys::close_fd(fd);
            return Err(error);
        }
        Ok(channel)
    }

    /// Marks the beginning of an I/O operation. The returned guard keeps a
    /// concurrent close from tearing the channel down mid-operation.
    fn begin(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read();
        if !*guard {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    // -- connect --

    /// Connects to `remote`, resolving the future once the connection is
    /// established.
    pub fn connect(self: &Arc<Self>, remote: SocketAddr) -> IoFuture<()> {
        self.connect_impl(remote, None)
    }

    /// Like [`connect`](Self::connect), delivering the outcome to `handler`
    /// together with `attachment`.
    pub fn connect_with<A, F>(
        self: &Arc<Self>,
        remote: SocketAddr,
        attachment: A,
        handler: F,
    ) -> IoFuture<()>
    where
        A: Send + 'static,
        F: FnOnce(Result<()>, A) + Send + 'static,
    {
        self.connect_impl(
            remote,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn connect_impl(self: &Arc<Self>, remote: SocketAddr, handler: Option<Handler<()>>) -> IoFuture<()> {
        {
            let mut state = self.state.lock();
            match state.stage {
                Stage::Closed => {
                    return deliver_completed(&self.port, handler, Err(Error::Closed));
                }
                Stage::Connected => {
                    return deliver_completed(&self.port, handler, Err(Error::AlreadyConnected));
                }
                Stage::Pending => {
                    return deliver_completed(&self.port, handler, Err(Error::ConnectionPending));
                }
                Stage::Unconnected => {
                    state.stage = Stage::Pending;
                    state.pending_remote = Some(remote);
                }
            }
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => return deliver_completed(&self.port, handler, Err(error)),
        };
        match sys::try_connect(self.fd, &remote) {
            Ok(IoOutcome::Done(())) => {
                self.set_connected();
                drop(guard);
                deliver_completed(&self.port, handler, Ok(()))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Connect, abortable, &self.port, handler);
                self.pending.lock().connect = Some(result.clone());
                self.update_interest();
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                // The connection cannot be established; the channel is done.
                self.close();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    fn set_connected(&self) {
        let mut state = self.state.lock();
        if state.stage == Stage::Closed {
            return;
        }
        state.stage = Stage::Connected;
        state.local = sys::local_addr(self.fd).ok();
        state.remote = state.pending_remote.take();
    }

    fn finish_connect(&self, result: Arc<PendingResult<()>>) {
        let outcome = match self.begin() {
            Ok(_guard) => match sys::check_connect(self.fd) {
                Ok(()) => {
                    self.set_connected();
                    Ok(())
                }
                Err(error) => Err(Error::from(error)),
            },
            Err(error) => Err(error),
        };
        match outcome {
            Ok(()) => {
                if result.set_result(()) {
                    invoker::invoke(&self.port, &result);
                }
                self.update_interest();
            }
            Err(error) => {
                self.close();
                if result.set_failure(error) {
                    invoker::invoke(&self.port, &result);
                }
            }
        }
    }

    // -- read --

    /// Reads into the buffer's spare capacity, completing with the byte
    /// count and the buffer. A count of zero means end of stream.
    ///
    /// `timeout` of `None` waits indefinitely; otherwise the operation fails
    /// with `TimedOut` when the delay elapses first, leaving the channel
    /// usable for subsequent reads.
    pub fn read(
        self: &Arc<Self>,
        buf: BytesMut,
        timeout: Option<Duration>,
    ) -> IoFuture<(usize, BytesMut)> {
        self.read_impl(buf, timeout, None)
    }

    /// Like [`read`](Self::read), delivering the outcome to `handler`.
    pub fn read_with<A, F>(
        self: &Arc<Self>,
        buf: BytesMut,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> IoFuture<(usize, BytesMut)>
    where
        A: Send + 'static,
        F: FnOnce(Result<(usize, BytesMut)>, A) + Send + 'static,
    {
        self.read_impl(
            buf,
            timeout,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn read_impl(
        self: &Arc<Self>,
        mut buf: BytesMut,
        timeout: Option<Duration>,
        handler: Option<Handler<(usize, BytesMut)>>,
    ) -> IoFuture<(usize, BytesMut)> {
        if let Err(error) = self.check_connected() {
            return deliver_completed(&self.port, handler, Err(error));
        }
        if let Err(error) = self.reserve_read() {
            return deliver_completed(&self.port, handler, Err(error));
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_reading();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        let attempt = if self.may_attempt(&handler) {
            sys::try_read_buf(self.fd, &mut buf)
        } else {
            Ok(IoOutcome::WouldBlock)
        };
        match attempt {
            Ok(IoOutcome::Done(n)) => {
                drop(guard);
                self.enable_reading();
                deliver_completed(&self.port, handler, Ok((n, buf)))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Read, abortable, &self.port, handler);
                self.install_read(PendingRead::Single {
                    result: result.clone(),
                    buf,
                });
                if let Some(delay) = timeout {
                    self.schedule_read_timeout(&result, delay);
                }
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_reading();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    /// Scattering read across several buffers, completing with the
    /// aggregate count as `u64` and the buffers.
    pub fn read_vectored(
        self: &Arc<Self>,
        bufs: Vec<BytesMut>,
        timeout: Option<Duration>,
    ) -> IoFuture<(u64, Vec<BytesMut>)> {
        self.read_vectored_impl(bufs, timeout, None)
    }

    /// Like [`read_vectored`](Self::read_vectored) with a handler.
    pub fn read_vectored_with<A, F>(
        self: &Arc<Self>,
        bufs: Vec<BytesMut>,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> IoFuture<(u64, Vec<BytesMut>)>
    where
        A: Send + 'static,
        F: FnOnce(Result<(u64, Vec<BytesMut>)>, A) + Send + 'static,
    {
        self.read_vectored_impl(
            bufs,
            timeout,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn read_vectored_impl(
        self: &Arc<Self>,
        mut bufs: Vec<BytesMut>,
        timeout: Option<Duration>,
        handler: Option<Handler<(u64, Vec<BytesMut>)>>,
    ) -> IoFuture<(u64, Vec<BytesMut>)> {
        if bufs.is_empty() {
            return deliver_completed(
                &self.port,
                handler,
                Err(Error::InvalidInput("scattering read requires buffers")),
            );
        }
        if let Err(error) = self.check_connected() {
            return deliver_completed(&self.port, handler, Err(error));
        }
        if let Err(error) = self.reserve_read() {
            return deliver_completed(&self.port, handler, Err(error));
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_reading();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        let attempt = if self.may_attempt(&handler) {
            sys::try_read_bufs(self.fd, &mut bufs)
        } else {
            Ok(IoOutcome::WouldBlock)
        };
        match attempt {
            Ok(IoOutcome::Done(n)) => {
                drop(guard);
                self.enable_reading();
                deliver_completed(&self.port, handler, Ok((n, bufs)))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Read, abortable, &self.port, handler);
                self.install_read(PendingRead::Scattering {
                    result: result.clone(),
                    bufs,
                });
                if let Some(delay) = timeout {
                    self.schedule_read_timeout(&result, delay);
                }
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_reading();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    fn reserve_read(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.read_busy {
            return Err(Error::AlreadyPending(OpKind::Read));
        }
        pending.read_busy = true;
        Ok(())
    }

    fn enable_reading(&self) {
        self.pending.lock().read_busy = false;
    }

    fn install_read(&self, op: PendingRead) {
        self.pending.lock().read = Some(op);
        self.update_interest();
    }

    /// Schedules the read timeout and attaches its handle to the result so
    /// natural completion cancels the timer.
    fn schedule_read_timeout<T: Send + 'static>(
        self: &Arc<Self>,
        result: &Arc<PendingResult<T>>,
        delay: Duration,
    ) {
        let token = result.token();
        let channel = Arc::downgrade(self);
        let handle = self.port.schedule(
            delay,
            Box::new(move || {
                if let Some(channel) = channel.upgrade() {
                    channel.read_timed_out(token);
                }
            }),
        );
        result.set_timeout_task(handle);
    }

    fn read_timed_out(&self, token: usize) {
        let op = {
            let mut pending = self.pending.lock();
            match &pending.read {
                Some(op) if op.token() == token => {
                    pending.read_busy = false;
                    pending.read.take()
                }
                _ => None,
            }
        };
        let Some(op) = op else { return };
        self.update_interest();
        op.fail(&self.port, Error::TimedOut);
    }

    fn finish_read(&self, op: PendingRead) {
        match op {
            PendingRead::Single { result, mut buf } => match self.begin() {
                Ok(guard) => match sys::try_read_buf(self.fd, &mut buf) {
                    Ok(IoOutcome::Done(n)) => {
                        self.enable_reading();
                        self.update_interest();
                        drop(guard);
                        if result.set_result((n, buf)) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                    Ok(IoOutcome::WouldBlock) => {
                        // Spurious wakeup: park the operation again. The
                        // begin bracket keeps a concurrent close from
                        // missing the re-parked operation.
                        self.pending.lock().read = Some(PendingRead::Single { result, buf });
                        self.update_interest();
                        drop(guard);
                    }
                    Err(error) => {
                        self.enable_reading();
                        self.update_interest();
                        drop(guard);
                        if result.set_failure(error.into()) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                },
                Err(error) => {
                    self.enable_reading();
                    if result.set_failure(error) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
            PendingRead::Scattering { result, mut bufs } => match self.begin() {
                Ok(guard) => match sys::try_read_bufs(self.fd, &mut bufs) {
                    Ok(IoOutcome::Done(n)) => {
                        self.enable_reading();
                        self.update_interest();
                        drop(guard);
                        if result.set_result((n, bufs)) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                    Ok(IoOutcome::WouldBlock) => {
                        self.pending.lock().read = Some(PendingRead::Scattering { result, bufs });
                        self.update_interest();
                        drop(guard);
                    }
                    Err(error) => {
                        self.enable_reading();
                        self.update_interest();
                        drop(guard);
                        if result.set_failure(error.into()) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                },
                Err(error) => {
                    self.enable_reading();
                    if result.set_failure(error) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
        }
    }

    // -- write --

    /// Writes the buffer's contents, completing with the number of bytes
    /// accepted by one syscall.
    pub fn write(self: &Arc<Self>, buf: Bytes, timeout: Option<Duration>) -> IoFuture<usize> {
        self.write_impl(buf, timeout, None)
    }

    /// Like [`write`](Self::write), delivering the outcome to `handler`.
    pub fn write_with<A, F>(
        self: &Arc<Self>,
        buf: Bytes,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> IoFuture<usize>
    where
        A: Send + 'static,
        F: FnOnce(Result<usize>, A) + Send + 'static,
    {
        self.write_impl(
            buf,
            timeout,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn write_impl(
        self: &Arc<Self>,
        buf: Bytes,
        timeout: Option<Duration>,
        handler: Option<Handler<usize>>,
    ) -> IoFuture<usize> {
        if let Err(error) = self.check_connected() {
            return deliver_completed(&self.port, handler, Err(error));
        }
        if let Err(error) = self.reserve_write() {
            return deliver_completed(&self.port, handler, Err(error));
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_writing();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        let attempt = if self.may_attempt(&handler) {
            sys::try_write_buf(self.fd, &buf)
        } else {
            Ok(IoOutcome::WouldBlock)
        };
        match attempt {
            Ok(IoOutcome::Done(n)) => {
                drop(guard);
                self.enable_writing();
                deliver_completed(&self.port, handler, Ok(n))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Write, abortable, &self.port, handler);
                self.install_write(PendingWrite::Single {
                    result: result.clone(),
                    buf,
                });
                if let Some(delay) = timeout {
                    self.schedule_write_timeout(&result, delay);
                }
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_writing();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    /// Gathering write from several buffers, completing with the aggregate
    /// count as `u64`.
    pub fn write_vectored(
        self: &Arc<Self>,
        bufs: Vec<Bytes>,
        timeout: Option<Duration>,
    ) -> IoFuture<u64> {
        self.write_vectored_impl(bufs, timeout, None)
    }

    /// Like [`write_vectored`](Self::write_vectored) with a handler.
    pub fn write_vectored_with<A, F>(
        self: &Arc<Self>,
        bufs: Vec<Bytes>,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> IoFuture<u64>
    where
        A: Send + 'static,
        F: FnOnce(Result<u64>, A) + Send + 'static,
    {
        self.write_vectored_impl(
            bufs,
            timeout,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn write_vectored_impl(
        self: &Arc<Self>,
        bufs: Vec<Bytes>,
        timeout: Option<Duration>,
        handler: Option<Handler<u64>>,
    ) -> IoFuture<u64> {
        if bufs.is_empty() {
            return deliver_completed(
                &self.port,
                handler,
                Err(Error::InvalidInput("gathering write requires buffers")),
            );
        }
        if let Err(error) = self.check_connected() {
            return deliver_completed(&self.port, handler, Err(error));
        }
        if let Err(error) = self.reserve_write() {
            return deliver_completed(&self.port, handler, Err(error));
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_writing();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        let attempt = if self.may_attempt(&handler) {
            sys::try_write_bufs(self.fd, &bufs)
        } else {
            Ok(IoOutcome::WouldBlock)
        };
        match attempt {
            Ok(IoOutcome::Done(n)) => {
                drop(guard);
                self.enable_writing();
                deliver_completed(&self.port, handler, Ok(n))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Write, abortable, &self.port, handler);
                self.install_write(PendingWrite::Gathering {
                    result: result.clone(),
                    bufs,
                });
                if let Some(delay) = timeout {
                    self.schedule_write_timeout(&result, delay);
                }
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_writing();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    fn reserve_write(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.write_busy {
            return Err(Error::AlreadyPending(OpKind::Write));
        }
        pending.write_busy = true;
        Ok(())
    }

    fn enable_writing(&self) {
        self.pending.lock().write_busy = false;
    }

    fn install_write(&self, op: PendingWrite) {
        self.pending.lock().write = Some(op);
        self.update_interest();
    }

    /// Schedules the write timeout and attaches its handle to the result.
    fn schedule_write_timeout<T: Send + 'static>(
        self: &Arc<Self>,
        result: &Arc<PendingResult<T>>,
        delay: Duration,
    ) {
        let token = result.token();
        let channel = Arc::downgrade(self);
        let handle = self.port.schedule(
            delay,
            Box::new(move || {
                if let Some(channel) = channel.upgrade() {
                    channel.write_timed_out(token);
                }
            }),
        );
        result.set_timeout_task(handle);
    }

    fn write_timed_out(&self, token: usize) {
        let op = {
            let mut pending = self.pending.lock();
            match &pending.write {
                Some(op) if op.token() == token => {
                    pending.write_busy = false;
                    pending.write.take()
                }
                _ => None,
            }
        };
        let Some(op) = op else { return };
        self.update_interest();
        op.fail(&self.port, Error::TimedOut);
    }

    fn finish_write(&self, op: PendingWrite) {
        match op {
            PendingWrite::Single { result, buf } => match self.begin() {
                Ok(guard) => match sys::try_write_buf(self.fd, &buf) {
                    Ok(IoOutcome::Done(n)) => {
                        self.enable_writing();
                        self.update_interest();
                        drop(guard);
                        if result.set_result(n) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                    Ok(IoOutcome::WouldBlock) => {
                        self.pending.lock().write = Some(PendingWrite::Single { result, buf });
                        self.update_interest();
                        drop(guard);
                    }
                    Err(error) => {
                        self.enable_writing();
                        self.update_interest();
                        drop(guard);
                        if result.set_failure(error.into()) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                },
                Err(error) => {
                    self.enable_writing();
                    if result.set_failure(error) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
            PendingWrite::Gathering { result, bufs } => match self.begin() {
                Ok(guard) => match sys::try_write_bufs(self.fd, &bufs) {
                    Ok(IoOutcome::Done(n)) => {
                        self.enable_writing();
                        self.update_interest();
                        drop(guard);
                        if result.set_result(n) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                    Ok(IoOutcome::WouldBlock) => {
                        self.pending.lock().write = Some(PendingWrite::Gathering { result, bufs });
                        self.update_interest();
                        drop(guard);
                    }
                    Err(error) => {
                        self.enable_writing();
                        self.update_interest();
                        drop(guard);
                        if result.set_failure(error.into()) {
                            invoker::invoke(&self.port, &result);
                        }
                    }
                },
                Err(error) => {
                    self.enable_writing();
                    if result.set_failure(error) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
        }
    }

    // -- shared --

    /// Whether the synchronous fast path may run. Pull-style callers and
    /// direct-dispatch threads always attempt; so does any thread when the
    /// pool is unbounded. A bounded pool with a handler that would have to
    /// be queued parks the operation instead.
    fn may_attempt<T>(&self, handler: &Option<Handler<T>>) -> bool {
        handler.is_none() || invoker::may_invoke_direct(&self.port) || !self.port.is_fixed_pool()
    }

    fn check_connected(&self) -> Result<()> {
        let state = self.state.lock();
        match state.stage {
            Stage::Connected => Ok(()),
            Stage::Closed => Err(Error::Closed),
            Stage::Unconnected | Stage::Pending => Err(Error::NotConnected),
        }
    }

    /// Derives the readiness interest from the pending slots and re-arms
    /// the one-shot registration with the port.
    fn update_interest(&self) {
        let pending = self.pending.lock();
        let mut interest = Interest::NONE;
        if pending.read.is_some() {
            interest |= Interest::READABLE;
        }
        if pending.write.is_some() || pending.connect.is_some() {
            interest |= Interest::WRITABLE;
        }
        if !interest.is_empty() {
            if let Err(error) = self.port.start_poll(self.fd, interest) {
                tracing::warn!(fd = self.fd, error = %error, "failed to arm readiness interest");
            }
        }
    }

    /// The local address once bound or connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local
    }

    /// The peer address once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state.lock().remote
    }

    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().stage == Stage::Connected
    }

    /// Closes the channel. Every still-pending operation completes with a
    /// `Closed` failure; no caller is left waiting.
    pub fn close(&self) {
        {
            let mut open = self.open.write();
            if !*open {
                return;
            }
            *open = false;
        }
        self.state.lock().stage = Stage::Closed;
        self.port.unregister(self.fd);
        sys::close_fd(self.fd);

        let (connect_result, read_op, write_op) = {
            let mut pending = self.pending.lock();
            pending.read_busy = false;
            pending.write_busy = false;
            (
                pending.connect.take(),
                pending.read.take(),
                pending.write.take(),
            )
        };
        if let Some(result) = connect_result {
            if result.set_failure(Error::Closed) {
                invoker::invoke_indirectly(&self.port, &result);
            }
        }
        if let Some(op) = read_op {
            op.fail(&self.port, Error::Closed);
        }
        if let Some(op) = write_op {
            op.fail(&self.port, Error::Closed);
        }
    }
}

impl PollableChannel for TcpChannel {
    fn on_event(&self, readable: bool, writable: bool) {
        let (read_op, write_op, connect_result) = {
            let mut pending = self.pending.lock();
            let read_op = if readable { pending.read.take() } else { None };
            let (write_op, connect_result) = if writable {
                match pending.write.take() {
                    Some(op) => (Some(op), None),
                    None => (None, pending.connect.take()),
                }
            } else {
                (None, None)
            };
            (read_op, write_op, connect_result)
        };

        if let Some(op) = write_op {
            self.finish_write(op);
        }
        if let Some(op) = read_op {
            self.finish_read(op);
        }
        if let Some(result) = connect_result {
            self.finish_connect(result);
        }
    }

    fn force_close(&self) {
        self.close();
    }
}

impl Abortable for TcpChannel {
    fn abort(&self, kind: OpKind, token: usize) {
        match kind {
            OpKind::Connect => {
                let grabbed = {
                    let mut pending = self.pending.lock();
                    match &pending.connect {
                        Some(result) if result.token() == token => pending.connect.take(),
                        _ => None,
                    }
                };
                if grabbed.is_some() {
                    // A cancelled connect leaves the socket half-open.
                    self.close();
                }
            }
            OpKind::Read => {
                let grabbed = {
                    let mut pending = self.pending.lock();
                    match &pending.read {
                        Some(op) if op.token() == token => {
                            pending.read_busy = false;
                            pending.read.take()
                        }
                        _ => None,
                    }
                };
                if grabbed.is_some() {
                    self.update_interest();
                }
            }
            OpKind::Write => {
                let grabbed = {
                    let mut pending = self.pending.lock();
                    match &pending.write {
                        Some(op) if op.token() == token => {
                            pending.write_busy = false;
                            pending.write.take()
                        }
                        _ => None,
                    }
                };
                if grabbed.is_some() {
                    self.update_interest();
                }
            }
            OpKind::Accept | OpKind::Receive => {}
        }
    }
}
