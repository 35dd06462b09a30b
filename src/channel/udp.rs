//! Asynchronous UDP datagram channel.
//!
//! Receives park a pending operation and wait for readiness like stream
//! reads do. Sends are assumed not to block and complete synchronously; a
//! datagram that cannot be queued reports a count of zero.

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

/// Completion value of a receive: byte count, sender address, buffer.
type Received = (usize, SocketAddr, BytesMut);

struct PendingReceive {
    result: Arc<PendingResult<Received>>,
    buf: BytesMut,
}

#[derive(Default)]
struct PendingOps {
    receive: Option<PendingReceive>,
    busy: bool,
}

/// Datagram channel registered with an [`EventPort`].
pub struct UdpChannel {
    fd: RawFd,
    port: Arc<EventPort>,
    local: SocketAddr,
    open: RwLock<bool>,
    pending: Mutex<PendingOps>,
}

impl UdpChannel {
    /// Binds a datagram channel to `addr` and registers it with the port.
    pub fn bind(port: &Arc<EventPort>, addr: SocketAddr) -> Result<Arc<UdpChannel>> {
        let fd = sys::udp_socket(addr.is_ipv6())?;
        let setup = (|| -> Result<SocketAddr> {
            sys::bind_socket(fd, &addr)?;
            Ok(sys::local_addr(fd)?)
        })();
        let local = match setup {
            Ok(local) => local,
            Err(error) => {
                sys::close_fd(fd);
                return Err(error);
            }
        };

        let channel = Arc::new(UdpChannel {
            fd,
            port: port.clone(),
            local,
            open: RwLock::new(true),
            pending: Mutex::new(PendingOps::default()),
        });
        if let Err(error) = port.register(fd, channel.clone()) {
            sys::close_fd(fd);
            *channel.open.write() = false;
            return Err(error);
        }
        Ok(channel)
    }

    fn begin(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read();
        if !*guard {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    // -- receive --

    /// Receives one datagram into the buffer's spare capacity, completing
    /// with the byte count, the sender's address, and the buffer.
    pub fn receive(
        self: &Arc<Self>,
        buf: BytesMut,
        timeout: Option<Duration>,
    ) -> IoFuture<Received> {
        self.receive_impl(buf, timeout, None)
    }

    /// Like [`receive`](Self::receive), delivering the outcome to `handler`.
    pub fn receive_with<A, F>(
        self: &Arc<Self>,
        buf: BytesMut,
        timeout: Option<Duration>,
        attachment: A,
        handler: F,
    ) -> IoFuture<Received>
    where
        A: Send + 'static,
        F: FnOnce(Result<Received>, A) + Send + 'static,
    {
        self.receive_impl(
            buf,
            timeout,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn receive_impl(
        self: &Arc<Self>,
        mut buf: BytesMut,
        timeout: Option<Duration>,
        handler: Option<Handler<Received>>,
    ) -> IoFuture<Received> {
        {
            let mut pending = self.pending.lock();
            if pending.busy {
                return deliver_completed(
                    &self.port,
                    handler,
                    Err(Error::AlreadyPending(OpKind::Receive)),
                );
            }
            pending.busy = true;
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_receiving();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        match sys::try_recv_from(self.fd, &mut buf) {
            Ok(IoOutcome::Done((n, peer))) => {
                drop(guard);
                self.enable_receiving();
                deliver_completed(&self.port, handler, Ok((n, peer, buf)))
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Receive, abortable, &self.port, handler);
                self.install_receive(
                    PendingReceive {
                        result: result.clone(),
                        buf,
                    },
                    timeout,
                );
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_receiving();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    fn enable_receiving(&self) {
        self.pending.lock().busy = false;
    }

    fn install_receive(self: &Arc<Self>, op: PendingReceive, timeout: Option<Duration>) {
        let token = op.result.token();
        let result = op.result.clone();
        self.pending.lock().receive = Some(op);
        self.update_interest();
        if let Some(delay) = timeout {
            let channel = Arc::downgrade(self);
            let handle = self.port.schedule(
                delay,
                Box::new(move || {
                    if let Some(channel) = channel.upgrade() {
                        channel.receive_timed_out(token);
                    }
                }),
            );
            result.set_timeout_task(handle);
        }
    }

    fn receive_timed_out(&self, token: usize) {
        let op = {
            let mut pending = self.pending.lock();
            match &pending.receive {
                Some(op) if op.result.token() == token => {
                    pending.busy = false;
                    pending.receive.take()
                }
                _ => None,
            }
        };
        let Some(op) = op else { return };
        self.update_interest();
        if op.result.set_failure(Error::TimedOut) {
            invoker::invoke_indirectly(&self.port, &op.result);
        }
    }

    fn finish_receive(&self, op: PendingReceive) {
        let PendingReceive { result, mut buf } = op;
        match self.begin() {
            Ok(guard) => match sys::try_recv_from(self.fd, &mut buf) {
                Ok(IoOutcome::Done((n, peer))) => {
                    self.enable_receiving();
                    self.update_interest();
                    drop(guard);
                    if result.set_result((n, peer, buf)) {
                        invoker::invoke(&self.port, &result);
                    }
                }
                Ok(IoOutcome::WouldBlock) => {
                    // Spurious wakeup: park the operation again. The begin
                    // bracket keeps a concurrent close from missing the
                    // re-parked operation.
                    self.pending.lock().receive = Some(PendingReceive { result, buf });
                    self.update_interest();
                    drop(guard);
                }
                Err(error) => {
                    self.enable_receiving();
                    self.update_interest();
                    drop(guard);
                    if result.set_failure(error.into()) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
            Err(error) => {
                self.enable_receiving();
                if result.set_failure(error) {
                    invoker::invoke(&self.port, &result);
                }
            }
        }
    }

    // -- send --

    /// Sends one datagram to `target`, completing synchronously with the
    /// byte count. Datagram sends are assumed not to block; one that would
    /// completes with a count of zero.
    pub fn send(self: &Arc<Self>, datagram: Bytes, target: SocketAddr) -> IoFuture<usize> {
        self.send_impl(datagram, target, None)
    }

    /// Like [`send`](Self::send), delivering the outcome to `handler`.
    pub fn send_with<A, F>(
        self: &Arc<Self>,
        datagram: Bytes,
        target: SocketAddr,
        attachment: A,
        handler: F,
    ) -> IoFuture<usize>
    where
        A: Send + 'static,
        F: FnOnce(Result<usize>, A) + Send + 'static,
    {
        self.send_impl(
            datagram,
            target,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn send_impl(
        self: &Arc<Self>,
        datagram: Bytes,
        target: SocketAddr,
        handler: Option<Handler<usize>>,
    ) -> IoFuture<usize> {
        let outcome = match self.begin() {
            Ok(_guard) => match sys::send_to(self.fd, &datagram, &target) {
                Ok(IoOutcome::Done(n)) => Ok(n),
                Ok(IoOutcome::WouldBlock) => Ok(0),
                Err(error) => Err(error.into()),
            },
            Err(error) => Err(error),
        };
        deliver_completed(&self.port, handler, outcome)
    }

    /// The address the channel is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    fn update_interest(&self) {
        let pending = self.pending.lock();
        if pending.receive.is_some() {
            if let Err(error) = self.port.start_poll(self.fd, Interest::READABLE) {
                tracing::warn!(fd = self.fd, error = %error, "failed to arm receive interest");
            }
        }
    }

    /// Closes the channel, failing a pending receive with `Closed`.
    pub fn close(&self) {
        {
            let mut open = self.open.write();
            if !*open {
                return;
            }
            *open = false;
        }
        self.port.unregister(self.fd);
        sys::close_fd(self.fd);

        let op = {
            let mut pending = self.pending.lock();
            pending.busy = false;
            pending.receive.take()
        };
        if let Some(op) = op {
            if op.result.set_failure(Error::Closed) {
                invoker::invoke_indirectly(&self.port, &op.result);
            }
        }
    }
}

impl PollableChannel for UdpChannel {
    fn on_event(&self, readable: bool, _writable: bool) {
        if !readable {
            return;
        }
        let Some(op) = self.pending.lock().receive.take() else {
            return;
        };
        self.finish_receive(op);
    }

    fn force_close(&self) {
        self.close();
    }
}

impl Abortable for UdpChannel {
    fn abort(&self, kind: OpKind, token: usize) {
        if kind != OpKind::Receive {
            return;
        }
        let grabbed = {
            let mut pending = self.pending.lock();
            match &pending.receive {
                Some(op) if op.result.token() == token => {
                    pending.busy = false;
                    pending.receive.take()
                }
                _ => None,
            }
        };
        if grabbed.is_some() {
            self.update_interest();
        }
    }
}
