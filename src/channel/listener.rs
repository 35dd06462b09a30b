//! Asynchronous accepting channel.
//!
//! Accepted sockets are wrapped as connected [`TcpChannel`]s and registered
//! in the same event port as the listener. One accept may be pending at a
//! time; further accept requests while one is in flight fail fast.

use crate::channel::tcp::TcpChannel;
use crate::channel::{Abortable, OpKind, PollableChannel, deliver_completed};
use crate::error::{Error, Result};
use crate::future::{Handler, IoFuture, PendingResult};
use crate::invoker;
use crate::port::EventPort;
use crate::port::poller::Interest;
use crate::sys::{self, IoOutcome};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

const BACKLOG: i32 = 128;

type Accepted = (Arc<TcpChannel>, SocketAddr);

#[derive(Default)]
struct PendingAccept {
    accept: Option<Arc<PendingResult<Accepted>>>,
    busy: bool,
}

/// Listening channel producing connected [`TcpChannel`]s.
pub struct TcpListener {
    fd: RawFd,
    port: Arc<EventPort>,
    local: SocketAddr,
    open: RwLock<bool>,
    pending: Mutex<PendingAccept>,
}

impl TcpListener {
    /// Binds a listener to `addr` and registers it with the port.
    pub fn bind(port: &Arc<EventPort>, addr: SocketAddr) -> Result<Arc<TcpListener>> {
        let fd = sys::tcp_socket(addr.is_ipv6())?;
        let setup = (|| -> Result<SocketAddr> {
            sys::set_reuseaddr(fd)?;
            sys::bind_socket(fd, &addr)?;
            sys::listen_socket(fd, BACKLOG)?;
            Ok(sys::local_addr(fd)?)
        })();
        let local = match setup {
            Ok(local) => local,
            Err(error) => {
                sys::close_fd(fd);
                return Err(error);
            }
        };

        let listener = Arc::new(TcpListener {
            fd,
            port: port.clone(),
            local,
            open: RwLock::new(true),
            pending: Mutex::new(PendingAccept::default()),
        });
        if let Err(error) = port.register(fd, listener.clone()) {
            sys::close_fd(fd);
            *listener.open.write() = false;
            return Err(error);
        }
        Ok(listener)
    }

    fn begin(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read();
        if !*guard {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    /// Accepts the next connection, completing with the connected channel
    /// and its peer address.
    pub fn accept(self: &Arc<Self>) -> IoFuture<Accepted> {
        self.accept_impl(None)
    }

    /// Like [`accept`](Self::accept), delivering the outcome to `handler`.
    pub fn accept_with<A, F>(self: &Arc<Self>, attachment: A, handler: F) -> IoFuture<Accepted>
    where
        A: Send + 'static,
        F: FnOnce(Result<Accepted>, A) + Send + 'static,
    {
        self.accept_impl(Some(Box::new(move |outcome| handler(outcome, attachment))))
    }

    fn accept_impl(self: &Arc<Self>, handler: Option<Handler<Accepted>>) -> IoFuture<Accepted> {
        {
            let mut pending = self.pending.lock();
            if pending.busy {
                return deliver_completed(
                    &self.port,
                    handler,
                    Err(Error::AlreadyPending(OpKind::Accept)),
                );
            }
            pending.busy = true;
        }

        let guard = match self.begin() {
            Ok(guard) => guard,
            Err(error) => {
                self.enable_accepting();
                return deliver_completed(&self.port, handler, Err(error));
            }
        };
        match sys::try_accept(self.fd) {
            Ok(IoOutcome::Done((client, peer))) => {
                drop(guard);
                self.enable_accepting();
                let outcome = self.finish_accepted(client, peer);
                deliver_completed(&self.port, handler, outcome)
            }
            Ok(IoOutcome::WouldBlock) => {
                let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
                let result = PendingResult::new(OpKind::Accept, abortable, &self.port, handler);
                self.pending.lock().accept = Some(result.clone());
                self.update_interest();
                drop(guard);
                IoFuture::Pending(result)
            }
            Err(error) => {
                drop(guard);
                self.enable_accepting();
                deliver_completed(&self.port, handler, Err(error.into()))
            }
        }
    }

    /// Wraps an accepted descriptor as a registered, connected channel.
    fn finish_accepted(&self, client: RawFd, peer: SocketAddr) -> Result<Accepted> {
        let channel = TcpChannel::from_accepted(&self.port, client, peer)?;
        Ok((channel, peer))
    }

    fn enable_accepting(&self) {
        self.pending.lock().busy = false;
    }

    fn update_interest(&self) {
        let pending = self.pending.lock();
        if pending.accept.is_some() {
            if let Err(error) = self.port.start_poll(self.fd, Interest::READABLE) {
                tracing::warn!(fd = self.fd, error = %error, "failed to arm accept interest");
            }
        }
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Closes the listener, failing a pending accept with `Closed`.
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

        let result = {
            let mut pending = self.pending.lock();
            pending.busy = false;
            pending.accept.take()
        };
        if let Some(result) = result {
            if result.set_failure(Error::Closed) {
                invoker::invoke_indirectly(&self.port, &result);
            }
        }
    }
}

impl PollableChannel for TcpListener {
    fn on_event(&self, readable: bool, _writable: bool) {
        if !readable {
            return;
        }
        let Some(result) = self.pending.lock().accept.take() else {
            return;
        };

        match self.begin() {
            Ok(guard) => match sys::try_accept(self.fd) {
                Ok(IoOutcome::Done((client, peer))) => {
                    self.enable_accepting();
                    drop(guard);
                    match self.finish_accepted(client, peer) {
                        Ok(accepted) => {
                            if result.set_result(accepted) {
                                invoker::invoke(&self.port, &result);
                            }
                        }
                        Err(error) => {
                            if result.set_failure(error) {
                                invoker::invoke(&self.port, &result);
                            }
                        }
                    }
                }
                Ok(IoOutcome::WouldBlock) => {
                    // Spurious wakeup: keep waiting for the next connection.
                    // The begin bracket keeps a concurrent close from
                    // missing the re-parked operation.
                    self.pending.lock().accept = Some(result);
                    self.update_interest();
                    drop(guard);
                }
                Err(error) => {
                    self.enable_accepting();
                    drop(guard);
                    if result.set_failure(error.into()) {
                        invoker::invoke(&self.port, &result);
                    }
                }
            },
            Err(error) => {
                self.enable_accepting();
                if result.set_failure(error) {
                    invoker::invoke(&self.port, &result);
                }
            }
        }
    }

    fn force_close(&self) {
        self.close();
    }
}

impl Abortable for TcpListener {
    fn abort(&self, kind: OpKind, token: usize) {
        if kind != OpKind::Accept {
            return;
        }
        let grabbed = {
            let mut pending = self.pending.lock();
            match &pending.accept {
                Some(result) if result.token() == token => {
                    pending.busy = false;
                    pending.accept.take()
                }
                _ => None,
            }
        };
        // The cancelled accept simply stops waiting; the listener stays
        // usable.
        drop(grabbed);
    }
}
