//! Asynchronous file channel.
//!
//! Files have no readiness notion, so positional reads and writes run as
//! tasks on the event port's pool and complete their pending result when
//! the transfer finishes. The close/operate bracket is the same read-write
//! lock the socket channels use: closing waits out running transfers, and
//! queued transfers that start after the close fail with `Closed`.

use crate::channel::{Abortable, OpKind, deliver_completed};
use crate::error::{Error, Result};
use crate::future::{Handler, IoFuture, PendingResult};
use crate::invoker;
use crate::port::EventPort;
use crate::sys;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct PendingOps {
    read_busy: bool,
    write_busy: bool,
}

/// File channel whose transfers execute on pool threads.
pub struct FileChannel {
    fd: RawFd,
    port: Arc<EventPort>,
    reading: bool,
    writing: bool,
    open: RwLock<bool>,
    pending: Mutex<PendingOps>,
}

impl FileChannel {
    /// Opens `path` for reading.
    pub fn open(port: &Arc<EventPort>, path: &str) -> Result<Arc<FileChannel>> {
        Self::open_with_flags(port, path, libc::O_RDONLY, true, false)
    }

    /// Creates or truncates `path` for writing.
    pub fn create(port: &Arc<EventPort>, path: &str) -> Result<Arc<FileChannel>> {
        Self::open_with_flags(
            port,
            path,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            false,
            true,
        )
    }

    /// Opens `path` for both reading and writing, creating it if missing.
    pub fn open_rw(port: &Arc<EventPort>, path: &str) -> Result<Arc<FileChannel>> {
        Self::open_with_flags(port, path, libc::O_CREAT | libc::O_RDWR, true, true)
    }

    fn open_with_flags(
        port: &Arc<EventPort>,
        path: &str,
        flags: i32,
        reading: bool,
        writing: bool,
    ) -> Result<Arc<FileChannel>> {
        let fd = open_fd(path, flags)?;
        Ok(Arc::new(FileChannel {
            fd,
            port: port.clone(),
            reading,
            writing,
            open: RwLock::new(true),
            pending: Mutex::new(PendingOps::default()),
        }))
    }

    fn begin(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read();
        if !*guard {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    /// Reads into the buffer's spare capacity at `position`, completing
    /// with the byte count and the buffer.
    pub fn read_at(
        self: &Arc<Self>,
        buf: BytesMut,
        position: u64,
    ) -> IoFuture<(usize, BytesMut)> {
        self.read_at_impl(buf, position, None)
    }

    /// Like [`read_at`](Self::read_at), delivering the outcome to `handler`.
    pub fn read_at_with<A, F>(
        self: &Arc<Self>,
        buf: BytesMut,
        position: u64,
        attachment: A,
        handler: F,
    ) -> IoFuture<(usize, BytesMut)>
    where
        A: Send + 'static,
        F: FnOnce(Result<(usize, BytesMut)>, A) + Send + 'static,
    {
        self.read_at_impl(
            buf,
            position,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn read_at_impl(
        self: &Arc<Self>,
        buf: BytesMut,
        position: u64,
        handler: Option<Handler<(usize, BytesMut)>>,
    ) -> IoFuture<(usize, BytesMut)> {
        if !self.reading {
            return deliver_completed(
                &self.port,
                handler,
                Err(Error::InvalidInput("channel is not open for reading")),
            );
        }
        if !self.is_open() {
            return deliver_completed(&self.port, handler, Err(Error::Closed));
        }
        {
            let mut pending = self.pending.lock();
            if pending.read_busy {
                return deliver_completed(
                    &self.port,
                    handler,
                    Err(Error::AlreadyPending(OpKind::Read)),
                );
            }
            pending.read_busy = true;
        }

        let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
        let result = PendingResult::new(OpKind::Read, abortable, &self.port, handler);
        let channel = self.clone();
        let future = result.clone();
        let task = Box::new(move || {
            let mut buf = buf;
            let outcome = match channel.begin() {
                Ok(_guard) => sys::pread_buf(channel.fd, &mut buf, position).map_err(Error::from),
                Err(error) => Err(error),
            };
            channel.pending.lock().read_busy = false;
            let settled = match outcome {
                Ok(n) => future.set_result((n, buf)),
                Err(error) => future.set_failure(error),
            };
            if settled {
                invoker::invoke(&channel.port, &future);
            }
        });
        self.submit(task, &result);
        IoFuture::Pending(result)
    }

    /// Writes the buffer at `position`, completing with the byte count
    /// accepted by one transfer.
    pub fn write_at(self: &Arc<Self>, buf: Bytes, position: u64) -> IoFuture<usize> {
        self.write_at_impl(buf, position, None)
    }

    /// Like [`write_at`](Self::write_at), delivering the outcome to
    /// `handler`.
    pub fn write_at_with<A, F>(
        self: &Arc<Self>,
        buf: Bytes,
        position: u64,
        attachment: A,
        handler: F,
    ) -> IoFuture<usize>
    where
        A: Send + 'static,
        F: FnOnce(Result<usize>, A) + Send + 'static,
    {
        self.write_at_impl(
            buf,
            position,
            Some(Box::new(move |outcome| handler(outcome, attachment))),
        )
    }

    fn write_at_impl(
        self: &Arc<Self>,
        buf: Bytes,
        position: u64,
        handler: Option<Handler<usize>>,
    ) -> IoFuture<usize> {
        if !self.writing {
            return deliver_completed(
                &self.port,
                handler,
                Err(Error::InvalidInput("channel is not open for writing")),
            );
        }
        if !self.is_open() {
            return deliver_completed(&self.port, handler, Err(Error::Closed));
        }
        {
            let mut pending = self.pending.lock();
            if pending.write_busy {
                return deliver_completed(
                    &self.port,
                    handler,
                    Err(Error::AlreadyPending(OpKind::Write)),
                );
            }
            pending.write_busy = true;
        }

        let this: Arc<dyn Abortable> = self.clone();
        let abortable: Weak<dyn Abortable> = Arc::downgrade(&this);
        let result = PendingResult::new(OpKind::Write, abortable, &self.port, handler);
        let channel = self.clone();
        let future = result.clone();
        let task = Box::new(move || {
            let outcome = match channel.begin() {
                Ok(_guard) => sys::pwrite_buf(channel.fd, &buf, position).map_err(Error::from),
                Err(error) => Err(error),
            };
            channel.pending.lock().write_busy = false;
            let settled = match outcome {
                Ok(n) => future.set_result(n),
                Err(error) => future.set_failure(error),
            };
            if settled {
                invoker::invoke(&channel.port, &future);
            }
        });
        self.submit(task, &result);
        IoFuture::Pending(result)
    }

    /// Submits a transfer task, failing the result with `Shutdown` when the
    /// pool no longer accepts work.
    fn submit<T: Send + 'static>(&self, task: crate::pool::Task, result: &Arc<PendingResult<T>>) {
        if self.port.execute(task).is_err() {
            {
                let mut pending = self.pending.lock();
                match result.kind() {
                    OpKind::Read => pending.read_busy = false,
                    OpKind::Write => pending.write_busy = false,
                    _ => {}
                }
            }
            if result.set_failure(Error::Shutdown) {
                invoker::invoke_indirectly(&self.port, result);
            }
        }
    }

    /// Current file size.
    pub fn size(&self) -> Result<u64> {
        let _guard = self.begin()?;
        Ok(sys::file_size(self.fd)?)
    }

    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Closes the channel. Running transfers finish first; queued transfers
    /// that have not started fail with `Closed` when they run.
    pub fn close(&self) {
        {
            let mut open = self.open.write();
            if !*open {
                return;
            }
            *open = false;
        }
        sys::close_fd(self.fd);
    }
}

impl Abortable for FileChannel {
    fn abort(&self, _kind: OpKind, _token: usize) {
        // An in-flight pooled transfer is not interruptible; cancellation
        // only settles the future.
    }
}

fn open_fd(path: &str, flags: i32) -> Result<RawFd> {
    let c_path = CString::new(path).map_err(|_| Error::InvalidInput("path contains null byte"))?;

    let fd = unsafe {
        if flags & libc::O_CREAT != 0 {
            libc::open(c_path.as_ptr(), flags, 0o644)
        } else {
            libc::open(c_path.as_ptr(), flags)
        }
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}
