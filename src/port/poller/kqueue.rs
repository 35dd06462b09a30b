//! kqueue-backed readiness poller (macOS and the BSDs).

use crate::port::poller::{Interest, Poller, ReadyEvent};
use crate::sys;

use std::io;
use std::os::fd::RawFd;
use std::ptr;

const EVENT_CAPACITY: usize = 64;

const EMPTY_EVENT: libc::kevent = libc::kevent {
    ident: 0,
    filter: 0,
    flags: 0,
    fflags: 0,
    data: 0,
    udata: ptr::null_mut(),
};

pub(crate) struct KqueuePoller {
    queue: RawFd,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
}

impl KqueuePoller {
    pub(crate) fn new() -> io::Result<Self> {
        let queue = unsafe { libc::kqueue() };
        if queue < 0 {
            return Err(io::Error::last_os_error());
        }

        let (wakeup_read, wakeup_write) = match sys::pipe_pair() {
            Ok(pair) => pair,
            Err(err) => {
                sys::close_fd(queue);
                return Err(err);
            }
        };

        // The wakeup pipe stays registered for the poller's lifetime.
        let event = libc::kevent {
            ident: wakeup_read as usize,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD | libc::EV_ENABLE,
            ..EMPTY_EVENT
        };
        let result = unsafe { libc::kevent(queue, &event, 1, ptr::null_mut(), 0, ptr::null()) };
        if result < 0 {
            let err = io::Error::last_os_error();
            sys::close_fd(queue);
            sys::close_fd(wakeup_read);
            sys::close_fd(wakeup_write);
            return Err(err);
        }

        Ok(Self {
            queue,
            wakeup_read,
            wakeup_write,
        })
    }

    fn delete_filter(&self, fd: RawFd, filter: i16) {
        let event = libc::kevent {
            ident: fd as usize,
            filter,
            flags: libc::EV_DELETE,
            ..EMPTY_EVENT
        };
        unsafe {
            libc::kevent(self.queue, &event, 1, ptr::null_mut(), 0, ptr::null());
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe { libc::read(self.wakeup_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Poller for KqueuePoller {
    fn arm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        // One-shot filters delete themselves when they fire; a filter armed
        // earlier but never fired must be cleared before re-arming.
        self.delete_filter(fd, libc::EVFILT_READ);
        self.delete_filter(fd, libc::EVFILT_WRITE);

        let mut changes = [EMPTY_EVENT; 2];
        let mut count = 0;
        if interest.is_readable() {
            changes[count] = libc::kevent {
                ident: fd as usize,
                filter: libc::EVFILT_READ,
                flags: libc::EV_ADD | libc::EV_ONESHOT,
                ..EMPTY_EVENT
            };
            count += 1;
        }
        if interest.is_writable() {
            changes[count] = libc::kevent {
                ident: fd as usize,
                filter: libc::EVFILT_WRITE,
                flags: libc::EV_ADD | libc::EV_ONESHOT,
                ..EMPTY_EVENT
            };
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }

        let result = unsafe {
            libc::kevent(
                self.queue,
                changes.as_ptr(),
                count as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn disarm(&self, fd: RawFd) {
        self.delete_filter(fd, libc::EVFILT_READ);
        self.delete_filter(fd, libc::EVFILT_WRITE);
    }

    fn wait(&self, events: &mut Vec<ReadyEvent>) -> io::Result<()> {
        let mut buf = [EMPTY_EVENT; EVENT_CAPACITY];
        let n = loop {
            let n = unsafe {
                libc::kevent(
                    self.queue,
                    ptr::null(),
                    0,
                    buf.as_mut_ptr(),
                    EVENT_CAPACITY as libc::c_int,
                    ptr::null(),
                )
            };
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        };

        for event in buf.iter().take(n as usize) {
            let fd = event.ident as RawFd;
            if fd == self.wakeup_read && event.filter == libc::EVFILT_READ {
                self.drain_wakeup();
                continue;
            }
            // EV_ERROR and EV_EOF give both directions a chance to observe
            // the failure.
            let failed = event.flags & (libc::EV_ERROR | libc::EV_EOF) != 0;
            events.push(ReadyEvent {
                fd,
                readable: failed || event.filter == libc::EVFILT_READ,
                writable: failed || event.filter == libc::EVFILT_WRITE,
            });
        }
        Ok(())
    }

    fn wakeup(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.wakeup_write, byte.as_ptr().cast(), 1);
        }
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        sys::close_fd(self.queue);
        sys::close_fd(self.wakeup_read);
        sys::close_fd(self.wakeup_write);
    }
}
