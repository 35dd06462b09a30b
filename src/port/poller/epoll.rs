//! epoll-backed readiness poller (Linux).

use crate::port::poller::{Interest, Poller, ReadyEvent};
use crate::sys;

use std::io;
use std::os::fd::RawFd;

const EVENT_CAPACITY: usize = 64;

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let (wakeup_read, wakeup_write) = match sys::pipe_pair() {
            Ok(pair) => pair,
            Err(err) => {
                sys::close_fd(epoll_fd);
                return Err(err);
            }
        };

        // The wakeup pipe stays registered for the poller's lifetime.
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wakeup_read as u64,
        };
        let result = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wakeup_read, &mut event)
        };
        if result < 0 {
            let err = io::Error::last_os_error();
            sys::close_fd(epoll_fd);
            sys::close_fd(wakeup_read);
            sys::close_fd(wakeup_write);
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wakeup_read,
            wakeup_write,
        })
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

impl Poller for EpollPoller {
    fn arm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut events = libc::EPOLLONESHOT as u32;
        if interest.is_readable() {
            events |= libc::EPOLLIN as u32;
        }
        if interest.is_writable() {
            events |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) };
        if result == 0 {
            return Ok(());
        }
        if io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
            let result =
                unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
            if result == 0 {
                return Ok(());
            }
        }
        Err(io::Error::last_os_error())
    }

    fn disarm(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn wait(&self, events: &mut Vec<ReadyEvent>) -> io::Result<()> {
        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY];
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, buf.as_mut_ptr(), EVENT_CAPACITY as i32, -1)
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
            let fd = event.u64 as RawFd;
            if fd == self.wakeup_read {
                self.drain_wakeup();
                continue;
            }
            let flags = event.events;
            let failed = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            events.push(ReadyEvent {
                fd,
                readable: failed || flags & libc::EPOLLIN as u32 != 0,
                writable: failed || flags & libc::EPOLLOUT as u32 != 0,
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

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys::close_fd(self.epoll_fd);
        sys::close_fd(self.wakeup_read);
        sys::close_fd(self.wakeup_write);
    }
}
