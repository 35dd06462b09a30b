//! Readiness notification primitive.
//!
//! The event port depends only on this contract: register a one-shot
//! interest for a descriptor, then be told which descriptors are ready. The
//! platform implementation is selected at build time — epoll on Linux,
//! kqueue on macOS and the BSDs. Both fold error and hangup conditions into
//! "readable and writable" so every pending direction observes the failure,
//! and both use a self-pipe to interrupt a blocked wait.

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

#[cfg(target_os = "linux")]
mod epoll;

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

/// Per-channel readiness interest mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Interest(u8);

impl Interest {
    pub(crate) const NONE: Interest = Interest(0);
    pub(crate) const READABLE: Interest = Interest(0b01);
    pub(crate) const WRITABLE: Interest = Interest(0b10);

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub(crate) fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One ready descriptor reported by a wait.
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Platform readiness mechanism driven by the poll loop.
pub(crate) trait Poller: Send + Sync {
    /// Registers one-shot interest for a descriptor. The registration is
    /// consumed by the next readiness report and must be re-armed.
    fn arm(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Drops any registration for a descriptor.
    fn disarm(&self, fd: RawFd);

    /// Blocks until at least one descriptor is ready or the poller is woken,
    /// appending the ready set to `events`.
    fn wait(&self, events: &mut Vec<ReadyEvent>) -> io::Result<()>;

    /// Interrupts a blocked [`wait`](Self::wait).
    fn wakeup(&self);
}

/// Creates the readiness poller for the build platform.
pub(crate) fn platform_poller() -> io::Result<Box<dyn Poller>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollPoller::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Ok(Box::new(kqueue::KqueuePoller::new()?))
    }
}
