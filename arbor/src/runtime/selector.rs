use bitflags::bitflags;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::task::Waker;
use std::time::Duration;

bitflags! {
    /// Readiness a task can wait for on a file descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
        const PRIORITY = 1 << 2;
    }
}

impl Interest {
    pub(crate) fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Interest::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            events |= libc::POLLOUT;
        }
        if self.contains(Interest::PRIORITY) {
            events |= libc::POLLPRI;
        }
        events
    }

    /// Hang-ups and errors are reported as whatever the caller asked for, the
    /// next read or write surfaces the actual condition.
    pub(crate) fn from_poll_events(revents: libc::c_short, requested: Interest) -> Interest {
        if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
            return requested;
        }

        let mut ready = Interest::empty();
        if revents & libc::POLLIN != 0 {
            ready |= Interest::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            ready |= Interest::WRITABLE;
        }
        if revents & libc::POLLPRI != 0 {
            ready |= Interest::PRIORITY;
        }
        ready & requested
    }
}

/// The I/O multiplexing capability polled by the scheduler on every iteration.
///
/// Only [`Selector::wakeup`] is called from other threads, everything else
/// runs on the scheduler's thread.
pub trait Selector: Send + Sync {
    /// Registers a one-shot interest. `waker` is woken once `fd` is ready, the
    /// readiness is then reported by [`Selector::ready`].
    fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> io::Result<()>;

    fn deregister(&self, fd: RawFd);

    /// Takes the readiness observed for `fd` by the last `select`.
    fn ready(&self, fd: RawFd) -> Option<Interest>;

    /// Waits up to `timeout` for readiness or a wakeup. `None` waits
    /// indefinitely. Returns the number of ready registrations.
    fn select(&self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Interrupts a concurrent or the next `select`.
    fn wakeup(&self) -> io::Result<()>;

    /// How long the last `select` was blocked.
    fn idle_duration(&self) -> Duration;

    fn close(&self);

    fn process_wait(&self, pid: i32) -> io::Result<WaitStatus> {
        waitpid(Pid::from_raw(pid), None).map_err(io::Error::from)
    }

    fn address_resolve(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        Ok(host.to_socket_addrs()?.collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::readable(libc::POLLIN, Interest::READABLE, Interest::READABLE)]
    #[case::not_requested(libc::POLLIN, Interest::WRITABLE, Interest::empty())]
    #[case::both(libc::POLLIN | libc::POLLOUT, Interest::all(), Interest::READABLE | Interest::WRITABLE)]
    #[case::hangup(libc::POLLHUP, Interest::WRITABLE, Interest::WRITABLE)]
    fn test_from_poll_events(
        #[case] revents: libc::c_short,
        #[case] requested: Interest,
        #[case] expected: Interest,
    ) {
        assert_eq!(Interest::from_poll_events(revents, requested), expected);
    }

    #[test]
    fn test_to_poll_events() {
        assert_eq!(
            (Interest::READABLE | Interest::PRIORITY).to_poll_events(),
            libc::POLLIN | libc::POLLPRI
        );
    }
}
