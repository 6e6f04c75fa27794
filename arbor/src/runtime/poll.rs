use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::runtime::selector::{Interest, Selector};

/// Default selector: `poll(2)` over the registered descriptors plus an
/// `eventfd` used for wakeups.
///
/// Registrations are one-shot, a descriptor is dropped from the poll set as
/// soon as it is reported ready.
pub struct PollSelector {
    wakeup: OwnedFd,
    state: Mutex<State>,
    idle: Mutex<Duration>,
}

#[derive(Default)]
struct State {
    registrations: HashMap<RawFd, (Interest, Waker)>,
    ready: HashMap<RawFd, Interest>,
    closed: bool,
}

impl PollSelector {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // Safety: freshly created, nobody else owns it.
            wakeup: unsafe { OwnedFd::from_raw_fd(fd) },
            state: Mutex::new(State::default()),
            idle: Mutex::new(Duration::ZERO),
        })
    }

    fn drain_wakeup(&self) {
        let mut buf = 0u64;
        // EAGAIN just means another select already drained it.
        unsafe {
            libc::read(
                self.wakeup.as_raw_fd(),
                (&mut buf as *mut u64).cast(),
                size_of::<u64>(),
            );
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        // Round up, a 100us timer must not turn into a busy loop.
        Some(d) => d
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

impl Selector for PollSelector {
    fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "selector is closed"));
        }
        state.ready.remove(&fd);
        state.registrations.insert(fd, (interest, waker));
        Ok(())
    }

    fn deregister(&self, fd: RawFd) {
        let mut state = self.state.lock();
        state.registrations.remove(&fd);
        state.ready.remove(&fd);
    }

    fn ready(&self, fd: RawFd) -> Option<Interest> {
        self.state.lock().ready.remove(&fd)
    }

    fn select(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut fds = vec![libc::pollfd {
            fd: self.wakeup.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let state = self.state.lock();
            fds.extend(state.registrations.iter().map(|(fd, (interest, _))| libc::pollfd {
                fd: *fd,
                events: interest.to_poll_events(),
                revents: 0,
            }));
        }

        let start = Instant::now();
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
        *self.idle.lock() = start.elapsed();

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if fds[0].revents != 0 {
            self.drain_wakeup();
        }

        let mut wakers = Vec::new();
        {
            let mut state = self.state.lock();
            for pollfd in fds.iter().skip(1).filter(|p| p.revents != 0) {
                // Deregistered while we were blocked.
                let Some((interest, waker)) = state.registrations.remove(&pollfd.fd) else {
                    continue;
                };
                let ready = Interest::from_poll_events(pollfd.revents, interest);
                state.ready.insert(pollfd.fd, ready);
                wakers.push(waker);
            }
        }

        let count = wakers.len();
        for waker in wakers {
            waker.wake();
        }
        Ok(count)
    }

    fn wakeup(&self) -> io::Result<()> {
        let one = 1u64;
        let ret = unsafe {
            libc::write(
                self.wakeup.as_raw_fd(),
                (&one as *const u64).cast(),
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated, a wakeup is pending anyway.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn idle_duration(&self) -> Duration {
        *self.idle.lock()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.registrations.clear();
        state.ready.clear();
    }
}
