use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::fd::RawFd;
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::runtime::selector::{Interest, Selector};

/// A selector without descriptor support: `select` parks the thread until a
/// wakeup or the timeout. Suits schedulers that only deal with timers and
/// synchronization primitives.
#[derive(Default)]
pub struct ParkSelector {
    pending: Mutex<bool>,
    condvar: Condvar,
    idle: Mutex<Duration>,
}

impl ParkSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for ParkSelector {
    fn register(&self, _fd: RawFd, _interest: Interest, _waker: Waker) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ParkSelector cannot wait on file descriptors",
        ))
    }

    fn deregister(&self, _fd: RawFd) {}

    fn ready(&self, _fd: RawFd) -> Option<Interest> {
        None
    }

    fn select(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let start = Instant::now();
        let mut pending = self.pending.lock();

        if !*pending {
            match timeout {
                Some(timeout) => {
                    let deadline = start + timeout;
                    while !*pending && !self.condvar.wait_until(&mut pending, deadline).timed_out() {}
                }
                None => {
                    while !*pending {
                        self.condvar.wait(&mut pending);
                    }
                }
            }
        }
        *pending = false;
        drop(pending);

        *self.idle.lock() = start.elapsed();
        Ok(0)
    }

    fn wakeup(&self) -> io::Result<()> {
        *self.pending.lock() = true;
        self.condvar.notify_one();
        Ok(())
    }

    fn idle_duration(&self) -> Duration {
        *self.idle.lock()
    }

    fn close(&self) {}
}
