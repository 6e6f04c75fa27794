use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::Error;
use crate::runtime::selector::{Interest, Selector};
use crate::runtime::timers::Expiry;
use crate::runtime::waker::{Blocker, Shared};
use crate::task::Task;

/// Future returned by [`crate::Scheduler::block`].
///
/// Counts as a blocked operation from its first poll until it is dropped. A
/// scheduler closed with blocked operations reports them.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Block<'a> {
    task: &'a Task,
    blocker: Blocker,
    timeout: Option<Duration>,
    expiry: Option<Expiry>,
    shared: Arc<Shared>,
    armed: bool,
}

impl<'a> Block<'a> {
    pub(crate) fn new(
        task: &'a Task,
        blocker: Blocker,
        timeout: Option<Duration>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            task,
            blocker,
            timeout,
            expiry: None,
            shared,
            armed: false,
        }
    }

    /// The handle that releases this block. Hand it to another thread before
    /// awaiting.
    pub fn blocker(&self) -> Blocker {
        self.blocker.clone()
    }
}

impl Future for Block<'_> {
    type Output = Result<bool, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.blocker.is_unblocked() {
            return Poll::Ready(Ok(true));
        }
        if let Err(err) = this.task.check_signal() {
            return Poll::Ready(Err(err));
        }
        if this.expiry.as_ref().is_some_and(Expiry::fired) {
            return Poll::Ready(Ok(false));
        }

        if !this.armed {
            this.armed = true;
            this.shared.blocked.fetch_add(1, Ordering::AcqRel);
            this.expiry = this
                .timeout
                .and_then(|timeout| Expiry::new(this.task, timeout, None));
        }

        Poll::Pending
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.blocked.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Future returned by [`crate::Scheduler::io_wait`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct IoWait<'a> {
    task: &'a Task,
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
    expiry: Option<Expiry>,
    selector: Option<Arc<dyn Selector>>,
    registered: bool,
}

impl<'a> IoWait<'a> {
    pub(crate) fn new(
        task: &'a Task,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
        selector: Option<Arc<dyn Selector>>,
    ) -> Self {
        Self {
            task,
            fd,
            interest,
            timeout,
            expiry: None,
            selector,
            registered: false,
        }
    }

    fn deregister(&mut self) {
        if std::mem::take(&mut self.registered)
            && let Some(selector) = &self.selector
        {
            selector.deregister(self.fd);
        }
    }
}

impl Future for IoWait<'_> {
    type Output = Result<Option<Interest>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(selector) = this.selector.clone() else {
            return Poll::Ready(Err(Error::Closed));
        };

        if this.registered
            && let Some(ready) = selector.ready(this.fd)
        {
            this.registered = false;
            return Poll::Ready(Ok(Some(ready)));
        }
        if let Err(err) = this.task.check_signal() {
            this.deregister();
            return Poll::Ready(Err(err));
        }
        if this.expiry.as_ref().is_some_and(Expiry::fired) {
            this.deregister();
            return Poll::Ready(Ok(None));
        }

        if !this.registered {
            if let Err(err) = selector.register(this.fd, this.interest, cx.waker().clone()) {
                return Poll::Ready(Err(Error::selector(err)));
            }
            this.registered = true;
            if this.expiry.is_none() {
                this.expiry = this
                    .timeout
                    .and_then(|timeout| Expiry::new(this.task, timeout, None));
            }
        }

        Poll::Pending
    }
}

impl Drop for IoWait<'_> {
    fn drop(&mut self) {
        self.deregister();
    }
}
