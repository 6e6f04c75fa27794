use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::Error;
use crate::sync::condition::WaitQueue;
use crate::task::{JoinHandle, Task};

struct Inner {
    count: Cell<usize>,
    limit: Cell<usize>,
    waiting: WaitQueue<()>,
}

impl Inner {
    /// Hands free slots to waiters one at a time, so each acquires before the
    /// next one is considered.
    fn wake_waiters(&self) {
        while self.count.get() < self.limit.get() {
            if self.waiting.signal_front(1, ()) == 0 {
                break;
            }
        }
    }

    fn release(&self) {
        self.count.set(self.count.get().saturating_sub(1));
        self.wake_waiters();
    }
}

/// Bounds how many tasks hold a slot at once. Waiters are granted slots in
/// the order they asked for them.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<Inner>,
}

impl Semaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Rc::new(Inner {
                count: Cell::new(0),
                limit: Cell::new(limit),
                waiting: WaitQueue::transfer(),
            }),
        }
    }

    /// Suspends `task` until a slot is free and takes it. The slot is released
    /// when the guard drops.
    pub async fn acquire(&self, task: &Task) -> Result<SemaphoreGuard, Error> {
        while self.is_blocking() {
            self.inner.waiting.wait(task).await?;
        }

        self.inner.count.set(self.inner.count.get() + 1);
        Ok(SemaphoreGuard {
            inner: Rc::clone(&self.inner),
        })
    }

    /// Acquires a slot for `task`, then spawns a child under it that holds the
    /// slot until it finishes.
    pub async fn spawn<F, Fut, T>(&self, task: &Task, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let guard = self.acquire(task).await?;

        Ok(task.spawn(move |child| async move {
            let _guard = guard;
            f(child).await
        }))
    }

    /// Changes the limit. Raising it wakes as many waiters as there are new
    /// free slots. Current holders are never revoked.
    pub fn set_limit(&self, limit: usize) {
        self.inner.limit.set(limit);
        self.inner.wake_waiters();
    }

    pub fn limit(&self) -> usize {
        self.inner.limit.get()
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    /// True while an `acquire` would suspend.
    pub fn is_blocking(&self) -> bool {
        self.inner.count.get() >= self.inner.limit.get()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.count.get() == 0
    }

    pub fn waiting(&self) -> usize {
        self.inner.waiting.len()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("limit", &self.limit())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A held [`Semaphore`] slot.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SemaphoreGuard {
    inner: Rc<Inner>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for SemaphoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreGuard").finish_non_exhaustive()
    }
}
