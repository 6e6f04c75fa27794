use crossbeam_deque::{Injector, Steal};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Wake;

use crate::runtime::selector::Selector;
use crate::task::Id;

/// The part of the scheduler reachable from other threads.
pub(crate) struct Shared {
    /// Ids of tasks to resume on the next iteration.
    pub(crate) injector: Injector<Id>,

    pub(crate) interrupted: AtomicBool,

    /// Operations suspended in [`crate::runtime::Block`].
    pub(crate) blocked: AtomicUsize,

    /// Taken when the scheduler closes, which turns every later unblock into
    /// a no-op.
    pub(crate) selector: RwLock<Option<Arc<dyn Selector>>>,
}

impl Shared {
    pub(crate) fn new(selector: Arc<dyn Selector>) -> Self {
        Self {
            injector: Injector::new(),
            interrupted: AtomicBool::new(false),
            blocked: AtomicUsize::new(0),
            selector: RwLock::new(Some(selector)),
        }
    }

    pub(crate) fn selector(&self) -> Option<Arc<dyn Selector>> {
        self.selector.read().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.selector.read().is_none()
    }

    pub(crate) fn wakeup(&self) {
        let selector = self.selector();
        if let Some(Err(error)) = selector.map(|selector| selector.wakeup()) {
            tracing::warn!(%error, "failed to wake up selector");
        }
    }

    /// Queues `id` for resumption and wakes the selector. Returns false once
    /// the scheduler is closed.
    pub(crate) fn notify(&self, id: Id) -> bool {
        if self.is_closed() {
            return false;
        }
        self.injector.push(id);
        self.wakeup();
        true
    }

    pub(crate) fn drain(&self) -> Vec<Id> {
        let mut ids = Vec::new();
        loop {
            match self.injector.steal() {
                Steal::Success(id) => ids.push(id),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        ids
    }
}

/// Waker handed to foreign futures polled by a task.
pub(crate) struct TaskWaker {
    shared: Arc<Shared>,
    id: Id,
}

impl TaskWaker {
    pub(crate) fn new(shared: Arc<Shared>, id: Id) -> Self {
        Self { shared, id }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.notify(self.id);
    }
}

/// Cross-thread handle to a scheduler.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Asks the run loop to stop at its next iteration. Safe from any thread.
    pub fn interrupt(&self) {
        tracing::debug!("interrupt requested");
        self.shared.interrupted.store(true, Ordering::Release);
        self.shared.wakeup();
    }

    pub fn unblock(&self, blocker: &Blocker) {
        blocker.unblock();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// Releases one [`crate::runtime::Block`]. Safe from any thread.
#[derive(Clone)]
pub struct Blocker {
    shared: Arc<Shared>,
    id: Id,
    unblocked: Arc<AtomicBool>,
}

impl Blocker {
    pub(crate) fn new(shared: Arc<Shared>, id: Id) -> Self {
        Self {
            shared,
            id,
            unblocked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resumes the blocked task on the scheduler's next iteration. A no-op
    /// once the scheduler is closed.
    pub fn unblock(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.unblocked.store(true, Ordering::Release);
        self.shared.notify(self.id);
    }

    pub fn is_unblocked(&self) -> bool {
        self.unblocked.load(Ordering::Acquire)
    }

    /// True if both release the same block.
    pub(crate) fn same(&self, other: &Blocker) -> bool {
        Arc::ptr_eq(&self.unblocked, &other.unblocked)
    }
}

impl std::fmt::Debug for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blocker")
            .field("task", &self.id)
            .field("unblocked", &self.is_unblocked())
            .finish()
    }
}
