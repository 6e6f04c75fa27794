use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::Error;
use crate::list::{Link, List};
use crate::runtime::Runnable;
use crate::task::{NodeInner, Task};

struct Waiting<T> {
    task: Weak<NodeInner>,
    value: RefCell<Option<T>>,
    signalled: Cell<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Resume waiters on the signaller's stack.
    Transfer,

    /// Queue waiters for the scheduler's next turn.
    Schedule,
}

/// FIFO list of suspended tasks, shared by every wait-based primitive.
pub(crate) struct WaitQueue<T> {
    waiting: RefCell<List<Rc<Waiting<T>>>>,
    mode: Mode,
}

impl<T> WaitQueue<T> {
    const fn new(mode: Mode) -> Self {
        Self {
            waiting: RefCell::new(List::new()),
            mode,
        }
    }

    pub(crate) const fn transfer() -> Self {
        Self::new(Mode::Transfer)
    }

    pub(crate) const fn schedule() -> Self {
        Self::new(Mode::Schedule)
    }

    pub(crate) fn wait<'a>(&'a self, task: &'a Task) -> Wait<'a, T> {
        Wait {
            queue: self,
            task,
            entry: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.borrow().len()
    }

    fn unlink(&self, link: Link) {
        let removed = self.waiting.borrow_mut().remove(link);
        drop(removed);
    }

    fn wake(&self, waiting: Rc<Waiting<T>>, value: T) {
        let Some(node) = waiting.task.upgrade() else {
            return;
        };

        *waiting.value.borrow_mut() = Some(value);
        waiting.signalled.set(true);

        match self.mode {
            Mode::Transfer => node.wake(None),
            Mode::Schedule => node.schedule(Runnable::Resume(Rc::downgrade(&node))),
        }
    }
}

impl<T: Clone> WaitQueue<T> {
    /// Swaps out the whole list and resumes every waiter in FIFO order.
    ///
    /// Waiters added while we resume belong to the next signal.
    pub(crate) fn signal(&self, value: T) -> usize {
        let waiting = self.waiting.borrow_mut().take();
        let count = waiting.len();

        for waiting in waiting {
            self.wake(waiting, value.clone());
        }
        count
    }

    /// Resumes up to `n` waiters from the front, in FIFO order.
    pub(crate) fn signal_front(&self, n: usize, value: T) -> usize {
        let mut woken = Vec::with_capacity(n);
        {
            let mut list = self.waiting.borrow_mut();
            while woken.len() < n {
                let Some(waiting) = list.pop_front() else {
                    break;
                };
                woken.push(waiting);
            }
        }

        let count = woken.len();
        for waiting in woken {
            self.wake(waiting, value.clone());
        }
        count
    }
}

/// Future returned by the `wait` of [`Condition`] and [`Notification`].
///
/// Dropping it before it resolves removes the waiter, a later signal will not
/// resume it.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait<'a, T> {
    queue: &'a WaitQueue<T>,
    task: &'a Task,
    entry: Option<(Link, Rc<Waiting<T>>)>,
}

impl<T> Future for Wait<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some((_, waiting)) = &this.entry
            && waiting.signalled.get()
        {
            let value = waiting.value.borrow_mut().take();
            this.entry = None;
            if let Some(value) = value {
                return Poll::Ready(Ok(value));
            }
        }

        if let Err(err) = this.task.check_signal() {
            if let Some((link, _)) = this.entry.take() {
                this.queue.unlink(link);
            }
            return Poll::Ready(Err(err));
        }

        if this.entry.is_none() {
            let waiting = Rc::new(Waiting {
                task: this.task.downgrade(),
                value: RefCell::new(None),
                signalled: Cell::new(false),
            });
            let link = this
                .queue
                .waiting
                .borrow_mut()
                .push_back(Rc::clone(&waiting));
            this.entry = Some((link, waiting));
        }

        Poll::Pending
    }
}

impl<T> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        if let Some((link, _)) = self.entry.take() {
            // Already gone if we were signalled.
            self.queue.unlink(link);
        }
    }
}

/// Suspends tasks until signalled. Signalling transfers control to each
/// waiter immediately, in the order they started waiting.
pub struct Condition<T = ()> {
    queue: WaitQueue<T>,
}

impl<T> Default for Condition<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Condition<T> {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::transfer(),
        }
    }

    /// Suspends `task` until the next [`Condition::signal`] and returns the
    /// signalled value.
    pub fn wait<'a>(&'a self, task: &'a Task) -> Wait<'a, T> {
        self.queue.wait(task)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.len() == 0
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl<T: Clone> Condition<T> {
    /// Resumes every current waiter with `value`. Returns how many there were.
    pub fn signal(&self, value: T) -> usize {
        self.queue.signal(value)
    }
}

impl<T> fmt::Debug for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// A [`Condition`] whose signal only queues the waiters. They run on the
/// scheduler's next turn, after the signaller has moved on.
pub struct Notification<T = ()> {
    queue: WaitQueue<T>,
}

impl<T> Default for Notification<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Notification<T> {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::schedule(),
        }
    }

    pub fn wait<'a>(&'a self, task: &'a Task) -> Wait<'a, T> {
        self.queue.wait(task)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.len() == 0
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl<T: Clone> Notification<T> {
    pub fn signal(&self, value: T) -> usize {
        self.queue.signal(value)
    }
}

impl<T> fmt::Debug for Notification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("waiting", &self.waiting())
            .finish()
    }
}
