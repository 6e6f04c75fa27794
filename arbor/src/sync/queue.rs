use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;
use crate::runtime::Blocker;
use crate::task::Task;
use crate::time::Deadline;
use crate::utils::ScopeGuard;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,

    /// Consumers currently suspended in a pop.
    waiting: usize,

    /// Tasks suspended in `pop_async` and `push_async`. Every change that may
    /// satisfy one of them releases all of them, they re-check on resume.
    poppers: Vec<Blocker>,
    pushers: Vec<Blocker>,
}

impl<T> State<T> {
    fn is_full(&self, limit: Option<usize>) -> bool {
        limit.is_some_and(|limit| self.items.len() >= limit)
    }
}

struct Channel<T> {
    state: Mutex<State<T>>,
    readable: Condvar,
    writable: Condvar,
    limit: Option<usize>,
}

impl<T> Channel<T> {
    fn put(&self, state: &mut State<T>, item: T) {
        state.items.push_back(item);
        self.readable.notify_one();
        state.poppers.drain(..).for_each(|blocker| blocker.unblock());
    }

    fn take(&self, state: &mut State<T>) -> Option<T> {
        let item = state.items.pop_front()?;
        self.writable.notify_one();
        state.pushers.drain(..).for_each(|blocker| blocker.unblock());
        Some(item)
    }

    fn unpark_popper(&self, blocker: &Blocker) {
        let mut state = self.state.lock();
        state.waiting -= 1;
        state.poppers.retain(|b| !b.same(blocker));
    }

    fn unpark_pusher(&self, blocker: &Blocker) {
        self.state.lock().pushers.retain(|b| !b.same(blocker));
    }
}

/// A multi-producer, multi-consumer FIFO channel.
///
/// Every operation is safe from any thread. Tasks use the `_async` variants,
/// which suspend the task instead of the scheduler's thread. The blocking
/// variants are for threads that run no scheduler.
pub struct Queue<T> {
    channel: Arc<Channel<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    fn with_limit(limit: Option<usize>) -> Self {
        Self {
            channel: Arc::new(Channel {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                    waiting: 0,
                    poppers: Vec::new(),
                    pushers: Vec::new(),
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
                limit,
            }),
        }
    }

    /// Appends `item`, blocking the calling thread while a limited queue is
    /// full. Fails with [`Error::Closed`] once the queue is closed.
    pub fn push(&self, item: T) -> Result<(), Error> {
        let channel = &*self.channel;
        let mut state = channel.state.lock();

        while !state.closed && state.is_full(channel.limit) {
            channel.writable.wait(&mut state);
        }
        if state.closed {
            return Err(Error::Closed);
        }

        channel.put(&mut state, item);
        Ok(())
    }

    pub fn enqueue(&self, items: impl IntoIterator<Item = T>) -> Result<(), Error> {
        items.into_iter().try_for_each(|item| self.push(item))
    }

    /// Appends `item`, suspending `task` while a limited queue is full.
    pub async fn push_async(&self, task: &Task, item: T) -> Result<(), Error> {
        let scheduler = task.scheduler()?;
        let channel = &*self.channel;

        loop {
            let block = {
                let mut state = channel.state.lock();
                if state.closed {
                    return Err(Error::Closed);
                }
                if !state.is_full(channel.limit) {
                    channel.put(&mut state, item);
                    return Ok(());
                }

                let block = scheduler.block(task, None);
                state.pushers.push(block.blocker());
                block
            };

            let blocker = block.blocker();
            let _parked = ScopeGuard::new(|| channel.unpark_pusher(&blocker));
            block.await?;
        }
    }

    /// Removes the oldest item, blocking the calling thread up to `timeout`.
    ///
    /// Returns `None` on timeout, or once the queue is closed and drained.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let channel = &*self.channel;
        let deadline = Deadline::start(timeout);
        let mut state = channel.state.lock();

        state.waiting += 1;
        let item = loop {
            if let Some(item) = channel.take(&mut state) {
                break Some(item);
            }
            if state.closed {
                break None;
            }

            match deadline {
                None => channel.readable.wait(&mut state),
                Some(deadline) if deadline.is_expired() => break None,
                Some(deadline) => {
                    channel.readable.wait_for(&mut state, deadline.remaining());
                }
            }
        };
        state.waiting -= 1;

        item
    }

    pub fn try_pop(&self) -> Option<T> {
        let channel = &*self.channel;
        channel.take(&mut channel.state.lock())
    }

    /// Removes the oldest item, suspending `task` up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout, or once the queue is closed and drained.
    pub async fn pop_async(&self, task: &Task, timeout: Option<Duration>) -> Result<Option<T>, Error> {
        let scheduler = task.scheduler()?;
        let channel = &*self.channel;
        let deadline = Deadline::start(timeout);

        loop {
            let block = {
                let mut state = channel.state.lock();
                if let Some(item) = channel.take(&mut state) {
                    return Ok(Some(item));
                }
                if state.closed || deadline.is_some_and(|d| d.is_expired()) {
                    return Ok(None);
                }

                let block = scheduler.block(task, deadline.map(|d| d.remaining()));
                state.poppers.push(block.blocker());
                state.waiting += 1;
                block
            };

            let blocker = block.blocker();
            let _parked = ScopeGuard::new(|| channel.unpark_popper(&blocker));
            block.await?;
        }
    }

    /// Rejects further pushes and releases every waiter. Items already queued
    /// can still be popped.
    pub fn close(&self) {
        let channel = &*self.channel;
        let mut state = channel.state.lock();
        if std::mem::replace(&mut state.closed, true) {
            return;
        }

        channel.readable.notify_all();
        channel.writable.notify_all();
        state.poppers.drain(..).for_each(|blocker| blocker.unblock());
        state.pushers.drain(..).for_each(|blocker| blocker.unblock());
    }

    pub fn is_closed(&self) -> bool {
        self.channel.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.channel.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers suspended in a pop.
    pub fn waiting(&self) -> usize {
        self.channel.state.lock().waiting
    }

    pub fn limit(&self) -> Option<usize> {
        self.channel.limit
    }
}

impl<T: 'static> Queue<T> {
    /// Pops items until the queue is closed and drained, spawning a child of
    /// `task` for each. Returns how many were spawned.
    pub async fn spawn_each<F, Fut, R>(&self, task: &Task, f: F) -> Result<usize, Error>
    where
        F: Fn(Task, T) -> Fut + 'static,
        Fut: Future<Output = Result<R, Error>> + 'static,
        R: 'static,
    {
        let f = Rc::new(f);
        let mut spawned = 0;

        while let Some(item) = self.pop_async(task, None).await? {
            let f = Rc::clone(&f);
            task.spawn(move |child| (*f)(child, item));
            spawned += 1;
        }

        tracing::debug!(task = %task.id(), spawned, "queue drained");
        Ok(spawned)
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.channel.state.lock();
        f.debug_struct("Queue")
            .field("len", &state.items.len())
            .field("limit", &self.channel.limit)
            .field("waiting", &state.waiting)
            .field("closed", &state.closed)
            .finish()
    }
}

/// A [`Queue`] holding at most `limit` items. Pushes wait for room.
pub struct LimitedQueue<T> {
    queue: Queue<T>,
}

impl<T> LimitedQueue<T> {
    #[track_caller]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "limit must be greater than zero");
        Self {
            queue: Queue::with_limit(Some(limit)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.queue.channel.state.lock().is_full(self.queue.channel.limit)
    }
}

impl<T> Clone for LimitedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Deref for LimitedQueue<T> {
    type Target = Queue<T>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

impl<T> fmt::Debug for LimitedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.queue.fmt(f)
    }
}
