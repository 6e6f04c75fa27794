use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;
use crate::runtime::Blocker;
use crate::task::Task;
use crate::time::Deadline;

struct Slot<T> {
    item: Option<T>,

    /// Tombstone. Set on every exit so a late hand-off skips this waiter.
    dead: bool,
    closed: bool,
}

struct Waiter<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
    blocker: Option<Blocker>,
}

impl<T> Waiter<T> {
    fn new(blocker: Option<Blocker>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                item: None,
                dead: false,
                closed: false,
            }),
            condvar: Condvar::new(),
            blocker,
        }
    }

    fn notify(&self) {
        self.condvar.notify_one();
        if let Some(blocker) = &self.blocker {
            blocker.unblock();
        }
    }
}

struct Entry<T> {
    priority: i64,
    seq: u64,
    waiter: Arc<Waiter<T>>,
}

// Max-heap: higher priority first, then lower sequence.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

struct State<T> {
    items: VecDeque<T>,
    waiting: BinaryHeap<Entry<T>>,
    seq: u64,
    closed: bool,
}

impl<T> State<T> {
    /// Priority of the best waiter still alive, dropping dead ones on the way.
    fn best_waiter(&mut self) -> Option<i64> {
        while let Some(entry) = self.waiting.peek() {
            if !entry.waiter.slot.lock().dead {
                return Some(entry.priority);
            }
            self.waiting.pop();
        }
        None
    }

    /// Hands items to waiters, best first, until one side runs out.
    fn distribute(&mut self) {
        while !self.items.is_empty() {
            let Some(entry) = self.waiting.pop() else {
                break;
            };

            let mut slot = entry.waiter.slot.lock();
            if slot.dead {
                continue;
            }
            slot.item = self.items.pop_front();
            slot.dead = true;
            drop(slot);

            entry.waiter.notify();
        }
    }

    fn try_take(&mut self, priority: i64) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        match self.best_waiter() {
            Some(best) if best >= priority => None,
            _ => self.items.pop_front(),
        }
    }

    fn register(&mut self, priority: i64, blocker: Option<Blocker>) -> Arc<Waiter<T>> {
        let waiter = Arc::new(Waiter::new(blocker));
        self.seq += 1;
        self.waiting.push(Entry {
            priority,
            seq: self.seq,
            waiter: Arc::clone(&waiter),
        });
        waiter
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn requeue(&self, item: T) {
        let mut state = self.state.lock();
        state.items.push_front(item);
        state.distribute();
    }
}

/// Tombstones a registered waiter when the dequeue exits, however it exits.
///
/// An item handed over too late to be returned goes back to the front of the
/// queue for the next waiter.
struct Registration<'a, T> {
    inner: &'a Inner<T>,
    waiter: Arc<Waiter<T>>,
}

impl<T> Registration<'_, T> {
    /// Returns the handed-over item, and whether the queue was closed.
    fn finish(&self) -> (Option<T>, bool) {
        let mut slot = self.waiter.slot.lock();
        slot.dead = true;
        (slot.item.take(), slot.closed)
    }
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if let (Some(item), _) = self.finish() {
            self.inner.requeue(item);
        }
    }
}

/// A channel whose consumers are served by priority.
///
/// Higher priorities are served first and equal priorities in arrival order.
/// Items are handed over FIFO. Safe from any thread.
pub struct PriorityQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    waiting: BinaryHeap::new(),
                    seq: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn push(&self, item: T) -> Result<(), Error> {
        self.enqueue([item])
    }

    /// Appends every item, then serves the waiting consumers.
    pub fn enqueue(&self, items: impl IntoIterator<Item = T>) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        state.items.extend(items);
        state.distribute();
        Ok(())
    }

    /// Takes an item, blocking the calling thread up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout and [`Error::Closed`] once the queue is
    /// closed and drained. A zero timeout never blocks.
    pub fn dequeue(&self, priority: i64, timeout: Option<Duration>) -> Result<Option<T>, Error> {
        let registration = {
            let mut state = self.inner.state.lock();
            if let Some(item) = state.try_take(priority) {
                return Ok(Some(item));
            }
            if state.closed {
                return Err(Error::Closed);
            }
            if timeout.is_some_and(|t| t.is_zero()) {
                return Ok(None);
            }

            Registration {
                inner: &self.inner,
                waiter: state.register(priority, None),
            }
        };

        let deadline = Deadline::start(timeout);
        let waiter = &registration.waiter;
        let mut slot = waiter.slot.lock();
        loop {
            if let Some(item) = slot.item.take() {
                return Ok(Some(item));
            }
            if slot.closed {
                return Err(Error::Closed);
            }

            match deadline {
                None => waiter.condvar.wait(&mut slot),
                Some(deadline) if deadline.is_expired() => {
                    slot.dead = true;
                    return Ok(None);
                }
                Some(deadline) => {
                    waiter.condvar.wait_for(&mut slot, deadline.remaining());
                }
            }
        }
    }

    /// Takes an item, suspending `task` up to `timeout`.
    ///
    /// A stopped or timed out waiter never consumes an item.
    pub async fn dequeue_async(
        &self,
        task: &Task,
        priority: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, Error> {
        let scheduler = task.scheduler()?;

        let (registration, block) = {
            let mut state = self.inner.state.lock();
            if let Some(item) = state.try_take(priority) {
                return Ok(Some(item));
            }
            if state.closed {
                return Err(Error::Closed);
            }
            if timeout.is_some_and(|t| t.is_zero()) {
                return Ok(None);
            }

            let block = scheduler.block(task, timeout);
            let registration = Registration {
                inner: &self.inner,
                waiter: state.register(priority, Some(block.blocker())),
            };
            (registration, block)
        };

        let woken = block.await;
        let (item, closed) = registration.finish();

        match (woken, item) {
            (Err(error), Some(item)) => {
                self.inner.requeue(item);
                Err(error)
            }
            (Err(error), None) => Err(error),
            (Ok(_), Some(item)) => Ok(Some(item)),
            (Ok(_), None) if closed => Err(Error::Closed),
            (Ok(_), None) => Ok(None),
        }
    }

    /// Takes an item only if no waiting consumer ranks above `priority`.
    pub fn try_dequeue(&self, priority: i64) -> Option<T> {
        self.inner.state.lock().try_take(priority)
    }

    /// Rejects further pushes and fails every waiter with [`Error::Closed`].
    /// Queued items can still be dequeued.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;

        for entry in state.waiting.drain() {
            let mut slot = entry.waiter.slot.lock();
            if slot.dead {
                continue;
            }
            slot.closed = true;
            drop(slot);
            entry.waiter.notify();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live waiting consumers.
    pub fn waiting(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiting
            .iter()
            .filter(|entry| !entry.waiter.slot.lock().dead)
            .count()
    }
}

impl<T> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.len())
            .field("waiting", &self.waiting())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use anyhow::Result;
    use std::thread;

    #[test]
    fn test_fast_path_and_zero_timeout() {
        let queue = PriorityQueue::new();
        assert_eq!(queue.dequeue(0, Some(Duration::ZERO)), Ok(None));

        queue.push("a").expect("open");
        assert_eq!(queue.dequeue(0, Some(Duration::ZERO)), Ok(Some("a")));
        assert_eq!(queue.try_dequeue(0), None);
    }

    #[test]
    fn test_close_fails_waiters_and_drains() {
        let queue = PriorityQueue::<u8>::new();

        let q = queue.clone();
        let consumer = thread::spawn(move || q.dequeue(1, None));
        while queue.waiting() == 0 {
            thread::yield_now();
        }

        queue.close();
        assert_eq!(consumer.join().expect("consumer panicked"), Err(Error::Closed));
        assert_eq!(queue.push(1), Err(Error::Closed));
        assert_eq!(queue.dequeue(1, None), Err(Error::Closed));
    }

    #[test]
    fn test_timed_out_waiter_is_skipped() {
        let queue = PriorityQueue::new();
        assert_eq!(queue.dequeue(10, Some(Duration::from_millis(2))), Ok(None));

        // The dead high-priority waiter does not block the fast path.
        queue.push(1).expect("open");
        assert_eq!(queue.try_dequeue(0), Some(1));
        assert_eq!(queue.waiting(), 0);
    }

    #[test]
    fn test_thread_waiters_served_by_priority() {
        let queue = PriorityQueue::new();

        let consumers: Vec<_> = [1, 5, 10]
            .into_iter()
            .enumerate()
            .map(|(i, priority)| {
                let q = queue.clone();
                let handle = thread::spawn(move || q.dequeue(priority, None));
                while queue.waiting() <= i {
                    thread::yield_now();
                }
                handle
            })
            .collect();

        queue.enqueue(["first", "second", "third"]).expect("open");

        let received: Vec<_> = consumers
            .into_iter()
            .map(|c| c.join().expect("consumer panicked").expect("open"))
            .collect();
        assert_eq!(received, vec![Some("third"), Some("second"), Some("first")]);
    }

    #[arbor::test]
    async fn test_async_waiters_served_by_priority(task: Task) -> Result<()> {
        let queue = PriorityQueue::new();

        let consumers: Vec<_> = [1, 5, 10]
            .into_iter()
            .map(|priority| {
                let q = queue.clone();
                task.spawn(move |t| async move { q.dequeue_async(&t, priority, None).await })
            })
            .collect();
        assert_eq!(queue.waiting(), 3);

        queue.enqueue([0, 1, 2])?;

        let mut received = Vec::new();
        for consumer in &consumers {
            received.push(consumer.wait(&task).await?.flatten());
        }
        // Priorities 1, 5 and 10, in that order.
        assert_eq!(received, vec![Some(2), Some(1), Some(0)]);
        Ok(())
    }

    #[arbor::test]
    async fn test_stopped_waiter_consumes_nothing(task: Task) -> Result<()> {
        let queue = PriorityQueue::new();

        let consumers: Vec<_> = [1, 5, 10]
            .into_iter()
            .map(|priority| {
                let q = queue.clone();
                task.spawn(move |t| async move { q.dequeue_async(&t, priority, None).await })
            })
            .collect();

        consumers[2].stop(false)?;
        assert!(consumers[2].is_stopped());
        assert_eq!(queue.waiting(), 2);

        queue.enqueue(["a", "b"])?;
        assert_eq!(consumers[1].wait(&task).await?.flatten(), Some("a"));
        assert_eq!(consumers[0].wait(&task).await?.flatten(), Some("b"));
        assert!(queue.is_empty());
        Ok(())
    }

    #[arbor::test]
    async fn test_item_of_dropped_waiter_is_redistributed(task: Task) -> Result<()> {
        let queue = PriorityQueue::new();

        let mut dropped = Box::pin(queue.dequeue_async(&task, 0, None));
        assert!(futures::poll!(dropped.as_mut()).is_pending());

        let q = queue.clone();
        let consumer = task.spawn(move |t| async move { q.dequeue_async(&t, 0, None).await });
        assert_eq!(queue.waiting(), 2);

        // Handed to the first waiter, which goes away before resuming.
        queue.push(42)?;
        assert!(consumer.is_running());
        drop(dropped);

        assert_eq!(consumer.wait(&task).await?.flatten(), Some(42));
        assert!(queue.is_empty());
        Ok(())
    }
}
