use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::runtime::SchedulerCore;
use crate::task::{NodeInner, Signal, Task};

pub(crate) type Action = Box<dyn FnOnce()>;

/// Pending timers ordered by deadline, ties broken by creation order.
///
/// Cancelled timers only lose their action, their heap entry is skipped when
/// it surfaces. Once stale entries outnumber live ones the heap is rebuilt.
#[derive(Default)]
pub(crate) struct TimerSet {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    actions: HashMap<u64, Action>,
    seq: u64,
}

impl TimerSet {
    pub(crate) fn insert(&mut self, deadline: Instant, action: Action) -> u64 {
        self.seq += 1;
        let seq = self.seq;
        self.heap.push(Reverse((deadline, seq)));
        self.actions.insert(seq, action);
        seq
    }

    pub(crate) fn cancel(&mut self, seq: u64) -> Option<Action> {
        let action = self.actions.remove(&seq)?;
        if self.heap.len() > 2 * self.actions.len() {
            let actions = &self.actions;
            self.heap.retain(|Reverse((_, seq))| actions.contains_key(seq));
        }
        Some(action)
    }

    pub(crate) fn contains(&self, seq: u64) -> bool {
        self.actions.contains_key(&seq)
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }

    pub(crate) fn earliest(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.actions.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes every timer due at `now`, in deadline order.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<Action> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(action) = self.actions.remove(&seq) {
                due.push(action);
            }
        }
        due
    }

    pub(crate) fn clear(&mut self) -> Vec<Action> {
        self.heap.clear();
        self.actions.drain().map(|(_, action)| action).collect()
    }
}

/// Handle to a timer registered with [`crate::Scheduler::after`].
#[derive(Debug)]
pub struct Timer {
    seq: u64,
    scheduler: Weak<SchedulerCore>,
}

impl Timer {
    pub(crate) fn new(seq: u64, scheduler: Weak<SchedulerCore>) -> Self {
        Self { seq, scheduler }
    }

    /// Cancels the timer. Cancelling twice, or after it fired, is a no-op.
    pub fn cancel(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel_timer(self.seq);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|scheduler| scheduler.has_timer(self.seq))
    }
}

/// A timer that resumes a suspended task, cancelled when dropped.
///
/// Every bounded wait arms one and checks [`Expiry::fired`] when it is polled
/// again.
pub(crate) struct Expiry {
    timer: Timer,
    fired: Rc<Cell<bool>>,
}

impl Expiry {
    /// With a `signal`, the task observes it at its next suspension point
    /// even if whatever it waits on does not look at `fired`.
    pub(crate) fn new(task: &Task, duration: Duration, signal: Option<Signal>) -> Option<Self> {
        let scheduler = task.inner().scheduler.upgrade()?;

        let fired = Rc::new(Cell::new(false));
        let target: Weak<NodeInner> = task.downgrade();
        let flag = Rc::clone(&fired);

        let timer = scheduler.after(duration, move || {
            flag.set(true);
            if let Some(node) = target.upgrade() {
                node.wake(signal);
            }
        });

        Some(Self { timer, fired })
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.get()
    }
}

impl Drop for Expiry {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
