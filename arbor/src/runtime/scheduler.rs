use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::Waker;
use std::time::{Duration, Instant};

use nix::sys::wait::WaitStatus;

use crate::Error;
use crate::runtime::block::{Block, IoWait};
use crate::runtime::builder::SchedulerConfig;
use crate::runtime::selector::Interest;
use crate::runtime::timers::{Timer, TimerSet};
use crate::runtime::waker::{Blocker, Handle, Shared, TaskWaker};
use crate::task::{Id, JoinHandle, Node, NodeInner, SpawnBuilder, Status, Task};

#[cfg(test)]
use crate::utils::tracker::{Call, Tracker};

/// Work queued for the next iteration of the run loop.
pub(crate) enum Runnable {
    /// Poll the task's execution context.
    Resume(Weak<NodeInner>),

    /// Deliver a stop that could not be delivered on the spot, because the
    /// target was the one being polled.
    StopLater(Weak<NodeInner>),
}

pub(crate) struct SchedulerCore {
    pub(crate) root: Rc<NodeInner>,

    pub(crate) shared: Arc<Shared>,

    // Tasks currently being polled, innermost last. Resuming is re-entrant so
    // this is a stack rather than a single slot.
    current: RefCell<Vec<(Id, Weak<NodeInner>)>>,

    ready: RefCell<VecDeque<Runnable>>,

    // Started, unfinished tasks by id. Used to resolve wakeups coming through
    // the injector.
    registry: RefCell<HashMap<Id, Weak<NodeInner>>>,

    timers: RefCell<TimerSet>,

    busy: Cell<Duration>,

    idle: Cell<Duration>,

    load_window: Duration,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

/// Pops the current stack on drop.
pub(crate) struct Enter<'a> {
    core: &'a SchedulerCore,
}

impl Drop for Enter<'_> {
    fn drop(&mut self) {
        self.core.current.borrow_mut().pop();
    }
}

impl SchedulerCore {
    fn new(cfg: SchedulerConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak| SchedulerCore {
            root: NodeInner::new_root(weak.clone()),
            shared: Arc::new(Shared::new(cfg.selector)),
            current: RefCell::new(Vec::new()),
            ready: RefCell::new(VecDeque::with_capacity(cfg.ready_capacity)),
            registry: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerSet::default()),
            busy: Cell::new(Duration::ZERO),
            idle: Cell::new(Duration::ZERO),
            load_window: cfg.load_window,

            #[cfg(test)]
            tracker: Tracker::default(),
        })
    }

    pub(crate) fn enter(&self, node: &Rc<NodeInner>) -> Enter<'_> {
        self.current
            .borrow_mut()
            .push((node.id, Rc::downgrade(node)));
        Enter { core: self }
    }

    pub(crate) fn is_current(&self, id: Id) -> bool {
        self.current.borrow().last().is_some_and(|(top, _)| *top == id)
    }

    fn current(&self) -> Option<Rc<NodeInner>> {
        self.current.borrow().last().and_then(|(_, node)| node.upgrade())
    }

    pub(crate) fn push(&self, runnable: Runnable) {
        self.ready.borrow_mut().push_back(runnable);
    }

    pub(crate) fn register(&self, node: &Rc<NodeInner>) {
        self.registry
            .borrow_mut()
            .insert(node.id, Rc::downgrade(node));
    }

    pub(crate) fn deregister(&self, id: Id) {
        self.registry.borrow_mut().remove(&id);
    }

    pub(crate) fn waker(&self, id: Id) -> Waker {
        Waker::from(Arc::new(TaskWaker::new(Arc::clone(&self.shared), id)))
    }

    pub(crate) fn after(self: &Rc<Self>, duration: Duration, action: impl FnOnce() + 'static) -> Timer {
        let deadline = Instant::now() + duration;
        let seq = self.timers.borrow_mut().insert(deadline, Box::new(action));
        Timer::new(seq, Rc::downgrade(self))
    }

    pub(crate) fn cancel_timer(&self, seq: u64) {
        // The action may own the last handle to something with a destructor,
        // drop it outside of the borrow.
        let action = self.timers.borrow_mut().cancel(seq);
        if action.is_some() {
            tracing::trace!(timer = seq, "timer cancelled");
        }
        drop(action);
    }

    pub(crate) fn has_timer(&self, seq: u64) -> bool {
        self.timers.borrow().contains(seq)
    }

    pub(crate) fn num_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    fn has_ready(&self) -> bool {
        !self.ready.borrow().is_empty() || !self.shared.injector.is_empty()
    }

    fn run_once_inner(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let selector = self.shared.selector().ok_or(Error::Closed)?;
        let start = Instant::now();

        let interval = if self.has_ready() {
            Some(Duration::ZERO)
        } else {
            let next_timer = self
                .timers
                .borrow_mut()
                .earliest()
                .map(|deadline| deadline.saturating_duration_since(start));
            match (next_timer, timeout) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        };

        #[cfg(test)]
        self.tracker.record(Call::Select { timeout: interval });

        if let Err(err) = selector.select(interval).map_err(Error::selector) {
            if !err.is_retryable() {
                return Err(err);
            }
            tracing::trace!(%err, "selector wait cut short");
        }
        let idle = selector.idle_duration();

        self.fire_timers();
        self.resume_injected();
        self.process_ready();

        self.account(start.elapsed(), idle);
        Ok(())
    }

    fn fire_timers(&self) {
        let due = self.timers.borrow_mut().expired(Instant::now());
        if due.is_empty() {
            return;
        }

        tracing::trace!(count = due.len(), "timers fired");
        #[cfg(test)]
        self.tracker.record(Call::TimerFired { count: due.len() });

        for action in due {
            action();
        }
    }

    fn resume_injected(&self) {
        for id in self.shared.drain() {
            let node = self.registry.borrow().get(&id).and_then(Weak::upgrade);
            let Some(node) = node else {
                continue;
            };
            if !node.resume(None) {
                self.push(Runnable::Resume(Rc::downgrade(&node)));
            }
        }
    }

    fn process_ready(&self) {
        // Anything pushed while we go is for the next iteration.
        let ready = std::mem::take(&mut *self.ready.borrow_mut());

        for runnable in ready {
            match runnable {
                Runnable::Resume(node) => {
                    let Some(node) = node.upgrade() else {
                        continue;
                    };
                    if !node.resume(None) {
                        self.push(Runnable::Resume(Rc::downgrade(&node)));
                    }
                }
                Runnable::StopLater(node) => {
                    let Some(node) = node.upgrade() else {
                        continue;
                    };
                    if let Err(error) = node.stop(false) {
                        tracing::debug!(node = %node.id, %error, "deferred stop raised");
                    }
                }
            }
        }
    }

    fn account(&self, total: Duration, idle: Duration) {
        let idle = idle.min(total);
        let mut busy = self.busy.get() + (total - idle);
        let mut idle = self.idle.get() + idle;

        let sum = busy + idle;
        if sum > self.load_window {
            let scale = self.load_window.as_secs_f64() / sum.as_secs_f64();
            busy = busy.mul_f64(scale);
            idle = idle.mul_f64(scale);
        }

        self.busy.set(busy);
        self.idle.set(idle);
    }

    fn load(&self) -> f64 {
        let busy = self.busy.get().as_secs_f64();
        let total = busy + self.idle.get().as_secs_f64();
        if total == 0.0 { 0.0 } else { busy / total }
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        // Dropped without `close`: break the task <-> future cycles.
        self.root.abandon();
        let actions = self.timers.get_mut().clear();
        drop(actions);
    }
}

/// The root of a task tree and the single-threaded loop that drives it.
///
/// Dropping every handle without calling [`Scheduler::close`] discards all
/// unfinished tasks without running them again.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedulerCore>,
    root: Node,
}

impl Scheduler {
    pub(crate) fn new(cfg: SchedulerConfig) -> Scheduler {
        Scheduler::from_core(SchedulerCore::new(cfg))
    }

    pub(crate) fn from_core(core: Rc<SchedulerCore>) -> Scheduler {
        let root = Node::from_inner(Rc::clone(&core.root));
        Scheduler { core, root }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &SchedulerCore {
        &self.core
    }

    pub fn root(&self) -> Node {
        self.root.clone()
    }

    pub fn spawn<F, Fut, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        self.root.spawn(f)
    }

    pub fn spawn_builder(&self) -> SpawnBuilder<'_> {
        self.root.spawn_builder()
    }

    /// The innermost task being polled, if any.
    pub fn current(&self) -> Option<Task> {
        self.core.current().and_then(Task::from_inner)
    }

    /// Drives the loop until the tree has no work left.
    ///
    /// Returns `Err(Error::Interrupted)` when an interrupt was requested
    /// through [`Handle::interrupt`]. The tree is left as is and the loop may
    /// be resumed or closed.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            if self.core.shared.interrupted.swap(false, Ordering::AcqRel) {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let mut hierarchy = String::new();
                    let _ = self.print_hierarchy(&mut hierarchy);
                    tracing::debug!(%hierarchy, "scheduler interrupted");
                }
                return Err(Error::Interrupted);
            }

            if !self.run_once(None)? {
                return Ok(());
            }
        }
    }

    /// Runs a single iteration, waiting at most `timeout` for something to
    /// happen. Returns false when there is no more work.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        if self.core.root.is_finished() {
            return Ok(false);
        }

        self.core.run_once_inner(timeout)?;
        Ok(!self.core.root.is_finished())
    }

    /// Terminates every task, transient ones included, and releases the
    /// selector.
    ///
    /// Fails with [`Error::BlockedOnClose`] if a [`Block`] is still pending
    /// afterwards. The selector is kept in that case.
    pub fn close(&self) -> Result<(), Error> {
        tracing::debug!(children = self.root.len(), "closing scheduler");

        while !self.core.root.terminate() {
            self.core.run_once_inner(None)?;
        }
        // An interrupt raised while tearing down has nothing left to stop.
        self.core.shared.interrupted.store(false, Ordering::Release);

        let blocked = self.core.shared.blocked.load(Ordering::Acquire);
        if blocked > 0 {
            return Err(Error::BlockedOnClose { blocked });
        }

        let selector = self.core.shared.selector.write().take();
        if let Some(selector) = selector {
            selector.close();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.shared.is_closed()
    }

    pub fn interrupt(&self) {
        self.handle().interrupt();
    }

    pub fn handle(&self) -> Handle {
        Handle::new(Arc::clone(&self.core.shared))
    }

    /// Fraction of recent time spent outside of `select`, in `[0, 1]`.
    pub fn load(&self) -> f64 {
        self.core.load()
    }

    /// Runs `action` on the scheduler thread once `duration` has elapsed.
    pub fn after(&self, duration: Duration, action: impl FnOnce() + 'static) -> Timer {
        self.core.after(duration, action)
    }

    /// Suspends `task` until the returned future's [`Blocker`] is unblocked,
    /// possibly from another thread.
    ///
    /// Resolves to `Ok(true)` when unblocked and `Ok(false)` on timeout.
    pub fn block<'a>(&self, task: &'a Task, timeout: Option<Duration>) -> Block<'a> {
        let blocker = Blocker::new(Arc::clone(&self.core.shared), task.id());
        Block::new(task, blocker, timeout, Arc::clone(&self.core.shared))
    }

    /// Suspends `task` until `fd` is ready for `interest`.
    ///
    /// Resolves to `Ok(None)` on timeout.
    pub fn io_wait<'a>(
        &self,
        task: &'a Task,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> IoWait<'a> {
        IoWait::new(task, fd, interest, timeout, self.core.shared.selector())
    }

    pub fn process_wait(&self, pid: i32) -> Result<WaitStatus, Error> {
        let selector = self.core.shared.selector().ok_or(Error::Closed)?;
        Ok(selector.process_wait(pid)?)
    }

    pub fn address_resolve(&self, host: &str) -> Result<Vec<SocketAddr>, Error> {
        let selector = self.core.shared.selector().ok_or(Error::Closed)?;
        Ok(selector.address_resolve(host)?)
    }

    /// Spawns the entry task, runs until no work is left, closes the
    /// scheduler and returns the entry task's value.
    ///
    /// A stopped entry task yields `Err(Error::Stop)`.
    pub fn block_on<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let main = self.root.spawn_builder().with_annotation("main").task(f);
        main.observe();
        main.launch();

        let run = self.run();
        let close = self.close();
        run?;
        close?;

        match main.status() {
            Status::Completed => main
                .take_value()
                .and_then(|value| value.downcast::<T>().ok())
                .and_then(|value| Rc::try_unwrap(value).ok())
                .ok_or_else(|| Error::failed("entry task value is still shared")),
            Status::Failed => Err(main.failure().unwrap_or(Error::Closed)),
            Status::Stopped => Err(Error::Stop),
            Status::Initialized | Status::Running => Err(Error::Closed),
        }
    }

    pub fn print_hierarchy(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.root.print_hierarchy(out)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.root.id())
            .field("children", &self.root.len())
            .field("timers", &self.core.num_timers())
            .field("closed", &self.is_closed())
            .finish()
    }
}
