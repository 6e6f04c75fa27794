use futures::future::LocalBoxFuture;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::Error;
use crate::runtime::{Runnable, Scheduler};
use crate::sync::Condition;
use crate::task::node::{Kind, Node, NodeInner};
use crate::task::JoinHandle;
use crate::utils::ScopeGuard;

#[cfg(test)]
use crate::utils::tracker::Call;

/// Lifecycle of a task. The three terminal states are reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Initialized,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initialized => "initialized",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to a suspended task and observed at its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Stop,
    Timeout,
}

impl From<Signal> for Error {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Stop => Error::Stop,
            Signal::Timeout => Error::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DeferStop {
    /// No `defer_stop` section is active.
    #[default]
    Unset,

    /// Inside a section, no stop requested so far.
    Armed,

    /// Inside a section, a stop arrived and will be raised on exit.
    Requested,
}

pub(crate) type Value = Rc<dyn Any>;
pub(crate) type Outcome = Result<Value, Error>;
pub(crate) type TaskFuture = LocalBoxFuture<'static, Outcome>;
pub(crate) type Body = Box<dyn FnOnce(Task) -> TaskFuture>;

pub(crate) struct TaskCore {
    status: Cell<Status>,

    // Consumed by `run`, or dropped if the task is stopped before it starts.
    body: RefCell<Option<Body>>,

    // The execution context. Borrowed for the whole duration of a poll, so a
    // failed `try_borrow_mut` means the task is somewhere on the poll stack.
    future: RefCell<Option<TaskFuture>>,

    result: RefCell<Option<Outcome>>,

    // Created by the first `wait` on an unfinished task.
    finished: RefCell<Option<Rc<Condition<()>>>>,

    defer_stop: Cell<DeferStop>,

    signal: Cell<Option<Signal>>,

    waker: Waker,
}

impl TaskCore {
    pub(crate) fn new(body: Body, waker: Waker) -> Self {
        Self {
            status: Cell::new(Status::Initialized),
            body: RefCell::new(Some(body)),
            future: RefCell::new(None),
            result: RefCell::new(None),
            finished: RefCell::new(None),
            defer_stop: Cell::new(DeferStop::Unset),
            signal: Cell::new(None),
            waker,
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.status.get()
    }

    /// Both the body and the execution context are gone.
    pub(crate) fn is_done(&self) -> bool {
        let future_done = self
            .future
            .try_borrow()
            .is_ok_and(|future| future.is_none());

        future_done && self.body.borrow().is_none()
    }

    fn is_alive(&self) -> bool {
        self.future
            .try_borrow()
            .map_or(true, |future| future.is_some())
    }

    /// A pending stop is never downgraded to a timeout.
    pub(crate) fn raise(&self, signal: Signal) {
        if signal == Signal::Timeout && self.signal.get() == Some(Signal::Stop) {
            return;
        }
        self.signal.set(Some(signal));
    }

    fn finished_condition(&self) -> Rc<Condition<()>> {
        let mut finished = self.finished.borrow_mut();
        Rc::clone(finished.get_or_insert_with(|| Rc::new(Condition::new())))
    }

    /// Drops the condition created by [`Task::observe`] while nobody waits on
    /// it, so a later failure is reported again.
    fn unobserve(&self) {
        let mut finished = self.finished.borrow_mut();
        if finished.as_ref().is_some_and(|condition| condition.is_empty()) {
            *finished = None;
        }
    }

    pub(crate) fn abandon(&self) {
        let future = self.future.try_borrow_mut().ok().and_then(|mut f| f.take());
        let body = self.body.borrow_mut().take();
        drop((future, body));
    }
}

impl NodeInner {
    /// Polls the task's execution context right away, on the caller's stack.
    ///
    /// Returns false without doing anything when the context is already being
    /// polled further down the stack.
    pub(crate) fn resume(self: &Rc<Self>, signal: Option<Signal>) -> bool {
        let Some(core) = self.task_core() else {
            return true;
        };
        let Ok(mut slot) = core.future.try_borrow_mut() else {
            return false;
        };
        let Some(future) = slot.as_mut() else {
            return true;
        };

        if let Some(signal) = signal {
            core.raise(signal);
        }

        let scheduler = self.scheduler.upgrade();

        #[cfg(test)]
        if let Some(scheduler) = &scheduler {
            scheduler.tracker.record(Call::Resume { id: self.id });
        }

        let poll = {
            let _enter = scheduler.as_ref().map(|s| s.enter(self));
            let mut cx = Context::from_waker(&core.waker);
            future.as_mut().poll(&mut cx)
        };

        if let Poll::Ready(outcome) = poll {
            let future = slot.take();
            drop(slot);
            drop(future);
            self.complete(outcome);
        }

        true
    }

    /// Resumes now when possible, otherwise on the scheduler's next turn.
    pub(crate) fn wake(self: &Rc<Self>, signal: Option<Signal>) {
        if self.resume(signal) {
            return;
        }

        if let (Some(core), Some(signal)) = (self.task_core(), signal) {
            core.raise(signal);
        }
        self.schedule(Runnable::Resume(Rc::downgrade(self)));
    }

    pub(crate) fn schedule(&self, runnable: Runnable) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.push(runnable);
        }
    }

    fn is_current(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|scheduler| scheduler.is_current(self.id))
    }

    fn complete(self: &Rc<Self>, outcome: Outcome) {
        let Some(core) = self.task_core() else {
            return;
        };
        if core.status.get().is_terminal() {
            return;
        }

        match outcome {
            Ok(value) => {
                core.status.set(Status::Completed);
                *core.result.borrow_mut() = Some(Ok(value));
                tracing::debug!(task = %self.id, "task completed");
            }
            Err(Error::Stop) => {
                // We are no longer on the poll stack, nothing can be current
                // among our children.
                let _ = self.stopped();
            }
            Err(error) => {
                core.status.set(Status::Failed);
                if core.finished.borrow().is_none() {
                    #[cfg(test)]
                    if let Some(scheduler) = self.scheduler.upgrade() {
                        scheduler.tracker.record(Call::Unhandled { id: self.id });
                    }
                    tracing::warn!(task = %self.id, %error, "task may have ended with unhandled failure");
                } else {
                    tracing::debug!(task = %self.id, %error, "task failed");
                }
                *core.result.borrow_mut() = Some(Err(error));
            }
        }

        self.finish();
    }

    pub(crate) fn stop_task(self: &Rc<Self>, core: &TaskCore, later: bool) -> Result<(), Error> {
        match core.status.get() {
            // Children may not have stopped cleanly the first time around.
            Status::Stopped => return self.stopped(),
            Status::Completed | Status::Failed => return Ok(()),
            Status::Initialized | Status::Running => {}
        }

        if core.defer_stop.get() == DeferStop::Armed {
            core.defer_stop.set(DeferStop::Requested);
            tracing::debug!(task = %self.id, "stop deferred");
            return Ok(());
        }

        if core.status.get() == Status::Running && core.is_alive() {
            if self.is_current() {
                if !later {
                    return Err(Error::Stop);
                }
                self.stop_later();
            } else if !self.resume(Some(Signal::Stop)) {
                // Mid-transition further down the poll stack.
                self.stop_later();
            }
            return Ok(());
        }

        let result = self.stopped();
        self.finish();
        result
    }

    fn stop_later(self: &Rc<Self>) {
        tracing::trace!(task = %self.id, "stop scheduled for next turn");

        #[cfg(test)]
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.tracker.record(Call::StopLater { id: self.id });
        }

        self.schedule(Runnable::StopLater(Rc::downgrade(self)));
    }

    fn stopped(self: &Rc<Self>) -> Result<(), Error> {
        if let Some(core) = self.task_core() {
            core.status.set(Status::Stopped);
            core.defer_stop.set(DeferStop::Unset);
        }
        tracing::debug!(task = %self.id, children = self.num_children(), "task stopped");

        self.stop_children(true)
    }

    fn finish(self: &Rc<Self>) {
        let Some(core) = self.task_core() else {
            return;
        };

        core.abandon();
        core.signal.set(None);

        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.deregister(self.id);
        }

        self.consume();

        let finished = core.finished.borrow_mut().take();
        if let Some(finished) = finished {
            finished.signal(());
        }
    }
}

/// Handle to a task of the tree.
///
/// Every task body receives its own `Task`, which is the explicit context
/// handed to suspension points ([`Condition::wait`], [`crate::time::sleep`],
/// ...). It dereferences to [`Node`] for tree operations.
#[derive(Clone)]
pub struct Task {
    node: Node,
}

impl Deref for Task {
    type Target = Node;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl Task {
    pub(crate) fn new(parent: &Rc<NodeInner>, transient: bool, body: Body) -> Task {
        let scheduler = parent.scheduler.upgrade();
        let inner = NodeInner::new_child(parent, transient, |id| {
            let waker = scheduler
                .as_ref()
                .map_or_else(futures::task::noop_waker, |scheduler| scheduler.waker(id));
            Kind::Task(TaskCore::new(body, waker))
        });
        Task {
            node: Node::from_inner(inner),
        }
    }

    pub(crate) fn from_inner(inner: Rc<NodeInner>) -> Option<Task> {
        inner.task_core()?;
        Some(Task {
            node: Node::from_inner(inner),
        })
    }

    pub(crate) fn inner(&self) -> &Rc<NodeInner> {
        &self.node.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Rc::downgrade(&self.node.inner)
    }

    pub(crate) fn core(&self) -> &TaskCore {
        match &self.node.inner.kind {
            Kind::Task(core) => core,
            Kind::Root | Kind::Plain => unreachable!("task handle over a non-task node"),
        }
    }

    pub fn status(&self) -> Status {
        self.core().status()
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Status::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Status::Failed
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == Status::Stopped
    }

    /// The execution context exists and has not finished.
    pub fn is_alive(&self) -> bool {
        self.core().is_alive()
    }

    /// This task is the one the scheduler is polling right now.
    pub fn is_current(&self) -> bool {
        self.node.inner.is_current()
    }

    pub fn scheduler(&self) -> Result<Scheduler, Error> {
        self.node
            .inner
            .scheduler
            .upgrade()
            .map(Scheduler::from_core)
            .ok_or(Error::Closed)
    }

    /// Starts the task: runs the body until its first suspension point.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the task is initialized. A
    /// failure raised before the first suspension point is returned here too
    /// (and still stored for `wait`).
    pub fn run(&self) -> Result<(), Error> {
        let observed = self.core().finished.borrow().is_some();
        self.observe();
        let started = self.start();
        if !observed && !self.status().is_terminal() {
            self.core().unobserve();
        }
        started?;

        match self.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Starts a freshly created task, leaving any failure for `wait`.
    pub(crate) fn launch(&self) {
        if let Err(error) = self.start() {
            tracing::debug!(task = %self.id(), %error, "launch skipped");
        }
    }

    pub(crate) fn start(&self) -> Result<(), Error> {
        let core = self.core();
        if core.status.get() != Status::Initialized {
            return Err(Error::AlreadyRunning);
        }
        let body = core.body.borrow_mut().take();
        let Some(body) = body else {
            return Err(Error::AlreadyRunning);
        };

        core.status.set(Status::Running);
        let future = body(self.clone());
        if core.status.get() != Status::Running {
            // The body stopped its own task before handing out the future.
            drop(future);
            return Ok(());
        }
        *core.future.borrow_mut() = Some(future);

        if let Some(scheduler) = self.node.inner.scheduler.upgrade() {
            scheduler.register(self.inner());
        }
        tracing::debug!(task = %self.id(), transient = self.is_transient(), "task started");

        self.node.inner.resume(None);
        Ok(())
    }

    /// The stored failure, if the task failed.
    pub fn failure(&self) -> Option<Error> {
        match self.core().result.borrow().as_ref() {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Moves the completed value out, leaving the status untouched.
    pub(crate) fn take_value(&self) -> Option<Value> {
        let mut result = self.core().result.borrow_mut();
        match result.take() {
            Some(Ok(value)) => Some(value),
            other => {
                *result = other;
                None
            }
        }
    }

    /// Marks the outcome as collected, a failure is then not reported as
    /// unhandled.
    pub(crate) fn observe(&self) {
        self.core().finished_condition();
    }

    pub(crate) fn value(&self) -> Option<Value> {
        match self.core().result.borrow().as_ref() {
            Some(Ok(value)) => Some(Rc::clone(value)),
            _ => None,
        }
    }

    /// Suspends `caller` until this task finishes.
    ///
    /// Re-raises the stored failure. A stopped task is not a failure.
    pub async fn wait(&self, caller: &Task) -> Result<(), Error> {
        self.join(caller).await?;

        match self.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub(crate) async fn join(&self, caller: &Task) -> Result<(), Error> {
        if caller.id() == self.id() || self.is_current() {
            return Err(Error::Deadlock);
        }

        let core = self.core();
        if !core.is_done() {
            let finished = core.finished_condition();
            finished.wait(caller).await?;
        }

        Ok(())
    }

    /// Runs `future` as a critical section that a stop cannot interrupt.
    ///
    /// A stop requested in the meantime is raised as `Err(Error::Stop)` once
    /// the section exits. Nested sections are transparent, only the outermost
    /// one acts.
    pub async fn defer_stop<F, R>(&self, future: F) -> Result<R, Error>
    where
        F: Future<Output = Result<R, Error>>,
    {
        let core = self.core();
        if core.defer_stop.get() != DeferStop::Unset {
            return future.await;
        }

        core.defer_stop.set(DeferStop::Armed);
        let _reset = ScopeGuard::new(|| core.defer_stop.set(DeferStop::Unset));

        let result = future.await;
        let requested = core.defer_stop.replace(DeferStop::Unset) == DeferStop::Requested;

        match result {
            // Already unwinding because of a stop, don't raise it twice.
            Err(Error::Stop) => Err(Error::Stop),
            _ if requested => {
                tracing::debug!(task = %self.id(), "raising deferred stop");
                Err(Error::Stop)
            }
            result => result,
        }
    }

    pub fn is_stop_deferred(&self) -> bool {
        self.core().defer_stop.get() == DeferStop::Requested
    }

    pub(crate) fn take_signal(&self) -> Option<Signal> {
        self.core().signal.take()
    }

    /// Surfaces a pending signal as an error. Every suspension point calls
    /// this before (re)registering itself.
    pub(crate) fn check_signal(&self) -> Result<(), Error> {
        match self.take_signal() {
            Some(signal) => Err(signal.into()),
            None => Ok(()),
        }
    }

    /// Drops a pending timeout that nobody observed.
    pub(crate) fn clear_timeout(&self) {
        let core = self.core();
        if core.signal.get() == Some(Signal::Timeout) {
            core.signal.set(None);
        }
    }

    pub fn into_handle<T>(self) -> JoinHandle<T> {
        JoinHandle::new(self)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for Task {}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.fmt(f)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("transient", &self.is_transient())
            .finish()
    }
}
