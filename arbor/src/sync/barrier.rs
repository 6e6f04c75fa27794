use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crate::Error;
use crate::list::{Link, List};
use crate::sync::Notification;
use crate::task::{JoinHandle, Node, Task};
use crate::utils::ScopeGuard;

struct Inner {
    /// Children that have not been collected by a wait yet, in spawn order.
    tracked: RefCell<List<Task>>,

    /// Finished children, in completion order.
    done: RefCell<VecDeque<Link>>,

    closed: Cell<bool>,

    // Scheduled rather than transferred, a waiter must only run once the
    // child has recorded its final status.
    finished: Notification<()>,
}

impl Inner {
    fn finished(&self, link: Link) {
        self.done.borrow_mut().push_back(link);
        self.finished.signal(());
    }

    fn pop_done(&self) -> Option<Task> {
        loop {
            let link = self.done.borrow_mut().pop_front()?;
            let removed = self.tracked.borrow_mut().remove(link);
            if let Ok(task) = removed {
                return Some(task);
            }
        }
    }
}

/// Tracks a group of child tasks and waits for them in completion order.
#[derive(Clone)]
pub struct Barrier {
    inner: Rc<Inner>,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                tracked: RefCell::new(List::new()),
                done: RefCell::new(VecDeque::new()),
                closed: Cell::new(false),
                finished: Notification::new(),
            }),
        }
    }

    /// Spawns a child of `parent` and tracks it until a wait collects it.
    ///
    /// Fails with [`Error::Closed`] once the barrier was stopped.
    pub fn spawn<F, Fut, T>(&self, parent: &Node, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }

        let slot = Rc::new(Cell::new(None::<Link>));
        let inner: Weak<Inner> = Rc::downgrade(&self.inner);

        let handle = parent.spawn_builder().task({
            let slot = Rc::clone(&slot);
            move |task| async move {
                // Runs on success, failure and stop alike.
                let _done = ScopeGuard::new(move || {
                    if let (Some(inner), Some(link)) = (inner.upgrade(), slot.get()) {
                        inner.finished(link);
                    }
                });
                f(task).await
            }
        });

        let link = self
            .inner
            .tracked
            .borrow_mut()
            .push_back(handle.task().clone());
        slot.set(Some(link));

        handle.launch();
        Ok(handle)
    }

    /// Suspends `task` until every tracked child finished, collecting them in
    /// completion order.
    ///
    /// The first failure is re-raised. Children that finished after it stay
    /// queued for the next wait.
    pub async fn wait(&self, task: &Task) -> Result<(), Error> {
        self.wait_with(task, |child| child.failure().map_or(Ok(()), Err))
            .await
    }

    /// Like [`Barrier::wait`], but hands each finished child to `handler`
    /// instead of re-raising its failure. An error from `handler` ends the
    /// wait.
    pub async fn wait_with<H>(&self, task: &Task, mut handler: H) -> Result<(), Error>
    where
        H: FnMut(Task) -> Result<(), Error>,
    {
        loop {
            while let Some(child) = self.inner.pop_done() {
                handler(child)?;
            }

            if self.inner.tracked.borrow().is_empty() {
                return Ok(());
            }
            self.inner.finished.wait(task).await?;
        }
    }

    /// Suspends `task` until `n` tracked children finished and returns them
    /// in completion order. The others stay tracked.
    pub(crate) async fn wait_for(&self, task: &Task, n: usize) -> Result<Vec<Task>, Error> {
        let n = n.min(self.len());

        while self.inner.done.borrow().len() < n {
            self.inner.finished.wait(task).await?;
        }

        Ok((0..n).filter_map(|_| self.inner.pop_done()).collect())
    }

    /// Stops every tracked child and closes the barrier to new spawns.
    ///
    /// Every child is stopped even if one of them fails to, the first such
    /// error is returned.
    pub fn stop(&self) -> Result<(), Error> {
        self.inner.closed.set(true);

        let children: Vec<Task> = self.inner.tracked.borrow().iter().cloned().collect();
        tracing::debug!(children = children.len(), "stopping barrier");

        let mut first_error = None;
        for child in children {
            if let Err(error) = child.stop(false) {
                first_error.get_or_insert(error);
            }
        }

        // Wake a waiter even if nothing stopped synchronously.
        self.inner.finished.signal(());
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Number of children not collected yet, finished or not.
    pub fn len(&self) -> usize {
        self.inner.tracked.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("tracked", &self.len())
            .field("done", &self.inner.done.borrow().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A [`Barrier`] that can be drained a few completions at a time.
#[derive(Clone, Debug, Default)]
pub struct LimitedBarrier {
    barrier: Barrier,
}

impl LimitedBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first `n` children to finish, in completion order. Later
    /// calls continue where the previous one stopped.
    ///
    /// Failures are not re-raised, inspect the returned tasks.
    pub async fn wait_for(&self, task: &Task, n: usize) -> Result<Vec<Task>, Error> {
        self.barrier.wait_for(task, n).await
    }
}

impl Deref for LimitedBarrier {
    type Target = Barrier;

    fn deref(&self) -> &Self::Target {
        &self.barrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use crate::time::sleep;
    use anyhow::Result;
    use std::time::Duration;

    fn spawn_sleeper(barrier: &Barrier, parent: &Task, i: u64, ms: u64) -> JoinHandle<u64> {
        barrier
            .spawn(parent, move |t| async move {
                sleep(&t, Duration::from_millis(ms)).await?;
                Ok(i)
            })
            .expect("barrier open")
    }

    #[arbor::test]
    async fn test_collects_in_completion_order(task: Task) -> Result<()> {
        let barrier = Barrier::new();
        let children: Vec<_> = [5, 1, 4, 2, 3]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| spawn_sleeper(&barrier, &task, i as u64, ms * 3))
            .collect();
        assert_eq!(barrier.len(), 5);

        let mut order = Vec::new();
        barrier
            .wait_with(&task, |child| {
                order.push(child.id());
                Ok(())
            })
            .await?;

        let expected: Vec<_> = [1, 3, 4, 2, 0].iter().map(|&i| children[i].id()).collect();
        assert_eq!(order, expected);
        assert!(barrier.is_empty());
        Ok(())
    }

    #[arbor::test]
    async fn test_wait_reraises_failure(task: Task) -> Result<()> {
        let barrier = Barrier::new();
        spawn_sleeper(&barrier, &task, 0, 5);
        let failing = barrier.spawn(&task, |t| async move {
            sleep(&t, Duration::from_millis(1)).await?;
            Err::<(), _>(Error::failed("boom"))
        })?;

        let res = barrier.wait(&task).await;
        assert_eq!(res, Err(failing.failure().expect("failed")));

        // The sleeper is still tracked, a second wait picks it up.
        assert_eq!(barrier.len(), 1);
        barrier.wait(&task).await?;
        assert!(barrier.is_empty());
        Ok(())
    }

    #[arbor::test]
    async fn test_stop_during_wait_does_not_hang(task: Task) -> Result<()> {
        let barrier = Barrier::new();
        let children: Vec<_> = (0..3)
            .map(|i| spawn_sleeper(&barrier, &task, i, 60_000))
            .collect();

        let b = barrier.clone();
        let waiter = task.spawn(move |t| async move { b.wait(&t).await });

        let b = barrier.clone();
        task.spawn(move |t| async move {
            sleep(&t, Duration::from_millis(1)).await?;
            b.stop()
        });

        waiter.wait(&task).await?;
        assert!(children.iter().all(|c| c.is_stopped()));
        assert!(barrier.is_empty());
        assert_eq!(
            barrier.spawn(&task, |_| async { Ok(()) }).err(),
            Some(Error::Closed)
        );
        Ok(())
    }

    #[arbor::test]
    async fn test_limited_wait_for_leaves_rest_tracked(task: Task) -> Result<()> {
        let barrier = LimitedBarrier::new();
        let children: Vec<_> = [3, 1, 2]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| spawn_sleeper(&barrier, &task, i as u64, ms * 3))
            .collect();

        let first = barrier.wait_for(&task, 2).await?;
        assert_eq!(first, vec![children[1].task().clone(), children[2].task().clone()]);
        assert_eq!(barrier.len(), 1);

        // Asking for more than what is tracked is capped.
        let rest = barrier.wait_for(&task, 10).await?;
        assert_eq!(rest, vec![children[0].task().clone()]);
        assert!(barrier.is_empty());
        Ok(())
    }
}
