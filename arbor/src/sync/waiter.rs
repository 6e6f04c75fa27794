use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::Error;
use crate::sync::Notification;
use crate::task::{JoinHandle, Node, Task};
use crate::utils::ScopeGuard;

struct Inner {
    done: RefCell<VecDeque<Task>>,
    outstanding: Cell<usize>,
    finished: Notification<()>,
}

/// Collects children as they finish, for "first N of M" fan-in.
#[derive(Clone)]
pub struct Waiter {
    inner: Rc<Inner>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                done: RefCell::new(VecDeque::new()),
                outstanding: Cell::new(0),
                finished: Notification::new(),
            }),
        }
    }

    pub fn spawn<F, Fut, T>(&self, parent: &Node, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let inner: Weak<Inner> = Rc::downgrade(&self.inner);
        self.inner.outstanding.set(self.inner.outstanding.get() + 1);

        parent.spawn(move |task| async move {
            let me = task.clone();
            let _done = ScopeGuard::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.outstanding.set(inner.outstanding.get() - 1);
                    inner.done.borrow_mut().push_back(me);
                    inner.finished.signal(());
                }
            });
            f(task).await
        })
    }

    /// Suspends `task` until `n` children finished and takes them, in
    /// completion order. `n` is capped at what this waiter can still deliver.
    pub async fn first(&self, task: &Task, n: usize) -> Result<Vec<Task>, Error> {
        let n = n.min(self.inner.done.borrow().len() + self.inner.outstanding.get());

        while self.inner.done.borrow().len() < n {
            self.inner.finished.wait(task).await?;
        }

        Ok(self.inner.done.borrow_mut().drain(..n).collect())
    }

    /// Like [`Waiter::first`], then re-raises the first failure among the
    /// collected children.
    pub async fn wait(&self, task: &Task, n: usize) -> Result<Vec<Task>, Error> {
        let children = self.first(task, n).await?;
        for child in &children {
            child.wait(task).await?;
        }
        Ok(children)
    }

    /// Children still running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.get()
    }

    /// Finished children not taken yet.
    pub fn ready(&self) -> usize {
        self.inner.done.borrow().len()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("outstanding", &self.outstanding())
            .field("ready", &self.ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use crate::time::sleep;
    use anyhow::Result;
    use std::time::Duration;

    #[arbor::test]
    async fn test_first_preserves_completion_order(task: Task) -> Result<()> {
        let waiter = Waiter::new();
        let children: Vec<_> = [4, 1, 3, 2]
            .into_iter()
            .map(|ms| {
                waiter.spawn(&task, move |t| async move {
                    sleep(&t, Duration::from_millis(ms * 3)).await?;
                    Ok(ms)
                })
            })
            .collect();

        let first = waiter.first(&task, 2).await?;
        assert_eq!(first, vec![children[1].task().clone(), children[3].task().clone()]);
        assert_eq!(waiter.outstanding() + waiter.ready(), 2);

        let rest = waiter.first(&task, 5).await?;
        assert_eq!(rest, vec![children[2].task().clone(), children[0].task().clone()]);

        // Nothing left to deliver.
        assert!(waiter.first(&task, 1).await?.is_empty());
        Ok(())
    }

    #[arbor::test]
    async fn test_wait_reraises_failure(task: Task) -> Result<()> {
        let waiter = Waiter::new();
        let failing = waiter.spawn(&task, |_| async { Err::<(), _>(Error::failed("nope")) });
        waiter.spawn(&task, |t| async move { sleep(&t, Duration::from_millis(1)).await });

        let res = waiter.wait(&task, 1).await;
        assert_eq!(res, Err(failing.failure().expect("failed")));
        assert_eq!(waiter.outstanding(), 1);
        Ok(())
    }
}
