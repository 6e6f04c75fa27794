use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::Error;
use crate::task::{Status, Task};

/// Typed handle to a spawned task.
///
/// Dereferences to [`Task`]. Dropping the handle does not stop the task, the
/// tree keeps it alive until it finishes.
pub struct JoinHandle<T> {
    task: Task,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Task) -> Self {
        Self {
            task,
            _marker: PhantomData,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }
}

impl<T: Clone + 'static> JoinHandle<T> {
    /// Suspends `caller` until the task finishes.
    ///
    /// Returns `Some(value)` if it completed and `None` if it was stopped. A
    /// failure is re-raised, every call hands out the same stored error.
    pub async fn wait(&self, caller: &Task) -> Result<Option<T>, Error> {
        self.task.join(caller).await?;
        self.outcome()
    }

    /// Non-blocking view of the outcome. `None` until the task completed.
    pub fn result(&self) -> Option<T> {
        self.outcome().ok().flatten()
    }

    fn outcome(&self) -> Result<Option<T>, Error> {
        match self.task.status() {
            Status::Completed => Ok(self
                .task
                .value()
                .and_then(|value| value.downcast_ref::<T>().cloned())),
            Status::Failed => match self.task.failure() {
                Some(error) => Err(error),
                None => Ok(None),
            },
            Status::Initialized | Status::Running | Status::Stopped => Ok(None),
        }
    }
}

impl<T> Deref for JoinHandle<T> {
    type Target = Task;

    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

impl<T> Clone for JoinHandle<T> {
    fn clone(&self) -> Self {
        Self::new(self.task.clone())
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JoinHandle").field(&self.task).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate as arbor;
    use crate::sync::Condition;
    use crate::{Error, Task};
    use anyhow::Result;
    use std::rc::Rc;

    #[arbor::test]
    async fn test_wait_returns_value(task: Task) -> Result<()> {
        let gate = Rc::new(Condition::<()>::new());

        let g = Rc::clone(&gate);
        let child = task.spawn(move |t| async move {
            g.wait(&t).await?;
            Ok(String::from("done"))
        });
        assert_eq!(child.result(), None);

        gate.signal(());
        assert_eq!(child.wait(&task).await?, Some(String::from("done")));
        assert_eq!(child.result(), Some(String::from("done")));
        Ok(())
    }

    #[arbor::test]
    async fn test_repeated_wait_returns_same_failure(task: Task) -> Result<()> {
        let gate = Rc::new(Condition::<()>::new());

        let g = Rc::clone(&gate);
        let child = task.spawn(move |t| async move {
            g.wait(&t).await?;
            Err::<(), _>(Error::failed("boom"))
        });

        // Waiting before the failure suppresses the unhandled warning.
        let waiter = {
            let child = child.clone();
            task.spawn(move |t| async move { child.wait(&t).await })
        };

        gate.signal(());
        assert!(child.is_failed());
        assert!(waiter.is_failed());

        let first = child.wait(&task).await.unwrap_err();
        let second = child.wait(&task).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(waiter.failure(), Some(first.clone()));
        assert!(first.to_string().contains("boom"));
        assert_eq!(child.result(), None);
        Ok(())
    }

    #[arbor::test]
    async fn test_wait_on_stopped_task(task: Task) -> Result<()> {
        let gate = Rc::new(Condition::<()>::new());

        let g = Rc::clone(&gate);
        let child = task.spawn(move |t| async move {
            g.wait(&t).await?;
            Ok(1)
        });
        child.stop(false)?;

        assert!(child.is_stopped());
        assert_eq!(child.wait(&task).await?, None);
        assert!(gate.is_empty());
        Ok(())
    }

    #[arbor::test]
    async fn test_wait_on_self_is_a_deadlock(task: Task) -> Result<()> {
        let child = task.spawn(|me| async move {
            let err = me.wait(&me).await.unwrap_err();
            assert_eq!(err, Error::Deadlock);
            Ok(())
        });
        assert!(child.is_completed());

        assert_eq!(task.wait(&task).await, Err(Error::Deadlock));
        Ok(())
    }

    #[arbor::test]
    async fn test_run_twice_is_rejected(task: Task) -> Result<()> {
        let child = task.task(|_| async move { Ok(()) });
        assert!(child.status() == crate::task::Status::Initialized);

        child.run()?;
        assert!(child.is_completed());
        assert_eq!(child.run(), Err(Error::AlreadyRunning));
        Ok(())
    }

    #[arbor::test]
    async fn test_run_surfaces_synchronous_failure(task: Task) -> Result<()> {
        let child = task.task(|_| async move { Err::<(), _>(Error::failed("early")) });

        let err = child.run().unwrap_err();
        assert!(child.is_failed());
        assert_eq!(child.wait(&task).await, Err(err));
        Ok(())
    }
}
