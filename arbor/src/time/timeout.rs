use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::Error;
use crate::runtime::Expiry;
use crate::task::{Signal, Task};

/// Future returned by [`with_timeout`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Timeout<'a, F> {
    task: &'a Task,
    #[pin]
    future: F,
    duration: Duration,
    expiry: Option<Expiry>,
}

/// Bounds `future` to `duration`.
///
/// When the timer fires the task receives [`Error::Timeout`] at its next
/// suspension point inside `future`. A future that does not observe it is
/// abandoned and the wrapper returns `Err(Error::Timeout)` itself.
pub fn with_timeout<F, T>(task: &Task, duration: Duration, future: F) -> Timeout<'_, F>
where
    F: Future<Output = Result<T, Error>>,
{
    Timeout {
        task,
        future,
        duration,
        expiry: None,
    }
}

impl<F, T> Future for Timeout<'_, F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.expiry.is_none() {
            *this.expiry = Expiry::new(this.task, *this.duration, Some(Signal::Timeout));
        }
        let fired = this.expiry.as_ref().is_some_and(Expiry::fired);

        match this.future.poll(cx) {
            Poll::Ready(output) => {
                // Completed before observing our signal, don't leak it into
                // whatever the task awaits next.
                if fired {
                    this.task.clear_timeout();
                }
                Poll::Ready(output)
            }
            Poll::Pending if fired => {
                this.task.clear_timeout();
                Poll::Ready(Err(Error::Timeout))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use crate::sync::Condition;
    use crate::time::sleep;
    use anyhow::Result;
    use std::rc::Rc;

    #[arbor::test]
    async fn test_completes_within_timeout(task: Task) -> Result<()> {
        let value = with_timeout(&task, Duration::from_secs(5), async {
            sleep(&task, Duration::from_millis(1)).await?;
            Ok(42)
        })
        .await?;

        assert_eq!(value, 42);
        assert_eq!(task.scheduler()?.core().num_timers(), 0);
        Ok(())
    }

    #[arbor::test]
    async fn test_signal_reaches_inner_wait(task: Task) -> Result<()> {
        let never = Rc::new(Condition::<()>::new());

        let res = with_timeout(&task, Duration::from_millis(2), never.wait(&task)).await;
        assert_eq!(res, Err(Error::Timeout));
        assert!(never.is_empty());

        // Nothing pending afterwards.
        sleep(&task, Duration::from_millis(1)).await?;
        Ok(())
    }

    #[arbor::test]
    async fn test_foreign_future_is_abandoned(task: Task) -> Result<()> {
        let res = with_timeout(&task, Duration::from_millis(2), async {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .await;

        assert_eq!(res, Err(Error::Timeout));
        sleep(&task, Duration::from_millis(1)).await?;
        Ok(())
    }
}
