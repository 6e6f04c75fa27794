use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::Error;
use crate::runtime::Expiry;
use crate::task::Task;

/// Future returned by [`sleep`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep<'a> {
    task: &'a Task,
    duration: Duration,
    expiry: Option<Expiry>,
}

/// Suspends `task` for `duration`. A zero duration resumes on the next
/// iteration of the scheduler.
pub fn sleep(task: &Task, duration: Duration) -> Sleep<'_> {
    Sleep {
        task,
        duration,
        expiry: None,
    }
}

impl Future for Sleep<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.task.check_signal()?;

        match &this.expiry {
            Some(expiry) if expiry.fired() => Poll::Ready(Ok(())),
            Some(_) => Poll::Pending,
            None => {
                this.expiry = Some(Expiry::new(this.task, this.duration, None).ok_or(Error::Closed)?);
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use anyhow::Result;
    use std::time::Instant;

    #[arbor::test]
    async fn test_sleep_lasts_at_least_duration(task: Task) -> Result<()> {
        for duration in [Duration::from_micros(100), Duration::from_millis(2)] {
            let start = Instant::now();
            sleep(&task, duration).await?;

            let elapsed = start.elapsed();
            assert!(elapsed >= duration, "slept {elapsed:?}, expected >= {duration:?}");
            // Generous margin for loaded machines.
            assert!(elapsed < duration + Duration::from_millis(50));
        }
        Ok(())
    }

    #[arbor::test]
    async fn test_zero_sleep_resumes_next_iteration(task: Task) -> Result<()> {
        sleep(&task, Duration::ZERO).await?;
        Ok(())
    }

    #[arbor::test]
    async fn test_stopped_sleeper_cancels_timer(task: Task) -> Result<()> {
        let scheduler = task.scheduler()?;
        let sleeper = task.spawn(|t| async move { sleep(&t, Duration::from_secs(60)).await });
        assert_eq!(scheduler.core().num_timers(), 1);

        sleeper.stop(false)?;
        assert!(sleeper.is_stopped());
        assert_eq!(scheduler.core().num_timers(), 0);
        Ok(())
    }
}
