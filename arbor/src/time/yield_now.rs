use std::pin::Pin;
use std::task::{Context, Poll};

use crate::Error;
use crate::runtime::Runnable;
use crate::task::Task;

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow<'a> {
    task: &'a Task,
    awaiting_first_poll: bool,
}

/// Suspends `task` until the next iteration of the scheduler, letting
/// everything already queued run first.
pub fn yield_now(task: &Task) -> YieldNow<'_> {
    YieldNow {
        task,
        awaiting_first_poll: true,
    }
}

impl Future for YieldNow<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.task.check_signal()?;

        // Only yield on first poll. Next time the task is resumed we return.
        if this.awaiting_first_poll {
            this.awaiting_first_poll = false;
            this.task
                .inner()
                .schedule(Runnable::Resume(this.task.downgrade()));
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}
