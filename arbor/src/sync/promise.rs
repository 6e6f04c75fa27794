use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::Error;
use crate::runtime::Blocker;
use crate::task::Task;
use crate::time::Deadline;
use crate::utils::ScopeGuard;

enum Resolution<T> {
    Completed(Option<T>),
    Failed(Error),
    Cancelled,
}

impl<T: Clone> Resolution<T> {
    fn outcome(&self) -> Result<Option<T>, Error> {
        match self {
            Resolution::Completed(value) => Ok(value.clone()),
            Resolution::Failed(error) => Err(error.clone()),
            Resolution::Cancelled => Err(Error::Cancelled),
        }
    }
}

struct State<T> {
    resolution: Option<Resolution<T>>,
    waiting: usize,
    blockers: Vec<Blocker>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

/// A one-shot result cell, safe from any thread.
///
/// The first of [`Promise::resolve`], [`Promise::reject`] and
/// [`Promise::cancel`] wins, later calls are no-ops.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    resolution: None,
                    waiting: 0,
                    blockers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    fn settle(&self, resolution: Resolution<T>) -> bool {
        let mut state = self.inner.state.lock();
        if state.resolution.is_some() {
            return false;
        }

        state.resolution = Some(resolution);
        self.inner.resolved.notify_all();
        state.blockers.drain(..).for_each(|blocker| blocker.unblock());
        true
    }

    /// Returns false if the promise was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Resolution::Completed(Some(value)))
    }

    pub fn reject(&self, error: Error) -> bool {
        self.settle(Resolution::Failed(error))
    }

    pub fn cancel(&self) -> bool {
        self.settle(Resolution::Cancelled)
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().resolution.is_some()
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.inner.state.lock().resolution,
            Some(Resolution::Completed(_))
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.inner.state.lock().resolution,
            Some(Resolution::Failed(_))
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().resolution,
            Some(Resolution::Cancelled)
        )
    }

    /// Number of threads and tasks waiting for the resolution.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting
    }

    /// Resolves the promise with the outcome of `f`.
    ///
    /// A cancellation error cancels the promise, any other error rejects it. If
    /// `f` panics the promise is rejected before the panic resumes.
    pub fn fulfill<F>(&self, f: F)
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let mut on_panic = ScopeGuard::new(|| {
            self.reject(Error::failed("promise fulfillment panicked"));
        });
        let result = f();
        on_panic.disarm();

        self.settle_with(result);
    }

    /// Resolves the promise with the outcome of `future`.
    ///
    /// Dropping the returned future before it finishes resolves the promise to
    /// `None`, so it always ends up resolved.
    pub async fn fulfill_async<F>(&self, future: F)
    where
        F: Future<Output = Result<T, Error>>,
    {
        let _fallback = ScopeGuard::new(|| {
            if thread::panicking() {
                self.reject(Error::failed("promise fulfillment panicked"));
            } else {
                self.settle(Resolution::Completed(None));
            }
        });

        self.settle_with(future.await);
    }

    fn settle_with(&self, result: Result<T, Error>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) if error.is_cancellation() => self.cancel(),
            Err(error) => self.reject(error),
        };
    }
}

impl<T: Clone> Promise<T> {
    /// Blocks the calling thread until the promise is resolved, up to
    /// `timeout`.
    ///
    /// Fails with [`Error::Timeout`] if it is not resolved in time, with the
    /// stored error if it was rejected and with [`Error::Cancelled`] if it was
    /// cancelled.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<T>, Error> {
        let deadline = Deadline::start(timeout);
        let mut state = self.inner.state.lock();

        state.waiting += 1;
        let outcome = loop {
            if let Some(resolution) = &state.resolution {
                break resolution.outcome();
            }

            match deadline {
                None => self.inner.resolved.wait(&mut state),
                Some(deadline) if deadline.is_expired() => break Err(Error::Timeout),
                Some(deadline) => {
                    self.inner.resolved.wait_for(&mut state, deadline.remaining());
                }
            }
        };
        state.waiting -= 1;

        outcome
    }

    /// Like [`Promise::wait`], but suspends `task` instead of the thread.
    pub async fn wait_async(&self, task: &Task, timeout: Option<Duration>) -> Result<Option<T>, Error> {
        let scheduler = task.scheduler()?;
        let deadline = Deadline::start(timeout);

        loop {
            let block = {
                let mut state = self.inner.state.lock();
                if let Some(resolution) = &state.resolution {
                    return resolution.outcome();
                }
                if deadline.is_some_and(|d| d.is_expired()) {
                    return Err(Error::Timeout);
                }

                let block = scheduler.block(task, deadline.map(|d| d.remaining()));
                state.blockers.push(block.blocker());
                state.waiting += 1;
                block
            };

            let blocker = block.blocker();
            let _parked = ScopeGuard::new(|| {
                let mut state = self.inner.state.lock();
                state.waiting -= 1;
                state.blockers.retain(|b| !b.same(&blocker));
            });
            block.await?;
        }
    }

    /// The value, if the promise completed. Never blocks.
    pub fn value(&self) -> Option<T> {
        match &self.inner.state.lock().resolution {
            Some(Resolution::Completed(value)) => value.clone(),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let resolution = match &state.resolution {
            None => "pending",
            Some(Resolution::Completed(_)) => "completed",
            Some(Resolution::Failed(_)) => "failed",
            Some(Resolution::Cancelled) => "cancelled",
        };
        f.debug_struct("Promise")
            .field("resolution", &resolution)
            .field("waiting", &state.waiting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as arbor;
    use anyhow::Result;
    use rstest::rstest;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_first_resolution_wins() {
        let promise = Promise::new();
        assert!(promise.resolve("a"));
        assert!(!promise.resolve("b"));
        assert!(!promise.cancel());
        assert!(!promise.reject(Error::failed("late")));

        for _ in 0..3 {
            assert_eq!(promise.wait(None), Ok(Some("a")));
        }
        assert!(promise.is_completed());
        assert_eq!(promise.value(), Some("a"));
    }

    #[test]
    fn test_wait_timeout() {
        let promise = Promise::<u8>::new();
        assert_eq!(promise.wait(Some(Duration::from_millis(2))), Err(Error::Timeout));
        assert_eq!(promise.wait(Some(Duration::ZERO)), Err(Error::Timeout));
        assert!(!promise.is_resolved());
        assert_eq!(promise.waiting(), 0);
    }

    #[test]
    fn test_resolve_from_other_thread() {
        let promise = Promise::new();

        let p = promise.clone();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            p.resolve(7)
        });

        assert_eq!(promise.wait(None), Ok(Some(7)));
        assert!(resolver.join().expect("resolver panicked"));
    }

    #[rstest]
    #[case::value(Ok(1), Ok(Some(1)))]
    #[case::stop(Err(Error::Stop), Err(Error::Cancelled))]
    #[case::cancelled(Err(Error::Cancelled), Err(Error::Cancelled))]
    #[case::timeout(Err(Error::Timeout), Err(Error::Timeout))]
    fn test_fulfill(#[case] result: Result<u8, Error>, #[case] expected: Result<Option<u8>, Error>) {
        let promise = Promise::new();
        promise.fulfill(|| result);
        assert_eq!(promise.wait(None), expected);
    }

    #[test]
    fn test_fulfill_panic_rejects() {
        let promise = Promise::<u8>::new();

        let res = catch_unwind(AssertUnwindSafe(|| {
            promise.fulfill(|| panic!("boom"));
        }));
        assert!(res.is_err());
        assert!(promise.is_failed());
    }

    #[test]
    fn test_dropped_fulfill_async_resolves_to_none() {
        let promise = Promise::<u8>::new();

        let fut = promise.fulfill_async(futures::future::pending());
        drop(fut);
        // Never polled, nothing ran.
        assert!(!promise.is_resolved());

        let mut fut = Box::pin(promise.fulfill_async(futures::future::pending()));
        let waker = futures::task::noop_waker();
        assert!(
            fut.as_mut()
                .poll(&mut std::task::Context::from_waker(&waker))
                .is_pending()
        );
        drop(fut);

        assert!(promise.is_completed());
        assert_eq!(promise.value(), None);
    }

    #[arbor::test]
    async fn test_wait_async_resolved_by_thread(task: Task) -> Result<()> {
        let promise = Promise::new();

        let p = promise.clone();
        let resolver = thread::spawn(move || {
            while p.waiting() == 0 {
                thread::yield_now();
            }
            p.resolve("done")
        });

        assert_eq!(promise.wait_async(&task, None).await?, Some("done"));
        assert!(resolver.join().expect("resolver panicked"));
        assert_eq!(promise.waiting(), 0);
        Ok(())
    }

    #[arbor::test]
    async fn test_wait_async_cancelled_and_timeout(task: Task) -> Result<()> {
        let promise = Promise::<u8>::new();
        let res = promise
            .wait_async(&task, Some(Duration::from_millis(2)))
            .await;
        assert_eq!(res, Err(Error::Timeout));

        promise.cancel();
        assert_eq!(promise.wait_async(&task, None).await, Err(Error::Cancelled));
        Ok(())
    }
}
