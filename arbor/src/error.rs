use std::io;
use std::sync::Arc;

/// The error type shared by tasks, the scheduler and every sync primitive.
///
/// `Error` is cheap to clone so that a stored task failure can be handed to
/// every caller of `wait()`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// A recoverable error raised inside a task body.
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// Cooperative cancellation. Absorbed at the task boundary, where the task
    /// is recorded as stopped instead of failed.
    #[error("task was stopped")]
    Stop,

    #[error("operation timed out")]
    Timeout,

    /// The queue, barrier or scheduler backing this operation was closed.
    #[error("operation on a closed resource")]
    Closed,

    /// A promise was cancelled before it produced a value.
    #[error("promise was cancelled")]
    Cancelled,

    #[error("task is already running")]
    AlreadyRunning,

    /// A task tried to wait on itself.
    #[error("cannot wait on own task")]
    Deadlock,

    #[error("closing scheduler with {blocked} blocked operations")]
    BlockedOnClose { blocked: usize },

    /// The run loop observed an interrupt requested through `Handle::interrupt`.
    #[error("scheduler was interrupted")]
    Interrupted,

    #[error("selector error: {0}")]
    Selector(Arc<io::Error>),
}

impl Error {
    /// Wraps an ad-hoc message as a task failure.
    pub fn failed(msg: impl std::fmt::Display + Send + Sync + 'static) -> Self {
        Error::Failed(Arc::new(anyhow::anyhow!("{msg}")))
    }

    pub(crate) fn selector(err: io::Error) -> Self {
        Error::Selector(Arc::new(err))
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stop)
    }

    /// Errors that resolve a promise to "cancelled" rather than "failed".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Stop | Error::Cancelled)
    }

    /// Errors worth another attempt: a timed out operation, or a selector
    /// wait cut short by a signal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Selector(e) => {
                matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Failed(Arc::new(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Failed(Arc::new(err.into()))
    }
}

// Failures only compare equal when they are the same stored failure, which is
// what repeated `wait()` calls hand out.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Failed(a), Error::Failed(b)) => Arc::ptr_eq(a, b),
            (Error::Selector(a), Error::Selector(b)) => Arc::ptr_eq(a, b),
            (Error::BlockedOnClose { blocked: a }, Error::BlockedOnClose { blocked: b }) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stop(Error::Stop, true)]
    #[case::cancelled(Error::Cancelled, true)]
    #[case::timeout(Error::Timeout, false)]
    #[case::failed(Error::failed("boom"), false)]
    fn test_is_cancellation(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(err.is_cancellation(), expected);
    }

    #[rstest]
    #[case::timeout(Error::Timeout, true)]
    #[case::eintr(Error::selector(io::Error::from_raw_os_error(libc::EINTR)), true)]
    #[case::eagain(Error::selector(io::Error::from_raw_os_error(libc::EAGAIN)), true)]
    #[case::ebadf(Error::selector(io::Error::from_raw_os_error(libc::EBADF)), false)]
    #[case::stop(Error::Stop, false)]
    fn test_is_retryable(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn test_failures_compare_by_identity() {
        let a = Error::failed("boom");
        let b = Error::failed("boom");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(Error::Stop, Error::Stop);
        assert_ne!(Error::Stop, Error::Timeout);
    }

    #[test]
    fn test_io_error_becomes_failure() {
        let err: Error = io::Error::other("disk on fire").into();
        assert!(matches!(err, Error::Failed(_)));
        assert!(err.to_string().contains("disk on fire"));
    }
}
