use std::time::{Duration, Instant};

/// Remaining-time accounting for a bounded wait that may block several times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// A zero timeout: never block.
    Zero,

    At(Instant),
}

impl Deadline {
    /// `None` means no deadline at all.
    pub fn start(timeout: Option<Duration>) -> Option<Deadline> {
        timeout.map(|timeout| {
            if timeout.is_zero() {
                Deadline::Zero
            } else {
                Deadline::At(Instant::now() + timeout)
            }
        })
    }

    pub fn remaining(&self) -> Duration {
        match self {
            Deadline::Zero => Duration::ZERO,
            Deadline::At(at) => at.saturating_duration_since(Instant::now()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_timeout_means_no_deadline() {
        assert_eq!(Deadline::start(None), None);
    }

    #[test]
    fn test_zero_timeout_is_expired() {
        let deadline = Deadline::start(Some(Duration::ZERO)).expect("deadline");
        assert_eq!(deadline, Deadline::Zero);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_decreases() {
        let deadline = Deadline::start(Some(Duration::from_millis(20))).expect("deadline");
        let first = deadline.remaining();
        assert!(first <= Duration::from_millis(20));
        assert!(!deadline.is_expired());

        std::thread::sleep(Duration::from_millis(25));
        assert!(deadline.is_expired());
    }
}
