use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;
use crate::runtime::poll::PollSelector;
use crate::runtime::selector::Selector;
use crate::runtime::Scheduler;

/// Window over which the load metric is normalized.
const LOAD_WINDOW: Duration = Duration::from_secs(1);

/// Initial capacity of the ready queue.
const READY_CAPACITY: usize = 64;

/// Configures and creates a [`Scheduler`].
///
/// ```no_run
/// use arbor::runtime::Builder;
/// use std::time::Duration;
///
/// let scheduler = Builder::new()
///     .load_window(Duration::from_millis(500))
///     .try_build()?;
/// # Ok::<(), arbor::Error>(())
/// ```
pub struct Builder {
    /// Once busy + idle time exceeds this, both are rescaled to fit.
    load_window: Duration,

    /// Defaults to a [`PollSelector`], created by `try_build`.
    selector: Option<Arc<dyn Selector>>,

    ready_capacity: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            load_window: LOAD_WINDOW,
            selector: None,
            ready_capacity: READY_CAPACITY,
        }
    }

    #[track_caller]
    pub fn load_window(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "load_window must be greater than 0");
        self.load_window = val;
        self
    }

    pub fn selector(mut self, selector: impl Selector + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    #[track_caller]
    pub fn ready_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "ready_capacity must be greater than 0");
        self.ready_capacity = val;
        self
    }

    /// Creates the configured scheduler, ready to spawn tasks.
    pub fn try_build(self) -> Result<Scheduler, Error> {
        let cfg = SchedulerConfig::try_from(self)?;
        tracing::debug!(load_window = ?cfg.load_window, "scheduler created");
        Ok(Scheduler::new(cfg))
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("load_window", &self.load_window)
            .field("custom_selector", &self.selector.is_some())
            .field("ready_capacity", &self.ready_capacity)
            .finish()
    }
}

/// The validated builder, consumed by the scheduler.
pub(crate) struct SchedulerConfig {
    pub(crate) load_window: Duration,
    pub(crate) selector: Arc<dyn Selector>,
    pub(crate) ready_capacity: usize,
}

impl TryFrom<Builder> for SchedulerConfig {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let selector = match builder.selector {
            Some(selector) => selector,
            None => Arc::new(PollSelector::new().map_err(Error::selector)?),
        };

        Ok(SchedulerConfig {
            load_window: builder.load_window,
            selector,
            ready_capacity: builder.ready_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ParkSelector;

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let cfg = SchedulerConfig::try_from(Builder::new())?;
        assert_eq!(cfg.load_window, LOAD_WINDOW);
        assert_eq!(cfg.ready_capacity, READY_CAPACITY);
        Ok(())
    }

    #[test]
    fn test_custom_selector() -> anyhow::Result<()> {
        let scheduler = Builder::new()
            .selector(ParkSelector::new())
            .ready_capacity(4)
            .try_build()?;
        assert!(!scheduler.run_once(None)?);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "load_window must be greater than 0")]
    fn test_zero_load_window_panics() {
        let _ = Builder::new().load_window(Duration::ZERO);
    }
}
