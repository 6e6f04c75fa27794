//! Timers as seen from a task: bounded waits, sleeping and yielding.
mod deadline;
pub use deadline::Deadline;

mod sleep;
pub use sleep::{Sleep, sleep};

mod timeout;
pub use timeout::{Timeout, with_timeout};

mod yield_now;
pub use yield_now::{YieldNow, yield_now};
