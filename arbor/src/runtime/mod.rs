//! The scheduler: run loop, timers, the selector boundary and the handles
//! that reach it from other threads.

// Public API
mod builder;
pub use builder::Builder;

mod scheduler;
pub use scheduler::Scheduler;
pub(crate) use scheduler::{Runnable, SchedulerCore};

mod block;
pub use block::{Block, IoWait};

pub mod selector;
pub use selector::{Interest, Selector};

mod poll;
pub use poll::PollSelector;

mod park;
pub use park::ParkSelector;

mod timers;
pub use timers::Timer;
pub(crate) use timers::Expiry;

mod waker;
pub use waker::{Blocker, Handle};

#[cfg(test)]
mod tests;
