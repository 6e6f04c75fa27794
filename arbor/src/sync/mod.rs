//! Synchronization primitives.
//!
//! [`Condition`], [`Notification`], [`Semaphore`], [`Barrier`] and [`Waiter`]
//! belong to one scheduler and suspend tasks through a FIFO wait list.
//! [`Queue`], [`PriorityQueue`] and [`Promise`] are also reachable from other
//! threads and pair a mutex with a condition variable.

mod condition;
pub use condition::{Condition, Notification, Wait};

mod semaphore;
pub use semaphore::{Semaphore, SemaphoreGuard};

mod barrier;
pub use barrier::{Barrier, LimitedBarrier};

mod waiter;
pub use waiter::Waiter;

mod queue;
pub use queue::{LimitedQueue, Queue};

mod priority_queue;
pub use priority_queue::PriorityQueue;

mod promise;
pub use promise::Promise;
