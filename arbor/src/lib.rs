#[doc(inline)]
pub use arbor_macros::main;

#[doc(inline)]
pub use arbor_macros::test;

mod error;
pub use error::Error;

pub mod list;

pub mod runtime;
pub use runtime::{Builder, Scheduler};

pub mod sync;

pub mod task;
pub use task::{Id, JoinHandle, Node, SpawnBuilder, Status, Task, TaskOpts};

pub mod time;

mod utils;
