// Public API
mod join;
pub use self::join::JoinHandle;

pub mod id;
pub use self::id::Id;

pub(crate) mod node;
pub use self::node::Node;
pub(crate) use self::node::NodeInner;

mod spawn;
pub use self::spawn::{SpawnBuilder, TaskOpts};

#[allow(clippy::module_inception)]
pub(crate) mod task;
pub use self::task::{Status, Task};
pub(crate) use self::task::{Signal, TaskCore, TaskFuture, Value};
