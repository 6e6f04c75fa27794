//! Creating tasks under a node of the tree.
//!
//! Tasks are spawned with [`Node::spawn`] for default behavior, or configured
//! first through the [`SpawnBuilder`] returned by [`Node::spawn_builder`].
use std::borrow::Cow;
use std::rc::Rc;

use bitflags::bitflags;

use crate::Error;
use crate::task::node::NodeInner;
use crate::task::{JoinHandle, Node, Task};

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed via [SpawnBuilder::with_opts].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u8 {
        /// The task does not count towards its parent being finished.
        ///
        /// It may outlive the parent's natural completion, but is still
        /// force-stopped when the scheduler closes.
        const TRANSIENT = 1;

        /// The task is attached to the scheduler root instead of the node it
        /// was spawned from, so stopping that node does not reach it.
        const DETACHED = 1 << 1;
    }
}

impl TaskOpts {
    pub(crate) fn is_transient(&self) -> bool {
        self.contains(TaskOpts::TRANSIENT)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.contains(TaskOpts::DETACHED)
    }
}

/// Builder for configuring and spawning a task.
///
/// # Example
///
/// ```no_run
/// # fn demo(task: arbor::Task) {
/// use arbor::TaskOpts;
///
/// task.spawn_builder()
///     .with_opts(TaskOpts::TRANSIENT)
///     .with_annotation("heartbeat")
///     .spawn(|me| async move {
///         arbor::time::sleep(&me, std::time::Duration::from_secs(1)).await?;
///         Ok::<_, arbor::Error>(())
///     });
/// # }
/// ```
#[must_use = "a SpawnBuilder does nothing until `task` or `spawn` is called"]
pub struct SpawnBuilder<'a> {
    parent: &'a Node,
    opts: TaskOpts,
    annotation: Option<Cow<'static, str>>,
}

impl<'a> SpawnBuilder<'a> {
    pub(crate) fn new(parent: &'a Node) -> Self {
        Self {
            parent,
            opts: TaskOpts::default(),
            annotation: None,
        }
    }

    pub fn with_opts(mut self, opts: TaskOpts) -> Self {
        self.opts |= opts;
        self
    }

    pub fn transient(self) -> Self {
        self.with_opts(TaskOpts::TRANSIENT)
    }

    pub fn with_annotation(mut self, annotation: impl Into<Cow<'static, str>>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Creates the task without running it.
    pub fn task<F, Fut, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let parent = if self.opts.is_detached() {
            root_of(&self.parent.inner)
        } else {
            Rc::clone(&self.parent.inner)
        };

        let task = Task::new(
            &parent,
            self.opts.is_transient(),
            Box::new(move |task: Task| -> crate::task::TaskFuture {
                let fut = f(task);
                Box::pin(async move {
                    let value = fut.await?;
                    Ok(Rc::new(value) as crate::task::Value)
                })
            }),
        );

        if let Some(annotation) = self.annotation {
            task.annotate(annotation);
        }

        JoinHandle::new(task)
    }

    /// Creates the task and runs it until its first suspension point.
    ///
    /// A failure raised before that point is stored on the task for a later
    /// `wait`, it is not returned here.
    pub fn spawn<F, Fut, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let handle = self.task(f);
        handle.launch();
        handle
    }
}

fn root_of(node: &Rc<NodeInner>) -> Rc<NodeInner> {
    let mut current = Rc::clone(node);
    while let Some(parent) = current.parent() {
        current = parent;
    }
    current
}

impl Node {
    /// Creates an initialized task under this node. Start it with
    /// [`Task::run`].
    pub fn task<F, Fut, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        self.spawn_builder().task(f)
    }

    /// Spawns a task under this node with default options.
    pub fn spawn<F, Fut, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Task) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        self.spawn_builder().spawn(f)
    }

    pub fn spawn_builder(&self) -> SpawnBuilder<'_> {
        SpawnBuilder::new(self)
    }
}
