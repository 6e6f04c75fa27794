use smallvec::SmallVec;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::Error;
use crate::list::{Link, List};
use crate::runtime::SchedulerCore;
use crate::task::{Id, Task, TaskCore};

/// Most nodes have a handful of children, snapshots stay on the stack.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 8;

pub(crate) type Snapshot = SmallVec<[Rc<NodeInner>; SPILL_TO_HEAP_THRESHOLD]>;

pub(crate) enum Kind {
    /// The scheduler itself.
    Root,

    /// A grouping node with no execution context of its own.
    Plain,

    Task(TaskCore),
}

// We implement structured concurrency by tracking the parent<->children
// relationship of every unit of work. Cancellation fans out through this tree,
// so nobody has to pass tokens around.
pub(crate) struct NodeInner {
    pub(crate) id: Id,

    transient: bool,

    annotation: RefCell<Option<Cow<'static, str>>>,

    // A weak reference to the parent. This MUST be Weak to prevent reference
    // cycles. It is swapped when `consume` re-parents us onto a grandparent.
    parent: RefCell<Option<Weak<NodeInner>>>,

    // Children own their subtree. Insertion order is creation order, which is
    // also the order `stop` visits them in.
    children: RefCell<List<Rc<NodeInner>>>,

    // Number of transient entries in `children`. A node is finished once every
    // remaining child is transient.
    transient_children: Cell<usize>,

    // Our position in the parent's children list.
    link: Cell<Option<Link>>,

    pub(crate) scheduler: Weak<SchedulerCore>,

    pub(crate) kind: Kind,
}

impl NodeInner {
    pub(crate) fn new_root(scheduler: Weak<SchedulerCore>) -> Rc<Self> {
        Rc::new(Self::detached(Id::next(), false, scheduler, Kind::Root))
    }

    /// `kind` receives the id of the new node.
    pub(crate) fn new_child(
        parent: &Rc<NodeInner>,
        transient: bool,
        kind: impl FnOnce(Id) -> Kind,
    ) -> Rc<Self> {
        let id = Id::next();
        let child = Rc::new(Self::detached(id, transient, parent.scheduler.clone(), kind(id)));
        parent.add_child(Rc::clone(&child));
        child
    }

    fn detached(id: Id, transient: bool, scheduler: Weak<SchedulerCore>, kind: Kind) -> Self {
        Self {
            id,
            transient,
            annotation: RefCell::new(None),
            parent: RefCell::new(None),
            children: RefCell::new(List::new()),
            transient_children: Cell::new(0),
            link: Cell::new(None),
            scheduler,
            kind,
        }
    }

    pub(crate) fn task_core(&self) -> Option<&TaskCore> {
        match &self.kind {
            Kind::Task(core) => Some(core),
            _ => None,
        }
    }

    pub(crate) fn is_transient(&self) -> bool {
        self.transient
    }

    pub(crate) fn parent(&self) -> Option<Rc<NodeInner>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: Option<Weak<NodeInner>>) {
        *self.parent.borrow_mut() = parent;
    }

    pub(crate) fn add_child(self: &Rc<Self>, child: Rc<NodeInner>) {
        debug_assert!(child.link.get().is_none(), "node already has a parent");

        child.set_parent(Some(Rc::downgrade(self)));
        if child.transient {
            self.transient_children.set(self.transient_children.get() + 1);
        }

        let node = Rc::clone(&child);
        let link = self.children.borrow_mut().push_back(node);
        child.link.set(Some(link));
    }

    pub(crate) fn remove_child(&self, child: &NodeInner) {
        let Some(link) = child.link.take() else {
            return;
        };

        // Keep the removed handle alive until the borrow is released, the
        // drop may run arbitrary destructors.
        let removed = self.children.borrow_mut().remove(link);
        if removed.is_ok() && child.transient {
            self.transient_children.set(self.transient_children.get() - 1);
        }
        child.set_parent(None);
        drop(removed);
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.children.borrow().iter().cloned().collect()
    }

    pub(crate) fn num_children(&self) -> usize {
        self.children.borrow().len()
    }

    /// All non-transient children are gone, and for a task both the body and
    /// the execution context have been released.
    pub(crate) fn is_finished(&self) -> bool {
        let children_finished = self.children.borrow().len() == self.transient_children.get();

        match &self.kind {
            Kind::Task(core) => children_finished && core.is_done(),
            _ => children_finished,
        }
    }

    /// Detaches a finished node from the tree.
    ///
    /// Our own children are either dropped (finished) or handed to the
    /// grandparent (still running), so every live descendant stays reachable
    /// from the root. The grandparent may have become finished in turn.
    pub(crate) fn consume(self: &Rc<Self>) {
        let Some(parent) = self.parent() else {
            return;
        };
        if !self.is_finished() {
            return;
        }

        parent.remove_child(self);

        let children = self.children.borrow_mut().take();
        self.transient_children.set(0);
        for child in children {
            child.link.set(None);
            if child.is_finished() {
                child.set_parent(None);
            } else {
                parent.add_child(child);
            }
        }

        tracing::trace!(node = %self.id, parent = %parent.id, "consumed");
        parent.consume();
    }

    /// Stops every non-transient child.
    ///
    /// A child that turns out to be the currently executing task raises the
    /// stop signal when `later` is false. We keep going so its siblings are
    /// still stopped and hand the signal back at the end.
    pub(crate) fn stop_children(&self, later: bool) -> Result<(), Error> {
        let mut result = Ok(());

        for child in self.snapshot() {
            if child.transient {
                continue;
            }
            if let Err(err) = child.stop(later) {
                result = Err(err);
            }
        }

        result
    }

    pub(crate) fn stop(self: &Rc<Self>, later: bool) -> Result<(), Error> {
        match &self.kind {
            Kind::Task(core) => self.stop_task(core, later),
            Kind::Root | Kind::Plain => self.stop_children(later),
        }
    }

    /// Stops this node, then every child including the transient ones.
    ///
    /// Returns true when nothing is left underneath.
    pub(crate) fn terminate(self: &Rc<Self>) -> bool {
        // Nothing is current during a hard shutdown, a stop signal here can
        // only come from a task terminating its own ancestors.
        let _ = self.stop(false);

        for child in self.snapshot() {
            child.terminate();
        }

        self.children.borrow().is_empty()
    }

    /// Drops every execution context in the subtree without running it.
    ///
    /// Only used when a scheduler is dropped without being closed, to break
    /// the task <-> future reference cycles.
    pub(crate) fn abandon(&self) {
        let children = self.children.borrow_mut().take();
        self.transient_children.set(0);

        for child in children {
            child.link.set(None);
            child.set_parent(None);
            if let Some(core) = child.task_core() {
                core.abandon();
            }
            child.abandon();
        }
    }

    pub(crate) fn annotation(&self) -> Option<Cow<'static, str>> {
        self.annotation.borrow().clone()
    }

    pub(crate) fn annotate(&self, label: Cow<'static, str>) {
        *self.annotation.borrow_mut() = Some(label);
    }

    fn print_hierarchy(&self, out: &mut dyn fmt::Write, depth: usize) -> fmt::Result {
        writeln!(out, "{:indent$}{self}", "", indent = depth * 2)?;
        for child in self.snapshot() {
            child.print_hierarchy(out, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Root => write!(f, "Scheduler {}", self.id)?,
            Kind::Plain => write!(f, "Node {}", self.id)?,
            Kind::Task(core) => write!(f, "Task {} ({})", self.id, core.status())?,
        }
        if self.transient {
            f.write_str(" transient")?;
        }
        if let Some(annotation) = self.annotation.borrow().as_deref() {
            write!(f, " {annotation:?}")?;
        }
        Ok(())
    }
}

/// A node of the task tree.
///
/// Tasks and the scheduler root are nodes too. Plain nodes have no execution
/// context and exist to group tasks so they can be stopped together.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Rc<NodeInner>,
}

impl Node {
    pub(crate) fn from_inner(inner: Rc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Creates a plain child of `parent`.
    ///
    /// A transient child never keeps its parent from finishing, but is still
    /// terminated when the scheduler closes.
    pub fn new(parent: &Node, transient: bool) -> Node {
        Node::from_inner(NodeInner::new_child(&parent.inner, transient, |_| Kind::Plain))
    }

    pub fn id(&self) -> Id {
        self.inner.id
    }

    pub fn parent(&self) -> Option<Node> {
        self.inner.parent().map(Node::from_inner)
    }

    /// Children in creation order.
    pub fn children(&self) -> Vec<Node> {
        self.inner.snapshot().into_iter().map(Node::from_inner).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.num_children()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_transient(&self) -> bool {
        self.inner.is_transient()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn annotation(&self) -> Option<Cow<'static, str>> {
        self.inner.annotation()
    }

    /// Attaches a human readable label, shown by [`Node::print_hierarchy`].
    pub fn annotate(&self, label: impl Into<Cow<'static, str>>) {
        self.inner.annotate(label.into());
    }

    pub fn as_task(&self) -> Option<Task> {
        Task::from_inner(Rc::clone(&self.inner))
    }

    /// Detaches this node from the tree if it is finished, re-parenting any
    /// live transient descendants onto the parent.
    pub fn consume(&self) {
        self.inner.consume();
    }

    /// Stops this node and its non-transient subtree.
    ///
    /// When the target is the currently executing task and `later` is false
    /// the stop signal is returned as `Err(Error::Stop)`, to be propagated
    /// with `?`. With `later` set it is scheduled for the next turn instead.
    pub fn stop(&self, later: bool) -> Result<(), Error> {
        self.inner.stop(later)
    }

    /// Stops the whole subtree, transient children included. Returns true when
    /// no child survived.
    pub fn terminate(&self) -> bool {
        self.inner.terminate()
    }

    pub fn print_hierarchy(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.inner.print_hierarchy(out, 0)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("transient", &self.inner.transient)
            .field("children", &self.inner.num_children())
            .finish()
    }
}
