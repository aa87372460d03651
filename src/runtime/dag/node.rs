//! Task node record
//!
//! A `TaskNode` is one arena slot: the gate counters, the successor edges and
//! the kind-specific work. The slot is reused across allocations; every use
//! is identified by the slot's current generation.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use smallvec::SmallVec;

use super::node_id::NodeId;
use crate::runtime::event::EventKey;
use crate::runtime::scheduler::future::RunState;
use crate::runtime::scheduler::task::{TaskContext, TaskGraph};

/// Functor of a general task.
pub type TaskFn = Box<dyn FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static>;

/// Per-index functor of a parallel-for node.
pub type JobFn = Arc<dyn Fn(usize) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Deferred setup step of a graph.
pub type SetupFn = Box<dyn FnOnce(&TaskGraph) -> anyhow::Result<()> + Send + 'static>;

/// Externally owned object kept alive for a graph's execution window.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Kind of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    /// A single functor.
    General,
    /// N invocations of one functor sharing a completion counter.
    ParallelFor,
    /// A container of child nodes.
    Graph,
}

impl NodeKind {
    /// Whether released nodes of this kind go back to a free list.
    ///
    /// Graph records carry child lists and resources and are destroyed instead.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        !matches!(self, NodeKind::Graph)
    }

    /// Default name given to nodes of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::General => "task",
            NodeKind::ParallelFor => "parallel_for",
            NodeKind::Graph => "graph",
        }
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum NodeState {
    /// Accepting configuration and dependency edges.
    Building = 0,
    /// Visible to the scheduler, waiting for its gates to open.
    Armed = 1,
    /// Sitting in a ready queue.
    Queued = 2,
    /// Picked by a worker.
    Running = 3,
    /// Functor returned; completion bookkeeping done or in progress.
    Finished = 4,
    /// Back in the allocator.
    Free = 5,
}

impl NodeState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => NodeState::Building,
            1 => NodeState::Armed,
            2 => NodeState::Queued,
            3 => NodeState::Running,
            4 => NodeState::Finished,
            _ => NodeState::Free,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Who is told when a node finishes.
#[derive(Clone, Default)]
pub(crate) enum Owner {
    /// Not attached yet (an unrun top-level graph).
    #[default]
    None,
    /// A child of the given graph.
    Graph(NodeId),
    /// Directly tracked by an execution window (top-level graph or batch member).
    Run(Arc<RunState>),
}

impl fmt::Debug for Owner {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Owner::None => write!(f, "None"),
            Owner::Graph(id) => write!(f, "Graph({id})"),
            Owner::Run(run) => write!(f, "Run({})", run.name()),
        }
    }
}

/// Which ready queue a node is pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QueueAffinity {
    /// The shared queue drained by every worker.
    #[default]
    Shared,
    /// The queue drained only by the pool's main thread.
    MainThread,
}

/// Graph-specific state.
#[derive(Default)]
pub(crate) struct GraphWork {
    pub(crate) children: Vec<NodeId>,
    pub(crate) setup: Option<SetupFn>,
    pub(crate) resources: Vec<Resource>,
    /// Cleared once the setup step returned and children were armed.
    pub(crate) accepting: bool,
}

/// Kind-specific work of a node.
pub(crate) enum Work {
    General { functor: Option<TaskFn> },
    ParallelFor { job_count: usize, func: Option<JobFn> },
    Graph(GraphWork),
}

impl Work {
    fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::General => Work::General { functor: None },
            NodeKind::ParallelFor => Work::ParallelFor {
                job_count: 0,
                func: None,
            },
            NodeKind::Graph => Work::Graph(GraphWork {
                accepting: true,
                ..GraphWork::default()
            }),
        }
    }
}

/// Mutable, lock-protected part of a node.
pub(crate) struct NodeBody {
    pub(crate) name: String,
    pub(crate) owner: Owner,
    pub(crate) run: Option<Arc<RunState>>,
    pub(crate) affinity: QueueAffinity,
    pub(crate) waits: SmallVec<[EventKey; 2]>,
    pub(crate) signals: SmallVec<[EventKey; 2]>,
    pub(crate) work: Work,
}

impl NodeBody {
    fn new(kind: NodeKind) -> Self {
        Self {
            name: String::new(),
            owner: Owner::None,
            run: None,
            affinity: QueueAffinity::Shared,
            waits: SmallVec::new(),
            signals: SmallVec::new(),
            work: Work::empty(kind),
        }
    }

    pub(crate) fn graph(&self) -> Option<&GraphWork> {
        match &self.work {
            Work::Graph(graph) => Some(graph),
            _ => None,
        }
    }

    pub(crate) fn graph_mut(&mut self) -> Option<&mut GraphWork> {
        match &mut self.work {
            Work::Graph(graph) => Some(graph),
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Successors {
    list: SmallVec<[NodeId; 4]>,
    sealed: bool,
}

/// One slot of the task arena.
pub struct TaskNode {
    index: u32,
    kind: NodeKind,
    generation: AtomicU32,
    state: AtomicU8,
    /// Manual gate plus one per event wait.
    explicit_deps: AtomicI64,
    /// One per registered predecessor.
    structural_deps: AtomicI64,
    /// Parallel-for: jobs not yet run. Graph: children not yet finished (plus a guard).
    outstanding: AtomicUsize,
    successors: Mutex<Successors>,
    body: Mutex<NodeBody>,
}

impl TaskNode {
    pub(crate) fn new(
        index: u32,
        kind: NodeKind,
        generation: u32,
    ) -> Self {
        Self {
            index,
            kind,
            generation: AtomicU32::new(generation),
            state: AtomicU8::new(NodeState::Building.as_u8()),
            explicit_deps: AtomicI64::new(0),
            structural_deps: AtomicI64::new(0),
            outstanding: AtomicUsize::new(0),
            successors: Mutex::new(Successors::default()),
            body: Mutex::new(NodeBody::new(kind)),
        }
    }

    /// Handle for the current use of this slot.
    #[inline]
    pub fn id(&self) -> NodeId {
        NodeId::new(self.index, self.generation.load(Ordering::SeqCst))
    }

    /// Whether `id` names the current use of this slot.
    #[inline]
    pub fn is_current(
        &self,
        id: NodeId,
    ) -> bool {
        id.index() == self.index && self.generation.load(Ordering::SeqCst) == id.generation()
    }

    /// Node kind; fixed for the life of the slot.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(
        &self,
        state: NodeState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Move from `from` to `to`; false if another thread got there first.
    #[inline]
    pub(crate) fn transition(
        &self,
        from: NodeState,
        to: NodeState,
    ) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Diagnostic name.
    pub fn name(&self) -> String {
        self.body.lock().name.clone()
    }

    /// Current value of the explicit gate.
    #[inline]
    pub fn explicit_deps(&self) -> i64 {
        self.explicit_deps.load(Ordering::SeqCst)
    }

    /// Current value of the structural gate.
    #[inline]
    pub fn structural_deps(&self) -> i64 {
        self.structural_deps.load(Ordering::SeqCst)
    }

    /// Both gates open.
    ///
    /// Gate updates and this check are all `SeqCst` so that two threads
    /// opening the two gates concurrently cannot both miss the other's update.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.explicit_deps.load(Ordering::SeqCst) <= 0
            && self.structural_deps.load(Ordering::SeqCst) <= 0
    }

    #[inline]
    pub(crate) fn set_explicit_deps(
        &self,
        count: i64,
    ) {
        self.explicit_deps.store(count, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn add_explicit_dep(&self) {
        self.explicit_deps.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the explicit gate, returning the new value.
    #[inline]
    pub(crate) fn satisfy_explicit_dep(&self) -> i64 {
        self.explicit_deps.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Decrement the structural gate, returning the new value.
    #[inline]
    pub(crate) fn satisfy_structural_dep(&self) -> i64 {
        self.structural_deps.fetch_sub(1, Ordering::SeqCst) - 1
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> &AtomicUsize {
        &self.outstanding
    }

    /// Register `successor` behind the use of this node named by `id` and
    /// bump the successor's structural gate.
    ///
    /// Fails once this node has sealed its successor list on completion, or
    /// once `id` went stale. Both are checked under the successor lock;
    /// `retire` clears `sealed`, so the generation check is what rejects an
    /// edge onto a record that was released in the meantime.
    pub(crate) fn try_add_successor(
        &self,
        id: NodeId,
        successor: NodeId,
        successor_node: &TaskNode,
    ) -> bool {
        let mut successors = self.successors.lock();
        if successors.sealed || !self.is_current(id) {
            return false;
        }
        successor_node
            .structural_deps
            .fetch_add(1, Ordering::SeqCst);
        successors.list.push(successor);
        true
    }

    /// Seal the successor list and hand it out for notification.
    pub(crate) fn seal_successors(&self) -> SmallVec<[NodeId; 4]> {
        let mut successors = self.successors.lock();
        successors.sealed = true;
        std::mem::take(&mut successors.list)
    }

    /// Snapshot of registered successors.
    pub fn successors(&self) -> SmallVec<[NodeId; 4]> {
        self.successors.lock().list.clone()
    }

    #[inline]
    pub(crate) fn body(&self) -> MutexGuard<'_, NodeBody> {
        self.body.lock()
    }

    /// Prepare a freshly popped slot for a new use.
    pub(crate) fn activate(&self) {
        self.set_state(NodeState::Building);
    }

    /// Invalidate the current use and wipe every field.
    ///
    /// Only the caller that moves the generation forward performs the reset,
    /// so concurrent releases of one handle cannot both succeed.
    pub(crate) fn retire(
        &self,
        id: NodeId,
    ) -> bool {
        let next = id.generation().wrapping_add(1);
        if self
            .generation
            .compare_exchange(id.generation(), next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.set_state(NodeState::Free);
        self.explicit_deps.store(0, Ordering::SeqCst);
        self.structural_deps.store(0, Ordering::SeqCst);
        self.outstanding.store(0, Ordering::SeqCst);
        *self.successors.lock() = Successors::default();

        // Drop captured closures and resources outside the lock.
        let old = std::mem::replace(&mut *self.body.lock(), NodeBody::new(self.kind));
        drop(old);
        true
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("explicit_deps", &self.explicit_deps())
            .field("structural_deps", &self.structural_deps())
            .finish()
    }
}

impl fmt::Display for TaskNode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "TaskNode({}: {:?})", self.id(), self.kind)
    }
}
