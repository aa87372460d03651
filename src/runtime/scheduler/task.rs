//! Node handles and the fluent builder API
//!
//! Handles are cheap `Clone` values pairing the pool with a [`NodeId`]. They
//! never own the node; once it finishes and is released, fallible calls
//! through a handle report [`SchedulerError::StaleHandle`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use tracing::{error, warn};

use super::executor::PoolShared;
use super::future::{RunFuture, RunState};
use crate::runtime::dag::node::{Owner, Work};
use crate::runtime::dag::{
    AsNode, JobFn, NodeId, NodeKind, NodeState, QueueAffinity, Resource, SetupFn, TaskFn,
};
use crate::runtime::error::{RunError, SchedulerError, SchedulerResult};
use crate::runtime::event::EventKey;

/// Stands in for the missing graph node of a batch in the cycle check.
const BATCH_ROOT: NodeId = NodeId::new(u32::MAX, u32::MAX);

/// Log and, in debug builds, fail on configuration of a node that already left the building state.
fn expect_building(
    result: SchedulerResult<()>,
    what: &str,
) {
    if let Err(error) = &result {
        error!(%error, what, "configuration ignored");
    }
    debug_assert!(
        result.is_ok(),
        "{what} called on a node that is no longer being built"
    );
}

/// Methods shared by every node handle.
macro_rules! impl_node_handle {
    ($($handle:ident),*) => {
        $(
            impl AsNode for $handle {
                #[inline]
                fn node_id(&self) -> NodeId {
                    self.id
                }
            }

            impl fmt::Debug for $handle {
                fn fmt(
                    &self,
                    f: &mut fmt::Formatter<'_>,
                ) -> fmt::Result {
                    f.debug_struct(stringify!($handle))
                        .field("id", &self.id)
                        .finish()
                }
            }

            impl $handle {
                /// Handle of the underlying node.
                #[inline]
                pub fn id(&self) -> NodeId {
                    self.id
                }

                /// Set the diagnostic name.
                pub fn name(
                    &self,
                    name: impl Into<String>,
                ) -> &Self {
                    let name = name.into();
                    expect_building(
                        self.shared.configure(self.id, |_, body| body.name = name),
                        "name",
                    );
                    self
                }

                /// Run only after `predecessor` has finished.
                pub fn depends_on(
                    &self,
                    predecessor: &impl AsNode,
                ) -> SchedulerResult<&Self> {
                    self.shared
                        .add_dependency(self.id, predecessor.node_id())?;
                    Ok(self)
                }

                /// Run only after event `(name, id)` has been signaled in this run.
                pub fn wait_on_event(
                    &self,
                    name: impl Into<String>,
                    id: u64,
                ) -> SchedulerResult<&Self> {
                    let key = EventKey::new(name, id);
                    self.shared.configure(self.id, |node, body| {
                        node.add_explicit_dep();
                        body.waits.push(key);
                    })?;
                    Ok(self)
                }

                /// Signal event `(name, id)` when this node finishes.
                pub fn signal_event(
                    &self,
                    name: impl Into<String>,
                    id: u64,
                ) -> SchedulerResult<&Self> {
                    let key = EventKey::new(name, id);
                    self.shared
                        .configure(self.id, |_, body| body.signals.push(key))?;
                    Ok(self)
                }

                /// Hold the node until [`signal_explicit_dep`](Self::signal_explicit_dep)
                /// has been called `count` times.
                pub fn set_explicit_deps_count(
                    &self,
                    count: i64,
                ) -> SchedulerResult<&Self> {
                    self.shared.configure(self.id, |node, body| {
                        node.set_explicit_deps(count + body.waits.len() as i64);
                    })?;
                    Ok(self)
                }

                /// Open one unit of the manual gate; enqueues the node if it became ready.
                pub fn signal_explicit_dep(&self) -> SchedulerResult<()> {
                    self.shared.signal_explicit(self.id)
                }

                /// Route the node to the pool's main-thread queue.
                pub fn pin_to_main_thread(&self) -> SchedulerResult<&Self> {
                    self.shared.configure(self.id, |_, body| {
                        body.affinity = QueueAffinity::MainThread;
                    })?;
                    Ok(self)
                }

                /// Current lifecycle state.
                pub fn state(&self) -> SchedulerResult<NodeState> {
                    Ok(self.shared.arena().get(self.id)?.state())
                }
            }
        )*
    };
}

/// A single-functor task.
#[derive(Clone)]
pub struct Task {
    shared: Arc<PoolShared>,
    id: NodeId,
}

/// A node running one functor over `0..job_count`.
#[derive(Clone)]
pub struct ParallelFor {
    shared: Arc<PoolShared>,
    id: NodeId,
}

/// A container of child nodes.
///
/// Children run once the graph itself runs; the graph finishes after every
/// descendant finished.
#[derive(Clone)]
pub struct TaskGraph {
    shared: Arc<PoolShared>,
    id: NodeId,
}

impl_node_handle!(Task, ParallelFor, TaskGraph);

impl Task {
    /// Set an infallible functor.
    pub fn functor<F>(
        &self,
        f: F,
    ) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.functor_with(move |_| {
            f();
            Ok(())
        })
    }

    /// Set a fallible functor that can spawn further tasks through its context.
    pub fn functor_with<F>(
        &self,
        f: F,
    ) -> &Self
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let functor: TaskFn = Box::new(f);
        expect_building(
            self.shared.configure(self.id, |_, body| {
                body.work = Work::General {
                    functor: Some(functor),
                };
            }),
            "functor",
        );
        self
    }
}

impl ParallelFor {
    /// Set an infallible per-index functor.
    pub fn func<F>(
        &self,
        f: F,
    ) -> &Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.try_func(move |index| {
            f(index);
            Ok(())
        })
    }

    /// Set a fallible per-index functor; a failing index does not stop the others.
    pub fn try_func<F>(
        &self,
        f: F,
    ) -> &Self
    where
        F: Fn(usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let job: JobFn = Arc::new(f);
        expect_building(
            self.shared.configure(self.id, |_, body| {
                if let Work::ParallelFor { func, .. } = &mut body.work {
                    *func = Some(job);
                }
            }),
            "func",
        );
        self
    }

    /// Number of invocations.
    pub fn job_count(
        &self,
        count: usize,
    ) -> &Self {
        expect_building(
            self.shared.configure(self.id, |_, body| {
                if let Work::ParallelFor { job_count, .. } = &mut body.work {
                    *job_count = count;
                }
            }),
            "job_count",
        );
        self
    }
}

impl TaskGraph {
    pub(crate) fn new(
        shared: Arc<PoolShared>,
        name: String,
    ) -> Self {
        let id = shared.create_node(NodeKind::Graph, Owner::None, None);
        let graph = Self { shared, id };
        graph.name(name);
        graph
    }

    pub(crate) fn attached(
        shared: Arc<PoolShared>,
        id: NodeId,
    ) -> Self {
        Self { shared, id }
    }

    /// Add a general child task.
    ///
    /// # Panics
    ///
    /// When the graph is frozen: children can be added before the graph runs
    /// or from its setup functor, not later.
    pub fn new_task(&self) -> Task {
        Task {
            id: self.shared.add_child(self.id, NodeKind::General),
            shared: self.shared.clone(),
        }
    }

    /// Add a parallel-for child. Panics like [`new_task`](Self::new_task).
    pub fn new_task_parallel_for(&self) -> ParallelFor {
        ParallelFor {
            id: self.shared.add_child(self.id, NodeKind::ParallelFor),
            shared: self.shared.clone(),
        }
    }

    /// Add a nested graph. Panics like [`new_task`](Self::new_task).
    pub fn new_task_graph(&self) -> TaskGraph {
        TaskGraph {
            id: self.shared.add_child(self.id, NodeKind::Graph),
            shared: self.shared.clone(),
        }
    }

    /// Build the children when the graph starts running instead of up front.
    pub fn setup_functor<F>(
        &self,
        f: F,
    ) -> &Self
    where
        F: FnOnce(&TaskGraph) -> anyhow::Result<()> + Send + 'static,
    {
        let setup: SetupFn = Box::new(f);
        expect_building(
            self.shared.configure(self.id, |_, body| {
                if let Some(graph) = body.graph_mut() {
                    graph.setup = Some(setup);
                }
            }),
            "setup_functor",
        );
        self
    }

    /// Keep `resource` alive until every descendant of this graph has finished.
    pub fn add_resource<T>(
        &self,
        resource: Arc<T>,
    ) -> &Self
    where
        T: Any + Send + Sync,
    {
        let resource: Resource = resource;
        match self.shared.arena().get(self.id) {
            Ok(node) => {
                let mut body = node.body();
                if let Some(graph) = body.graph_mut() {
                    graph.resources.push(resource);
                }
            },
            Err(error) => warn!(%error, "resource added to a finished graph"),
        }
        self
    }

    /// Number of statically declared children not yet handed to the scheduler.
    pub fn child_count(&self) -> usize {
        self.shared
            .arena()
            .get(self.id)
            .map(|node| {
                let body = node.body();
                body.graph().map_or(0, |graph| graph.children.len())
            })
            .unwrap_or(0)
    }

    /// Schedule a top-level graph and return its future.
    ///
    /// Fails on nested graphs, on a second run, on a dependency cycle among
    /// the declared children and on a stopped pool.
    pub fn run(&self) -> SchedulerResult<RunFuture> {
        let node = self.shared.arena().get(self.id)?;
        if node.state() != NodeState::Building {
            return Err(SchedulerError::AlreadyRunning(self.id));
        }
        let name = {
            let body = node.body();
            if !matches!(body.owner, Owner::None) {
                return Err(SchedulerError::NotTopLevel(self.id));
            }
            body.name.clone()
        };
        self.shared.check_acyclic(self.id, None)?;

        let run = RunState::new(name, 1);
        self.shared.register_run(&run)?;
        node.body().owner = Owner::Run(run.clone());
        self.shared.arm(&node, &run);
        Ok(RunFuture::new(run, self.shared.clone()))
    }

    /// Run and block, executing ready nodes on the calling thread meanwhile.
    pub fn run_and_wait(&self) -> Result<(), RunError> {
        self.run()?.wait_helping()
    }

    /// Release a graph that will not be run, together with its children.
    pub fn discard(self) -> SchedulerResult<()> {
        self.shared.discard(self.id)
    }
}

/// A set of nodes enqueued together without a graph node.
///
/// Members may depend on each other; the batch finishes after every member
/// and everything they spawned has finished.
pub struct TaskBatch {
    shared: Arc<PoolShared>,
    run: Arc<RunState>,
    nodes: RefCell<Vec<NodeId>>,
}

impl TaskBatch {
    pub(crate) fn new(
        shared: Arc<PoolShared>,
        name: String,
    ) -> Self {
        Self {
            shared,
            // The extra count is released by `enqueue`.
            run: RunState::new(name, 1),
            nodes: RefCell::new(Vec::new()),
        }
    }

    fn member(
        &self,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.shared.create_node(
            kind,
            Owner::Run(self.run.clone()),
            Some(self.run.clone()),
        );
        self.run.add_outstanding();
        self.nodes.borrow_mut().push(id);
        id
    }

    /// Add a general task.
    pub fn new_task(&self) -> Task {
        Task {
            id: self.member(NodeKind::General),
            shared: self.shared.clone(),
        }
    }

    /// Add a parallel-for node.
    pub fn new_task_parallel_for(&self) -> ParallelFor {
        ParallelFor {
            id: self.member(NodeKind::ParallelFor),
            shared: self.shared.clone(),
        }
    }

    /// Add a graph; it runs as part of the batch, not on its own.
    pub fn new_task_graph(&self) -> TaskGraph {
        TaskGraph {
            id: self.member(NodeKind::Graph),
            shared: self.shared.clone(),
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Hand the members to the scheduler; ready ones are queued right away.
    pub fn enqueue(self) -> SchedulerResult<RunFuture> {
        let nodes = self.nodes.into_inner();
        let admitted = self
            .shared
            .check_acyclic(BATCH_ROOT, Some(&nodes))
            .and_then(|()| self.shared.register_run(&self.run));
        if let Err(error) = admitted {
            for id in nodes {
                if let Err(discard) = self.shared.discard(id) {
                    warn!(%discard, "could not discard rejected batch member");
                }
            }
            return Err(error);
        }

        for id in &nodes {
            match self.shared.arena().get(*id) {
                Ok(node) => self.shared.arm(&node, &self.run),
                Err(error) => error!(%error, "batch member vanished before enqueue"),
            }
        }
        if self.run.node_done() {
            self.shared.complete_run(&self.run);
        }
        Ok(RunFuture::new(self.run, self.shared))
    }

    /// Enqueue and let the calling thread execute ready nodes until the batch is done.
    pub fn enqueue_and_wait(self) -> Result<(), RunError> {
        self.enqueue()?.wait_helping()
    }
}

impl fmt::Debug for TaskBatch {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskBatch")
            .field("run", &self.run.name())
            .field("members", &self.nodes.borrow().len())
            .finish()
    }
}

/// What a running functor sees of the scheduler.
///
/// Nodes created through the context belong to the same owner as the running
/// node and are handed to the scheduler once the functor returns.
pub struct TaskContext<'a> {
    shared: &'a Arc<PoolShared>,
    node: NodeId,
    name: &'a str,
    worker: Option<usize>,
    owner: Owner,
    run: Arc<RunState>,
    spawned: RefCell<Vec<NodeId>>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        shared: &'a Arc<PoolShared>,
        node: NodeId,
        name: &'a str,
        worker: Option<usize>,
        owner: Owner,
        run: Arc<RunState>,
    ) -> Self {
        Self {
            shared,
            node,
            name,
            worker,
            owner,
            run,
            spawned: RefCell::new(Vec::new()),
        }
    }

    /// Worker index, `None` on a helping or main thread.
    #[inline]
    pub fn worker_id(&self) -> Option<usize> {
        self.worker
    }

    /// Name of the running task.
    #[inline]
    pub fn task_name(&self) -> &str {
        self.name
    }

    /// Handle of the running task.
    #[inline]
    pub fn current(&self) -> NodeId {
        self.node
    }

    fn spawn(
        &self,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.shared.spawn_from(&self.owner, &self.run, kind);
        self.spawned.borrow_mut().push(id);
        id
    }

    /// Create a sibling task.
    pub fn new_task(&self) -> Task {
        Task {
            id: self.spawn(NodeKind::General),
            shared: self.shared.clone(),
        }
    }

    /// Create a sibling parallel-for node.
    pub fn new_task_parallel_for(&self) -> ParallelFor {
        ParallelFor {
            id: self.spawn(NodeKind::ParallelFor),
            shared: self.shared.clone(),
        }
    }

    /// Create a sibling graph.
    pub fn new_task_graph(&self) -> TaskGraph {
        TaskGraph {
            id: self.spawn(NodeKind::Graph),
            shared: self.shared.clone(),
        }
    }

    /// Raise an event in the current run right away.
    pub fn signal_event(
        &self,
        name: impl Into<String>,
        id: u64,
    ) {
        self.shared
            .signal_event(&self.run, &EventKey::new(name, id));
    }

    /// Whether an event has been raised in the current run.
    pub fn is_event_signaled(
        &self,
        name: impl Into<String>,
        id: u64,
    ) -> bool {
        self.run.events().is_signaled(&EventKey::new(name, id))
    }

    pub(crate) fn into_spawned(self) -> Vec<NodeId> {
        self.spawned.into_inner()
    }
}

impl AsNode for TaskContext<'_> {
    #[inline]
    fn node_id(&self) -> NodeId {
        self.node
    }
}
