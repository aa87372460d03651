//! Pool internals shared by workers, handles and futures
//!
//! `PoolShared` owns the ready queue, the node arena and the statistics. It
//! implements the node lifecycle: arming, readiness checks, execution of the
//! three node kinds, and completion bookkeeping.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, debug_span, error, trace, warn};

use super::future::RunState;
use super::observer::{TaskInfo, TaskObserver};
use super::queue::{Job, TaskQueue};
use super::task::{TaskContext, TaskGraph};
use super::{SchedulerConfig, SchedulerStats, WorkerState};
use crate::runtime::dag::node::{NodeBody, Owner, Work};
use crate::runtime::dag::{find_cycle, JobFn, NodeId, NodeKind, NodeState, TaskNode};
use crate::runtime::error::{SchedulerError, SchedulerResult, TaskError};
use crate::runtime::event::{EventKey, WaitRegistration};
use crate::runtime::memory::{LocalAllocator, NodeArena};

/// Run `f`, turning an error or a panic into a [`TaskError`].
fn catch_task<F>(
    name: &str,
    kind: NodeKind,
    f: F,
) -> Result<(), TaskError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(match kind {
            NodeKind::Graph => TaskError::Setup {
                graph: name.to_string(),
                source,
            },
            _ => TaskError::Failed {
                task: name.to_string(),
                source,
            },
        }),
        Err(payload) => Err(TaskError::from_panic(name, payload)),
    }
}

/// State shared by the pool, its workers and every handle.
pub(crate) struct PoolShared {
    config: SchedulerConfig,
    queue: TaskQueue,
    arena: NodeArena,
    stats: SchedulerStats,
    worker_states: Vec<CachePadded<AtomicU8>>,
    observer: Option<Arc<dyn TaskObserver>>,
    runs: Mutex<Vec<Weak<RunState>>>,
    running: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn new(
        config: SchedulerConfig,
        observer: Option<Arc<dyn TaskObserver>>,
    ) -> Self {
        let worker_states = (0..config.num_workers)
            .map(|_| CachePadded::new(AtomicU8::new(WorkerState::Idle.as_u8())))
            .collect();
        Self {
            queue: TaskQueue::new(thread::current().id()),
            arena: NodeArena::new(),
            stats: SchedulerStats::default(),
            worker_states,
            observer,
            runs: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            config,
        }
    }

    #[inline]
    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[inline]
    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    #[inline]
    pub(crate) fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.worker_states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Relaxed)))
            .collect()
    }

    #[inline]
    fn set_worker_state(
        &self,
        worker: usize,
        state: WorkerState,
    ) {
        if let Some(slot) = self.worker_states.get(worker) {
            slot.store(state.as_u8(), Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Dequeue-execute loop of one worker thread.
    pub(crate) fn worker_loop(
        self: Arc<Self>,
        worker: usize,
    ) {
        debug!(worker, "worker started");
        loop {
            self.set_worker_state(worker, WorkerState::WaitingOnQueue);
            let Some(job) = self.queue.next_job(false, || false) else {
                break;
            };
            self.set_worker_state(worker, WorkerState::RunningNode);
            self.execute(job, Some(worker));
            self.set_worker_state(worker, WorkerState::Idle);
        }
        self.set_worker_state(worker, WorkerState::Stopped);
        debug!(worker, "worker stopped");
    }

    /// Execute jobs on the calling thread until `run` finishes or the pool stops.
    pub(crate) fn help_until(
        self: &Arc<Self>,
        run: &RunState,
    ) {
        let take_main = thread::current().id() == self.queue.main_thread();
        while let Some(job) = self.queue.next_job(take_main, || run.is_done()) {
            self.execute(job, None);
        }
    }

    /// Run every pinned job currently queued; only the main thread may do so.
    pub(crate) fn pump_main(self: &Arc<Self>) -> usize {
        if thread::current().id() != self.queue.main_thread() {
            warn!("pump_main_thread called off the main thread");
            return 0;
        }
        let mut executed = 0;
        while let Some(job) = self.queue.try_pop_main() {
            self.execute(job, None);
            executed += 1;
        }
        executed
    }

    fn execute(
        self: &Arc<Self>,
        job: Job,
        worker: Option<usize>,
    ) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.update_parallelism(running);
        match job {
            Job::Node(id) => self.run_node(id, worker),
            Job::Slice { node, func, range } => self.run_slice(node, &func, range, worker),
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Span, observer and statistics around one call boundary.
    ///
    /// `f` returns the number of failures it recorded.
    fn instrumented<F>(
        &self,
        info: &TaskInfo<'_>,
        f: F,
    ) where
        F: FnOnce() -> usize,
    {
        let span = match info.kind {
            NodeKind::Graph => debug_span!("graph_setup", name = info.name, worker = ?info.worker),
            kind => debug_span!("task", name = info.name, kind = ?kind, worker = ?info.worker),
        };
        let _entered = span.enter();

        self.notify_observer(info, "on_begin", |observer| observer.on_begin(info));
        let started = self.config.enable_stats.then(Instant::now);
        let failures = f();
        self.notify_observer(info, "on_end", |observer| {
            observer.on_end(info, failures == 0)
        });
        self.stats
            .record_executed(started.map(|at| at.elapsed()), failures);
    }

    /// Call into the observer; a panic there is logged and swallowed so the
    /// worker keeps running.
    fn notify_observer<F>(
        &self,
        info: &TaskInfo<'_>,
        hook: &'static str,
        call: F,
    ) where
        F: FnOnce(&dyn TaskObserver),
    {
        let Some(observer) = &self.observer else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))) {
            let error = TaskError::from_panic(info.name, payload);
            error!(%error, hook, node = %info.node, "task observer panicked");
        }
    }

    fn run_node(
        self: &Arc<Self>,
        id: NodeId,
        worker: Option<usize>,
    ) {
        let node = match self.arena.get(id) {
            Ok(node) => node,
            Err(error) => {
                error!(%error, "dequeued node is gone");
                return;
            },
        };
        if !node.transition(NodeState::Queued, NodeState::Running) {
            error!(node = %id, state = ?node.state(), "dequeued node was not queued");
            return;
        }

        match node.kind() {
            NodeKind::General => self.run_general(&node, id, worker),
            NodeKind::ParallelFor => self.start_parallel_for(&node, id, worker),
            NodeKind::Graph => self.activate_graph(&node, id, worker),
        }
    }

    fn run_general(
        self: &Arc<Self>,
        node: &Arc<TaskNode>,
        id: NodeId,
        worker: Option<usize>,
    ) {
        let (name, functor, owner, run) = {
            let mut body = node.body();
            let functor = match &mut body.work {
                Work::General { functor } => functor.take(),
                _ => None,
            };
            (body.name.clone(), functor, body.owner.clone(), body.run.clone())
        };
        let Some(run) = run else {
            error!(node = %id, "node executed outside of a run");
            self.finish_node(node, id);
            return;
        };

        let ctx = TaskContext::new(self, id, &name, worker, owner, run.clone());
        if let Some(functor) = functor {
            let info = TaskInfo {
                name: &name,
                node: id,
                kind: NodeKind::General,
                worker,
                slice: None,
            };
            self.instrumented(&info, || {
                match catch_task(&name, NodeKind::General, || functor(&ctx)) {
                    Ok(()) => 0,
                    Err(error) => {
                        run.record_failure(error);
                        1
                    },
                }
            });
        }

        for child in ctx.into_spawned() {
            self.arm_id(child, &run);
        }
        self.finish_node(node, id);
    }

    fn start_parallel_for(
        self: &Arc<Self>,
        node: &Arc<TaskNode>,
        id: NodeId,
        worker: Option<usize>,
    ) {
        let (job_count, func) = {
            let mut body = node.body();
            match &mut body.work {
                Work::ParallelFor { job_count, func } => (*job_count, func.take()),
                _ => (0, None),
            }
        };
        let func = match func {
            Some(func) if job_count > 0 => func,
            _ => {
                self.finish_node(node, id);
                return;
            },
        };

        node.outstanding().store(job_count, Ordering::SeqCst);
        let slices = self
            .config
            .num_workers
            .saturating_mul(self.config.parallel_for_chunks_per_worker)
            .clamp(1, job_count);
        let chunk = job_count.div_ceil(slices);
        let mut ranges = (0..job_count)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(job_count));

        let first = ranges.next();
        let rest: Vec<Job> = ranges
            .map(|range| Job::Slice {
                node: id,
                func: func.clone(),
                range,
            })
            .collect();
        trace!(node = %id, job_count, slices = rest.len() + 1, "parallel-for split");
        self.stats.record_enqueued(rest.len());
        self.queue.push_batch(rest);

        if let Some(range) = first {
            self.run_slice(id, &func, range, worker);
        }
    }

    fn run_slice(
        self: &Arc<Self>,
        id: NodeId,
        func: &JobFn,
        range: std::ops::Range<usize>,
        worker: Option<usize>,
    ) {
        let node = match self.arena.get(id) {
            Ok(node) => node,
            Err(error) => {
                error!(%error, "parallel-for slice outlived its node");
                return;
            },
        };
        let (name, run) = {
            let body = node.body();
            (body.name.clone(), body.run.clone())
        };

        let len = range.len();
        let info = TaskInfo {
            name: &name,
            node: id,
            kind: NodeKind::ParallelFor,
            worker,
            slice: Some(range.clone()),
        };
        self.instrumented(&info, || {
            let mut failures = 0;
            for index in range.clone() {
                let label = || format!("{name}[{index}]");
                if let Err(error) = catch_task(&name, NodeKind::ParallelFor, || func(index)) {
                    failures += 1;
                    let error = match error {
                        TaskError::Failed { source, .. } => TaskError::Failed {
                            task: label(),
                            source,
                        },
                        TaskError::Panicked { message, .. } => TaskError::Panicked {
                            task: label(),
                            message,
                        },
                        other => other,
                    };
                    match &run {
                        Some(run) => run.record_failure(error),
                        None => error!(%error, "parallel-for failure outside of a run"),
                    }
                }
            }
            failures
        });
        self.stats.record_slice();

        if node.outstanding().fetch_sub(len, Ordering::SeqCst) == len {
            self.finish_node(&node, id);
        }
    }

    fn activate_graph(
        self: &Arc<Self>,
        node: &Arc<TaskNode>,
        id: NodeId,
        worker: Option<usize>,
    ) {
        let (name, setup, run) = {
            let mut body = node.body();
            let setup = body.graph_mut().and_then(|graph| graph.setup.take());
            (body.name.clone(), setup, body.run.clone())
        };

        if let Some(setup) = setup {
            let graph = TaskGraph::attached(self.clone(), id);
            let info = TaskInfo {
                name: &name,
                node: id,
                kind: NodeKind::Graph,
                worker,
                slice: None,
            };
            self.instrumented(&info, || {
                match catch_task(&name, NodeKind::Graph, || setup(&graph)) {
                    Ok(()) => 0,
                    Err(error) => {
                        match &run {
                            Some(run) => run.record_failure(error),
                            None => error!(%error, "graph setup failed outside of a run"),
                        }
                        1
                    },
                }
            });
        }

        let children = {
            let mut body = node.body();
            body.graph_mut()
                .map(|graph| {
                    graph.accepting = false;
                    std::mem::take(&mut graph.children)
                })
                .unwrap_or_default()
        };

        debug!(graph = %name, children = children.len(), "graph activated");
        // One extra count keeps the graph open while its children are armed.
        node.outstanding()
            .store(children.len() + 1, Ordering::SeqCst);
        match &run {
            Some(run) => {
                for child in children {
                    self.arm_id(child, run);
                }
            },
            None => error!(graph = %name, "graph activated outside of a run"),
        }
        self.graph_child_done(node, id);
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Make a building node visible to the scheduler under `run`.
    pub(crate) fn arm(
        &self,
        node: &TaskNode,
        run: &Arc<RunState>,
    ) {
        let id = node.id();
        let waits = {
            let mut body = node.body();
            body.run = Some(run.clone());
            body.waits.clone()
        };
        if !node.transition(NodeState::Building, NodeState::Armed) {
            warn!(node = %id, state = ?node.state(), "node armed twice");
            return;
        }
        for key in &waits {
            if run.events().register_waiter(key, id) == WaitRegistration::AlreadySignaled {
                node.satisfy_explicit_dep();
            }
        }
        self.try_enqueue(node);
    }

    fn arm_id(
        &self,
        id: NodeId,
        run: &Arc<RunState>,
    ) {
        match self.arena.get(id) {
            Ok(node) => self.arm(&node, run),
            Err(error) => error!(%error, "cannot arm node"),
        }
    }

    /// Push `node` if both gates are open; at most one caller succeeds.
    fn try_enqueue(
        &self,
        node: &TaskNode,
    ) {
        if node.is_ready() && node.transition(NodeState::Armed, NodeState::Queued) {
            let affinity = node.body().affinity;
            let id = node.id();
            trace!(node = %id, ?affinity, "node ready");
            self.stats.record_enqueued(1);
            self.queue.push(Job::Node(id), affinity);
        }
    }

    fn satisfy_structural(
        &self,
        id: NodeId,
    ) {
        match self.arena.get(id) {
            Ok(node) => {
                node.satisfy_structural_dep();
                self.try_enqueue(&node);
            },
            Err(error) => error!(%error, "successor vanished before its predecessor finished"),
        }
    }

    pub(crate) fn signal_explicit(
        &self,
        id: NodeId,
    ) -> SchedulerResult<()> {
        let node = self.arena.get(id)?;
        node.satisfy_explicit_dep();
        self.try_enqueue(&node);
        Ok(())
    }

    /// Raise `key` in `run` and open the gates of its waiters.
    pub(crate) fn signal_event(
        &self,
        run: &RunState,
        key: &EventKey,
    ) {
        let waiters = run.events().signal(key);
        trace!(run = run.name(), event = %key, waiters = waiters.len(), "event signaled");
        for waiter in waiters {
            if let Err(error) = self.signal_explicit(waiter) {
                error!(%error, event = %key, "event waiter vanished");
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn graph_child_done(
        &self,
        graph: &Arc<TaskNode>,
        id: NodeId,
    ) {
        if graph.outstanding().fetch_sub(1, Ordering::SeqCst) == 1 {
            let resources = graph
                .body()
                .graph_mut()
                .map(|work| std::mem::take(&mut work.resources))
                .unwrap_or_default();
            if !resources.is_empty() {
                trace!(graph = %id, count = resources.len(), "releasing graph resources");
            }
            drop(resources);
            self.finish_node(graph, id);
        }
    }

    /// Completion bookkeeping: event signals, successors, release, owner.
    fn finish_node(
        &self,
        node: &Arc<TaskNode>,
        id: NodeId,
    ) {
        node.set_state(NodeState::Finished);
        let (owner, run, signals) = {
            let mut body = node.body();
            (
                std::mem::take(&mut body.owner),
                body.run.clone(),
                std::mem::take(&mut body.signals),
            )
        };

        if let Some(run) = &run {
            for key in &signals {
                self.signal_event(run, key);
            }
        }
        for successor in node.seal_successors() {
            self.satisfy_structural(successor);
        }
        if let Err(error) = self.arena.release(id) {
            error!(%error, "finished node could not be released");
        }

        match owner {
            Owner::Graph(graph) => match self.arena.get(graph) {
                Ok(parent) => self.graph_child_done(&parent, graph),
                Err(error) => error!(%error, "owning graph vanished before its child finished"),
            },
            Owner::Run(run) => {
                if run.node_done() {
                    self.complete_run(&run);
                }
            },
            Owner::None => warn!(node = %id, "finished node had no owner"),
        }
    }

    pub(crate) fn complete_run(
        &self,
        run: &RunState,
    ) {
        self.stats.record_run();
        run.complete();
        debug!(run = run.name(), "run finished");
        // Helpers blocked in `next_job` re-check their target run.
        self.queue.notify_all();
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Track `run` so that stopping the pool can resolve it.
    pub(crate) fn register_run(
        &self,
        run: &Arc<RunState>,
    ) -> SchedulerResult<()> {
        let mut runs = self.runs.lock();
        if self.queue.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        runs.retain(|weak| weak.upgrade().is_some_and(|run| !run.is_done()));
        runs.push(Arc::downgrade(run));
        Ok(())
    }

    /// Set the stop flag and resolve every pending run as stopped.
    pub(crate) fn stop(&self) {
        self.queue.stop();
        let runs = std::mem::take(&mut *self.runs.lock());
        let mut abandoned = 0;
        for run in runs.iter().filter_map(Weak::upgrade) {
            if !run.is_done() {
                run.abandon();
                abandoned += 1;
            }
        }
        debug!(abandoned, "pool stopped");
    }

    /// Static cycle check over the children declared under `root`.
    ///
    /// `extra_children` stands in for the children of a batch, which has no
    /// graph node of its own.
    pub(crate) fn check_acyclic(
        &self,
        root: NodeId,
        extra_children: Option<&[NodeId]>,
    ) -> SchedulerResult<()> {
        let children = |id: NodeId| -> Vec<NodeId> {
            if id == root {
                if let Some(extra) = extra_children {
                    return extra.to_vec();
                }
            }
            let Ok(node) = self.arena.get(id) else {
                return Vec::new();
            };
            let body = node.body();
            let children = body
                .graph()
                .map(|graph| graph.children.clone())
                .unwrap_or_default();
            children
        };
        let successors = |id: NodeId| -> Vec<NodeId> {
            self.arena
                .get(id)
                .map(|node| node.successors().to_vec())
                .unwrap_or_default()
        };
        match find_cycle(root, children, successors) {
            Some(at) => Err(SchedulerError::Cycle(at)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Allocate a node owned by `owner` without touching any counter.
    pub(crate) fn create_node(
        &self,
        kind: NodeKind,
        owner: Owner,
        run: Option<Arc<RunState>>,
    ) -> NodeId {
        LocalAllocator::new(&self.arena, owner, run)
            .allocate(kind, kind.label().to_string())
            .id()
    }

    /// Allocate a child of a graph that is still accepting children.
    ///
    /// Adding to a frozen or released graph is a caller bug and panics.
    pub(crate) fn add_child(
        &self,
        graph_id: NodeId,
        kind: NodeKind,
    ) -> NodeId {
        let graph = match self.arena.get(graph_id) {
            Ok(graph) => graph,
            Err(error) => panic!("cannot add a child: {error}"),
        };
        let state = graph.state();
        let mut body = graph.body();
        let run = body.run.clone();
        let accepting = body.graph().is_some_and(|work| work.accepting)
            && matches!(state, NodeState::Building | NodeState::Running);
        assert!(
            accepting,
            "graph {graph_id} is frozen; add children before running it or from its setup functor"
        );

        let child = self.create_node(kind, Owner::Graph(graph_id), run);
        if let Some(work) = body.graph_mut() {
            work.children.push(child);
        }
        child
    }

    /// Allocate a node from inside a running functor, owned like the caller.
    pub(crate) fn spawn_from(
        &self,
        owner: &Owner,
        run: &Arc<RunState>,
        kind: NodeKind,
    ) -> NodeId {
        match owner {
            Owner::Graph(graph) => match self.arena.get(*graph) {
                Ok(graph) => {
                    graph.outstanding().fetch_add(1, Ordering::SeqCst);
                },
                Err(error) => error!(%error, "spawning into a graph that is gone"),
            },
            Owner::Run(owner_run) => owner_run.add_outstanding(),
            Owner::None => warn!("spawning from a node without owner"),
        }
        self.create_node(kind, owner.clone(), Some(run.clone()))
    }

    /// Apply `f` to a node that is still being built.
    pub(crate) fn configure<F>(
        &self,
        id: NodeId,
        f: F,
    ) -> SchedulerResult<()>
    where
        F: FnOnce(&TaskNode, &mut NodeBody),
    {
        let node = self.arena.get(id)?;
        if node.state() != NodeState::Building {
            return Err(SchedulerError::Frozen(id));
        }
        let mut body = node.body();
        f(&node, &mut body);
        Ok(())
    }

    /// Register `successor` behind `predecessor`.
    pub(crate) fn add_dependency(
        &self,
        successor: NodeId,
        predecessor: NodeId,
    ) -> SchedulerResult<()> {
        if successor == predecessor {
            return Err(SchedulerError::SelfDependency(successor));
        }
        let succ = self.arena.get(successor)?;
        if succ.state() != NodeState::Building {
            return Err(SchedulerError::Frozen(successor));
        }
        let pred = self
            .arena
            .get(predecessor)
            .map_err(|_| SchedulerError::PredecessorFinished(predecessor))?;
        if !pred.try_add_successor(predecessor, successor, &succ) {
            return Err(SchedulerError::PredecessorFinished(predecessor));
        }
        Ok(())
    }

    /// Release a node that was never run, and its static children.
    pub(crate) fn discard(
        &self,
        id: NodeId,
    ) -> SchedulerResult<()> {
        let node = self.arena.get(id)?;
        if node.state() != NodeState::Building {
            return Err(SchedulerError::Frozen(id));
        }
        let children = node
            .body()
            .graph_mut()
            .map(|graph| std::mem::take(&mut graph.children))
            .unwrap_or_default();
        let local = LocalAllocator::new(&self.arena, Owner::Graph(id), None);
        for child in children {
            if self.arena.get(child)?.kind() == NodeKind::Graph {
                self.discard(child)?;
            } else {
                local.release(child)?;
            }
        }
        self.arena.release(id)
    }
}
