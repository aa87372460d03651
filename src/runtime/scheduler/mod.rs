//! Task scheduler for concurrent execution
//!
//! This module provides the [`WorkerPool`], a dependency-aware scheduler that
//! runs task graphs on a fixed set of worker threads.
//!
//! # Architecture
//!
//! - [`WorkerPool`] - owns the worker threads; entry point for graphs, batches and spawns
//! - [`TaskGraph`], [`Task`], [`ParallelFor`] - fluent node handles
//! - [`TaskBatch`] - nodes enqueued together without a graph node
//! - [`TaskContext`] - what a running functor sees of the scheduler
//! - [`RunFuture`] - completion handle of one execution window
//! - [`TaskObserver`] - begin/end instrumentation hook

pub(crate) mod executor;
pub mod future;
pub mod observer;
pub(crate) mod queue;
pub mod task;

pub use future::RunFuture;
pub use observer::{TaskInfo, TaskObserver};
pub use task::{ParallelFor, Task, TaskBatch, TaskContext, TaskGraph};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use self::executor::PoolShared;
use crate::runtime::error::{SchedulerError, SchedulerResult};
use crate::runtime::memory::ArenaStats;
use crate::util::config::ConfigError;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Prefix of worker thread names.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Worker stack size in bytes; platform default when unset.
    #[serde(default)]
    pub stack_size: Option<usize>,
    /// Slices per worker a parallel-for node is split into.
    #[serde(default = "default_chunks_per_worker")]
    pub parallel_for_chunks_per_worker: usize,
    /// Statistics collection enabled.
    #[serde(default = "default_enable_stats")]
    pub enable_stats: bool,
}

fn default_num_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_thread_name_prefix() -> String {
    "flow-worker".to_string()
}

fn default_chunks_per_worker() -> usize {
    4
}

fn default_enable_stats() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            thread_name_prefix: default_thread_name_prefix(),
            stack_size: None,
            parallel_for_chunks_per_worker: default_chunks_per_worker(),
            enable_stats: default_enable_stats(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with an explicit worker count.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    /// Reject values the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.num_workers must be at least 1".to_string(),
            ));
        }
        if self.parallel_for_chunks_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.parallel_for_chunks_per_worker must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler.thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Jobs pushed to a ready queue (nodes and parallel-for slices).
    pub nodes_enqueued: AtomicUsize,
    /// Functors, slices and setup steps executed.
    pub nodes_executed: AtomicUsize,
    /// Parallel-for slices executed.
    pub slices_executed: AtomicUsize,
    /// Failed invocations (errors and panics).
    pub tasks_failed: AtomicUsize,
    /// Execution windows resolved.
    pub runs_completed: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of running jobs.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    /// Record jobs pushed to a queue.
    #[inline]
    pub fn record_enqueued(
        &self,
        count: usize,
    ) {
        self.nodes_enqueued.fetch_add(count, Ordering::SeqCst);
    }

    /// Record one executed call boundary.
    #[inline]
    pub fn record_executed(
        &self,
        duration: Option<Duration>,
        failures: usize,
    ) {
        self.nodes_executed.fetch_add(1, Ordering::SeqCst);
        if failures > 0 {
            self.tasks_failed.fetch_add(failures, Ordering::SeqCst);
        }
        if let Some(duration) = duration {
            self.total_exec_time_us
                .fetch_add(duration.as_micros() as usize, Ordering::SeqCst);
        }
    }

    /// Record a parallel-for slice.
    #[inline]
    pub fn record_slice(&self) {
        self.slices_executed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a resolved run.
    #[inline]
    pub fn record_run(&self) {
        self.runs_completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::SeqCst);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Plain copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nodes_enqueued: self.nodes_enqueued.load(Ordering::SeqCst),
            nodes_executed: self.nodes_executed.load(Ordering::SeqCst),
            slices_executed: self.slices_executed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            runs_completed: self.runs_completed.load(Ordering::SeqCst),
            total_exec_time_us: self.total_exec_time_us.load(Ordering::SeqCst),
            peak_parallelism: self.peak_parallelism.load(Ordering::SeqCst),
        }
    }
}

/// Serializable copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub nodes_enqueued: usize,
    pub nodes_executed: usize,
    pub slices_executed: usize,
    pub tasks_failed: usize,
    pub runs_completed: usize,
    pub total_exec_time_us: usize,
    pub peak_parallelism: usize,
}

/// State of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Between two jobs.
    Idle = 0,
    /// Blocked on the queue's condition variable.
    WaitingOnQueue = 1,
    /// Executing a job.
    RunningNode = 2,
    /// Left its loop.
    Stopped = 3,
}

impl WorkerState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => WorkerState::Idle,
            1 => WorkerState::WaitingOnQueue,
            2 => WorkerState::RunningNode,
            _ => WorkerState::Stopped,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Per-worker state, indexed by worker id.
    pub workers: Vec<WorkerState>,
    /// Jobs waiting in the shared queue.
    pub queued: usize,
    /// Jobs waiting for the main thread.
    pub queued_main: usize,
    /// Allocator counters.
    pub arena: ArenaStats,
    /// Scheduler counters.
    pub stats: StatsSnapshot,
    /// Whether the stop flag is set.
    pub stopped: bool,
}

/// Fixed-size pool of worker threads executing task graphs.
///
/// The thread that constructs the pool is its main thread: nodes pinned with
/// `pin_to_main_thread` only run there, either from
/// [`pump_main_thread`](WorkerPool::pump_main_thread) or while that thread
/// blocks in [`RunFuture::wait_helping`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with the given configuration.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        Self::build(config, None)
    }

    /// Start a pool with `num_workers` threads and default settings otherwise.
    pub fn with_threads(num_workers: usize) -> SchedulerResult<Self> {
        Self::new(SchedulerConfig::with_workers(num_workers))
    }

    /// Start a pool reporting every call boundary to `observer`.
    pub fn with_observer(
        config: SchedulerConfig,
        observer: Arc<dyn TaskObserver>,
    ) -> SchedulerResult<Self> {
        Self::build(config, Some(observer))
    }

    fn build(
        config: SchedulerConfig,
        observer: Option<Arc<dyn TaskObserver>>,
    ) -> SchedulerResult<Self> {
        if config.num_workers == 0 {
            return Err(SchedulerError::InvalidThreadCount);
        }
        config.validate().map_err(|e| match e {
            ConfigError::Invalid(reason) => SchedulerError::InvalidConfig(reason),
            other => SchedulerError::InvalidConfig(other.to_string()),
        })?;
        let shared = Arc::new(PoolShared::new(config, observer));
        let workers = Self::spawn_workers(&shared)?;
        info!(
            workers = workers.len(),
            prefix = %shared.config().thread_name_prefix,
            "worker pool started"
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Spawn worker threads; on failure the ones already started are stopped.
    fn spawn_workers(shared: &Arc<PoolShared>) -> SchedulerResult<Vec<thread::JoinHandle<()>>> {
        let config = shared.config();
        let mut workers = Vec::with_capacity(config.num_workers);

        for worker_id in 0..config.num_workers {
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, worker_id));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let worker_shared = shared.clone();
            match builder.spawn(move || worker_shared.worker_loop(worker_id)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.stop();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::Spawn(e.to_string()));
                },
            }
        }

        Ok(workers)
    }

    /// Create an unattached graph; run it with [`TaskGraph::run`].
    pub fn new_graph(
        &self,
        name: impl Into<String>,
    ) -> TaskGraph {
        TaskGraph::new(self.shared.clone(), name.into())
    }

    /// Create an empty batch.
    pub fn new_batch(
        &self,
        name: impl Into<String>,
    ) -> TaskBatch {
        TaskBatch::new(self.shared.clone(), name.into())
    }

    /// Run one detached task.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> SchedulerResult<RunFuture>
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let batch = self.new_batch(name.clone());
        batch.new_task().name(name).functor_with(f);
        batch.enqueue()
    }

    /// Execute the nodes pinned to the main thread that are ready now.
    ///
    /// Returns the number of jobs run; always 0 off the main thread.
    pub fn pump_main_thread(&self) -> usize {
        self.shared.pump_main()
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.config().num_workers
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        self.shared.config()
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        self.shared.stats()
    }

    /// Snapshot of queues, workers, allocator and counters.
    pub fn status(&self) -> PoolStatus {
        let (queued, queued_main) = self.shared.queue().depths();
        PoolStatus {
            workers: self.shared.worker_states(),
            queued,
            queued_main,
            arena: self.shared.arena().stats(),
            stats: self.shared.stats().snapshot(),
            stopped: self.shared.queue().is_stopped(),
        }
    }

    /// Log the status snapshot at `info` level.
    pub fn log_status(&self) {
        let status = self.status();
        info!(
            queued = status.queued,
            queued_main = status.queued_main,
            live_nodes = status.arena.live,
            executed = status.stats.nodes_executed,
            failed = status.stats.tasks_failed,
            stopped = status.stopped,
            "pool status"
        );
        for (worker, state) in status.workers.iter().enumerate() {
            info!(worker, state = ?state, "worker status");
        }
    }

    /// Check if the pool accepts work.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.shared.queue().is_stopped()
    }

    /// Set the stop flag without joining.
    ///
    /// Workers exit at their next wake; jobs already dequeued run to
    /// completion. Runs that have not finished resolve to `RunError::Stopped`.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Stop and join the workers.
    pub fn shutdown(&self) {
        self.shared.stop();
        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            // A worker cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests;
