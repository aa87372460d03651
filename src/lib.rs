//! flowtask: a dependency-graph task scheduler
//!
//! Work is described as task nodes wired together by dependency edges,
//! nested graphs, parallel-for nodes and named events, and executed by a
//! fixed pool of worker threads. A node runs exactly once, after every
//! predecessor and every awaited event.
//!
//! # Example
//!
//! ```no_run
//! use flowtask::WorkerPool;
//!
//! fn main() -> anyhow::Result<()> {
//!     let pool = WorkerPool::with_threads(4)?;
//!     let graph = pool.new_graph("frame");
//!
//!     let a = graph.new_task();
//!     a.name("a").functor(|| println!("a"));
//!     let b = graph.new_task();
//!     b.name("b").functor(|| println!("b")).depends_on(&a)?;
//!
//!     graph.run_and_wait()?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::{
    AsNode, NodeId, NodeKind, NodeState, ParallelFor, PoolStatus, RunError, RunFuture,
    SchedulerConfig, SchedulerError, SchedulerResult, Task, TaskBatch, TaskContext, TaskError,
    TaskGraph, TaskInfo, TaskObserver, WorkerPool, WorkerState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "flowtask";
