//! Runtime system
//!
//! This module contains the task scheduler and the structures it is built on:
//! the node arena, the dependency graph records and the event registry.

pub mod dag;
pub mod error;
pub mod event;
pub mod memory;
pub mod scheduler;

pub use dag::{AsNode, NodeId, NodeKind, NodeState};
pub use error::{RunError, SchedulerError, SchedulerResult, TaskError};
pub use event::{EventKey, EventRegistry};
pub use scheduler::{
    ParallelFor, PoolStatus, RunFuture, SchedulerConfig, SchedulerStats, Task, TaskBatch,
    TaskContext, TaskGraph, TaskInfo, TaskObserver, WorkerPool, WorkerState,
};
