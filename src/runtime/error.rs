//! Runtime error types

use thiserror::Error;

use crate::runtime::dag::NodeId;

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Configuration and lifecycle errors raised while building or running graphs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("worker pool needs at least one thread")]
    InvalidThreadCount,

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("{0} is stale: the node was already released")]
    StaleHandle(NodeId),

    #[error("{0} is already scheduled; dependencies and gates must be declared before it runs")]
    Frozen(NodeId),

    #[error("predecessor {0} has already finished")]
    PredecessorFinished(NodeId),

    #[error("{0} cannot depend on itself")]
    SelfDependency(NodeId),

    #[error("dependency cycle through {0}")]
    Cycle(NodeId),

    #[error("{0} is nested inside another graph; only top-level graphs can be run")]
    NotTopLevel(NodeId),

    #[error("graph {0} has already been run")]
    AlreadyRunning(NodeId),

    #[error("{0} was released twice")]
    DoubleRelease(NodeId),

    #[error("the worker pool has been stopped")]
    Stopped,
}

/// A single task that did not complete successfully.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{task}' failed: {source}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task '{task}' panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("setup of graph '{graph}' failed: {source}")]
    Setup {
        graph: String,
        #[source]
        source: anyhow::Error,
    },
}

impl TaskError {
    /// Name of the task or graph the error belongs to.
    pub fn task_name(&self) -> &str {
        match self {
            TaskError::Failed { task, .. } | TaskError::Panicked { task, .. } => task,
            TaskError::Setup { graph, .. } => graph,
        }
    }

    pub(crate) fn from_panic(
        task: &str,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked {
            task: task.to_string(),
            message,
        }
    }
}

/// Outcome carried by a [`RunFuture`](crate::runtime::scheduler::RunFuture) that did not succeed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run '{run}' finished with {} failed task(s); first: {}", .failures.len(), first_failure(.failures))]
    Failed {
        run: String,
        failures: Vec<TaskError>,
    },

    #[error("run '{run}' was abandoned because the worker pool stopped")]
    Stopped { run: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl RunError {
    /// The failed tasks, empty for a stopped or rejected run.
    pub fn failures(&self) -> &[TaskError] {
        match self {
            RunError::Failed { failures, .. } => failures,
            RunError::Stopped { .. } | RunError::Scheduler(_) => &[],
        }
    }
}

fn first_failure(failures: &[TaskError]) -> String {
    failures
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}
