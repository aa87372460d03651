//! Instrumentation hook
//!
//! A profiler or timer plugs into the pool through [`TaskObserver`]. The pool
//! calls it around every functor, parallel-for slice and graph setup step.

use std::ops::Range;

use crate::runtime::dag::{NodeId, NodeKind};

/// What the pool knows about a call boundary.
#[derive(Debug, Clone)]
pub struct TaskInfo<'a> {
    /// Task name as set with `.name()`.
    pub name: &'a str,
    /// Node being executed.
    pub node: NodeId,
    /// Node kind.
    pub kind: NodeKind,
    /// Worker index, `None` when a helping or main thread runs the call.
    pub worker: Option<usize>,
    /// Index range of a parallel-for slice.
    pub slice: Option<Range<usize>>,
}

/// Begin/end callbacks around task execution.
///
/// A panic in either callback is caught and logged; it does not fail the
/// task or stop the worker.
pub trait TaskObserver: Send + Sync {
    /// Called right before the functor runs.
    fn on_begin(
        &self,
        info: &TaskInfo<'_>,
    );

    /// Called right after the functor returned or panicked.
    fn on_end(
        &self,
        info: &TaskInfo<'_>,
        succeeded: bool,
    );
}
