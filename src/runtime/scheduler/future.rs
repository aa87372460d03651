//! Execution windows and their futures
//!
//! Every top-level `TaskGraph::run`, batch enqueue and `WorkerPool::spawn`
//! opens one execution window. The window counts the nodes it still waits
//! for, collects task failures, owns the event registry of the run, and
//! resolves the [`RunFuture`] handed back to the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::executor::PoolShared;
use crate::runtime::error::{RunError, TaskError};
use crate::runtime::event::{EventKey, EventRegistry};

#[derive(Default)]
struct Outcome {
    result: Option<Result<(), RunError>>,
    waker: Option<Waker>,
}

/// Shared state of one execution window.
pub(crate) struct RunState {
    name: String,
    events: EventRegistry,
    outstanding: AtomicUsize,
    failures: Mutex<Vec<TaskError>>,
    done: AtomicBool,
    outcome: Mutex<Outcome>,
    finished: Condvar,
}

impl RunState {
    /// Open a window tracking `outstanding` nodes.
    pub(crate) fn new(
        name: impl Into<String>,
        outstanding: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: EventRegistry::new(),
            outstanding: AtomicUsize::new(outstanding),
            failures: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
            outcome: Mutex::new(Outcome::default()),
            finished: Condvar::new(),
        })
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn events(&self) -> &EventRegistry {
        &self.events
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Track one more node.
    #[inline]
    pub(crate) fn add_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// One tracked node finished; true when it was the last one.
    #[inline]
    pub(crate) fn node_done(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub(crate) fn record_failure(
        &self,
        error: TaskError,
    ) {
        debug!(run = %self.name, error = %error, "task failed");
        self.failures.lock().push(error);
    }

    /// Resolve the window from the collected failures.
    pub(crate) fn complete(&self) {
        let failures = std::mem::take(&mut *self.failures.lock());
        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(RunError::Failed {
                run: self.name.clone(),
                failures,
            })
        };
        self.resolve(result);
    }

    /// Resolve the window as stopped if it has not finished yet.
    pub(crate) fn abandon(&self) {
        self.resolve(Err(RunError::Stopped {
            run: self.name.clone(),
        }));
    }

    /// First resolution wins; later ones are ignored.
    fn resolve(
        &self,
        result: Result<(), RunError>,
    ) {
        let waker = {
            let mut outcome = self.outcome.lock();
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            outcome.result = Some(result);
            self.done.store(true, Ordering::SeqCst);
            outcome.waker.take()
        };
        self.finished.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Block until resolved and take the outcome.
    fn wait_result(&self) -> Result<(), RunError> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.result.take() {
                return result;
            }
            self.finished.wait(&mut outcome);
        }
    }
}

/// Handle to a running execution window.
///
/// Resolves once every node of the window, including nodes spawned while it
/// ran, has finished. The outcome is `Ok(())` or the failures collected on
/// the way; it can be taken once, by [`wait`](RunFuture::wait),
/// [`wait_helping`](RunFuture::wait_helping) or by awaiting the future.
#[must_use = "a run future does nothing unless waited on or polled"]
pub struct RunFuture {
    run: Arc<RunState>,
    shared: Arc<PoolShared>,
}

impl RunFuture {
    pub(crate) fn new(
        run: Arc<RunState>,
        shared: Arc<PoolShared>,
    ) -> Self {
        Self { run, shared }
    }

    /// Name of the run.
    #[inline]
    pub fn name(&self) -> &str {
        self.run.name()
    }

    /// Whether the run has finished (successfully or not).
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.run.is_done()
    }

    /// Block the calling thread until the run finishes.
    pub fn wait(self) -> Result<(), RunError> {
        self.run.wait_result()
    }

    /// Block until the run finishes, executing ready nodes meanwhile.
    ///
    /// The calling thread drains the shared queue (and, on the pool's main
    /// thread, the pinned queue), so this makes progress even when every
    /// worker is busy or the caller is itself a worker.
    pub fn wait_helping(self) -> Result<(), RunError> {
        self.shared.help_until(&self.run);
        self.run.wait_result()
    }

    /// Raise an event in this run's registry.
    pub fn signal_event(
        &self,
        name: impl Into<String>,
        id: u64,
    ) {
        self.shared
            .signal_event(&self.run, &EventKey::new(name, id));
    }
}

impl Future for RunFuture {
    type Output = Result<(), RunError>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let mut outcome = self.run.outcome.lock();
        match outcome.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                outcome.waker = Some(cx.waker().clone());
                Poll::Pending
            },
        }
    }
}

impl std::fmt::Debug for RunFuture {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RunFuture")
            .field("name", &self.run.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}
