//! Ready queue for the worker pool
//!
//! One lock guards the shared FIFO, the main-thread FIFO and the stop flag,
//! and one condition variable wakes threads blocked on any of them. Jobs are
//! popped under the lock and always executed after it is released.

use std::collections::VecDeque;
use std::ops::Range;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};

use crate::runtime::dag::{JobFn, NodeId, QueueAffinity};

/// A unit of work handed to a worker.
pub(crate) enum Job {
    /// Execute a ready node.
    Node(NodeId),
    /// Run one slice of a parallel-for node.
    Slice {
        node: NodeId,
        func: JobFn,
        range: Range<usize>,
    },
}

#[derive(Default)]
struct QueueState {
    shared: VecDeque<Job>,
    main: VecDeque<Job>,
    stop: bool,
}

/// Multi-producer, multi-consumer ready queue.
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    main_thread: ThreadId,
}

impl TaskQueue {
    /// Create an empty queue whose pinned jobs belong to `main_thread`.
    pub(crate) fn new(main_thread: ThreadId) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            main_thread,
        }
    }

    /// Thread allowed to take pinned jobs.
    #[inline]
    pub(crate) fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    /// Push one job.
    ///
    /// A shared job wakes one waiter. A pinned job wakes every waiter, since
    /// only the main thread may take it and a single wake could land on a worker.
    pub(crate) fn push(
        &self,
        job: Job,
        affinity: QueueAffinity,
    ) {
        let mut state = self.state.lock();
        match affinity {
            QueueAffinity::Shared => {
                state.shared.push_back(job);
                drop(state);
                self.available.notify_one();
            },
            QueueAffinity::MainThread => {
                state.main.push_back(job);
                drop(state);
                self.available.notify_all();
            },
        }
    }

    /// Push several shared jobs under one lock acquisition.
    pub(crate) fn push_batch(
        &self,
        jobs: Vec<Job>,
    ) {
        let count = jobs.len();
        if count == 0 {
            return;
        }
        self.state.lock().shared.extend(jobs);
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Block until a job is available, the queue is stopped, or `done` holds.
    ///
    /// `done` is evaluated under the queue lock; whoever makes it true must
    /// call [`TaskQueue::notify_all`] afterwards so the wake is not lost.
    pub(crate) fn next_job<F>(
        &self,
        take_main: bool,
        done: F,
    ) -> Option<Job>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock();
        loop {
            if state.stop || done() {
                return None;
            }
            if take_main {
                if let Some(job) = state.main.pop_front() {
                    return Some(job);
                }
            }
            if let Some(job) = state.shared.pop_front() {
                return Some(job);
            }
            self.available.wait(&mut state);
        }
    }

    /// Pop a pinned job without blocking.
    pub(crate) fn try_pop_main(&self) -> Option<Job> {
        self.state.lock().main.pop_front()
    }

    /// Wake every blocked thread so it re-checks its exit condition.
    pub(crate) fn notify_all(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }

    /// Set the stop flag and wake everyone.
    pub(crate) fn stop(&self) {
        self.state.lock().stop = true;
        self.available.notify_all();
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }

    /// Depth of the shared queue and of the main-thread queue.
    pub(crate) fn depths(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.shared.len(), state.main.len())
    }
}
