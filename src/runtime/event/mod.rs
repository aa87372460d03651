//! Named, numbered events
//!
//! An event is a `(name, id)` pair that tasks can wait on in addition to
//! their dependency edges. Signals are sticky: once an event is raised, every
//! later waiter is satisfied on registration, and raising it again is a no-op.
//!
//! A registry lives for one top-level execution window (one `TaskGraph::run`
//! or one batch enqueue) and is shared by every node scheduled under it.

use std::fmt;

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::runtime::dag::NodeId;

/// Identifies an event inside a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    name: String,
    id: u64,
}

impl EventKey {
    /// Create a key from a name and a numeric id.
    pub fn new(
        name: impl Into<String>,
        id: u64,
    ) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Event name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event number.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for EventKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Result of registering a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitRegistration {
    /// The waiter was recorded and will be returned by the next `signal`.
    Pending,
    /// The event had already been raised; the wait is satisfied.
    AlreadySignaled,
}

#[derive(Debug)]
enum EventEntry {
    Waiting(SmallVec<[NodeId; 4]>),
    Signaled,
}

/// Registry of events for one execution window.
#[derive(Debug, Default)]
pub struct EventRegistry {
    entries: Mutex<HashMap<EventKey, EventEntry>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `node` as waiting on `key`.
    ///
    /// Registration and signalling are serialized by the registry lock, so a
    /// waiter is either returned by exactly one `signal` call or reported as
    /// already satisfied here, never both and never neither.
    pub fn register_waiter(
        &self,
        key: &EventKey,
        node: NodeId,
    ) -> WaitRegistration {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(EventEntry::Signaled) => WaitRegistration::AlreadySignaled,
            Some(EventEntry::Waiting(waiters)) => {
                waiters.push(node);
                WaitRegistration::Pending
            },
            None => {
                let mut waiters = SmallVec::new();
                waiters.push(node);
                entries.insert(key.clone(), EventEntry::Waiting(waiters));
                WaitRegistration::Pending
            },
        }
    }

    /// Raise `key` and hand back the nodes that were waiting on it.
    ///
    /// The first signal drains the waiter list; later signals return nothing.
    pub fn signal(
        &self,
        key: &EventKey,
    ) -> SmallVec<[NodeId; 4]> {
        let mut entries = self.entries.lock();
        match entries.insert(key.clone(), EventEntry::Signaled) {
            Some(EventEntry::Waiting(waiters)) => waiters,
            Some(EventEntry::Signaled) | None => SmallVec::new(),
        }
    }

    /// Whether `key` has been raised in this registry.
    pub fn is_signaled(
        &self,
        key: &EventKey,
    ) -> bool {
        matches!(self.entries.lock().get(key), Some(EventEntry::Signaled))
    }

    /// Number of nodes still waiting on events that were never raised.
    pub fn pending_waiters(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|entry| match entry {
                EventEntry::Waiting(waiters) => waiters.len(),
                EventEntry::Signaled => 0,
            })
            .sum()
    }

    /// Number of distinct events that have been raised.
    pub fn signaled_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, EventEntry::Signaled))
            .count()
    }
}
