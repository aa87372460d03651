//! Task node allocators
//!
//! The root allocator owns every task node slot. General and parallel-for
//! records are recycled through per-kind free lists; graph records are
//! destroyed on release and their slot index is reused with a fresh record.
//!
//! A [`LocalAllocator`] is a thin view over the root used while building:
//! it stamps the owner and execution window onto each node it hands out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use crate::runtime::dag::node::Owner;
use crate::runtime::dag::{NodeId, NodeKind, TaskNode};
use crate::runtime::error::{SchedulerError, SchedulerResult};
use crate::runtime::scheduler::future::RunState;

#[derive(Debug, Default)]
struct FreeLists {
    general: Vec<u32>,
    parallel_for: Vec<u32>,
    /// Destroyed graph slots with the generation their next record starts at.
    vacant: Vec<(u32, u32)>,
}

impl FreeLists {
    fn pooled_mut(
        &mut self,
        kind: NodeKind,
    ) -> Option<&mut Vec<u32>> {
        match kind {
            NodeKind::General => Some(&mut self.general),
            NodeKind::ParallelFor => Some(&mut self.parallel_for),
            NodeKind::Graph => None,
        }
    }
}

/// Allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Nodes currently handed out.
    pub live: usize,
    /// Records constructed from scratch.
    pub created: usize,
    /// Allocations served from a free list.
    pub recycled: usize,
    /// Pooled general records waiting for reuse.
    pub free_general: usize,
    /// Pooled parallel-for records waiting for reuse.
    pub free_parallel_for: usize,
}

/// Root allocator owning every task node.
#[derive(Default)]
pub struct NodeArena {
    slots: RwLock<Vec<Option<Arc<TaskNode>>>>,
    free: Mutex<FreeLists>,
    live: AtomicUsize,
    created: AtomicUsize,
    recycled: AtomicUsize,
}

impl NodeArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a node of `kind` in the building state.
    ///
    /// Pooled kinds reuse a released record when one is available. Lock order
    /// is free lists first, then slots; neither is held while taking the other.
    pub fn allocate(
        &self,
        kind: NodeKind,
    ) -> Arc<TaskNode> {
        let (reuse, vacant) = {
            let mut free = self.free.lock();
            let reuse = free.pooled_mut(kind).and_then(|list| list.pop());
            let vacant = if reuse.is_none() {
                free.vacant.pop()
            } else {
                None
            };
            (reuse, vacant)
        };

        if let Some(index) = reuse {
            let slot = self.slots.read().get(index as usize).cloned().flatten();
            if let Some(node) = slot {
                node.activate();
                self.live.fetch_add(1, Ordering::Relaxed);
                self.recycled.fetch_add(1, Ordering::Relaxed);
                trace!(node = %node.id(), ?kind, "recycled task node");
                return node;
            }
        }

        let mut slots = self.slots.write();
        let node = match vacant {
            Some((index, generation)) => {
                let node = Arc::new(TaskNode::new(index, kind, generation));
                slots[index as usize] = Some(node.clone());
                node
            },
            None => {
                let index = slots.len() as u32;
                let node = Arc::new(TaskNode::new(index, kind, 0));
                slots.push(Some(node.clone()));
                node
            },
        };
        drop(slots);

        self.live.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        trace!(node = %node.id(), ?kind, "created task node");
        node
    }

    /// Look up the node named by `id`.
    pub fn get(
        &self,
        id: NodeId,
    ) -> SchedulerResult<Arc<TaskNode>> {
        let slot = self.slots.read().get(id.index() as usize).cloned().flatten();
        match slot {
            Some(node) if node.is_current(id) => Ok(node),
            _ => Err(SchedulerError::StaleHandle(id)),
        }
    }

    /// Return a node to the arena.
    ///
    /// The handle becomes stale; releasing it again is reported as
    /// [`SchedulerError::DoubleRelease`].
    pub fn release(
        &self,
        id: NodeId,
    ) -> SchedulerResult<()> {
        let slot = self.slots.read().get(id.index() as usize).cloned().flatten();
        let node = match slot {
            Some(node) => node,
            None => return Err(SchedulerError::DoubleRelease(id)),
        };
        if !node.retire(id) {
            return Err(SchedulerError::DoubleRelease(id));
        }

        let kind = node.kind();
        if kind.is_pooled() {
            if let Some(list) = self.free.lock().pooled_mut(kind) {
                list.push(id.index());
            }
        } else {
            self.slots.write()[id.index() as usize] = None;
            self.free
                .lock()
                .vacant
                .push((id.index(), id.generation().wrapping_add(1)));
        }

        self.live.fetch_sub(1, Ordering::Relaxed);
        trace!(node = %id, ?kind, "released task node");
        Ok(())
    }

    /// Number of nodes currently handed out.
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Snapshot of the allocator counters.
    pub fn stats(&self) -> ArenaStats {
        let free = self.free.lock();
        ArenaStats {
            live: self.live(),
            created: self.created.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            free_general: free.general.len(),
            free_parallel_for: free.parallel_for.len(),
        }
    }
}

/// Builder-side allocator bound to one owner.
pub(crate) struct LocalAllocator<'a> {
    root: &'a NodeArena,
    owner: Owner,
    run: Option<Arc<RunState>>,
}

impl<'a> LocalAllocator<'a> {
    pub(crate) fn new(
        root: &'a NodeArena,
        owner: Owner,
        run: Option<Arc<RunState>>,
    ) -> Self {
        Self { root, owner, run }
    }

    /// Allocate from the root and stamp owner and execution window.
    pub(crate) fn allocate(
        &self,
        kind: NodeKind,
        name: String,
    ) -> Arc<TaskNode> {
        let node = self.root.allocate(kind);
        {
            let mut body = node.body();
            body.name = name;
            body.owner = self.owner.clone();
            body.run = self.run.clone();
        }
        node
    }

    /// Forward a release to the root.
    pub(crate) fn release(
        &self,
        id: NodeId,
    ) -> SchedulerResult<()> {
        self.root.release(id)
    }
}
