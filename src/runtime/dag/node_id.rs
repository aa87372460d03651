//! Node handle for the task arena
//!
//! A `NodeId` names one use of an arena slot. Slots are recycled, so the
//! handle pairs the slot index with the slot's generation at allocation time.

use std::fmt;

/// A handle to a task node living in a [`NodeArena`](crate::runtime::memory::NodeArena).
///
/// The handle is `Copy` and never owns the node. Once the node is released,
/// the slot's generation moves on and every later access through this handle
/// reports [`SchedulerError::StaleHandle`](crate::runtime::SchedulerError::StaleHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Create a handle from a slot index and generation.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowtask::runtime::dag::NodeId;
    ///
    /// let id = NodeId::new(3, 1);
    /// assert_eq!(id.index(), 3);
    /// assert_eq!(id.generation(), 1);
    /// ```
    #[inline]
    pub const fn new(
        index: u32,
        generation: u32,
    ) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the arena.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot this handle was issued for.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "NodeId({}#{})", self.index, self.generation)
    }
}

/// Anything that names a task node: builders, graphs and raw ids.
///
/// Used as the argument of `depends_on` so that any node handle can be
/// passed as a predecessor.
pub trait AsNode {
    /// The handle of the underlying node.
    fn node_id(&self) -> NodeId;
}

impl AsNode for NodeId {
    #[inline]
    fn node_id(&self) -> NodeId {
        *self
    }
}
