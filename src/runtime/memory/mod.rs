//! Task node memory
//!
//! Nodes are allocated from a shared arena and addressed through
//! generation-checked [`NodeId`](crate::runtime::dag::NodeId) handles, so a
//! handle outliving its node is detected instead of aliasing a reused slot.

mod allocator;

pub use allocator::{ArenaStats, NodeArena};

pub(crate) use allocator::LocalAllocator;
