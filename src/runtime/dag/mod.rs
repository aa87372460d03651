//! Task dependency graph
//!
//! This module holds the node-level data structures of the scheduler:
//!
//! - [`NodeId`](node_id::NodeId) - Generation-checked handle to an arena slot
//! - [`TaskNode`](node::TaskNode) - Gate counters, successor edges and work of one node
//! - [`NodeKind`](node::NodeKind) - General, parallel-for or graph
//! - [`NodeState`](node::NodeState) - Lifecycle of a node from building to release
//!
//! It also provides the static cycle check run before a top-level graph is
//! scheduled.

pub mod node;
pub mod node_id;

use hashbrown::HashMap;

pub use node::{JobFn, NodeKind, NodeState, QueueAffinity, Resource, SetupFn, TaskFn, TaskNode};
pub use node_id::{AsNode, NodeId};

/// One half of a node in the cycle check.
///
/// A graph starts before its children start and finishes after its children
/// finish, so containment is modelled as two vertices per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Search the graph rooted at `root` for a dependency cycle.
///
/// `children` lists the static children of a graph node (empty for leaves)
/// and `successors` lists the nodes registered behind a node. Only edges
/// between nodes reachable from `root` through containment are considered.
/// Returns a node on the cycle, if any.
pub(crate) fn find_cycle<C, S>(
    root: NodeId,
    children: C,
    successors: S,
) -> Option<NodeId>
where
    C: Fn(NodeId) -> Vec<NodeId>,
    S: Fn(NodeId) -> Vec<NodeId>,
{
    // Collect the static tree first so edges leaving it are ignored.
    let mut kids: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        if kids.contains_key(&id) {
            continue;
        }
        let list = children(id);
        pending.extend(list.iter().copied());
        kids.insert(id, list);
    }

    let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
    for (id, list) in &kids {
        for child in list {
            parent.insert(*child, *id);
        }
    }

    let edges = |(id, phase): (NodeId, Phase)| -> Vec<(NodeId, Phase)> {
        match phase {
            Phase::Start => {
                let mut out: Vec<_> = kids
                    .get(&id)
                    .map(|list| list.iter().map(|c| (*c, Phase::Start)).collect())
                    .unwrap_or_default();
                out.push((id, Phase::Finish));
                out
            },
            Phase::Finish => {
                let mut out: Vec<_> = successors(id)
                    .into_iter()
                    .filter(|s| kids.contains_key(s))
                    .map(|s| (s, Phase::Start))
                    .collect();
                if let Some(p) = parent.get(&id) {
                    out.push((*p, Phase::Finish));
                }
                out
            },
        }
    };

    let mut marks: HashMap<(NodeId, Phase), Mark> = HashMap::new();
    let mut starts: Vec<NodeId> = kids.keys().copied().collect();
    starts.sort();

    for start in starts {
        let vertex = (start, Phase::Start);
        if marks.contains_key(&vertex) {
            continue;
        }

        // Iterative DFS; each frame holds a vertex and its unvisited edges.
        marks.insert(vertex, Mark::Visiting);
        let mut stack = vec![(vertex, edges(vertex))];
        while let Some((current, out)) = stack.last_mut() {
            match out.pop() {
                Some(next) => match marks.get(&next) {
                    Some(Mark::Visiting) => return Some(next.0),
                    Some(Mark::Done) => {},
                    None => {
                        marks.insert(next, Mark::Visiting);
                        let next_edges = edges(next);
                        stack.push((next, next_edges));
                    },
                },
                None => {
                    marks.insert(*current, Mark::Done);
                    stack.pop();
                },
            }
        }
    }

    None
}
