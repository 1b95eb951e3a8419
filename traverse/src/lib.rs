//!
//! The functions in this mod walk a [`graph::DatasetGraph`] outward from a seed identity,
//! producing the order in which collections can be visited by a request.
//!
//! The walk starts at the synthetic root collection, which holds one field per identity
//! in the seed. Every identity field in the graph whose identity is part of the seed gets an
//! edge from the root. From there, a collection is visited once all of the directed
//! edges that point into it have been traversed and every collection it is declared to
//! run `after` has been visited. Visiting a collection consumes every edge that can
//! flow out of it, so each edge is traversed exactly once.
//!
//! Collections that are never visited (they are not connected to the seed, or they
//! are part of a dependency cycle) are reported together in one error.

/// breadth-first walk of the graph
mod bfs;

/// struct returned by this mod
mod traversal;
pub use traversal::Traversal;

/// one visited collection
mod node;
pub use node::TraversalNode;

use graph::CollectionAddress;

/// Index of a node in a [`Traversal`], in visit order.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(u32);

impl From<NodeId> for usize {
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<usize> for NodeId {
    fn from(val: usize) -> NodeId {
        Self(val as u32)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Some collections cannot be reached from the seed identity \
        (they may be disconnected or part of a dependency cycle): {}",
        join_addresses(.0)
    )]
    Unreachable(Vec<CollectionAddress>),
}

fn join_addresses(addrs: &[CollectionAddress]) -> String {
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
