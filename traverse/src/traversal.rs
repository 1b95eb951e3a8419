use std::collections::{BTreeMap, BTreeSet};

use colored::Colorize;

use graph::{CollectionAddress, DatasetGraph};
use util::IdVec;

use super::{bfs::BfsTraverser, Error, NodeId, TraversalNode};

/// Every collection reachable from a seed identity, in a valid visit order.
#[derive(Debug, Clone)]
pub struct Traversal {
    nodes: IdVec<NodeId, TraversalNode>,
    index: BTreeMap<CollectionAddress, NodeId>,
}

impl Traversal {
    /// Walk `graph` outward from the identities named in `seed`.
    /// Fails if any collection in the graph can't be reached.
    pub fn new<I, S>(graph: &DatasetGraph, seed: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seed: BTreeSet<String> = seed.into_iter().map(Into::into).collect();
        log::debug!("Traversing {} collections from seed {seed:?}", graph.len());

        let (visited, unreachable) = BfsTraverser::new(graph, &seed).traverse();
        if !unreachable.is_empty() {
            for addr in &unreachable {
                log::debug!("unreachable: {}", addr.to_string().red());
            }
            return Err(Error::Unreachable(unreachable));
        }

        let mut nodes = IdVec::with_capacity(visited.len());
        let mut index = BTreeMap::new();
        for node in visited {
            let addr = node.address.clone();
            let id = nodes.push(node);
            index.insert(addr, id);
        }
        Ok(Self { nodes, index })
    }

    /// Nodes in visit order. The root is always first.
    pub fn nodes(&self) -> impl Iterator<Item = &TraversalNode> {
        self.nodes.iter()
    }

    pub fn get(&self, addr: &CollectionAddress) -> Option<&TraversalNode> {
        self.index.get(addr).map(|id| self.nodes.get(*id))
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
