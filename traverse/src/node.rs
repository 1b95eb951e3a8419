use std::collections::BTreeSet;

use graph::{Collection, CollectionAddress, Edge, ROOT_NAME};

/// One collection reached by a traversal, with the edges it was reached through.
#[derive(Debug, Clone)]
pub struct TraversalNode {
    pub address: CollectionAddress,
    /// snapshot of the collection at traversal time.
    pub collection: Collection,
    pub connector_key: String,
    /// edges whose data flows into this collection. `f2` is always on this collection.
    pub incoming_edges: BTreeSet<Edge>,
    /// edges whose data flows out of this collection. `f1` is always on this collection.
    pub outgoing_edges: BTreeSet<Edge>,
    pub children: BTreeSet<CollectionAddress>,
    /// collections that must complete before this one starts.
    pub after: BTreeSet<CollectionAddress>,
}

impl TraversalNode {
    pub fn new(
        address: CollectionAddress,
        collection: Collection,
        connector_key: String,
        after: BTreeSet<CollectionAddress>,
    ) -> Self {
        Self {
            address,
            collection,
            connector_key,
            incoming_edges: BTreeSet::new(),
            outgoing_edges: BTreeSet::new(),
            children: BTreeSet::new(),
            after,
        }
    }

    /// The synthetic node that holds the seed identity.
    pub fn root() -> Self {
        Self::new(
            CollectionAddress::root(),
            Collection::new(ROOT_NAME, Vec::new()),
            ROOT_NAME.to_owned(),
            BTreeSet::new(),
        )
    }

    /// Addresses of the collections this node takes input from, sorted.
    /// Upstream data is always handed to connectors in this order.
    pub fn input_keys(&self) -> Vec<CollectionAddress> {
        let parents: BTreeSet<_> = self
            .incoming_edges
            .iter()
            .map(|e| e.f1.collection.clone())
            .collect();
        parents.into_iter().collect()
    }

    pub fn is_root(&self) -> bool {
        self.address.is_root()
    }
}
