use std::collections::{BTreeMap, BTreeSet};

use crate::{
    AggregatedErrors, Collection, CollectionAddress, Dataset, Edge, Error, Errors, FieldAddress,
    ROOT_NAME, TERMINATOR_NAME,
};

/// One collection in the graph, with the dependencies resolved from its dataset.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub collection: Collection,
    pub connector_key: String,
    /// Every collection that has to finish before this one starts:
    /// the collection's own `after` list plus every collection
    /// in each dataset named by its dataset's `after` list.
    pub after: BTreeSet<CollectionAddress>,
}

/// Union of every collection and edge across a set of datasets.
#[derive(Debug, Clone, Default)]
pub struct DatasetGraph {
    nodes: BTreeMap<CollectionAddress, GraphNode>,
    edges: BTreeSet<Edge>,
    identity_keys: BTreeMap<FieldAddress, String>,
    dataset_connectors: BTreeMap<String, String>,
}

impl DatasetGraph {
    /// Build the graph, or fail with one error naming every bad reference.
    pub fn new(datasets: Vec<Dataset>) -> Result<Self, AggregatedErrors> {
        let mut errors = Errors::default();
        let mut graph = Self::default();

        // members of each dataset, for resolving dataset-level `after`:
        let mut members: BTreeMap<&str, Vec<CollectionAddress>> = BTreeMap::new();
        for ds in &datasets {
            if ds.name == ROOT_NAME || ds.name == TERMINATOR_NAME {
                errors.add(Error::ReservedName(ds.name.clone()));
            }
            graph
                .dataset_connectors
                .insert(ds.name.clone(), ds.connector_key.clone());
            members.entry(ds.name.as_str()).or_default().extend(ds.addresses());
        }

        for ds in &datasets {
            let mut dataset_after = BTreeSet::new();
            for name in &ds.after {
                match members.get(name.as_str()) {
                    Some(addrs) => dataset_after.extend(addrs.iter().cloned()),
                    None => errors.add(Error::MissingDependency {
                        collection: ds.name.clone(),
                        missing: name.clone(),
                    }),
                }
            }

            for (addr, collection) in ds.addresses().zip(&ds.collections) {
                if let Err(e) = collection.validate(&addr) {
                    errors.add(e);
                }
                let mut after = dataset_after.clone();
                after.extend(collection.after.iter().cloned());
                after.remove(&addr);

                let node = GraphNode {
                    collection: collection.clone(),
                    connector_key: ds.connector_key.clone(),
                    after,
                };
                if graph.nodes.contains_key(&addr) {
                    errors.add(Error::DuplicateCollection(addr.to_string()));
                } else {
                    graph.nodes.insert(addr, node);
                }
            }
        }

        graph.check_dependencies(&mut errors);
        graph.collect_edges(&mut errors);

        errors.into_result("building dataset graph")?;
        log::debug!(
            "Built dataset graph with {} collections and {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    fn check_dependencies(&self, errors: &mut Errors) {
        for (addr, node) in &self.nodes {
            let deps = node.after.iter().chain(&node.collection.erase_after);
            for dep in deps {
                if !self.nodes.contains_key(dep) {
                    errors.add(Error::MissingDependency {
                        collection: addr.to_string(),
                        missing: dep.to_string(),
                    });
                }
            }
        }
    }

    fn collect_edges(&mut self, errors: &mut Errors) {
        let mut edges = BTreeSet::new();
        let mut identity_keys = BTreeMap::new();
        for (addr, node) in &self.nodes {
            for (path, identity) in node.collection.identities() {
                identity_keys.insert(addr.field(path), identity);
            }
            for (path, refs) in node.collection.references() {
                let local = addr.field(path);
                for r in refs {
                    let Some(target) = self.nodes.get(&r.field.collection) else {
                        errors.add(Error::MissingCollection {
                            referenced_by: local.to_string(),
                            missing: r.field.collection.to_string(),
                        });
                        continue;
                    };
                    if target.collection.field(&r.field.path).is_none() {
                        errors.add(Error::MissingField {
                            referenced_by: local.to_string(),
                            missing: r.field.to_string(),
                        });
                        continue;
                    }
                    edges.insert(Edge::from_reference(local.clone(), r.field.clone(), r.direction));
                }
            }
        }
        self.edges = edges;
        self.identity_keys = identity_keys;
    }

    #[inline]
    pub fn nodes(&self) -> &BTreeMap<CollectionAddress, GraphNode> {
        &self.nodes
    }

    #[inline]
    pub fn node(&self, addr: &CollectionAddress) -> Option<&GraphNode> {
        self.nodes.get(addr)
    }

    #[inline]
    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Identity-seeded fields, mapped to the identity name that seeds them.
    #[inline]
    pub fn identity_keys(&self) -> &BTreeMap<FieldAddress, String> {
        &self.identity_keys
    }

    /// Dataset name mapped to the key of the connector that serves it.
    #[inline]
    pub fn dataset_connectors(&self) -> &BTreeMap<String, String> {
        &self.dataset_connectors
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
