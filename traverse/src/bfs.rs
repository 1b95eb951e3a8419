use std::collections::{BTreeMap, BTreeSet, VecDeque};

use colored::Colorize;

use graph::{CollectionAddress, DatasetGraph, Edge, FieldPath};
use util::HashSet;

use super::TraversalNode;

const QUEUE_CAPACITY: usize = 32;

/// Breadth-first walk over a dataset graph, starting at the root node.
pub struct BfsTraverser<'a> {
    graph: &'a DatasetGraph,
    /// edges that have not been traversed yet.
    remaining: BTreeSet<Edge>,
    /// collections ready to visit, in the order they became ready.
    queue: VecDeque<CollectionAddress>,
    /// collections reached by at least one edge, but not yet ready.
    waiting: BTreeSet<CollectionAddress>,
    /// every node reached so far, visited or not.
    nodes: BTreeMap<CollectionAddress, TraversalNode>,
    /// visit order.
    visited: Vec<CollectionAddress>,
    visited_set: HashSet<CollectionAddress>,
}

impl<'a> BfsTraverser<'a> {
    /// Create a traverser whose root holds the identities in `seed`.
    pub fn new(graph: &'a DatasetGraph, seed: &BTreeSet<String>) -> Self {
        let root = CollectionAddress::root();
        let mut remaining: BTreeSet<Edge> = graph
            .edges()
            .iter()
            .filter(|e| !e.is_self_reference())
            .cloned()
            .collect();

        for (field, identity) in graph.identity_keys() {
            if seed.contains(identity) {
                let root_field = root.field(FieldPath::new([identity.as_str()]));
                remaining.insert(Edge::directed(root_field, field.clone()));
            }
        }

        let mut nodes = BTreeMap::new();
        nodes.insert(root.clone(), TraversalNode::root());

        let mut queue = VecDeque::with_capacity(QUEUE_CAPACITY);
        queue.push_back(root);

        Self {
            graph,
            remaining,
            queue,
            waiting: BTreeSet::new(),
            nodes,
            visited: Vec::with_capacity(graph.len() + 1),
            visited_set: util::set_with_capacity(graph.len() + 1),
        }
    }

    /// Visit everything reachable. Returns the visited nodes in visit order,
    /// plus the sorted addresses of every collection that was never visited.
    pub fn traverse(mut self) -> (Vec<TraversalNode>, Vec<CollectionAddress>) {
        while let Some(addr) = self.queue.pop_front() {
            self.visit(addr);
            self.enqueue_ready();
        }

        let unreachable: Vec<_> = self
            .graph
            .nodes()
            .keys()
            .filter(|addr| !self.visited_set.contains(*addr))
            .cloned()
            .collect();

        for edge in &self.remaining {
            log::trace!("edge never traversed: {edge}");
        }

        let mut nodes = self.nodes;
        let ordered = self
            .visited
            .iter()
            .filter_map(|addr| nodes.remove(addr))
            .collect();
        (ordered, unreachable)
    }

    /// Consume every edge that can flow out of `addr`.
    fn visit(&mut self, addr: CollectionAddress) {
        log::debug!("Visiting {}", addr.to_string().cyan());

        let outgoing: Vec<Edge> = self
            .remaining
            .iter()
            .filter(|e| e.flows_from(&addr))
            .cloned()
            .collect();

        for edge in outgoing {
            self.remaining.remove(&edge);
            let edge = edge.oriented_from(&addr);
            let child = edge.f2.collection.clone();
            log::trace!("traversing {edge}");

            if let Some(node) = self.nodes.get_mut(&addr) {
                node.outgoing_edges.insert(edge.clone());
                node.children.insert(child.clone());
            }
            self.child_node(&child).incoming_edges.insert(edge);

            if !self.visited_set.contains(&child) && !self.queue.contains(&child) {
                self.waiting.insert(child);
            }
        }

        self.visited_set.insert(addr.clone());
        self.visited.push(addr);
    }

    /// Move every waiting collection that is now ready onto the queue.
    fn enqueue_ready(&mut self) {
        let ready: Vec<_> = self
            .waiting
            .iter()
            .filter(|addr| self.is_ready(addr))
            .cloned()
            .collect();
        for addr in ready {
            log::trace!("Enqueueing {}", addr.to_string().cyan());
            self.waiting.remove(&addr);
            self.queue.push_back(addr);
        }
    }

    fn is_ready(&self, addr: &CollectionAddress) -> bool {
        if self.remaining.iter().any(|e| e.blocks(addr)) {
            return false;
        }
        match self.graph.node(addr) {
            Some(node) => node.after.iter().all(|dep| self.visited_set.contains(dep)),
            None => false,
        }
    }

    fn child_node(&mut self, addr: &CollectionAddress) -> &mut TraversalNode {
        let graph = self.graph;
        self.nodes.entry(addr.clone()).or_insert_with(|| match graph.node(addr) {
            Some(n) => TraversalNode::new(
                addr.clone(),
                n.collection.clone(),
                n.connector_key.clone(),
                n.after.clone(),
            ),
            // edges only ever point at collections in the graph:
            None => TraversalNode::new(addr.clone(), Default::default(), String::new(), BTreeSet::new()),
        })
    }
}
