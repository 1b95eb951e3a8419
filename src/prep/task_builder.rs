use std::collections::BTreeMap;

use anyhow::{Context, Result};
use uuid::Uuid;

use graph::{Collection, CollectionAddress, DatasetGraph};
use traverse::{Traversal, TraversalNode};

use crate::policy::Policy;
use crate::task::{ActionType, RequestTask, TraversalDetails};

use super::erasure_order::check_acyclic;

/// Builds every task a request needs, for every stage its policy runs.
///
/// Within a stage, tasks are linked by upstream and downstream ids, and
/// each stage ends with a terminator task that waits on every task nothing
/// else depends on.
pub struct TaskBuilder<'a> {
    request_id: Uuid,
    graph: &'a DatasetGraph,
    policy: &'a Policy,
}

impl<'a> TaskBuilder<'a> {
    pub fn new(request_id: Uuid, graph: &'a DatasetGraph, policy: &'a Policy) -> Self {
        Self {
            request_id,
            graph,
            policy,
        }
    }

    /// Traverse from `seed` and build the tasks. Graph and traversal errors
    /// are returned before any task exists.
    pub fn build(&self, seed: &[String]) -> Result<Vec<RequestTask>> {
        let stages = self.policy.stages();
        let mut tasks = Vec::new();

        if stages.contains(&ActionType::Access) || stages.contains(&ActionType::Erasure) {
            let traversal = Traversal::new(self.graph, seed.iter().cloned())
                .context("while traversing the dataset graph")?;
            if stages.contains(&ActionType::Access) {
                tasks.extend(self.access_tasks(&traversal));
            }
            if stages.contains(&ActionType::Erasure) {
                tasks.extend(self.erasure_tasks(&traversal)?);
            }
        }
        if stages.contains(&ActionType::Consent) {
            tasks.extend(self.consent_tasks());
        }

        log::debug!(
            "Built {} tasks for request {} ({})",
            tasks.len(),
            self.request_id,
            stages
                .iter()
                .map(ActionType::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(tasks)
    }

    fn access_tasks(&self, traversal: &Traversal) -> Vec<RequestTask> {
        let nodes = traversal
            .nodes()
            .map(|node| (self.task(ActionType::Access, node), access_deps(node)))
            .collect();
        link(self.request_id, ActionType::Access, nodes)
    }

    /// Same shape as the access stage, plus `erase_after` ordering.
    fn erasure_tasks(&self, traversal: &Traversal) -> Result<Vec<RequestTask>> {
        let mut deps = BTreeMap::new();
        for node in traversal.nodes() {
            let mut waits_on = access_deps(node);
            for addr in &node.collection.erase_after {
                if traversal.get(addr).is_some() {
                    waits_on.push(addr.clone());
                } else {
                    log::debug!("{}: ignoring erase_after {addr}, not in traversal", node.address);
                }
            }
            deps.insert(node.address.clone(), waits_on);
        }
        check_acyclic(&deps)?;

        let nodes = traversal
            .nodes()
            .map(|node| {
                let waits_on = deps.remove(&node.address).unwrap_or_default();
                (self.task(ActionType::Erasure, node), waits_on)
            })
            .collect();
        Ok(link(self.request_id, ActionType::Erasure, nodes))
    }

    /// Consent runs once per dataset, all in parallel: root, one task per
    /// dataset, terminator.
    fn consent_tasks(&self) -> Vec<RequestTask> {
        let root = RequestTask::new(
            self.request_id,
            ActionType::Consent,
            CollectionAddress::root(),
            None,
            TraversalDetails::default(),
        );
        let root_addr = root.collection_address.clone();

        let mut nodes = vec![(root, Vec::new())];
        for (dataset, connector_key) in self.graph.dataset_connectors() {
            let task = RequestTask::new(
                self.request_id,
                ActionType::Consent,
                CollectionAddress::new(dataset.as_str(), dataset.as_str()),
                Some(Collection::new(dataset.as_str(), Vec::new())),
                TraversalDetails {
                    connector_key: connector_key.clone(),
                    input_keys: vec![root_addr.clone()],
                    ..Default::default()
                },
            );
            nodes.push((task, vec![root_addr.clone()]));
        }
        link(self.request_id, ActionType::Consent, nodes)
    }

    fn task(&self, action: ActionType, node: &TraversalNode) -> RequestTask {
        let collection = (!node.is_root()).then(|| node.collection.clone());
        RequestTask::new(
            self.request_id,
            action,
            node.address.clone(),
            collection,
            TraversalDetails::from(node),
        )
    }
}

/// A node waits on its data parents and on its `after` collections.
fn access_deps(node: &TraversalNode) -> Vec<CollectionAddress> {
    let mut deps = node.input_keys();
    for addr in &node.after {
        if !deps.contains(addr) {
            deps.push(addr.clone());
        }
    }
    deps
}

/// Fill in upstream and downstream ids from each task's dependencies,
/// and add the terminator.
fn link(
    request_id: Uuid,
    action: ActionType,
    nodes: Vec<(RequestTask, Vec<CollectionAddress>)>,
) -> Vec<RequestTask> {
    let ids: BTreeMap<CollectionAddress, Uuid> = nodes
        .iter()
        .map(|(task, _)| (task.collection_address.clone(), task.id))
        .collect();

    let mut tasks: Vec<RequestTask> = Vec::with_capacity(nodes.len() + 1);
    for (mut task, deps) in nodes {
        for dep in &deps {
            match ids.get(dep) {
                Some(id) if !task.upstream_tasks.contains(id) => task.upstream_tasks.push(*id),
                Some(_) => {}
                None => log::trace!("{}: no {action} task for {dep}", task.collection_address),
            }
        }
        tasks.push(task);
    }

    let mut downstream: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for task in &tasks {
        for up in &task.upstream_tasks {
            downstream.entry(*up).or_default().push(task.id);
        }
    }

    let mut terminator = RequestTask::new(
        request_id,
        action,
        CollectionAddress::terminator(),
        None,
        TraversalDetails::default(),
    );
    for task in &mut tasks {
        task.downstream_tasks = downstream.remove(&task.id).unwrap_or_default();
        if task.downstream_tasks.is_empty() {
            task.downstream_tasks.push(terminator.id);
            terminator.upstream_tasks.push(task.id);
            terminator
                .traversal_details
                .input_keys
                .push(task.collection_address.clone());
        }
    }
    tasks.push(terminator);
    tasks
}
