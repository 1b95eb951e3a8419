use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use graph::refine::consolidate_query_matches;
use graph::{Collection, CollectionAddress, Edge, FieldPath, Row};

use crate::task::RequestTask;

use super::NodeInput;

/// `(upstream path, local path)` pairs, per upstream collection.
pub type FieldPathMap = BTreeMap<CollectionAddress, Vec<(FieldPath, FieldPath)>>;

/// One collection's work for one request, rebuilt from its persisted task
/// so that it never needs the dataset graph.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub address: CollectionAddress,
    pub collection: Collection,
    pub connector_key: String,
    pub incoming_edges: Vec<Edge>,
    pub outgoing_edges: Vec<Edge>,
    pub input_keys: Vec<CollectionAddress>,
}

impl ExecutionNode {
    pub fn from_task(task: &RequestTask) -> Self {
        let details = &task.traversal_details;
        Self {
            address: task.collection_address.clone(),
            collection: task.collection.clone().unwrap_or_default(),
            connector_key: details.connector_key.clone(),
            incoming_edges: details.incoming_edges.clone(),
            outgoing_edges: details.outgoing_edges.clone(),
            input_keys: details.input_keys.clone(),
        }
    }

    /// Local field paths that receive data along an incoming edge.
    pub fn query_field_paths(&self) -> BTreeSet<FieldPath> {
        self.incoming_edges
            .iter()
            .filter(|e| e.f2.collection == self.address)
            .map(|e| e.f2.path.clone())
            .collect()
    }

    /// True if one of the grouped input fields is also seeded by an identity.
    pub fn dependent_identity_fields(&self) -> bool {
        let identities = self.collection.identities();
        self.collection
            .grouped_inputs
            .iter()
            .filter_map(|p| FieldPath::parse(p).ok())
            .any(|p| identities.contains_key(&p))
    }

    /// Map each upstream collection to the paths it feeds into this one.
    /// If `group_dependent_fields` is set, pairs whose local path is a grouped
    /// input are returned separately in the second map.
    pub fn build_incoming_field_path_maps(
        &self,
        group_dependent_fields: bool,
    ) -> (FieldPathMap, FieldPathMap) {
        let mut independent = FieldPathMap::new();
        let mut grouped = FieldPathMap::new();
        for edge in &self.incoming_edges {
            if edge.f2.collection != self.address {
                continue;
            }
            let pair = (edge.f1.path.clone(), edge.f2.path.clone());
            let map = if group_dependent_fields && self.collection.is_grouped(&edge.f2.path) {
                &mut grouped
            } else {
                &mut independent
            };
            map.entry(edge.f1.collection.clone()).or_default().push(pair);
        }
        (independent, grouped)
    }

    /// Combine upstream rows into the input for this node. Upstreams are
    /// consumed in `input_keys` order, whatever order they completed in.
    pub fn pre_process_input_data(
        &self,
        upstream: &BTreeMap<CollectionAddress, Vec<Row>>,
        group_dependent_fields: bool,
    ) -> NodeInput {
        let (independent, grouped) = self.build_incoming_field_path_maps(group_dependent_fields);
        let merge_identities = group_dependent_fields && self.dependent_identity_fields();

        let mut input = NodeInput::default();
        let mut identity_groups = Vec::new();

        for key in &self.input_keys {
            let Some(rows) = upstream.get(key) else {
                log::debug!("{}: no data from upstream {key}", self.address);
                continue;
            };

            if let Some(pairs) = independent.get(key) {
                for row in rows {
                    for (from, to) in pairs {
                        input.extend(&to.string_path(), consolidate_query_matches(row, from));
                    }
                }
            }

            if let Some(pairs) = grouped.get(key) {
                for row in rows {
                    let mut group: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                    for (from, to) in pairs {
                        let values = consolidate_query_matches(row, from);
                        if !values.is_empty() {
                            group.entry(to.string_path()).or_default().extend(values);
                        }
                    }
                    if group.is_empty() {
                        continue;
                    }
                    if merge_identities && key.is_root() {
                        identity_groups.push(group);
                    } else {
                        input.grouped.push(group);
                    }
                }
            }
        }

        if !identity_groups.is_empty() {
            if input.grouped.is_empty() {
                input.grouped = identity_groups;
            } else {
                for group in &mut input.grouped {
                    for identity in &identity_groups {
                        merge_group(group, identity);
                    }
                }
            }
        }
        input
    }

    /// Every input value that can be used to query this collection, cast to
    /// its field's type. Values that fail to cast are dropped, as are paths
    /// that don't exist on the collection.
    pub fn typed_filtered_values(&self, input: &NodeInput) -> BTreeMap<String, Vec<Value>> {
        let query_paths = self.query_field_paths();
        let mut keys: BTreeSet<&str> = input.values.keys().map(String::as_str).collect();
        for group in &input.grouped {
            keys.extend(group.keys().map(String::as_str));
        }

        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(values) = self.cast_values(key, &input.all_values(key), &query_paths) {
                out.insert(key.to_owned(), values);
            }
        }
        out
    }

    /// `input` with every value cast to its field's type. Groups that lose
    /// a field entirely are dropped, since they can no longer match.
    pub fn typed_input(&self, input: &NodeInput) -> NodeInput {
        let query_paths = self.query_field_paths();
        let mut out = NodeInput::default();
        for (key, values) in &input.values {
            if let Some(values) = self.cast_values(key, values, &query_paths) {
                out.values.insert(key.clone(), values);
            }
        }
        'groups: for group in &input.grouped {
            let mut typed = BTreeMap::new();
            for (key, values) in group {
                match self.cast_values(key, values, &query_paths) {
                    Some(values) => {
                        typed.insert(key.clone(), values);
                    }
                    None => continue 'groups,
                }
            }
            out.grouped.push(typed);
        }
        out
    }

    /// Typed values keyed by path, for trimming retrieved arrays down to
    /// their matching elements. Fields that return all elements are left out.
    pub fn query_paths_for_filter(&self, input: &NodeInput) -> BTreeMap<FieldPath, Vec<Value>> {
        self.typed_filtered_values(input)
            .into_iter()
            .filter_map(|(key, values)| {
                let path = FieldPath::parse(&key).ok()?;
                let field = self.collection.field(&path)?;
                (!field.return_all_elements).then_some((path, values))
            })
            .collect()
    }

    fn cast_values(
        &self,
        key: &str,
        values: &[Value],
        query_paths: &BTreeSet<FieldPath>,
    ) -> Option<Vec<Value>> {
        let path = FieldPath::parse(key).ok()?;
        if !query_paths.contains(&path) {
            return None;
        }
        let Some(field) = self.collection.field(&path) else {
            log::debug!("{}: ignoring input for missing field {key}", self.address);
            return None;
        };
        let mut typed: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            match field.cast(value) {
                Some(v) if !typed.contains(&v) => typed.push(v),
                Some(_) => {}
                None => log::trace!("{}: dropping {value} for {key}", self.address),
            }
        }
        (!typed.is_empty()).then_some(typed)
    }
}

fn merge_group(group: &mut BTreeMap<String, Vec<Value>>, other: &BTreeMap<String, Vec<Value>>) {
    for (path, values) in other {
        let entry = group.entry(path.clone()).or_default();
        for v in values {
            if !entry.contains(v) {
                entry.push(v.clone());
            }
        }
    }
}
