use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use graph::refine::{consolidate_query_matches, filter_element_match};
use graph::{FieldPath, Row};

use crate::policy::{MaskingStrategy, Policy};
use crate::request::{Identity, PrivacyRequest};
use crate::task::{ActionType, RequestTask};

use super::{
    Connector, ConnectorError, ExecutionNode, FilterQueryConfig, NodeInput, PollStatus,
    QueryConfig,
};

/// How an async collection reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncMode {
    Polling,
    Callback,
}

/// Contents of a fixture file: rows per collection name, plus switches
/// for the behaviors a real connector might show.
#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Row>>,
    #[serde(default)]
    pub disabled: bool,
    /// actions this connector is enabled for; all of them if absent.
    #[serde(default)]
    pub actions: Option<Vec<ActionType>>,
    #[serde(default)]
    pub async_collections: BTreeMap<String, AsyncMode>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<String, Vec<Row>>,
    failures: BTreeMap<String, VecDeque<ConnectorError>>,
    calls: BTreeMap<String, u32>,
    pending: BTreeMap<(String, ActionType), PollStatus>,
    consent_sent: Vec<String>,
}

/// Connector over rows held in memory, keyed by collection name.
///
/// Rows match when any incoming value matches (or all values of one
/// grouped row do). Erasures rewrite the stored rows in place, matched
/// by primary key.
pub struct MemoryConnector {
    key: String,
    enabled: bool,
    actions: Option<Vec<ActionType>>,
    async_collections: BTreeMap<String, AsyncMode>,
    state: Mutex<State>,
}

impl MemoryConnector {
    pub fn new(key: impl Into<String>) -> Self {
        Self::from_fixture(key, Fixture::default())
    }

    pub fn from_fixture(key: impl Into<String>, fixture: Fixture) -> Self {
        Self {
            key: key.into(),
            enabled: !fixture.disabled,
            actions: fixture.actions,
            async_collections: fixture.async_collections,
            state: Mutex::new(State {
                rows: fixture.collections,
                ..Default::default()
            }),
        }
    }

    /// Read a fixture file.
    pub fn load(key: impl Into<String>, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture file {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture file {}", path.display()))?;
        Ok(Self::from_fixture(key, fixture))
    }

    pub fn with_rows(mut self, collection: &str, rows: Vec<Row>) -> Self {
        self.state_mut().rows.insert(collection.to_owned(), rows);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn actions(mut self, actions: &[ActionType]) -> Self {
        self.actions = Some(actions.to_vec());
        self
    }

    pub fn async_collection(mut self, collection: &str, mode: AsyncMode) -> Self {
        self.async_collections.insert(collection.to_owned(), mode);
        self
    }

    /// Make the next `times` calls for `collection` fail with `err`.
    pub fn fail_next(&self, collection: &str, err: ConnectorError, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(collection.to_owned()).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    /// Number of retrieve, mask and consent calls made for `collection`.
    pub fn calls(&self, collection: &str) -> u32 {
        self.state().calls.get(collection).copied().unwrap_or(0)
    }

    pub fn rows(&self, collection: &str) -> Vec<Row> {
        self.state().rows.get(collection).cloned().unwrap_or_default()
    }

    /// Collections that consent was sent for, in call order.
    pub fn consent_sent(&self) -> Vec<String> {
        self.state().consent_sent.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&mut self) -> &mut State {
        self.state.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a call, and return the next scripted failure if there is one.
    fn begin_call(&self, collection: &str) -> Result<(), ConnectorError> {
        let mut state = self.state();
        *state.calls.entry(collection.to_owned()).or_default() += 1;
        match state.failures.get_mut(collection).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// If `collection` is async, hold `result` for later and signal the wait.
    fn defer(
        &self,
        collection: &str,
        action: ActionType,
        result: PollStatus,
    ) -> Result<(), ConnectorError> {
        match self.async_collections.get(collection) {
            Some(mode) => {
                self.state()
                    .pending
                    .insert((collection.to_owned(), action), result);
                Err(ConnectorError::AwaitingCallback {
                    polling: *mode == AsyncMode::Polling,
                })
            }
            None => Ok(()),
        }
    }

    fn matching_rows(&self, node: &ExecutionNode, input: &NodeInput) -> Vec<Row> {
        self.state()
            .rows
            .get(node.collection.name.as_str())
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(node, row, input))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply the policy's erasure rules to the stored rows with the same
    /// primary key as `rows`. Returns the number of stored rows changed.
    fn mask_rows(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        rows: &[Row],
    ) -> Result<u64, ConnectorError> {
        let targets = policy
            .erasure_targets(&node.collection)
            .map_err(|e| ConnectorError::Other(e.to_string()))?;
        let primary_keys = node.collection.primary_key_paths();
        if targets.is_empty() || rows.is_empty() {
            return Ok(0);
        }
        if primary_keys.is_empty() {
            return Err(ConnectorError::Unsupported(format!(
                "{} has no primary key",
                node.address
            )));
        }

        let mut masked = 0;
        let mut state = self.state();
        let stored = state.rows.entry(node.collection.name.clone()).or_default();
        for row in rows {
            let key = primary_key(row, &primary_keys);
            if key.iter().all(Vec::is_empty) {
                log::warn!("{}: row without primary key values", node.address);
                continue;
            }
            for target in stored
                .iter_mut()
                .filter(|s| primary_key(s, &primary_keys) == key)
            {
                for (path, strategy) in &targets {
                    mask_row(target, row, path, strategy.as_ref());
                }
                masked += 1;
            }
        }
        Ok(masked)
    }
}

impl Connector for MemoryConnector {
    fn key(&self) -> &str {
        &self.key
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn supports(&self, action: ActionType) -> bool {
        self.actions.as_ref().map_or(true, |a| a.contains(&action))
    }

    fn test_connection(&self) -> Result<(), ConnectorError> {
        if self.enabled {
            Ok(())
        } else {
            Err(ConnectorError::Connection(format!("{} is disabled", self.key)))
        }
    }

    fn query_config(&self, node: &ExecutionNode) -> Box<dyn QueryConfig> {
        Box::new(FilterQueryConfig::new(node))
    }

    fn retrieve_data(
        &self,
        node: &ExecutionNode,
        _policy: &Policy,
        _request: &PrivacyRequest,
        input: &NodeInput,
    ) -> Result<Vec<Row>, ConnectorError> {
        let name = node.collection.name.as_str();
        self.begin_call(name)?;

        let rows = self.matching_rows(node, input);
        log::debug!("{}: {} rows for {}", self.key, rows.len(), node.address);

        self.defer(
            name,
            ActionType::Access,
            PollStatus::Complete {
                rows: rows.clone(),
                rows_masked: None,
            },
        )?;
        Ok(rows)
    }

    fn mask_data(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        _request: &PrivacyRequest,
        rows: &[Row],
        _input: &NodeInput,
    ) -> Result<u64, ConnectorError> {
        let name = node.collection.name.as_str();
        self.begin_call(name)?;

        let masked = self.mask_rows(node, policy, rows)?;
        log::debug!("{}: masked {masked} rows in {}", self.key, node.address);

        self.defer(
            name,
            ActionType::Erasure,
            PollStatus::Complete {
                rows: Vec::new(),
                rows_masked: Some(masked),
            },
        )?;
        Ok(masked)
    }

    fn run_consent_request(
        &self,
        node: &ExecutionNode,
        _policy: &Policy,
        request: &PrivacyRequest,
        identity: &Identity,
    ) -> Result<bool, ConnectorError> {
        let name = node.collection.name.as_str();
        self.begin_call(name)?;
        if request.consent_preferences.is_empty() || identity.values().all(Value::is_null) {
            return Ok(false);
        }
        self.state().consent_sent.push(name.to_owned());
        Ok(true)
    }

    fn poll_status(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        _request: &PrivacyRequest,
        task: &RequestTask,
        input: &NodeInput,
    ) -> Result<PollStatus, ConnectorError> {
        let key = (node.collection.name.clone(), task.action_type);
        if let Some(status) = self.state().pending.remove(&key) {
            return Ok(status);
        }

        // Started by another process. The fixture gives the same answer
        // as it did then.
        log::debug!("{}: no job held for {}; answering from fixture", self.key, task.label());
        let status = match task.action_type {
            ActionType::Access => PollStatus::Complete {
                rows: self.matching_rows(node, input),
                rows_masked: None,
            },
            ActionType::Erasure => {
                let paths = node.query_paths_for_filter(input);
                let rows: Vec<Row> = self
                    .matching_rows(node, input)
                    .iter()
                    .map(|row| filter_element_match(row, &paths, false))
                    .collect();
                PollStatus::Complete {
                    rows: Vec::new(),
                    rows_masked: Some(self.mask_rows(node, policy, &rows)?),
                }
            }
            ActionType::Consent => PollStatus::Complete {
                rows: Vec::new(),
                rows_masked: None,
            },
        };
        Ok(status)
    }
}

/// True if `row` matches any independent input value, or every value of
/// one grouped input row.
fn row_matches(node: &ExecutionNode, row: &Row, input: &NodeInput) -> bool {
    let values_at = |key: &str| -> Vec<Value> {
        let Ok(path) = FieldPath::parse(key) else {
            return Vec::new();
        };
        let found = consolidate_query_matches(row, &path);
        match node.collection.field(&path) {
            Some(field) => found.iter().filter_map(|v| field.cast(v)).collect(),
            None => found,
        }
    };

    let independent = input
        .values
        .iter()
        .any(|(key, wanted)| values_at(key).iter().any(|v| wanted.contains(v)));

    independent
        || input.grouped_rows().iter().any(|group| {
            group
                .iter()
                .all(|(key, wanted)| values_at(key).contains(wanted))
        })
}

fn primary_key(row: &Row, paths: &[FieldPath]) -> Vec<Vec<Value>> {
    paths
        .iter()
        .map(|p| consolidate_query_matches(row, p))
        .collect()
}

/// Mask the value at `path` in `stored`, skipping array elements that are
/// null placeholders in `erasure`.
fn mask_row(stored: &mut Row, erasure: &Row, path: &FieldPath, strategy: &dyn MaskingStrategy) {
    let Some((first, rest)) = path.levels().split_first() else {
        return;
    };
    if let (Some(value), Some(keep)) = (stored.get_mut(first), erasure.get(first)) {
        mask_value(value, keep, rest, strategy);
    }
}

fn mask_value(value: &mut Value, keep: &Value, levels: &[String], strategy: &dyn MaskingStrategy) {
    match (value, keep) {
        (Value::Array(items), Value::Array(keep)) => {
            for (item, k) in items.iter_mut().zip(keep) {
                if !k.is_null() {
                    mask_value(item, k, levels, strategy);
                }
            }
        }
        (value, _) if levels.is_empty() => *value = strategy.apply(value),
        (Value::Object(map), Value::Object(keep)) => {
            if let (Some(v), Some(k)) = (map.get_mut(&levels[0]), keep.get(&levels[0])) {
                mask_value(v, k, &levels[1..], strategy);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::TraversalDetails;
    use graph::{Collection, DataType, Edge, Field};
    use serde_json::json;
    use uuid::Uuid;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn node() -> ExecutionNode {
        let collection = Collection::new(
            "customer",
            vec![
                Field::new("id", DataType::Integer).primary_key(),
                Field::new("email", DataType::String)
                    .identity("email")
                    .categories(&["user.contact.email"]),
                Field::new("phones", DataType::String)
                    .array()
                    .categories(&["user.contact.phone"]),
            ],
        );
        let task = RequestTask::new(
            Uuid::new_v4(),
            ActionType::Access,
            graph::CollectionAddress::new("db", "customer"),
            Some(collection),
            TraversalDetails {
                connector_key: "db".to_owned(),
                incoming_edges: vec![Edge::directed(
                    "__ROOT__:__ROOT__:email".parse().unwrap(),
                    "db:customer:email".parse().unwrap(),
                )],
                ..Default::default()
            },
        );
        ExecutionNode::from_task(&task)
    }

    fn connector() -> MemoryConnector {
        MemoryConnector::new("db").with_rows(
            "customer",
            vec![
                row(json!({"id": 1, "email": "jane@example.com", "phones": ["555-1", "555-2"]})),
                row(json!({"id": 2, "email": "joe@example.com", "phones": []})),
            ],
        )
    }

    fn policy() -> Policy {
        Policy::from_json(
            r#"{"key": "erase", "rules": [
                {"name": "mask", "action_type": "erasure", "data_categories": ["user.contact"],
                 "masking": {"strategy": "null_rewrite"}}
            ]}"#,
        )
        .unwrap()
    }

    fn input(email: &str) -> NodeInput {
        let mut input = NodeInput::default();
        input.extend("email", [json!(email)]);
        input
    }

    #[test]
    fn test_retrieve_matches_input() -> anyhow::Result<()> {
        let connector = connector();
        let request = PrivacyRequest::new("erase", Identity::new());
        let rows = connector.retrieve_data(&node(), &policy(), &request, &input("jane@example.com"))?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        let none = connector.retrieve_data(&node(), &policy(), &request, &NodeInput::default())?;
        assert!(none.is_empty());
        assert_eq!(connector.calls("customer"), 2);
        Ok(())
    }

    #[test]
    fn test_mask_respects_placeholders() -> anyhow::Result<()> {
        let connector = connector();
        let request = PrivacyRequest::new("erase", Identity::new());
        let erasure = row(json!({"id": 1, "email": "jane@example.com", "phones": [null, "555-2"]}));
        let masked =
            connector.mask_data(&node(), &policy(), &request, &[erasure], &NodeInput::default())?;
        assert_eq!(masked, 1);

        let rows = connector.rows("customer");
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"id": 1, "email": null, "phones": ["555-1", null]})
        );
        assert_eq!(rows[1]["email"], json!("joe@example.com"));
        Ok(())
    }

    #[test]
    fn test_scripted_failures_and_async() -> anyhow::Result<()> {
        let connector = connector().async_collection("customer", AsyncMode::Polling);
        let request = PrivacyRequest::new("erase", Identity::new());
        connector.fail_next("customer", ConnectorError::Connection("down".to_owned()), 1);

        let first = connector.retrieve_data(&node(), &policy(), &request, &input("joe@example.com"));
        assert_eq!(first, Err(ConnectorError::Connection("down".to_owned())));
        let second = connector.retrieve_data(&node(), &policy(), &request, &input("joe@example.com"));
        assert_eq!(second, Err(ConnectorError::AwaitingCallback { polling: true }));

        let task = RequestTask::new(
            request.id,
            ActionType::Access,
            graph::CollectionAddress::new("db", "customer"),
            None,
            TraversalDetails::default(),
        );
        let polled = connector.poll_status(&node(), &policy(), &request, &task, &input("joe@example.com"))?;
        match polled {
            PollStatus::Complete { rows, .. } => assert_eq!(rows[0]["id"], json!(2)),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_poll_without_a_held_job_answers_from_fixture() -> anyhow::Result<()> {
        // a connector that never started the job, as in a later process
        let connector = connector().async_collection("customer", AsyncMode::Polling);
        let request = PrivacyRequest::new("erase", Identity::new());
        let mut task = RequestTask::new(
            request.id,
            ActionType::Access,
            graph::CollectionAddress::new("db", "customer"),
            None,
            TraversalDetails::default(),
        );

        let access = connector.poll_status(&node(), &policy(), &request, &task, &input("jane@example.com"))?;
        match access {
            PollStatus::Complete { rows, .. } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["id"], json!(1));
            }
            other => panic!("unexpected {other:?}"),
        }

        task.action_type = ActionType::Erasure;
        let erasure = connector.poll_status(&node(), &policy(), &request, &task, &input("jane@example.com"))?;
        assert_eq!(
            erasure,
            PollStatus::Complete {
                rows: Vec::new(),
                rows_masked: Some(1)
            }
        );
        assert_eq!(connector.rows("customer")[0]["email"], Value::Null);
        assert_eq!(connector.calls("customer"), 0);
        Ok(())
    }
}
