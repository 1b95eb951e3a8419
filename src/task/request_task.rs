use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use graph::{Collection, CollectionAddress, Edge, Row};
use traverse::TraversalNode;

use super::{ActionType, Error, TaskStatus};

/// How a task's collection was reached, frozen when the task is created
/// so the task can be run again without rebuilding the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraversalDetails {
    pub connector_key: String,
    pub incoming_edges: Vec<Edge>,
    pub outgoing_edges: Vec<Edge>,
    /// upstream collections, in the order their data is handed to the connector.
    pub input_keys: Vec<CollectionAddress>,
    pub after: Vec<CollectionAddress>,
}

impl From<&TraversalNode> for TraversalDetails {
    fn from(node: &TraversalNode) -> Self {
        Self {
            connector_key: node.connector_key.clone(),
            incoming_edges: node.incoming_edges.iter().cloned().collect(),
            outgoing_edges: node.outgoing_edges.iter().cloned().collect(),
            input_keys: node.input_keys(),
            after: node.after.iter().cloned().collect(),
        }
    }
}

/// Durable state of one collection's work for one privacy request and action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTask {
    pub id: Uuid,
    pub privacy_request_id: Uuid,
    pub action_type: ActionType,
    pub collection_address: CollectionAddress,
    /// snapshot of the collection; absent for the root and terminator tasks.
    pub collection: Option<Collection>,
    pub traversal_details: TraversalDetails,
    pub status: TaskStatus,
    pub upstream_tasks: Vec<Uuid>,
    pub downstream_tasks: Vec<Uuid>,
    /// rows retrieved by an access task, trimmed to their matching elements.
    #[serde(default)]
    pub access_data: Vec<Row>,
    /// rows retrieved by an access task, with unmatched elements replaced by null.
    #[serde(default)]
    pub data_for_erasures: Vec<Row>,
    #[serde(default)]
    pub rows_masked: Option<u64>,
    #[serde(default)]
    pub consent_sent: Option<bool>,
    #[serde(default)]
    pub retry_count: u32,
    /// if set, an awaiting task is completed by polling its connector
    /// rather than by a callback.
    #[serde(default)]
    pub polling_async_task: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestTask {
    pub fn new(
        privacy_request_id: Uuid,
        action_type: ActionType,
        collection_address: CollectionAddress,
        collection: Option<Collection>,
        traversal_details: TraversalDetails,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            privacy_request_id,
            action_type,
            collection_address,
            collection,
            traversal_details,
            status: TaskStatus::Pending,
            upstream_tasks: Vec::new(),
            downstream_tasks: Vec::new(),
            access_data: Vec::new(),
            data_for_erasures: Vec::new(),
            rows_masked: None,
            consent_sent: None,
            retry_count: 0,
            polling_async_task: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root_task(&self) -> bool {
        self.collection_address.is_root()
    }

    pub fn is_terminator_task(&self) -> bool {
        self.collection_address.is_terminator()
    }

    /// Move to `next`, rejecting transitions the state machine doesn't allow.
    pub fn set_status(&mut self, next: TaskStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        log::trace!(
            "{} {} task: {} -> {next}",
            self.collection_address,
            self.action_type,
            self.status
        );
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Short description for log and UI output.
    pub fn label(&self) -> String {
        format!("{} {}", self.action_type, self.collection_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn task() -> RequestTask {
        RequestTask::new(
            Uuid::new_v4(),
            ActionType::Access,
            CollectionAddress::new("db", "customer"),
            None,
            TraversalDetails::default(),
        )
    }

    #[test]
    fn test_set_status() -> anyhow::Result<()> {
        let mut t = task();
        let created = t.updated_at;
        t.set_status(TaskStatus::InProcessing)?;
        t.set_status(TaskStatus::Complete)?;
        assert_eq!(t.status, TaskStatus::Complete);
        assert!(t.updated_at >= created);
        assert!(matches!(
            t.set_status(TaskStatus::InProcessing),
            Err(Error::IllegalTransition { .. })
        ));
        assert_eq!(t.status, TaskStatus::Complete);
        Ok(())
    }

    #[test]
    fn test_json_snapshot() -> anyhow::Result<()> {
        let t = task();
        let json = serde_json::to_string(&t)?;
        assert!(json.contains("\"collection_address\":\"db:customer\""));
        assert!(json.contains("\"status\":\"pending\""));
        let back: RequestTask = serde_json::from_str(&json)?;
        assert_eq!(back, t);
        Ok(())
    }
}
