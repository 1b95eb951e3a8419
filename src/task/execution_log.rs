use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use graph::CollectionAddress;

use super::{ActionType, RequestTask, TaskStatus};

/// One immutable entry in a request's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub privacy_request_id: Uuid,
    pub task_id: Uuid,
    pub collection_address: CollectionAddress,
    pub connector_key: String,
    pub action_type: ActionType,
    /// 1-based attempt number within the current run of the task.
    pub attempt: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_affected: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn for_task(task: &RequestTask, attempt: u32, status: TaskStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            privacy_request_id: task.privacy_request_id,
            task_id: task.id,
            collection_address: task.collection_address.clone(),
            connector_key: task.traversal_details.connector_key.clone(),
            action_type: task.action_type,
            attempt,
            status,
            message: None,
            fields_affected: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields_affected = fields;
        self
    }
}
