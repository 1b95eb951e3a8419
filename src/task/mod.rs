use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of one task, and the transitions between statuses
mod status;
pub use status::TaskStatus;

/// The persisted row for one collection in one request
mod request_task;
pub use request_task::{RequestTask, TraversalDetails};

/// Append-only record of task attempts
mod execution_log;
pub use execution_log::ExecutionLog;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Task {task} cannot move from {from} to {to}")]
    IllegalTransition {
        task: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// What a task does with its collection.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Access,
    Erasure,
    Consent,
}

impl ActionType {
    /// Stages in the order they run within a request.
    pub const ORDER: [ActionType; 3] = [Self::Access, Self::Erasure, Self::Consent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Erasure => "erasure",
            Self::Consent => "consent",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
