/// Values handed from upstream tasks to a node
mod node_input;
pub use node_input::NodeInput;

/// Runtime view of one persisted task
mod execution_node;
pub use execution_node::{ExecutionNode, FieldPathMap};

/// What the engine needs from a data store
mod connector;
pub use connector::{Connector, ConnectorError, ConnectorRegistry, PollStatus, QueryConfig};

/// Select rendering for dry runs
mod query_config;
pub use query_config::FilterQueryConfig;

/// In-memory connector over json fixture rows
mod memory_connector;
pub use memory_connector::{AsyncMode, Fixture, MemoryConnector};

/// Bounded retries around one connector call
mod retry;
pub use retry::{Backoff, Outcome, RetryController};

/// Ready queue shared by worker threads
mod work_queue;
use work_queue::WorkQueue;

/// Runs the tasks of a request, stage by stage
mod scheduler;
pub use scheduler::{Scheduler, StageOutcome};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No connector registered for key \"{0}\"")]
    UnknownConnector(String),
    #[error("Task {0} is not awaiting processing")]
    NotAwaiting(Uuid),
    #[error("Task {0} is completed by polling, not by callback")]
    NotCallbackTask(Uuid),
}
