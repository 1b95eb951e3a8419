use anyhow::Result;
use uuid::Uuid;

use crate::request::{Identity, PrivacyRequest};
use crate::task::{ActionType, ExecutionLog, RequestTask, TaskStatus};

/// Keeps everything in memory; for tests and one-shot runs
mod memory;
pub use memory::MemoryStore;

/// One json file per task and request under the output directory
mod fs_store;
pub use fs_store::FsStore;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No task with id {0}")]
    TaskNotFound(Uuid),
    #[error("No privacy request with id {0}")]
    RequestNotFound(Uuid),
    #[error("Store lock was poisoned by a panicking worker")]
    Poisoned,
}

/// Durable storage for tasks, requests and execution logs.
///
/// Status changes that race between workers go through
/// [`TaskStore::compare_and_set_status`], which must be atomic.
pub trait TaskStore: Send + Sync {
    fn load_task(&self, id: Uuid) -> Result<RequestTask>;

    fn save_task(&self, task: &RequestTask) -> Result<()>;

    /// Save a task this worker has claimed. Nothing is written unless the
    /// stored copy is still `in_processing`; returns whether it was.
    fn save_claimed(&self, task: &RequestTask) -> Result<bool>;

    fn create_tasks_for_request(&self, tasks: &[RequestTask]) -> Result<()>;

    /// Move a task from any of `expected` to `next`. Returns the updated task,
    /// or `None` if the task was not in one of the expected statuses.
    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Option<RequestTask>>;

    /// Claim a runnable task for this worker.
    fn claim_task(&self, id: Uuid) -> Result<Option<RequestTask>> {
        self.compare_and_set_status(
            id,
            &[TaskStatus::Pending, TaskStatus::Retrying],
            TaskStatus::InProcessing,
        )
    }

    /// Tasks for a request, optionally only those for one action, oldest first.
    fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>>;

    fn load_request(&self, id: Uuid) -> Result<PrivacyRequest>;

    fn save_request(&self, request: &PrivacyRequest) -> Result<()>;

    /// Load, modify and save a request as one atomic step.
    fn update_request(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut PrivacyRequest),
    ) -> Result<PrivacyRequest>;

    fn append_log(&self, log: &ExecutionLog) -> Result<()>;

    /// Every log entry for a request, oldest first.
    fn execution_logs(&self, request_id: Uuid) -> Result<Vec<ExecutionLog>>;
}

/// Short-lived storage for identity values, which are kept out of task rows.
pub trait IdentityCache: Send + Sync {
    fn cache_identity(&self, request_id: Uuid, identity: &Identity) -> Result<()>;
    fn get_cached_identity(&self, request_id: Uuid) -> Result<Option<Identity>>;
}

/// Apply a status change to `task` if it is currently one of `expected`.
fn transition(
    task: &mut RequestTask,
    expected: &[TaskStatus],
    next: TaskStatus,
) -> Result<bool> {
    if !expected.contains(&task.status) {
        return Ok(false);
    }
    task.set_status(next)?;
    Ok(true)
}

/// Oldest first, with ids breaking ties.
fn sort_tasks(tasks: &mut [RequestTask]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
