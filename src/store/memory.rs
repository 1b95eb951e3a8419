use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use uuid::Uuid;

use util::HashMap;

use super::{sort_tasks, transition, Error, IdentityCache, TaskStore};
use crate::request::{Identity, PrivacyRequest};
use crate::task::{ActionType, ExecutionLog, RequestTask, TaskStatus};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, RequestTask>,
    requests: HashMap<Uuid, PrivacyRequest>,
    logs: Vec<ExecutionLog>,
    identities: HashMap<Uuid, Identity>,
}

/// Task store that never touches disk. Every operation takes one lock,
/// so compare-and-set is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner.lock().map_err(|_| Error::Poisoned)
    }
}

impl TaskStore for MemoryStore {
    fn load_task(&self, id: Uuid) -> Result<RequestTask> {
        let inner = self.lock()?;
        Ok(inner.tasks.get(&id).cloned().ok_or(Error::TaskNotFound(id))?)
    }

    fn save_task(&self, task: &RequestTask) -> Result<()> {
        self.lock()?.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn save_claimed(&self, task: &RequestTask) -> Result<bool> {
        let mut inner = self.lock()?;
        let stored = inner.tasks.get(&task.id).ok_or(Error::TaskNotFound(task.id))?;
        if stored.status != TaskStatus::InProcessing {
            return Ok(false);
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    fn create_tasks_for_request(&self, tasks: &[RequestTask]) -> Result<()> {
        let mut inner = self.lock()?;
        for task in tasks {
            inner.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Option<RequestTask>> {
        let mut inner = self.lock()?;
        let task = inner.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if transition(task, expected, next)? {
            Ok(Some(task.clone()))
        } else {
            Ok(None)
        }
    }

    fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>> {
        let inner = self.lock()?;
        let mut tasks: Vec<_> = inner
            .tasks
            .values()
            .filter(|t| t.privacy_request_id == request_id)
            .filter(|t| action.map_or(true, |a| t.action_type == a))
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    fn load_request(&self, id: Uuid) -> Result<PrivacyRequest> {
        let inner = self.lock()?;
        Ok(inner
            .requests
            .get(&id)
            .cloned()
            .ok_or(Error::RequestNotFound(id))?)
    }

    fn save_request(&self, request: &PrivacyRequest) -> Result<()> {
        self.lock()?.requests.insert(request.id, request.clone());
        Ok(())
    }

    fn update_request(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut PrivacyRequest),
    ) -> Result<PrivacyRequest> {
        let mut inner = self.lock()?;
        let request = inner.requests.get_mut(&id).ok_or(Error::RequestNotFound(id))?;
        f(request);
        Ok(request.clone())
    }

    fn append_log(&self, log: &ExecutionLog) -> Result<()> {
        self.lock()?.logs.push(log.clone());
        Ok(())
    }

    fn execution_logs(&self, request_id: Uuid) -> Result<Vec<ExecutionLog>> {
        let inner = self.lock()?;
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.privacy_request_id == request_id)
            .cloned()
            .collect())
    }
}

impl IdentityCache for MemoryStore {
    fn cache_identity(&self, request_id: Uuid, identity: &Identity) -> Result<()> {
        self.lock()?.identities.insert(request_id, identity.clone());
        Ok(())
    }

    fn get_cached_identity(&self, request_id: Uuid) -> Result<Option<Identity>> {
        Ok(self.lock()?.identities.get(&request_id).cloned())
    }
}
