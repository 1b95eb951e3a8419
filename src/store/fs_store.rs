use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use util::HashMap;

use super::{sort_tasks, transition, Error, IdentityCache, TaskStore};
use crate::fs::Fs;
use crate::request::{Identity, PrivacyRequest};
use crate::task::{ActionType, ExecutionLog, RequestTask, TaskStatus};

/// Task store that keeps one json file per task and request, plus an
/// append-only jsonl execution log per request, under the output directory:
///
/// ```text
/// $OUTPUT/requests/<request>/request.json
/// $OUTPUT/requests/<request>/identity.json
/// $OUTPUT/requests/<request>/execution_log.jsonl
/// $OUTPUT/requests/<request>/tasks/<task>.json
/// ```
///
/// Files are replaced atomically. Read-modify-write operations hold a
/// process-wide lock, so only one process should use a directory at a time.
pub struct FsStore {
    fs: Fs,
    /// held for every read-modify-write.
    write_lock: Mutex<()>,
    /// task id -> request id, filled in lazily.
    index: Mutex<HashMap<Uuid, Uuid>>,
}

impl FsStore {
    /// Create a store writing through `fs`. The output dir must already exist.
    pub fn new(fs: Fs) -> Self {
        Self {
            fs,
            write_lock: Mutex::new(()),
            index: Mutex::new(util::map_with_capacity(64)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.write_lock.lock().map_err(|_| Error::Poisoned)
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let mut buf = String::new();
        self.fs
            .read_to_buf(path, &mut buf)
            .with_context(|| format!("reading {path:?}"))?;
        let value = serde_json::from_str(&buf).with_context(|| format!("parsing {path:?}"))?;
        Ok(value)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.fs.create_parent_dir(path)?;
        self.fs.write_atomic(path, &text)
    }

    /// Find the request a task belongs to.
    fn request_for_task(&self, task: Uuid) -> Result<Uuid> {
        if let Some(request) = self.index.lock().map_err(|_| Error::Poisoned)?.get(&task) {
            return Ok(*request);
        }
        let mut buf = PathBuf::with_capacity(128);
        let requests_dir = self.fs.requests_dir(&mut buf).to_path_buf();
        if self.fs.exists(&requests_dir) {
            for entry in self.fs.read_dir(&requests_dir)? {
                let entry = entry?;
                let Some(request) = entry.file_name().to_str().and_then(|s| s.parse::<Uuid>().ok()) else {
                    continue;
                };
                if self.fs.exists(self.fs.task_json(request, task, &mut buf)) {
                    self.remember(task, request)?;
                    return Ok(request);
                }
            }
        }
        Err(Error::TaskNotFound(task).into())
    }

    fn remember(&self, task: Uuid, request: Uuid) -> Result<(), Error> {
        self.index
            .lock()
            .map_err(|_| Error::Poisoned)?
            .insert(task, request);
        Ok(())
    }

    fn write_task(&self, task: &RequestTask) -> Result<()> {
        let mut buf = PathBuf::with_capacity(128);
        let path = self.fs.task_json(task.privacy_request_id, task.id, &mut buf);
        self.write_json(path, task)?;
        self.remember(task.id, task.privacy_request_id)?;
        Ok(())
    }
}

impl TaskStore for FsStore {
    fn load_task(&self, id: Uuid) -> Result<RequestTask> {
        let request = self.request_for_task(id)?;
        let mut buf = PathBuf::with_capacity(128);
        self.read_json(self.fs.task_json(request, id, &mut buf))
    }

    fn save_task(&self, task: &RequestTask) -> Result<()> {
        let _lock = self.lock()?;
        self.write_task(task)
    }

    fn save_claimed(&self, task: &RequestTask) -> Result<bool> {
        let _lock = self.lock()?;
        if self.load_task(task.id)?.status != TaskStatus::InProcessing {
            return Ok(false);
        }
        self.write_task(task)?;
        Ok(true)
    }

    fn create_tasks_for_request(&self, tasks: &[RequestTask]) -> Result<()> {
        let _lock = self.lock()?;
        for task in tasks {
            self.write_task(task)
                .with_context(|| format!("creating task for {}", task.label()))?;
        }
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Option<RequestTask>> {
        let _lock = self.lock()?;
        let mut task = self.load_task(id)?;
        if transition(&mut task, expected, next)? {
            self.write_task(&task)?;
            Ok(Some(task))
        } else {
            Ok(None)
        }
    }

    fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>> {
        let mut buf = PathBuf::with_capacity(128);
        let dir = self.fs.tasks_dir(request_id, &mut buf).to_path_buf();
        let mut tasks = Vec::new();
        if !self.fs.exists(&dir) {
            return Ok(tasks);
        }
        for entry in self.fs.read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let task: RequestTask = self.read_json(&path)?;
            if action.map_or(true, |a| task.action_type == a) {
                tasks.push(task);
            }
        }
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    fn load_request(&self, id: Uuid) -> Result<PrivacyRequest> {
        let mut buf = PathBuf::with_capacity(128);
        let path = self.fs.request_json(id, &mut buf);
        if !self.fs.exists(path) {
            return Err(Error::RequestNotFound(id).into());
        }
        self.read_json(path)
    }

    fn save_request(&self, request: &PrivacyRequest) -> Result<()> {
        let _lock = self.lock()?;
        let mut buf = PathBuf::with_capacity(128);
        self.write_json(self.fs.request_json(request.id, &mut buf), request)
    }

    fn update_request(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut PrivacyRequest),
    ) -> Result<PrivacyRequest> {
        let _lock = self.lock()?;
        let mut request = self.load_request(id)?;
        f(&mut request);
        let mut buf = PathBuf::with_capacity(128);
        self.write_json(self.fs.request_json(id, &mut buf), &request)?;
        Ok(request)
    }

    fn append_log(&self, log: &ExecutionLog) -> Result<()> {
        let line = serde_json::to_string(log)?;
        let mut buf = PathBuf::with_capacity(128);
        let path = self.fs.execution_log(log.privacy_request_id, &mut buf);
        self.fs.create_parent_dir(path)?;
        self.fs.append_line(path, &line)
    }

    fn execution_logs(&self, request_id: Uuid) -> Result<Vec<ExecutionLog>> {
        let mut buf = PathBuf::with_capacity(128);
        let path = self.fs.execution_log(request_id, &mut buf);
        if !self.fs.exists(path) {
            return Ok(Vec::new());
        }
        let mut text = String::new();
        self.fs.read_to_buf(path, &mut text)?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("parsing execution log entry"))
            .collect()
    }
}

impl IdentityCache for FsStore {
    fn cache_identity(&self, request_id: Uuid, identity: &Identity) -> Result<()> {
        let mut buf = PathBuf::with_capacity(128);
        self.write_json(self.fs.identity_json(request_id, &mut buf), identity)
    }

    fn get_cached_identity(&self, request_id: Uuid) -> Result<Option<Identity>> {
        let mut buf = PathBuf::with_capacity(128);
        let path = self.fs.identity_json(request_id, &mut buf);
        if !self.fs.exists(path) {
            return Ok(None);
        }
        Ok(Some(self.read_json(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TraversalDetails;
    use graph::CollectionAddress;
    use tempfile::tempdir;

    fn store(dir: &Path) -> Result<FsStore> {
        let mut fs = Fs::new(dir, false);
        fs.ensure_output_dir_exists(false)?;
        Ok(FsStore::new(fs))
    }

    #[test]
    fn test_task_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let request = PrivacyRequest::new("default", Identity::new());
        let task = RequestTask::new(
            request.id,
            ActionType::Access,
            CollectionAddress::new("db", "customer"),
            None,
            TraversalDetails::default(),
        );
        {
            let store = store(dir.path())?;
            store.save_request(&request)?;
            store.create_tasks_for_request(&[task.clone()])?;
            store.claim_task(task.id)?.expect("claim");
        }

        // a new store has no index, so it has to find the task on disk:
        let store = store(dir.path())?;
        let loaded = store.load_task(task.id)?;
        assert_eq!(loaded.status, TaskStatus::InProcessing);
        assert_eq!(loaded.id, task.id);
        assert_eq!(store.tasks_for_request(request.id, None)?.len(), 1);
        assert_eq!(store.load_request(request.id)?.id, request.id);
        Ok(())
    }

    #[test]
    fn test_save_claimed() -> Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;
        let task = RequestTask::new(
            Uuid::new_v4(),
            ActionType::Access,
            CollectionAddress::new("db", "customer"),
            None,
            TraversalDetails::default(),
        );
        store.create_tasks_for_request(&[task.clone()])?;
        assert!(!store.save_claimed(&task)?);

        let mut claimed = store.claim_task(task.id)?.expect("claim");
        claimed.set_status(TaskStatus::Complete)?;
        assert!(store.save_claimed(&claimed)?);
        assert_eq!(store.load_task(task.id)?.status, TaskStatus::Complete);
        assert!(!store.save_claimed(&claimed)?);
        Ok(())
    }

    #[test]
    fn test_logs_append() -> Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;
        let task = RequestTask::new(
            Uuid::new_v4(),
            ActionType::Erasure,
            CollectionAddress::new("db", "orders"),
            None,
            TraversalDetails::default(),
        );
        store.append_log(&ExecutionLog::for_task(&task, 1, TaskStatus::InProcessing))?;
        store.append_log(&ExecutionLog::for_task(&task, 1, TaskStatus::Complete).message("ok"))?;
        let logs = store.execution_logs(task.privacy_request_id)?;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].status, TaskStatus::Complete);
        assert_eq!(logs[1].message.as_deref(), Some("ok"));
        Ok(())
    }

    #[test]
    fn test_missing_request() -> Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;
        assert!(store.load_request(Uuid::new_v4()).is_err());
        assert!(store.load_task(Uuid::new_v4()).is_err());
        Ok(())
    }
}
