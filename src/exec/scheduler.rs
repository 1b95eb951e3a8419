use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use graph::refine::filter_element_match;
use graph::{CollectionAddress, DatasetGraph, Errors, Row};

use crate::policy::Policy;
use crate::prep::{check_connectors, TaskBuilder};
use crate::request::{ConsentPropagation, Identity, PrivacyRequest, RequestStatus};
use crate::settings::ExecutionConfig;
use crate::store::{IdentityCache, TaskStore};
use crate::task::{ActionType, ExecutionLog, RequestTask, TaskStatus};

use super::{
    Connector, ConnectorRegistry, Error, ExecutionNode, NodeInput, Outcome, PollStatus,
    RetryController, WorkQueue,
};

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Complete,
    Paused,
    Awaiting,
    Failed(String),
}

/// Runs the tasks of privacy requests: one stage at a time, in policy
/// order, with the tasks of a stage spread over a pool of worker threads.
///
/// Everything the scheduler knows lives in the store, so any request can
/// be picked up again by a later [`Scheduler::resume`], poll or callback.
pub struct Scheduler<'a> {
    store: &'a dyn TaskStore,
    identities: &'a dyn IdentityCache,
    connectors: &'a ConnectorRegistry,
    policy: &'a Policy,
    config: &'a ExecutionConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        store: &'a dyn TaskStore,
        identities: &'a dyn IdentityCache,
        connectors: &'a ConnectorRegistry,
        policy: &'a Policy,
        config: &'a ExecutionConfig,
    ) -> Self {
        Self {
            store,
            identities,
            connectors,
            policy,
            config,
        }
    }

    // REQUEST LIFECYCLE ////////////////////////////////////////////

    /// Create every task for `request`, then run it.
    pub fn run_request(&self, request: PrivacyRequest, graph: &DatasetGraph) -> Result<RequestStatus> {
        let request = self.create_request(request, graph)?;
        self.execute(request.id, None)
    }

    /// Validate and persist `request` along with all of its tasks.
    /// Nothing is written if the graph or its connectors don't check out.
    pub fn create_request(
        &self,
        mut request: PrivacyRequest,
        graph: &DatasetGraph,
    ) -> Result<PrivacyRequest> {
        check_connectors(graph, self.connectors)?;
        let tasks = TaskBuilder::new(request.id, graph, self.policy)
            .build(&request.seed_identities())
            .with_context(|| format!("while building tasks for request {}", request.id))?;

        for task in &tasks {
            if task.action_type == ActionType::Consent
                && !task.is_root_task()
                && !task.is_terminator_task()
            {
                request.add_consent_target(&task.traversal_details.connector_key);
            }
        }

        self.store.save_request(&request)?;
        self.identities.cache_identity(request.id, &request.identity)?;
        self.store.create_tasks_for_request(&tasks)?;
        log::info!("Created request {} with {} tasks", request.id, tasks.len());
        Ok(request)
    }

    /// Pick a failed or paused request back up. Tasks that errored, paused
    /// or were cut off mid-run are retried; completed tasks are left alone.
    pub fn resume(&self, request_id: Uuid) -> Result<RequestStatus> {
        let request = self.store.load_request(request_id)?;
        if matches!(request.status, RequestStatus::Complete | RequestStatus::Canceled) {
            log::warn!("Request {request_id} is {}; nothing to resume", request.status);
            return Ok(request.status);
        }

        let from = request.failed_checkpoint.as_ref().map(|c| c.step);
        let mut reset = 0;
        for task in self.store.tasks_for_request(request_id, None)? {
            if matches!(
                task.status,
                TaskStatus::InProcessing | TaskStatus::Error | TaskStatus::Paused
            ) && self
                .store
                .compare_and_set_status(task.id, &[task.status], TaskStatus::Retrying)?
                .is_some()
            {
                reset += 1;
            }
        }
        log::info!(
            "Resuming request {request_id} from {}; {reset} tasks to retry",
            from.map_or("the first stage", |step| step.as_str())
        );

        self.store
            .update_request(request_id, &mut |r: &mut PrivacyRequest| r.failed_checkpoint = None)?;
        self.execute(request_id, from)
    }

    /// Cancel a request. Tasks that haven't started are skipped; tasks
    /// already running finish, but nothing new is scheduled after them.
    /// Returns the number of tasks skipped.
    pub fn cancel(&self, request_id: Uuid) -> Result<usize> {
        self.store.update_request(request_id, &mut |r: &mut PrivacyRequest| {
            r.set_status(RequestStatus::Canceled)
        })?;

        let mut skipped = 0;
        for task in self.store.tasks_for_request(request_id, None)? {
            // running tasks are left to their worker
            let cancelable =
                !task.status.is_terminal() && task.status != TaskStatus::InProcessing;
            if cancelable
                && self
                    .store
                    .compare_and_set_status(task.id, &[task.status], TaskStatus::Skipped)?
                    .is_some()
            {
                skipped += 1;
            }
        }
        log::info!("Canceled request {request_id}; skipped {skipped} tasks");
        Ok(skipped)
    }

    /// Run the stages of a request, starting at `from` if given.
    fn execute(&self, request_id: Uuid, from: Option<ActionType>) -> Result<RequestStatus> {
        let request = self.store.load_request(request_id)?;
        if request.status == RequestStatus::Canceled {
            return Ok(request.status);
        }
        let request = self.store.update_request(request_id, &mut |r: &mut PrivacyRequest| {
            r.set_status(RequestStatus::InProcessing)
        })?;

        let stages = self
            .policy
            .stages()
            .into_iter()
            .filter(|stage| from.map_or(true, |from| *stage >= from));

        for stage in stages {
            log::info!("Running {stage} stage of request {request_id}");
            let status = match self.run_stage(&request, stage)? {
                StageOutcome::Complete => continue,
                StageOutcome::Paused => RequestStatus::Paused,
                StageOutcome::Awaiting => RequestStatus::AwaitingProcessing,
                StageOutcome::Failed(msg) => {
                    log::error!("{stage} stage of request {request_id} failed: {msg}");
                    RequestStatus::Error
                }
            };
            return self.finish(request_id, status);
        }
        self.finish(request_id, RequestStatus::Complete)
    }

    /// Record the final status of this run. A cancel that landed while we
    /// were running wins.
    fn finish(&self, request_id: Uuid, status: RequestStatus) -> Result<RequestStatus> {
        let request = self.store.update_request(request_id, &mut |r: &mut PrivacyRequest| {
            if r.status == RequestStatus::Canceled {
                return;
            }
            if status == RequestStatus::Complete {
                r.failed_checkpoint = None;
            }
            r.set_status(status);
        })?;
        log::info!("Request {request_id} is {}", request.status);
        Ok(request.status)
    }

    // STAGES ///////////////////////////////////////////////////////

    /// Run every runnable task of one stage, and report how the stage ended.
    pub fn run_stage(&self, request: &PrivacyRequest, action: ActionType) -> Result<StageOutcome> {
        let tasks = self.store.tasks_for_request(request.id, Some(action))?;
        if tasks.is_empty() {
            return Ok(StageOutcome::Complete);
        }

        let statuses: BTreeMap<Uuid, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();
        let ready: Vec<Uuid> = tasks
            .iter()
            .filter(|t| t.status.is_claimable())
            .filter(|t| {
                t.upstream_tasks
                    .iter()
                    .all(|up| statuses.get(up).is_some_and(|s| s.is_done()))
            })
            .map(|t| t.id)
            .collect();
        log::debug!("{action}: {} of {} tasks ready", ready.len(), tasks.len());

        let queue = WorkQueue::new(ready);
        let workers = self.config.worker_count.max(1);
        let results: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| s.spawn(|| self.work(request, &queue)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut errors = Errors::default();
        for result in results {
            if let Err(e) = result {
                errors.add(e);
            }
        }
        errors.into_result(&format!("running the {action} stage"))?;

        let tasks = self.store.tasks_for_request(request.id, Some(action))?;
        Ok(stage_outcome(&tasks))
    }

    /// Worker loop: run tasks until the queue is drained or closed.
    fn work(&self, request: &PrivacyRequest, queue: &WorkQueue) -> Result<()> {
        while let Some(id) = queue.pop() {
            let result = self.process(request, id, queue);
            queue.task_done();
            if let Err(e) = result {
                queue.close();
                return Err(e.context(format!("while running task {id}")));
            }
        }
        Ok(())
    }

    fn process(&self, request: &PrivacyRequest, id: Uuid, queue: &WorkQueue) -> Result<()> {
        let Some(mut task) = self.store.claim_task(id)? else {
            log::trace!("task {id} was claimed elsewhere");
            return Ok(());
        };
        log::debug!("Running {}", task.label());
        let outcome = self.execute_task(request, &mut task)?;
        self.apply_outcome(task, outcome, queue)
    }

    fn apply_outcome(&self, mut task: RequestTask, outcome: Outcome<()>, queue: &WorkQueue) -> Result<()> {
        let next = match &outcome {
            Outcome::Complete(()) | Outcome::Defer => TaskStatus::Complete,
            Outcome::Skip => TaskStatus::Skipped,
            Outcome::Pause => TaskStatus::Paused,
            Outcome::Await { polling } => {
                log::info!(
                    "{} is waiting on {}",
                    task.label(),
                    if *polling { "polling" } else { "a callback" }
                );
                task.polling_async_task = *polling;
                TaskStatus::AwaitingProcessing
            }
            Outcome::Fail(e) => {
                log::error!("{} failed: {e:#}", task.label());
                TaskStatus::Error
            }
        };
        task.set_status(next)?;
        if !self.store.save_claimed(&task)? {
            log::warn!("{} was taken over elsewhere; dropping its result", task.label());
            return Ok(());
        }

        match next {
            TaskStatus::Complete => self.enqueue_downstream(&task, queue)?,
            TaskStatus::Skipped => {
                if task.action_type == ActionType::Consent {
                    self.set_consent(&task, ConsentPropagation::Skipped)?;
                }
                self.enqueue_downstream(&task, queue)?;
            }
            TaskStatus::Paused | TaskStatus::Error => queue.close(),
            _ => {}
        }
        Ok(())
    }

    /// Queue each downstream task whose upstream tasks are now all done.
    fn enqueue_downstream(&self, task: &RequestTask, queue: &WorkQueue) -> Result<()> {
        for id in &task.downstream_tasks {
            let next = self.store.load_task(*id)?;
            if next.status.is_claimable() && self.upstream_done(&next)? {
                queue.push(*id);
            }
        }
        Ok(())
    }

    fn upstream_done(&self, task: &RequestTask) -> Result<bool> {
        for id in &task.upstream_tasks {
            if !self.store.load_task(*id)?.status.is_done() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // TASKS ////////////////////////////////////////////////////////

    /// Run the connector call for one claimed task. Errors are store
    /// errors; connector failures come back as an [`Outcome`].
    fn execute_task(&self, request: &PrivacyRequest, task: &mut RequestTask) -> Result<Outcome<()>> {
        if task.is_root_task() || task.is_terminator_task() {
            return Ok(Outcome::Complete(()));
        }
        let node = ExecutionNode::from_task(task);
        let connector = self.connector(&node.connector_key)?;
        let controller = RetryController::new(self.store, self.config);

        match task.action_type {
            ActionType::Access => self.run_access(request, task, &node, connector.as_ref(), &controller),
            ActionType::Erasure => self.run_erasure(request, task, &node, connector.as_ref(), &controller),
            ActionType::Consent => self.run_consent(request, task, &node, connector.as_ref(), &controller),
        }
    }

    fn run_access(
        &self,
        request: &PrivacyRequest,
        task: &mut RequestTask,
        node: &ExecutionNode,
        connector: &dyn Connector,
        controller: &RetryController,
    ) -> Result<Outcome<()>> {
        let input = self.node_input(request, task, node)?;
        let typed = node.typed_input(&input);
        let fields = self.policy.fields_affected(&node.collection, ActionType::Access);

        let outcome = controller.run(task, connector, fields, || {
            connector.retrieve_data(node, self.policy, request, &typed)
        })?;
        Ok(outcome.map(|rows| store_access_rows(task, node, &input, rows)))
    }

    fn run_erasure(
        &self,
        request: &PrivacyRequest,
        task: &mut RequestTask,
        node: &ExecutionNode,
        connector: &dyn Connector,
        controller: &RetryController,
    ) -> Result<Outcome<()>> {
        let rows = self
            .access_tasks(request.id)?
            .remove(&task.collection_address)
            .map(|t| t.data_for_erasures)
            .unwrap_or_default();
        let input = self.node_input(request, task, node)?;
        let typed = node.typed_input(&input);
        let fields = self.policy.fields_affected(&node.collection, ActionType::Erasure);

        let outcome = controller.run(task, connector, fields, || {
            connector.mask_data(node, self.policy, request, &rows, &typed)
        })?;
        Ok(outcome.map(|count| task.rows_masked = Some(count)))
    }

    fn run_consent(
        &self,
        request: &PrivacyRequest,
        task: &mut RequestTask,
        node: &ExecutionNode,
        connector: &dyn Connector,
        controller: &RetryController,
    ) -> Result<Outcome<()>> {
        let identity = self.identity(request)?;
        let outcome = controller.run(task, connector, Vec::new(), || {
            connector.run_consent_request(node, self.policy, request, &identity)
        })?;
        if let Outcome::Complete(sent) = &outcome {
            task.consent_sent = Some(*sent);
            let status = if *sent {
                ConsentPropagation::Complete
            } else {
                ConsentPropagation::Skipped
            };
            self.set_consent(task, status)?;
        }
        Ok(outcome.map(|_| ()))
    }

    // ASYNC TASKS //////////////////////////////////////////////////

    /// Check every polling task of a request that is waiting on its
    /// connector. If any finished, the request carries on from there.
    /// Returns the number of tasks that completed.
    pub fn poll_async_tasks(&self, request_id: Uuid) -> Result<usize> {
        let request = self.store.load_request(request_id)?;
        if request.status == RequestStatus::Canceled {
            return Ok(0);
        }

        let mut completed = 0;
        let mut failed = false;
        for task in self.store.tasks_for_request(request_id, None)? {
            if task.status != TaskStatus::AwaitingProcessing || !task.polling_async_task {
                continue;
            }
            let Some(mut task) = self.store.compare_and_set_status(
                task.id,
                &[TaskStatus::AwaitingProcessing],
                TaskStatus::InProcessing,
            )?
            else {
                continue;
            };

            let node = ExecutionNode::from_task(&task);
            let connector = self.connector(&node.connector_key)?;
            let input = node.typed_input(&self.node_input(&request, &task, &node)?);
            match connector.poll_status(&node, self.policy, &request, &task, &input) {
                Ok(PollStatus::Pending) => {
                    log::debug!("{} is still running", task.label());
                    task.set_status(TaskStatus::AwaitingProcessing)?;
                    self.store.save_claimed(&task)?;
                }
                Ok(PollStatus::Complete { rows, rows_masked }) => {
                    self.complete_async(&request, task, rows, rows_masked)?;
                    completed += 1;
                }
                Ok(PollStatus::Failed(msg)) => {
                    self.fail_async(task, msg)?;
                    failed = true;
                }
                Err(e) => {
                    self.fail_async(task, e.to_string())?;
                    failed = true;
                }
            }
        }

        if failed {
            self.finish(request_id, RequestStatus::Error)?;
        } else if completed > 0 {
            self.execute(request_id, None)?;
        }
        Ok(completed)
    }

    /// Finish a callback task with the results its connector reported,
    /// then carry on with the request.
    pub fn receive_callback(
        &self,
        task_id: Uuid,
        rows: Vec<Row>,
        rows_masked: Option<u64>,
    ) -> Result<RequestStatus> {
        let task = self.store.load_task(task_id)?;
        if task.polling_async_task {
            return Err(Error::NotCallbackTask(task_id).into());
        }
        let Some(task) = self.store.compare_and_set_status(
            task_id,
            &[TaskStatus::AwaitingProcessing],
            TaskStatus::InProcessing,
        )?
        else {
            return Err(Error::NotAwaiting(task_id).into());
        };

        let request = self.store.load_request(task.privacy_request_id)?;
        self.complete_async(&request, task, rows, rows_masked)?;
        self.execute(request.id, None)
    }

    fn complete_async(
        &self,
        request: &PrivacyRequest,
        mut task: RequestTask,
        rows: Vec<Row>,
        rows_masked: Option<u64>,
    ) -> Result<()> {
        match task.action_type {
            ActionType::Access => {
                let node = ExecutionNode::from_task(&task);
                let input = self.node_input(request, &task, &node)?;
                store_access_rows(&mut task, &node, &input, rows);
            }
            ActionType::Erasure => task.rows_masked = Some(rows_masked.unwrap_or(0)),
            ActionType::Consent => {
                task.consent_sent = Some(true);
                self.set_consent(&task, ConsentPropagation::Complete)?;
            }
        }
        self.store.append_log(
            &ExecutionLog::for_task(&task, task.retry_count + 1, TaskStatus::Complete)
                .message("async job finished"),
        )?;
        task.set_status(TaskStatus::Complete)?;
        if self.store.save_claimed(&task)? {
            log::info!("{} finished asynchronously", task.label());
        } else {
            log::warn!("{} was taken over elsewhere; dropping its result", task.label());
        }
        Ok(())
    }

    fn fail_async(&self, mut task: RequestTask, msg: String) -> Result<()> {
        log::error!("{} failed: {msg}", task.label());
        self.store.append_log(
            &ExecutionLog::for_task(&task, task.retry_count + 1, TaskStatus::Error).message(msg),
        )?;
        task.set_status(TaskStatus::Error)?;
        if !self.store.save_claimed(&task)? {
            log::warn!("{} was taken over elsewhere", task.label());
            return Ok(());
        }
        RetryController::new(self.store, self.config).fail_request(&task)
    }

    // HELPERS //////////////////////////////////////////////////////

    fn connector(&self, key: &str) -> Result<Arc<dyn Connector>> {
        match self.connectors.get(key) {
            Some(connector) => Ok(Arc::clone(connector)),
            None => Err(Error::UnknownConnector(key.to_owned()).into()),
        }
    }

    /// Identity values for a request: from the cache, or from the request
    /// itself if the cache has expired.
    fn identity(&self, request: &PrivacyRequest) -> Result<Identity> {
        Ok(self
            .identities
            .get_cached_identity(request.id)?
            .unwrap_or_else(|| request.identity.clone()))
    }

    /// Access tasks of a request, by collection.
    fn access_tasks(&self, request_id: Uuid) -> Result<BTreeMap<CollectionAddress, RequestTask>> {
        Ok(self
            .store
            .tasks_for_request(request_id, Some(ActionType::Access))?
            .into_iter()
            .map(|t| (t.collection_address.clone(), t))
            .collect())
    }

    /// Merged upstream output a task's connector call runs with. Access
    /// tasks read their upstream tasks; erasure and consent tasks read the
    /// access output of their input collections.
    fn node_input(
        &self,
        request: &PrivacyRequest,
        task: &RequestTask,
        node: &ExecutionNode,
    ) -> Result<NodeInput> {
        let mut upstream = BTreeMap::new();
        if task.action_type == ActionType::Access {
            for id in &task.upstream_tasks {
                let up = self.store.load_task(*id)?;
                let rows = self.rows_from(request, &up)?;
                upstream.insert(up.collection_address, rows);
            }
        } else if !node.input_keys.is_empty() {
            let access = self.access_tasks(request.id)?;
            for key in &node.input_keys {
                if let Some(up) = access.get(key) {
                    upstream.insert(key.clone(), self.rows_from(request, up)?);
                }
            }
        }
        Ok(node.pre_process_input_data(&upstream, !node.collection.grouped_inputs.is_empty()))
    }

    /// What an access task hands downstream. The root task hands down the
    /// identity, which is never stored with the task.
    fn rows_from(&self, request: &PrivacyRequest, task: &RequestTask) -> Result<Vec<Row>> {
        if !task.is_root_task() {
            return Ok(task.access_data.clone());
        }
        let row: Row = self
            .identity(request)?
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        Ok(vec![row])
    }

    fn set_consent(&self, task: &RequestTask, status: ConsentPropagation) -> Result<()> {
        let key = task.traversal_details.connector_key.as_str();
        self.store
            .update_request(task.privacy_request_id, &mut |r: &mut PrivacyRequest| {
                r.set_consent_status(key, status)
            })?;
        Ok(())
    }
}

/// Keep what a collection returned: trimmed to the matching array
/// elements for access, and with unmatched elements nulled out for erasure.
fn store_access_rows(task: &mut RequestTask, node: &ExecutionNode, input: &NodeInput, rows: Vec<Row>) {
    let paths: BTreeMap<_, Vec<Value>> = node.query_paths_for_filter(input);
    task.access_data = rows
        .iter()
        .map(|row| filter_element_match(row, &paths, true))
        .collect();
    task.data_for_erasures = rows
        .iter()
        .map(|row| filter_element_match(row, &paths, false))
        .collect();
}

fn stage_outcome(tasks: &[RequestTask]) -> StageOutcome {
    let labels = |status: TaskStatus| -> Vec<String> {
        tasks
            .iter()
            .filter(|t| t.status == status)
            .map(RequestTask::label)
            .collect()
    };

    let failed = labels(TaskStatus::Error);
    if !failed.is_empty() {
        return StageOutcome::Failed(format!("failed: {}", failed.join(", ")));
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Paused) {
        return StageOutcome::Paused;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::AwaitingProcessing) {
        return StageOutcome::Awaiting;
    }
    let stuck: Vec<String> = tasks
        .iter()
        .filter(|t| !t.status.is_done())
        .map(RequestTask::label)
        .collect();
    if stuck.is_empty() {
        StageOutcome::Complete
    } else {
        StageOutcome::Failed(format!("could not run: {}", stuck.join(", ")))
    }
}
