use std::time::Duration;

use anyhow::Result;

use crate::request::{CheckpointDetails, PrivacyRequest, RequestStatus};
use crate::settings::ExecutionConfig;
use crate::store::TaskStore;
use crate::task::{ExecutionLog, RequestTask, TaskStatus};

use super::{Connector, ConnectorError};

/// What became of a task after its connector call.
#[derive(Debug)]
pub enum Outcome<T> {
    Complete(T),
    /// the task was not run and counts as done.
    Skip,
    /// the request has to be resumed by hand.
    Pause,
    /// the connector can't perform the action; someone has been notified instead.
    Defer,
    /// the connector will finish later, either when polled or by callback.
    Await { polling: bool },
    Fail(anyhow::Error),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Complete(v) => Outcome::Complete(f(v)),
            Self::Skip => Outcome::Skip,
            Self::Pause => Outcome::Pause,
            Self::Defer => Outcome::Defer,
            Self::Await { polling } => Outcome::Await { polling },
            Self::Fail(e) => Outcome::Fail(e),
        }
    }
}

/// Delays between attempts. The first delay is already scaled by the factor.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    factor: f64,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 0.0 {
            factor
        } else {
            1.0
        };
        Self {
            delay: initial,
            factor,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        Some(self.delay)
    }
}

/// Runs one connector call for a task with bounded retries, recording
/// every attempt in the execution log.
///
/// The task stays `in_processing` for the whole run; retries show up in the
/// log and in `retry_count`. The caller applies the final status for the
/// returned [`Outcome`].
pub struct RetryController<'a> {
    store: &'a dyn TaskStore,
    config: &'a ExecutionConfig,
}

impl<'a> RetryController<'a> {
    pub fn new(store: &'a dyn TaskStore, config: &'a ExecutionConfig) -> Self {
        Self { store, config }
    }

    /// Why `task` should not be run at all, if there is a reason.
    fn skip_reason(&self, task: &RequestTask, connector: &dyn Connector) -> Option<String> {
        if task.collection.as_ref().is_some_and(|c| c.skip_processing) {
            Some(format!("{} is marked skip_processing", task.collection_address))
        } else if !connector.enabled() {
            Some(format!("connector {} is disabled", connector.key()))
        } else if !connector.supports(task.action_type) {
            Some(format!(
                "connector {} is not enabled for {}",
                connector.key(),
                task.action_type
            ))
        } else {
            None
        }
    }

    /// Run `call` for `task`, retrying transient failures.
    ///
    /// Errors returned from this fn come from the store; connector failures
    /// are reported as [`Outcome::Fail`].
    pub fn run<T, F>(
        &self,
        task: &mut RequestTask,
        connector: &dyn Connector,
        fields_affected: Vec<String>,
        mut call: F,
    ) -> Result<Outcome<T>>
    where
        F: FnMut() -> Result<T, ConnectorError>,
    {
        if let Some(reason) = self.skip_reason(task, connector) {
            log::info!("Skipping {}: {reason}", task.label());
            self.log(task, 1, TaskStatus::Skipped, Some(reason), Vec::new())?;
            return Ok(Outcome::Skip);
        }

        let attempts = self.config.task_retry_count + 1;
        let mut backoff = Backoff::new(self.config.task_retry_delay, self.config.task_retry_backoff);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.log(task, attempt, TaskStatus::InProcessing, None, Vec::new())?;

            let err = match call() {
                Ok(value) => {
                    self.log(task, attempt, TaskStatus::Complete, None, fields_affected)?;
                    return Ok(Outcome::Complete(value));
                }
                Err(e) => e,
            };

            match err {
                ConnectorError::Paused(msg) => {
                    log::info!("Pausing at {}: {msg}", task.label());
                    self.log(task, attempt, TaskStatus::Paused, Some(msg), Vec::new())?;
                    return Ok(Outcome::Pause);
                }
                ConnectorError::ErasureNotificationRequired(msg) => {
                    self.log(task, attempt, TaskStatus::Complete, Some(msg), fields_affected)?;
                    return Ok(Outcome::Defer);
                }
                ConnectorError::Unsupported(msg) => {
                    self.log(task, attempt, TaskStatus::Skipped, Some(msg), Vec::new())?;
                    return Ok(Outcome::Skip);
                }
                ConnectorError::AwaitingCallback { polling } => {
                    self.log(task, attempt, TaskStatus::AwaitingProcessing, None, Vec::new())?;
                    return Ok(Outcome::Await { polling });
                }
                err if err.is_retryable() && attempt < attempts => {
                    log::warn!(
                        "{} failed (attempt {attempt} of {attempts}): {err}",
                        task.label()
                    );
                    self.log(task, attempt, TaskStatus::Retrying, Some(err.to_string()), Vec::new())?;
                    // the row stays in_processing between attempts
                    task.retry_count += 1;
                    if !self.store.save_claimed(task)? {
                        return self.give_up(task, attempt, "task was claimed elsewhere");
                    }

                    let delay = backoff.next().unwrap_or_default();
                    if !delay.is_zero() {
                        log::debug!("Retrying {} in {delay:?}", task.label());
                        std::thread::sleep(delay);
                    }

                    let request = self.store.load_request(task.privacy_request_id)?;
                    if request.status == RequestStatus::Canceled {
                        return self.give_up(task, attempt, "request was canceled");
                    }
                }
                err => {
                    log::error!("{} failed after {attempts} attempts: {err}", task.label());
                    self.log(task, attempt, TaskStatus::Error, Some(err.to_string()), Vec::new())?;
                    self.fail_request(task)?;
                    return Ok(Outcome::Fail(err.into()));
                }
            }
        }
    }

    /// Stop retrying without another connector call.
    fn give_up<T>(&self, task: &RequestTask, attempt: u32, reason: &str) -> Result<Outcome<T>> {
        log::info!("Not retrying {}: {reason}", task.label());
        self.log(task, attempt, TaskStatus::Skipped, Some(reason.to_owned()), Vec::new())?;
        Ok(Outcome::Skip)
    }

    /// Record where the request failed, and fail any consent still waiting on
    /// this task's connector.
    pub fn fail_request(&self, task: &RequestTask) -> Result<()> {
        let checkpoint = CheckpointDetails {
            step: task.action_type,
            collection: task.collection_address.clone(),
        };
        let connector_key = task.traversal_details.connector_key.as_str();
        self.store.update_request(task.privacy_request_id, &mut |request: &mut PrivacyRequest| {
            request.failed_checkpoint = Some(checkpoint.clone());
            request.fail_pending_consent(connector_key);
        })?;
        Ok(())
    }

    fn log(
        &self,
        task: &RequestTask,
        attempt: u32,
        status: TaskStatus,
        message: Option<String>,
        fields: Vec<String>,
    ) -> Result<()> {
        let mut entry = ExecutionLog::for_task(task, attempt, status).fields(fields);
        entry.message = message;
        self.store.append_log(&entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::MemoryConnector;
    use crate::request::{ConsentPreference, ConsentPropagation};
    use crate::store::MemoryStore;
    use crate::task::{ActionType, TraversalDetails};
    use graph::{Collection, CollectionAddress};
    use std::collections::BTreeMap;

    fn setup(store: &MemoryStore) -> anyhow::Result<RequestTask> {
        let mut request = PrivacyRequest::new("default", Default::default()).with_consent(vec![
            ConsentPreference {
                data_use: "marketing".to_owned(),
                opt_in: false,
                affected_systems: BTreeMap::new(),
            },
        ]);
        request.add_consent_target("db");
        store.save_request(&request)?;

        let mut task = RequestTask::new(
            request.id,
            ActionType::Access,
            CollectionAddress::new("db", "customer"),
            Some(Collection::new("customer", vec![])),
            TraversalDetails {
                connector_key: "db".to_owned(),
                ..Default::default()
            },
        );
        store.create_tasks_for_request(&[task.clone()])?;
        task = store.claim_task(task.id)?.expect("claim");
        Ok(task)
    }

    fn config(retries: u32) -> ExecutionConfig {
        ExecutionConfig {
            task_retry_count: retries,
            task_retry_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn statuses(store: &MemoryStore, task: &RequestTask) -> anyhow::Result<Vec<TaskStatus>> {
        Ok(store
            .execution_logs(task.privacy_request_id)?
            .iter()
            .map(|l| l.status)
            .collect())
    }

    #[test]
    fn test_backoff() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(1), 2.0).take(3).collect();
        assert_eq!(
            delays,
            [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
        let flat: Vec<_> = Backoff::new(Duration::from_millis(5), 1.0).take(2).collect();
        assert_eq!(flat, [Duration::from_millis(5); 2]);
    }

    #[test]
    fn test_retry_bound() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let mut task = setup(&store)?;
        let config = config(2);
        let connector = MemoryConnector::new("db");

        let mut calls = 0;
        let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
            calls += 1;
            Err::<(), _>(ConnectorError::Connection("refused".to_owned()))
        })?;

        assert!(matches!(outcome, Outcome::Fail(_)));
        assert_eq!(calls, 3);
        assert_eq!(task.retry_count, 2);
        use TaskStatus::*;
        assert_eq!(
            statuses(&store, &task)?,
            [InProcessing, Retrying, InProcessing, Retrying, InProcessing, Error]
        );

        let request = store.load_request(task.privacy_request_id)?;
        let checkpoint = request.failed_checkpoint.expect("checkpoint");
        assert_eq!(checkpoint.step, ActionType::Access);
        assert_eq!(checkpoint.collection, task.collection_address);
        assert_eq!(
            request.consent_preferences[0].affected_systems["db"],
            ConsentPropagation::Error
        );
        Ok(())
    }

    #[test]
    fn test_recovers_after_retry() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let mut task = setup(&store)?;
        let config = config(3);
        let connector = MemoryConnector::new("db");

        let mut calls = 0;
        let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
            calls += 1;
            if calls < 2 {
                Err(ConnectorError::Other("timeout".to_owned()))
            } else {
                Ok(calls)
            }
        })?;
        assert!(matches!(outcome, Outcome::Complete(2)));
        assert_eq!(task.status, TaskStatus::InProcessing);
        assert_eq!(store.load_task(task.id)?.retry_count, 1);
        assert!(store.load_request(task.privacy_request_id)?.failed_checkpoint.is_none());
        Ok(())
    }

    #[test]
    fn test_task_stays_claimed_during_backoff() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let mut task = setup(&store)?;
        let config = ExecutionConfig {
            task_retry_count: 1,
            task_retry_delay: Duration::from_millis(300),
            task_retry_backoff: 1.0,
            ..Default::default()
        };
        let connector = MemoryConnector::new("db");
        let (id, request_id) = (task.id, task.privacy_request_id);

        let mut calls = 0;
        let (outcome, other) = std::thread::scope(|s| {
            let other = s.spawn(|| -> anyhow::Result<(bool, bool, TaskStatus)> {
                std::thread::sleep(Duration::from_millis(100));
                let claimed = store.claim_task(id)?.is_some();
                // what a cancel does to the request and its waiting tasks:
                store.update_request(request_id, &mut |r: &mut PrivacyRequest| {
                    r.set_status(RequestStatus::Canceled)
                })?;
                let skipped = store
                    .compare_and_set_status(
                        id,
                        &[TaskStatus::Pending, TaskStatus::Retrying, TaskStatus::Paused],
                        TaskStatus::Skipped,
                    )?
                    .is_some();
                Ok((claimed, skipped, store.load_task(id)?.status))
            });
            let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
                calls += 1;
                if calls < 2 {
                    Err(ConnectorError::Connection("refused".to_owned()))
                } else {
                    Ok(())
                }
            });
            (outcome, other.join().expect("join"))
        });

        let (claimed, skipped, status_mid_backoff) = other?;
        assert!(!claimed);
        assert!(!skipped);
        assert_eq!(status_mid_backoff, TaskStatus::InProcessing);

        assert!(matches!(outcome?, Outcome::Skip));
        assert_eq!(calls, 1);
        let stored = store.load_task(id)?;
        assert_eq!(stored.status, TaskStatus::InProcessing);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(statuses(&store, &task)?.last(), Some(&TaskStatus::Skipped));
        Ok(())
    }

    #[test]
    fn test_auth_failures_are_retried() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let mut task = setup(&store)?;
        let config = config(1);
        let connector = MemoryConnector::new("db");

        let mut calls = 0;
        let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
            calls += 1;
            Err::<(), _>(ConnectorError::Auth("expired token".to_owned()))
        })?;
        assert!(matches!(outcome, Outcome::Fail(_)));
        assert_eq!(calls, 2);
        Ok(())
    }

    #[test]
    fn test_skip_makes_no_calls() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let mut task = setup(&store)?;
        let config = config(2);
        let connector = MemoryConnector::new("db").disabled();

        let mut calls = 0;
        let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
            calls += 1;
            Ok(())
        })?;
        assert!(matches!(outcome, Outcome::Skip));
        assert_eq!(calls, 0);
        assert_eq!(statuses(&store, &task)?, [TaskStatus::Skipped]);

        let connector = MemoryConnector::new("db").actions(&[ActionType::Erasure]);
        let outcome = RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
            calls += 1;
            Ok(())
        })?;
        assert!(matches!(outcome, Outcome::Skip));
        assert_eq!(calls, 0);
        Ok(())
    }

    #[test]
    fn test_signals_are_not_retried() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let config = config(5);
        let connector = MemoryConnector::new("db");
        let cases = [
            (ConnectorError::Paused("manual step".to_owned()), TaskStatus::Paused),
            (
                ConnectorError::ErasureNotificationRequired("emailed".to_owned()),
                TaskStatus::Complete,
            ),
            (ConnectorError::Unsupported("no erasure".to_owned()), TaskStatus::Skipped),
            (
                ConnectorError::AwaitingCallback { polling: true },
                TaskStatus::AwaitingProcessing,
            ),
        ];
        for (err, logged) in cases {
            let mut task = setup(&store)?;
            let mut calls = 0;
            let outcome =
                RetryController::new(&store, &config).run(&mut task, &connector, vec![], || {
                    calls += 1;
                    Err::<(), _>(err.clone())
                })?;
            assert_eq!(calls, 1);
            let last = store
                .execution_logs(task.privacy_request_id)?
                .last()
                .map(|l| l.status);
            assert_eq!(last, Some(logged));
            match err {
                ConnectorError::Paused(_) => assert!(matches!(outcome, Outcome::Pause)),
                ConnectorError::ErasureNotificationRequired(_) => {
                    assert!(matches!(outcome, Outcome::Defer))
                }
                ConnectorError::Unsupported(_) => assert!(matches!(outcome, Outcome::Skip)),
                _ => assert!(matches!(outcome, Outcome::Await { polling: true })),
            }
        }
        Ok(())
    }
}
