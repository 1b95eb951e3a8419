use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use uuid::Uuid;

use graph::{Dataset, DatasetGraph, Errors};

use crate::exec::{ConnectorRegistry, ExecutionNode, MemoryConnector, Scheduler};
use crate::fs::Fs;
use crate::policy::Policy;
use crate::prep::TaskBuilder;
use crate::request::{ConsentPreference, Identity, PrivacyRequest, RequestStatus};
use crate::settings::{Command, Settings};
use crate::store::{FsStore, TaskStore};
use crate::task::{ActionType, RequestTask};
use crate::ui::{self, Ui};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No dataset files (*.json) found in {0:?}")]
    NoDatasets(PathBuf),
    #[error("Request {request} was created with policy \"{expected}\", but \"{found}\" is loaded")]
    PolicyMismatch {
        request: Uuid,
        expected: String,
        found: String,
    },
}

/// This struct actually runs the command-line app.
pub struct App {
    /// Interpreted command line settings
    settings: Settings,
    /// Filesystem interface
    fs: Fs,
    /// User interface
    ui: Ui,
}

impl App {
    /// Create a new `App`.
    pub fn new(settings: Settings) -> Self {
        let fs = Fs::new(&settings.output, settings.dry_run);
        let ui = Ui::new(&settings);
        Self { settings, fs, ui }
    }

    /// Run the app, using settings to determine which command to run.
    pub fn run(mut self) -> Result<()> {
        match self.settings.command.clone() {
            Command::Plan { identity } => self.plan(identity),
            Command::Run { identity, consent } => self.run_request(identity, consent),
            Command::Resume(id) => self.resume(id),
            Command::Poll(id) => self.poll(id),
            Command::Cancel(id) => self.cancel(id),
            Command::Logs(id) => self.print_logs(id),
        }
    }
}

// LOADING //////////////////
impl App {
    fn load_graph(&mut self) -> Result<DatasetGraph> {
        self.ui
            .verbose_progress_debug("Loading datasets from", &self.settings.datasets);
        self.ui.start_timer();

        let dir = &self.settings.datasets;
        let mut paths: Vec<PathBuf> = self
            .fs
            .read_dir(dir)
            .with_context(|| format!("while reading dataset directory {dir:?}"))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        if paths.is_empty() {
            return Err(Error::NoDatasets(dir.clone()).into());
        }
        // sorted, so graph errors come out in the same order every time:
        paths.sort();

        let mut datasets = Vec::with_capacity(paths.len());
        let mut errors = Errors::default();
        for path in &paths {
            match Dataset::load(path) {
                Ok(dataset) => datasets.push(dataset),
                Err(e) => errors.add(e),
            }
        }
        errors.print_recap("loading datasets");
        errors.into_result("loading datasets")?;

        let graph = DatasetGraph::new(datasets)?;
        self.ui.done();
        self.ui.print_elapsed("Loading datasets");

        if self.ui.verbose {
            eprintln!(
                "Loaded {} collections in {} datasets.",
                graph.len(),
                graph.dataset_connectors().len()
            );
        }
        Ok(graph)
    }

    fn load_policy(&self) -> Result<Policy> {
        self.ui
            .verbose_progress_debug("Loading policy", &self.settings.policy);
        let policy = Policy::load(&self.settings.policy)
            .with_context(|| format!("while loading policy {:?}", self.settings.policy))?;
        self.ui.done();
        Ok(policy)
    }

    /// One fixture connector per connector key the datasets use.
    fn load_connectors(&self, graph: &DatasetGraph) -> Result<ConnectorRegistry> {
        let keys: BTreeSet<&str> = graph
            .dataset_connectors()
            .values()
            .map(String::as_str)
            .collect();

        let mut registry = ConnectorRegistry::default();
        for key in keys {
            let path = self.settings.fixtures.join(format!("{key}.json"));
            let connector = if self.fs.exists(&path) {
                MemoryConnector::load(key, &path)?
            } else {
                log::warn!("No fixture file {path:?}; connector {key} starts out empty");
                MemoryConnector::new(key)
            };
            registry.register(Arc::new(connector));
        }

        for key in registry.keys() {
            if let Some(Err(e)) = registry.get(key).map(|c| c.test_connection()) {
                log::warn!("Connector {key} failed its connection test: {e}");
            }
        }
        Ok(registry)
    }

    fn open_store(&mut self) -> Result<FsStore> {
        self.fs.ensure_output_dir_exists(self.ui.verbose)?;
        Ok(FsStore::new(Fs::new(
            self.fs.output_prefix(),
            self.settings.dry_run,
        )))
    }

    /// Fail if `request` is being driven with a different policy than it
    /// was created with.
    fn check_policy(request: &PrivacyRequest, policy: &Policy) -> Result<(), Error> {
        if request.policy_key == policy.key {
            Ok(())
        } else {
            Err(Error::PolicyMismatch {
                request: request.id,
                expected: request.policy_key.clone(),
                found: policy.key.clone(),
            })
        }
    }
}

// COMMANDS /////////////////
impl App {
    fn plan(&mut self, identity: Identity) -> Result<()> {
        let graph = self.load_graph()?;
        let policy = self.load_policy()?;
        let connectors = self.load_connectors(&graph)?;

        let request = PrivacyRequest::new(&policy.key, identity);
        self.ui.verbose_progress("Building tasks");
        let tasks = TaskBuilder::new(request.id, &graph, &policy)
            .build(&request.seed_identities())
            .context("while planning request")?;
        self.ui.done();

        for action in policy.stages() {
            println!("{}", format!("{action} stage").bold());
            for task in tasks.iter().filter(|t| t.action_type == action) {
                if task.is_root_task() || task.is_terminator_task() {
                    continue;
                }
                print_planned_task(task, &connectors);
            }
        }
        Ok(())
    }

    fn run_request(&mut self, identity: Identity, consent: Vec<ConsentPreference>) -> Result<()> {
        let graph = self.load_graph()?;
        let policy = self.load_policy()?;
        let connectors = self.load_connectors(&graph)?;

        let request = PrivacyRequest::new(&policy.key, identity).with_consent(consent);
        let preview = TaskBuilder::new(request.id, &graph, &policy)
            .build(&request.seed_identities())
            .context("while planning request")?;
        let stages: Vec<&str> = policy.stages().iter().map(ActionType::as_str).collect();
        eprintln!(
            "Request will run {} tasks ({}) with policy \"{}\".",
            preview.len(),
            stages.join(", "),
            policy.key
        );
        if self.settings.dry_run {
            eprintln!("Dry run; not creating the request.");
            return Ok(());
        }
        if !self.ui.confirm("Proceed?")? {
            return Ok(());
        }

        let store = self.open_store()?;
        let scheduler = Scheduler::new(
            &store,
            &store,
            &connectors,
            &policy,
            &self.settings.execution,
        );
        let id = request.id;
        eprintln!("\n{} {id}.\n", "Starting request".magenta());

        self.ui.start_timer();
        let status = scheduler.run_request(request, &graph);
        connectors.close_all();
        let status = status.with_context(|| format!("while running request {id}"))?;
        self.ui.print_elapsed("Running request");

        print_status(id, status);
        Ok(())
    }

    fn resume(&mut self, id: Uuid) -> Result<()> {
        let graph = self.load_graph()?;
        let policy = self.load_policy()?;
        let connectors = self.load_connectors(&graph)?;
        let store = self.open_store()?;

        let request = store.load_request(id)?;
        Self::check_policy(&request, &policy)?;
        if self.settings.dry_run {
            eprintln!("Dry run; request {id} is {}.", ui::request_status(request.status));
            return Ok(());
        }

        let scheduler = Scheduler::new(
            &store,
            &store,
            &connectors,
            &policy,
            &self.settings.execution,
        );
        self.ui.start_timer();
        let status = scheduler.resume(id);
        connectors.close_all();
        let status = status.with_context(|| format!("while resuming request {id}"))?;
        self.ui.print_elapsed("Resuming request");

        print_status(id, status);
        Ok(())
    }

    fn poll(&mut self, id: Uuid) -> Result<()> {
        let graph = self.load_graph()?;
        let policy = self.load_policy()?;
        let connectors = self.load_connectors(&graph)?;
        let store = self.open_store()?;

        let request = store.load_request(id)?;
        Self::check_policy(&request, &policy)?;
        if self.settings.dry_run {
            eprintln!("Dry run; request {id} is {}.", ui::request_status(request.status));
            return Ok(());
        }

        let scheduler = Scheduler::new(
            &store,
            &store,
            &connectors,
            &policy,
            &self.settings.execution,
        );
        let completed = scheduler.poll_async_tasks(id);
        connectors.close_all();
        let completed = completed.with_context(|| format!("while polling request {id}"))?;
        self.ui
            .verbose_msg(&format!("{completed} async tasks finished since the last poll."));

        print_status(id, store.load_request(id)?.status);
        Ok(())
    }

    fn cancel(&mut self, id: Uuid) -> Result<()> {
        let policy = self.load_policy()?;
        let store = self.open_store()?;
        let request = store.load_request(id)?;
        Self::check_policy(&request, &policy)?;
        if self.settings.dry_run {
            eprintln!("Dry run; not canceling request {id}.");
            return Ok(());
        }
        if request.status == RequestStatus::Complete {
            eprintln!("Request {id} is already complete.");
            return Ok(());
        }
        if !self.ui.confirm(&format!("Cancel request {id}?"))? {
            return Ok(());
        }

        // canceling never calls a connector:
        let connectors = ConnectorRegistry::default();
        let scheduler = Scheduler::new(
            &store,
            &store,
            &connectors,
            &policy,
            &self.settings.execution,
        );
        let skipped = scheduler.cancel(id)?;
        self.ui.verbose_msg(&format!("Skipped {skipped} tasks."));

        print_status(id, store.load_request(id)?.status);
        Ok(())
    }

    fn print_logs(&mut self, id: Uuid) -> Result<()> {
        let store = self.open_store()?;
        let request = store.load_request(id)?;
        println!(
            "{} {id} ({}, policy \"{}\")",
            "Request".bold(),
            ui::request_status(request.status),
            request.policy_key
        );
        if let Some(checkpoint) = &request.failed_checkpoint {
            println!(
                "failed at: {} {}",
                checkpoint.step,
                checkpoint.collection.to_string().cyan()
            );
        }

        for entry in store.execution_logs(id)? {
            let mut line = format!(
                "{} {:<8} {} #{} {}",
                entry.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                entry.action_type.as_str(),
                entry.collection_address.to_string().cyan(),
                entry.attempt,
                ui::task_status(entry.status),
            );
            if let Some(msg) = &entry.message {
                line.push_str(": ");
                line.push_str(msg);
            }
            if !entry.fields_affected.is_empty() {
                line.push_str(&format!(" [{}]", entry.fields_affected.join(", ")));
            }
            println!("{line}");
        }
        Ok(())
    }
}

fn print_planned_task(task: &RequestTask, connectors: &ConnectorRegistry) {
    let details = &task.traversal_details;
    let inputs: Vec<String> = details.input_keys.iter().map(|k| k.to_string()).collect();
    println!(
        "  {} [{}] <- {}",
        task.collection_address.to_string().cyan(),
        details.connector_key,
        inputs.join(", ")
    );
    if task.action_type != ActionType::Access {
        return;
    }
    let node = ExecutionNode::from_task(task);
    let query = connectors
        .get(&node.connector_key)
        .and_then(|c| c.query_config(&node).dry_run_query());
    match query {
        Some(query) => println!("      {query}"),
        None => println!("      {}", "(no query: collection has no inputs)".dimmed()),
    }
}

fn print_status(id: Uuid, status: RequestStatus) {
    println!("{id} {}", ui::request_status(status));
}
