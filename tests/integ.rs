use anyhow::Result;
use dsr_runner::exec::{ConnectorError, ConnectorRegistry, MemoryConnector, Scheduler};
use dsr_runner::policy::Policy;
use dsr_runner::request::{Identity, PrivacyRequest, RequestStatus};
use dsr_runner::store::{FsStore, TaskStore};
use dsr_runner::task::{ActionType, RequestTask, TaskStatus};
use dsr_runner::{App, Args, Cmd, ExecutionConfig, Fs};
use graph::{Dataset, DatasetGraph};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

const DEMOS: &str = "demos";

fn basic_args(output: &Path, command: Cmd) -> Args {
    Args {
        command,
        output: output.to_str().unwrap().to_owned(),
        datasets: format!("{DEMOS}/datasets"),
        fixtures: format!("{DEMOS}/fixtures"),
        policy: format!("{DEMOS}/policy.json"),
        retry_count: 0,
        retry_delay: 0.0,
        retry_backoff: 1.0,
        workers: 2,
        yes: true,
        verbose: 1,
        dry_run: false,
    }
}

fn run_cmd(args: Args) -> Result<()> {
    simple_logging::log_to_stderr(log::LevelFilter::Debug);
    let settings = args.try_into()?;
    App::new(settings).run()
}

fn run_args(output: &Path) -> Args {
    basic_args(
        output,
        Cmd::Run {
            identity: vec!["email=jane@example.com".to_owned()],
            consent: Vec::new(),
        },
    )
}

fn open_store(output: &Path) -> Result<FsStore> {
    let mut fs = Fs::new(output, false);
    fs.ensure_output_dir_exists(false)?;
    Ok(FsStore::new(fs))
}

/// Ids of every request written under `output`.
fn request_ids(output: &Path) -> Result<Vec<Uuid>> {
    let dir = output.join("requests");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        ids.push(entry?.file_name().to_str().unwrap().parse()?);
    }
    Ok(ids)
}

fn task(store: &FsStore, id: Uuid, action: ActionType, collection: &str) -> Result<RequestTask> {
    Ok(store
        .tasks_for_request(id, Some(action))?
        .into_iter()
        .find(|t| t.collection_address.collection == collection)
        .unwrap())
}

#[test]
fn test_run_request() -> Result<()> {
    let output = tempdir()?;
    run_cmd(run_args(output.path()))?;

    let ids = request_ids(output.path())?;
    assert_eq!(ids.len(), 1, "one request was written");
    let id = ids[0];

    let store = open_store(output.path())?;
    let request = store.load_request(id)?;
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.policy_key, "default");

    let orders = task(&store, id, ActionType::Access, "orders")?;
    let order_ids: Vec<_> = orders.access_data.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(order_ids, [json!(10), json!(12)]);

    let reviews = task(&store, id, ActionType::Access, "reviews")?;
    assert_eq!(reviews.access_data.len(), 1);
    assert_eq!(reviews.access_data[0]["text"], json!("Arrived on time."));

    assert_eq!(task(&store, id, ActionType::Erasure, "customer")?.rows_masked, Some(1));
    assert_eq!(task(&store, id, ActionType::Erasure, "orders")?.rows_masked, Some(2));
    assert_eq!(task(&store, id, ActionType::Erasure, "subscribers")?.rows_masked, Some(1));
    assert_eq!(task(&store, id, ActionType::Erasure, "reviews")?.rows_masked, Some(0));

    // no consent preferences on the request, so nothing was sent:
    let consent = task(&store, id, ActionType::Consent, "mailer")?;
    assert_eq!(consent.status, TaskStatus::Complete);
    assert_eq!(consent.consent_sent, Some(false));

    let logs = store.execution_logs(id)?;
    assert!(logs.iter().all(|l| l.status != TaskStatus::Error));
    assert!(logs
        .iter()
        .any(|l| l.collection_address.collection == "customer"
            && l.status == TaskStatus::Complete
            && l.fields_affected.contains(&"email".to_owned())));

    output.close()?;
    Ok(())
}

#[test]
fn test_logs_and_cancel_after_run() -> Result<()> {
    let output = tempdir()?;
    run_cmd(run_args(output.path()))?;
    let id = request_ids(output.path())?[0];

    run_cmd(basic_args(output.path(), Cmd::Logs { request: id.to_string() }))?;

    // a complete request can't be canceled:
    run_cmd(basic_args(output.path(), Cmd::Cancel { request: id.to_string() }))?;
    let store = open_store(output.path())?;
    assert_eq!(store.load_request(id)?.status, RequestStatus::Complete);

    // resuming it again is a no-op:
    run_cmd(basic_args(output.path(), Cmd::Resume { request: id.to_string() }))?;
    assert_eq!(store.load_request(id)?.status, RequestStatus::Complete);

    output.close()?;
    Ok(())
}

#[test]
fn test_dry_run_writes_nothing() -> Result<()> {
    let output = tempdir()?;
    let out_dir = output.path().join("out");
    let mut args = run_args(&out_dir);
    args.dry_run = true;
    run_cmd(args)?;
    assert!(!out_dir.exists());

    let plan = basic_args(
        &out_dir,
        Cmd::Plan {
            identity: vec!["email=jane@example.com".to_owned()],
        },
    );
    run_cmd(plan)?;
    assert!(!out_dir.exists());

    output.close()?;
    Ok(())
}

#[test]
fn test_unknown_request() -> Result<()> {
    let output = tempdir()?;
    let args = basic_args(
        output.path(),
        Cmd::Logs {
            request: Uuid::new_v4().to_string(),
        },
    );
    assert!(run_cmd(args).is_err());
    output.close()?;
    Ok(())
}

#[test]
fn test_unreachable_collection_is_named() -> Result<()> {
    let dir = tempdir()?;
    let datasets = dir.path().join("datasets");
    std::fs::create_dir(&datasets)?;
    std::fs::write(
        datasets.join("db.json"),
        r#"{"name": "db", "collections": [
            {"name": "customer", "fields": [{"name": "email", "identity": "email"}]},
            {"name": "orphan", "fields": [{"name": "id"}]}
        ]}"#,
    )?;

    let mut args = run_args(&dir.path().join("out"));
    args.datasets = datasets.to_str().unwrap().to_owned();
    let err = run_cmd(args).unwrap_err();
    assert!(format!("{err:#}").contains("db:orphan"), "{err:#}");
    assert!(request_ids(&dir.path().join("out"))?.is_empty());

    dir.close()?;
    Ok(())
}

fn demo_graph() -> Result<DatasetGraph> {
    let mut datasets = Vec::new();
    for name in ["mailer", "shop"] {
        datasets.push(Dataset::load(&PathBuf::from(format!("{DEMOS}/datasets/{name}.json")))?);
    }
    Ok(DatasetGraph::new(datasets)?)
}

fn demo_connectors() -> Result<(Arc<MemoryConnector>, ConnectorRegistry)> {
    let shop = Arc::new(MemoryConnector::load(
        "shop",
        Path::new("demos/fixtures/shop.json"),
    )?);
    let mailer = Arc::new(MemoryConnector::load(
        "mailer",
        Path::new("demos/fixtures/mailer.json"),
    )?);
    let mut registry = ConnectorRegistry::default();
    registry.register(shop.clone());
    registry.register(mailer);
    Ok((shop, registry))
}

#[test]
fn test_resume_after_restart() -> Result<()> {
    let output = tempdir()?;
    let graph = demo_graph()?;
    let policy = Policy::load(Path::new("demos/policy.json"))?;
    let config = ExecutionConfig {
        task_retry_count: 1,
        task_retry_delay: Duration::ZERO,
        ..Default::default()
    };

    let mut identity = Identity::new();
    identity.insert("email".to_owned(), json!("jane@example.com"));
    let request = PrivacyRequest::new("default", identity);
    let id = request.id;

    {
        let store = open_store(output.path())?;
        let (shop, connectors) = demo_connectors()?;
        shop.fail_next("orders", ConnectorError::Connection("refused".to_owned()), 2);
        let scheduler = Scheduler::new(&store, &store, &connectors, &policy, &config);
        assert_eq!(scheduler.run_request(request, &graph)?, RequestStatus::Error);
        assert_eq!(shop.calls("orders"), 2);
    }

    // a new process picks the request up from disk:
    let store = open_store(output.path())?;
    let failed = store.load_request(id)?;
    assert_eq!(failed.failed_checkpoint.map(|c| c.step), Some(ActionType::Access));

    let (shop, connectors) = demo_connectors()?;
    let scheduler = Scheduler::new(&store, &store, &connectors, &policy, &config);
    assert_eq!(scheduler.resume(id)?, RequestStatus::Complete);

    // customer access already completed before the failure; only its erasure runs now.
    assert_eq!(shop.calls("customer"), 1);
    assert_eq!(shop.calls("orders"), 2);
    assert_eq!(task(&store, id, ActionType::Access, "orders")?.access_data.len(), 2);

    let retried = task(&store, id, ActionType::Access, "orders")?;
    assert_eq!(retried.retry_count, 1);

    output.close()?;
    Ok(())
}

#[test]
fn test_poll_finishes_async_collection_in_a_later_run() -> Result<()> {
    let dir = tempdir()?;
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir(&fixtures)?;
    std::fs::copy(
        format!("{DEMOS}/fixtures/mailer.json"),
        fixtures.join("mailer.json"),
    )?;
    let mut shop: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(format!("{DEMOS}/fixtures/shop.json"))?)?;
    shop["async_collections"] = json!({ "reviews": "polling" });
    std::fs::write(fixtures.join("shop.json"), serde_json::to_string(&shop)?)?;

    let output = dir.path().join("out");
    let with_fixtures = |command: Cmd| {
        let mut args = basic_args(&output, command);
        args.fixtures = fixtures.to_str().unwrap().to_owned();
        args
    };

    run_cmd(with_fixtures(Cmd::Run {
        identity: vec!["email=jane@example.com".to_owned()],
        consent: Vec::new(),
    }))?;
    let id = request_ids(&output)?[0];
    let store = open_store(&output)?;
    assert_eq!(store.load_request(id)?.status, RequestStatus::AwaitingProcessing);
    let reviews = task(&store, id, ActionType::Access, "reviews")?;
    assert_eq!(reviews.status, TaskStatus::AwaitingProcessing);

    // each poll is a fresh process; the job started by `run` isn't held in memory:
    run_cmd(with_fixtures(Cmd::Poll { request: id.to_string() }))?;
    let reviews = task(&store, id, ActionType::Access, "reviews")?;
    assert_eq!(reviews.status, TaskStatus::Complete);
    assert_eq!(reviews.access_data.len(), 1);
    assert_eq!(reviews.access_data[0]["text"], json!("Arrived on time."));
    // the erasure of reviews is async too:
    assert_eq!(store.load_request(id)?.status, RequestStatus::AwaitingProcessing);
    let erasure = task(&store, id, ActionType::Erasure, "reviews")?;
    assert_eq!(erasure.status, TaskStatus::AwaitingProcessing);

    run_cmd(with_fixtures(Cmd::Poll { request: id.to_string() }))?;
    assert_eq!(store.load_request(id)?.status, RequestStatus::Complete);
    let erasure = task(&store, id, ActionType::Erasure, "reviews")?;
    assert_eq!(erasure.status, TaskStatus::Complete);
    assert_eq!(erasure.rows_masked, Some(0));
    assert_eq!(task(&store, id, ActionType::Erasure, "customer")?.rows_masked, Some(1));

    dir.close()?;
    Ok(())
}
