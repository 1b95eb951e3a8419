use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::args::{Args, Cmd};
use crate::request::{ConsentPreference, Identity};

const KV_DELIM: char = '=';

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid identity '{0}' (should be formatted 'name=value')")]
    InvalidIdentity(String),
    #[error("no identity specified; use '--identity name=value'")]
    NoIdentity,
    #[error("invalid consent '{0}' (should be formatted 'data_use=true|false')")]
    InvalidConsent(String),
    #[error("invalid request id '{0}'")]
    InvalidRequestId(String),
    #[error("retry backoff must be a finite number >= 1.0 (got {0})")]
    InvalidBackoff(f64),
    #[error("retry delay must be a finite number of seconds >= 0 (got {0})")]
    InvalidDelay(f64),
}

/// Retry and concurrency knobs for task execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// retries after the first attempt; a task makes at most this + 1 calls.
    pub task_retry_count: u32,
    pub task_retry_delay: Duration,
    /// multiplier applied to the delay before each retry.
    pub task_retry_backoff: f64,
    pub worker_count: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_retry_count: 0,
            task_retry_delay: Duration::from_secs(1),
            task_retry_backoff: 1.0,
            worker_count: 4,
        }
    }
}

/// What the user asked us to do.
#[derive(Debug, Clone)]
pub enum Command {
    /// Print the traversal and the queries it would run.
    Plan { identity: Identity },
    Run {
        identity: Identity,
        consent: Vec<ConsentPreference>,
    },
    Resume(Uuid),
    Poll(Uuid),
    Cancel(Uuid),
    Logs(Uuid),
}

/// Settings are like Args, except all the logic has
/// been applied so e.g. defaults are added in.
#[derive(Debug)]
pub struct Settings {
    pub output: PathBuf,
    pub datasets: PathBuf,
    pub fixtures: PathBuf,
    pub policy: PathBuf,
    pub yes: bool,
    pub verbose: u8,
    pub dry_run: bool,
    pub execution: ExecutionConfig,
    pub command: Command,
}

impl TryFrom<Args> for Settings {
    type Error = anyhow::Error;
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if !args.retry_backoff.is_finite() || args.retry_backoff < 1.0 {
            return Err(Error::InvalidBackoff(args.retry_backoff).into());
        }
        if !args.retry_delay.is_finite() || args.retry_delay < 0.0 {
            return Err(Error::InvalidDelay(args.retry_delay).into());
        }
        let execution = ExecutionConfig {
            task_retry_count: args.retry_count,
            task_retry_delay: Duration::from_secs_f64(args.retry_delay),
            task_retry_backoff: args.retry_backoff,
            worker_count: args.workers.max(1),
        };

        let command = match args.command {
            Cmd::Plan { identity } => Command::Plan {
                identity: parse_identity(&identity)?,
            },
            Cmd::Run { identity, consent } => Command::Run {
                identity: parse_identity(&identity)?,
                consent: parse_consent(&consent)?,
            },
            Cmd::Resume { request } => Command::Resume(parse_id(&request)?),
            Cmd::Poll { request } => Command::Poll(parse_id(&request)?),
            Cmd::Cancel { request } => Command::Cancel(parse_id(&request)?),
            Cmd::Logs { request } => Command::Logs(parse_id(&request)?),
        };

        Ok(Self {
            output: PathBuf::from(&args.output),
            datasets: PathBuf::from(&args.datasets),
            fixtures: PathBuf::from(&args.fixtures),
            policy: PathBuf::from(&args.policy),
            yes: args.yes,
            verbose: args.verbose,
            dry_run: args.dry_run,
            execution,
            command,
        })
    }
}

fn parse_identity(args: &[String]) -> Result<Identity, Error> {
    if args.is_empty() {
        return Err(Error::NoIdentity);
    }
    let mut identity = Identity::new();
    for arg in args {
        let (k, v) = arg
            .split_once(KV_DELIM)
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .ok_or_else(|| Error::InvalidIdentity(arg.to_owned()))?;
        identity.insert(k.to_owned(), Value::String(v.to_owned()));
    }
    Ok(identity)
}

fn parse_consent(args: &[String]) -> Result<Vec<ConsentPreference>, Error> {
    args.iter()
        .map(|arg| {
            let (data_use, opt_in) = arg
                .split_once(KV_DELIM)
                .and_then(|(k, v)| Some((k, v.parse::<bool>().ok()?)))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| Error::InvalidConsent(arg.to_owned()))?;
            Ok(ConsentPreference {
                data_use: data_use.to_owned(),
                opt_in,
                affected_systems: BTreeMap::new(),
            })
        })
        .collect()
}

fn parse_id(s: &str) -> Result<Uuid, Error> {
    s.parse().map_err(|_| Error::InvalidRequestId(s.to_owned()))
}
