use clap::{Parser, Subcommand};

const CMD_NAME: &str = "dsr";
const DEFAULT_OUTPUT: &str = "output";
const DEFAULT_DATASETS: &str = "datasets";
const DEFAULT_FIXTURES: &str = "fixtures";
const DEFAULT_POLICY: &str = "policy.json";

/// Stores our command-line args format.
#[derive(Parser)]
#[command(name = CMD_NAME, version, about = None, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Cmd,

    /// Output directory for requests, tasks and logs
    #[arg(short, long, value_name = "DIR", default_value = DEFAULT_OUTPUT, global = true)]
    #[arg(env = "DSR_OUTPUT")]
    pub output: String,

    /// Directory of dataset definition files (*.json)
    #[arg(short, long, value_name = "DIR", default_value = DEFAULT_DATASETS, global = true)]
    #[arg(env = "DSR_DATASETS")]
    pub datasets: String,

    /// Directory of connector fixture files (<connector_key>.json)
    #[arg(short, long, value_name = "DIR", default_value = DEFAULT_FIXTURES, global = true)]
    #[arg(env = "DSR_FIXTURES")]
    pub fixtures: String,

    /// Policy file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_POLICY, global = true)]
    #[arg(env = "DSR_POLICY")]
    pub policy: String,

    /// Retries after a task's first failed attempt
    #[arg(long, value_name = "N", default_value_t = 0, global = true)]
    #[arg(env = "DSR_RETRY_COUNT")]
    pub retry_count: u32,

    /// Seconds to wait before the first retry
    #[arg(long, value_name = "SECS", default_value_t = 1.0, global = true)]
    #[arg(env = "DSR_RETRY_DELAY")]
    pub retry_delay: f64,

    /// Multiplier applied to the delay before each retry
    #[arg(long, value_name = "FACTOR", default_value_t = 1.0, global = true)]
    #[arg(env = "DSR_RETRY_BACKOFF")]
    pub retry_backoff: f64,

    /// Number of worker threads
    #[arg(short, long, value_name = "N", default_value_t = 4, global = true)]
    #[arg(env = "DSR_WORKERS")]
    pub workers: usize,

    /// Bypass user confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Print additional debugging info (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Dry run; print info but don't modify anything.
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Cmd {
    /// Show the traversal and the query each collection would run
    Plan {
        /// Identity value (repeatable)
        #[arg(short, long, value_name = "NAME=VALUE")]
        identity: Vec<String>,
    },
    /// Create a privacy request and run it
    Run {
        /// Identity value (repeatable)
        #[arg(short, long, value_name = "NAME=VALUE")]
        identity: Vec<String>,
        /// Consent preference to propagate (repeatable)
        #[arg(short, long, value_name = "DATA_USE=true|false")]
        consent: Vec<String>,
    },
    /// Retry a failed or paused request from its checkpoint
    Resume { request: String },
    /// Check async tasks of a request, and continue it if they're done
    Poll { request: String },
    /// Cancel a request, skipping all of its unfinished tasks
    Cancel { request: String },
    /// Print the execution log of a request
    Logs { request: String },
}
