/// High-level command line app
mod app;
/// Definition of command-line args
mod args;
/// Task execution: connectors, retries and the scheduler
pub mod exec;
/// Filesystem operations
mod fs;
/// What a request is allowed to read, erase and propagate
pub mod policy;
/// Building and checking the tasks of a request before it runs
pub mod prep;
/// Privacy requests and their identities
pub mod request;
/// Combined command-line and environment run settings
mod settings;
/// Persistence for requests, tasks and execution logs
pub mod store;
/// Tasks, their statuses and execution logs
pub mod task;
/// Text UI
mod ui;

// exported for tests:
pub use app::App;
pub use args::{Args, Cmd};
pub use fs::Fs;
pub use settings::{Command, ExecutionConfig, Settings};

/// Run the command-line app.
pub fn run() -> Result<(), anyhow::Error> {
    use clap::Parser;
    let args = Args::parse();

    // INTERPRET SETTINGS ///////////////
    let settings: Settings = args.try_into()?;

    let log_level = match settings.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logging::log_to_stderr(log_level);

    // RUN THE THING /////////////////
    let app = App::new(settings);
    app.run()?;

    Ok(())
}
