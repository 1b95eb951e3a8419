use anyhow::Result;
use colored::{ColoredString, Colorize};

use util::Timer;

use crate::request::RequestStatus;
use crate::settings::Settings;
use crate::task::TaskStatus;

/// Everything printed for a person (rather than logged) goes through here.
pub struct Ui {
    /// -v was given at least once
    pub verbose: bool,
    /// -y was given; every prompt is answered yes
    assume_yes: bool,
    timer: Timer,
}

impl Ui {
    pub fn new(settings: &Settings) -> Self {
        Self {
            verbose: settings.verbose > 0,
            assume_yes: settings.yes,
            timer: Timer::now(),
        }
    }

    /// Ask a yes/no question on stderr. Anything but an answer starting
    /// with 'y' is a no.
    pub fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        eprint!("{prompt} (y/N) ");
        let mut answer = String::with_capacity(8);
        std::io::stdin().read_line(&mut answer)?;
        Ok(answer.trim_start().to_ascii_lowercase().starts_with('y'))
    }

    pub fn start_timer(&mut self) {
        self.timer.reset();
    }

    pub fn print_elapsed(&self, step: &str) {
        if self.verbose {
            eprintln!("{step} took {:.3?}", self.timer.elapsed());
        }
    }

    pub fn verbose_msg(&self, msg: &str) {
        if self.verbose {
            eprintln!("{msg}");
        }
    }

    /// Print the start of a progress line; finish it with [`Ui::done`].
    pub fn verbose_progress(&self, msg: &str) {
        if self.verbose {
            eprint!("{}... ", msg.magenta());
        }
    }

    pub fn verbose_progress_debug<T: std::fmt::Debug>(&self, msg: &str, arg: T) {
        if self.verbose {
            eprint!("{} {arg:?}... ", msg.magenta());
        }
    }

    pub fn done(&self) {
        if self.verbose {
            eprintln!("{}.", "done".green());
        }
    }
}

pub fn request_status(status: RequestStatus) -> ColoredString {
    match status {
        RequestStatus::Complete => status.as_str().green(),
        RequestStatus::Error => status.as_str().red(),
        RequestStatus::Paused | RequestStatus::AwaitingProcessing => status.as_str().yellow(),
        RequestStatus::Canceled => status.as_str().dimmed(),
        _ => status.as_str().normal(),
    }
}

pub fn task_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Complete => status.as_str().green(),
        TaskStatus::Error => status.as_str().red(),
        TaskStatus::Retrying | TaskStatus::Paused | TaskStatus::AwaitingProcessing => {
            status.as_str().yellow()
        }
        TaskStatus::Skipped => status.as_str().dimmed(),
        _ => status.as_str().normal(),
    }
}
