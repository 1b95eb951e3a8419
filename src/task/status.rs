use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProcessing,
    Complete,
    Error,
    Skipped,
    Paused,
    AwaitingProcessing,
    Retrying,
}

impl TaskStatus {
    /// True if a task may move from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProcessing | Skipped)
                | (Retrying, InProcessing | Skipped)
                | (
                    InProcessing,
                    Complete | Error | Skipped | Paused | AwaitingProcessing | Retrying
                )
                | (Error, Retrying)
                | (Paused, Retrying | Skipped)
                | (AwaitingProcessing, InProcessing | Skipped | Error)
        )
    }

    /// Downstream tasks may run once all of their upstream tasks are done.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// Complete, skipped and errored tasks don't move without outside help.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Error)
    }

    /// Statuses a worker may claim a task from.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProcessing => "in_processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Paused => "paused",
            Self::AwaitingProcessing => "awaiting_processing",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
