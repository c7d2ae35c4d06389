//! Aggregate flow status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::task::TaskStatus;

/// Status of a flow, derived from the statuses of its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Nothing has been scheduled yet.
    New,
    /// Some task is queued or running.
    InProgress,
    /// Every task completed.
    Completed,
    /// A task failed or is on hold; the flow cannot advance.
    Stuck,
    /// A task was cancelled.
    Canceled,
    /// A task was stopped.
    Stopped,
    /// A stop request failed.
    Error,
}

impl FlowStatus {
    /// Derive the flow status from its task statuses.
    ///
    /// Rules are checked in priority order over the whole set: ON_HOLD or
    /// FAILED, then STOPPED, STOPPED_FAILURE, CANCELED, all COMPLETED and
    /// finally PENDING/PROCESSING. An empty flow is `New`.
    pub fn derive<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut seen = Seen::default();
        let mut total = 0usize;
        for status in statuses {
            total += 1;
            match status {
                TaskStatus::OnHold | TaskStatus::Failed => seen.stuck = true,
                TaskStatus::Stopped => seen.stopped = true,
                TaskStatus::StoppedFailure => seen.stop_failed = true,
                TaskStatus::Canceled => seen.canceled = true,
                TaskStatus::Completed => seen.completed += 1,
                TaskStatus::Pending | TaskStatus::Processing => seen.running = true,
                TaskStatus::Created | TaskStatus::New => {}
            }
        }

        if seen.stuck {
            Self::Stuck
        } else if seen.stopped {
            Self::Stopped
        } else if seen.stop_failed {
            Self::Error
        } else if seen.canceled {
            Self::Canceled
        } else if total > 0 && seen.completed == total {
            Self::Completed
        } else if seen.running {
            Self::InProgress
        } else {
            Self::New
        }
    }
}

#[derive(Default)]
#[allow(clippy::struct_excessive_bools)]
struct Seen {
    stuck: bool,
    stopped: bool,
    stop_failed: bool,
    canceled: bool,
    running: bool,
    completed: usize,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "New",
            Self::InProgress => "In_Progress",
            Self::Completed => "Completed",
            Self::Stuck => "Stuck",
            Self::Canceled => "Canceled",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}
