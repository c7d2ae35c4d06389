//! Task model and the task status state machine.
//!
//! A [`Task`] is a value: the scheduler copies it across the queue boundary
//! and every thread mutates only its own copy before writing it back through
//! storage.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::machines::Machine;

/// Storage-assigned task identifier.
pub type TaskId = u64;
/// Identifier shared by every task of one flow.
pub type FlowId = u64;
/// Worker machine identifier.
pub type MachineId = u64;

/// Context value meaning "every sub-directory at this level".
pub const WILDCARD: &str = ".*";

/// Matches `{study}`-style placeholders in unit path patterns.
pub(crate) static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(.*?)\}").expect("placeholder regex is valid"));

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Persisted but not yet started.
    Created,
    /// Visible to the producer.
    New,
    /// Enqueued in memory.
    Pending,
    /// Dispatched to a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before dispatch.
    Canceled,
    /// Killed while running.
    Stopped,
    /// Kill request failed on the worker.
    StoppedFailure,
    /// Parked because its stage cannot make progress.
    OnHold,
}

/// Result of applying a requested status on top of a persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Write the requested status.
    Apply(TaskStatus),
    /// The persisted status is final; the request is dropped.
    Deny,
    /// A PENDING request arrived for a running task; it stays PROCESSING.
    KeepProcessing,
}

impl TaskStatus {
    /// Statuses from which the scheduler never moves a task on its own.
    pub const FINAL: [Self; 5] = [
        Self::Completed,
        Self::Failed,
        Self::Canceled,
        Self::Stopped,
        Self::StoppedFailure,
    ];

    /// Terminal status check.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Stopped | Self::StoppedFailure
        )
    }

    /// Statuses that leave a stage stuck and propagate ON_HOLD to dependents.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Canceled | Self::Stopped | Self::StoppedFailure | Self::OnHold
        )
    }

    /// Whether reaching this status settles the task for dependency resolution.
    #[must_use]
    pub const fn triggers_resolution(self) -> bool {
        self.is_final() || matches!(self, Self::OnHold)
    }

    /// Whether an explicit resume may move the task back to NEW.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::OnHold) || (self.is_final() && !matches!(self, Self::Completed))
    }

    /// Decide how a request to move from `self` to `requested` is persisted.
    #[must_use]
    pub fn update_to(self, requested: Self) -> StatusUpdate {
        if self == requested {
            return StatusUpdate::Apply(self);
        }
        if self.is_final() {
            return StatusUpdate::Deny;
        }
        if self == Self::Processing && requested == Self::Pending {
            return StatusUpdate::KeepProcessing;
        }
        StatusUpdate::Apply(requested)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::New => "New",
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Stopped => "Stopped",
            Self::StoppedFailure => "Stop_Failed",
            Self::OnHold => "On_Hold",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "New" => Ok(Self::New),
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Canceled" => Ok(Self::Canceled),
            "Stopped" => Ok(Self::Stopped),
            "Stop_Failed" => Ok(Self::StoppedFailure),
            "On_Hold" => Ok(Self::OnHold),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// A named parameter handed to the unit executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitParameter {
    /// Parameter name.
    pub name: String,
    /// Parameter value; may contain placeholders.
    pub value: String,
}

impl UnitParameter {
    /// Build a parameter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Executable template a task runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTemplate {
    /// Unit identifier.
    pub id: u64,
    /// Human readable name.
    pub name: String,
    /// Executable or script to run on the worker.
    pub executable: String,
    /// Input path pattern.
    pub input_paths: String,
    /// Output directory pattern.
    pub output_dir: String,
    /// Parameters passed to the executable.
    #[serde(default)]
    pub parameters: Vec<UnitParameter>,
}

/// Level of the study/subject/run hierarchy a placeholder refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLevel {
    /// `{study}`
    Study,
    /// `{subject}`
    Subject,
    /// `{run}`
    Run,
}

impl ContextLevel {
    /// All levels, outermost first.
    pub const ALL: [Self; 3] = [Self::Study, Self::Subject, Self::Run];

    /// Placeholder name without braces.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Study => "study",
            Self::Subject => "subject",
            Self::Run => "run",
        }
    }

    /// Parse a placeholder name, ignoring case.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.name().eq_ignore_ascii_case(name))
    }
}

/// Identifiers used to resolve path patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Study identifier.
    pub study: Option<String>,
    /// Subject identifier.
    pub subject: Option<String>,
    /// Run identifier.
    pub run: Option<String>,
}

impl Context {
    /// Build a fully specified context.
    pub fn new(
        study: impl Into<String>,
        subject: impl Into<String>,
        run: impl Into<String>,
    ) -> Self {
        Self {
            study: Some(study.into()),
            subject: Some(subject.into()),
            run: Some(run.into()),
        }
    }

    /// Value stored for `level`.
    #[must_use]
    pub fn get(&self, level: ContextLevel) -> Option<&str> {
        match level {
            ContextLevel::Study => self.study.as_deref(),
            ContextLevel::Subject => self.subject.as_deref(),
            ContextLevel::Run => self.run.as_deref(),
        }
    }

    /// Replace the value stored for `level`.
    pub fn set(&mut self, level: ContextLevel, value: impl Into<String>) {
        let value = Some(value.into());
        match level {
            ContextLevel::Study => self.study = value,
            ContextLevel::Subject => self.subject = value,
            ContextLevel::Run => self.run = value,
        }
    }

    /// Substitute every concrete (non-wildcard) value into `pattern`.
    #[must_use]
    pub fn resolve(&self, pattern: &str) -> String {
        ContextLevel::ALL
            .into_iter()
            .fold(pattern.to_owned(), |acc, level| match self.get(level) {
                Some(value) if value != WILDCARD => replace_placeholder(&acc, level, value),
                _ => acc,
            })
    }
}

/// Replace every `{level}` occurrence (any case) in `source` with `value`.
pub(crate) fn replace_placeholder(source: &str, level: ContextLevel, value: &str) -> String {
    PLACEHOLDER
        .replace_all(source, |caps: &regex::Captures<'_>| {
            if ContextLevel::parse(&caps[1]) == Some(level) {
                value.to_owned()
            } else {
                caps[0].to_owned()
            }
        })
        .into_owned()
}

/// One unit of work within a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Storage-assigned identifier.
    pub id: TaskId,
    /// Owning flow.
    pub flow_id: FlowId,
    /// Serial position of the task's stage within the flow.
    pub stage: u32,
    /// Unit the task runs.
    pub unit: UnitTemplate,
    /// Worker the task was dispatched to, if any.
    pub machine: Option<Machine>,
    /// Study/subject/run identifiers.
    pub context: Context,
    /// Current status.
    pub status: TaskStatus,
}

impl Task {
    /// Build an unsaved task; storage assigns `id` and `flow_id`.
    #[must_use]
    pub fn new(stage: u32, unit: UnitTemplate, context: Context) -> Self {
        Self {
            id: 0,
            flow_id: 0,
            stage,
            unit,
            machine: None,
            context,
            status: TaskStatus::Created,
        }
    }

    /// Copy of this task carrying `status`.
    #[must_use]
    pub fn with_status(&self, status: TaskStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Input path with every known context value substituted.
    #[must_use]
    pub fn input_path(&self) -> String {
        self.context.resolve(&self.unit.input_paths)
    }

    /// Output path with every known context value substituted.
    #[must_use]
    pub fn output_path(&self) -> String {
        self.context.resolve(&self.unit.output_dir)
    }

    /// The input pattern still carries a placeholder and must be expanded.
    ///
    /// This holds even when the context fills every placeholder: such a task
    /// is still replaced by a single expanded task with a new id, and its own
    /// id is gone from storage once the expansion lands.
    #[must_use]
    pub fn needs_expansion(&self) -> bool {
        PLACEHOLDER.is_match(&self.unit.input_paths)
    }

    /// The output path cannot be fully resolved from the context.
    #[must_use]
    pub fn has_unresolved_output(&self) -> bool {
        let output = self.output_path();
        PLACEHOLDER.is_match(&output) || output.contains(WILDCARD)
    }
}
