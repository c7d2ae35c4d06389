//! Stage dependency index.
//!
//! One group per `(flow, stage)` that something waits on: the ids of that
//! stage's tasks that have not completed yet, and the next-stage tasks
//! waiting for them. Groups are transient; a restart rebuilds them lazily.

use std::collections::{HashMap, HashSet};

use crate::core::task::{FlowId, Task, TaskId, TaskStatus};

/// Identifies one stage of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageKey {
    /// Flow identifier.
    pub flow_id: FlowId,
    /// Stage index.
    pub stage: u32,
}

impl StageKey {
    /// Build a key.
    #[must_use]
    pub const fn new(flow_id: FlowId, stage: u32) -> Self {
        Self { flow_id, stage }
    }

    /// Key of the stage `task` belongs to.
    #[must_use]
    pub const fn of(task: &Task) -> Self {
        Self::new(task.flow_id, task.stage)
    }

    /// Key of the stage `task` waits on, `None` for stage 0.
    #[must_use]
    pub fn predecessor_of(task: &Task) -> Option<Self> {
        task.stage
            .checked_sub(1)
            .map(|stage| Self::new(task.flow_id, stage))
    }
}

/// Ids of the not-yet-completed tasks of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockingSet(HashSet<TaskId>);

impl BlockingSet {
    /// Number of blockers left.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No blockers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `id` still blocks the stage.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.0.contains(&id)
    }
}

impl FromIterator<TaskId> for BlockingSet {
    fn from_iter<I: IntoIterator<Item = TaskId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Blockers of one stage and the tasks waiting on them.
#[derive(Debug, Default)]
pub struct DependencyGroup {
    /// Tasks of the stage that have not completed.
    pub blocking: BlockingSet,
    /// Next-stage tasks waiting for `blocking` to drain.
    pub dependents: HashMap<TaskId, Task>,
}

/// Outcome of settling a group.
#[derive(Debug)]
pub struct Resolution {
    /// Status every dependent moves to: NEW when the stage cleared, ON_HOLD
    /// when it is stuck.
    pub status: TaskStatus,
    /// The released (or held) dependents, already carrying `status`.
    pub dependents: Vec<Task>,
}

/// All open dependency groups of the scheduler.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    groups: HashMap<StageKey, DependencyGroup>,
}

impl DependencyIndex {
    /// Record `dependent` as waiting on `key`.
    ///
    /// A new group takes `blockers` as its blocking set; an existing group
    /// keeps its own. A stale group with nothing left to wait on is dropped
    /// and replaced.
    pub fn register(&mut self, key: StageKey, blockers: BlockingSet, dependent: Task) {
        if self
            .groups
            .get(&key)
            .is_some_and(|group| group.blocking.is_empty() || group.dependents.is_empty())
        {
            tracing::debug!(flow_id = key.flow_id, stage = key.stage, "discarding stale dependency group");
            self.groups.remove(&key);
        }
        let group = self.groups.entry(key).or_insert_with(|| DependencyGroup {
            blocking: blockers,
            dependents: HashMap::new(),
        });
        group.dependents.insert(dependent.id, dependent);
    }

    /// Settle `task_id` (with persisted `status`) in the group for `key`.
    ///
    /// Returns the dependents to update when the stage cleared or got stuck;
    /// the group is removed in that case.
    pub fn complete(&mut self, key: StageKey, task_id: TaskId, status: TaskStatus) -> Option<Resolution> {
        if !status.triggers_resolution() {
            return None;
        }
        let group = self.groups.get_mut(&key)?;
        if group.blocking.is_empty() {
            self.groups.remove(&key);
            return None;
        }
        group.blocking.0.remove(&task_id);
        if !group.blocking.is_empty() && !status.is_failure() {
            return None;
        }

        let group = self.groups.remove(&key)?;
        let next = if status == TaskStatus::Completed {
            TaskStatus::New
        } else {
            TaskStatus::OnHold
        };
        let mut dependents: Vec<Task> = group
            .dependents
            .into_values()
            .map(|task| task.with_status(next))
            .collect();
        dependents.sort_by_key(|task| task.id);
        Some(Resolution {
            status: next,
            dependents,
        })
    }

    /// Replace blocker `old` with `replacements` wherever `key` waits on it.
    pub fn substitute(&mut self, key: StageKey, old: TaskId, replacements: &[TaskId]) {
        if let Some(group) = self.groups.get_mut(&key) {
            if group.blocking.0.remove(&old) {
                group.blocking.0.extend(replacements.iter().copied());
            }
        }
    }

    /// Whether a group is open for `key`.
    #[must_use]
    pub fn contains(&self, key: &StageKey) -> bool {
        self.groups.contains_key(key)
    }

    /// The open group for `key`.
    #[must_use]
    pub fn group(&self, key: &StageKey) -> Option<&DependencyGroup> {
        self.groups.get(key)
    }

    /// Number of open groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// No open groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drop every group.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Drop every group, returning the dependents that were still waiting.
    pub fn drain_dependents(&mut self) -> Vec<Task> {
        let mut dependents: Vec<Task> = self
            .groups
            .drain()
            .flat_map(|(_, group)| group.dependents.into_values())
            .collect();
        dependents.sort_by_key(|task| task.id);
        dependents
    }
}
