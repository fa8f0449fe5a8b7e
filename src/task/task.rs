//! Core Task type and its lifecycle state machine.
//!
//! # Invariants
//! - `id` is unique within a ledger
//! - `status` only moves along the edges accepted by [`TaskStatus::can_transition_to`]
//! - `attempts` is only advanced by the retry policy

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a task.
///
/// Tasks mirrored from the tracker use the issue number, locally decomposed
/// tasks may use any non-empty string. Ordering is numeric when both sides
/// are numbers and lexical otherwise, so `2 < 10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self::new(value.to_string())
    }
}

/// How a task is dispatched relative to siblings sharing its dependency tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// May run concurrently with siblings that have the same dependencies
    #[default]
    Parallel,
    /// Runs alone; the next sibling waits for this one to finish
    Sequential,
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Ready -> Dispatched -> Testing -> Implementing -> Verifying -> Verified -> Closed
///    |         ^                       |            ^   |           |
///    v         |                       v            |   v           v
/// Blocked -----+                   Escalated     Failed <-----------+
///                                                   |
///                                                   v
///                                               Escalated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Sub-state of `Pending`: a dependency is not yet verified
    Blocked,
    Ready,
    Dispatched,
    /// Test-writing phase (tests must be present and failing)
    Testing,
    Implementing,
    Verifying,
    Verified,
    Failed,
    /// Terminal failure, needs a human
    Escalated,
    /// Terminal success, the tracker issue is closed
    Closed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 11] = [
        TaskStatus::Pending,
        TaskStatus::Blocked,
        TaskStatus::Ready,
        TaskStatus::Dispatched,
        TaskStatus::Testing,
        TaskStatus::Implementing,
        TaskStatus::Verifying,
        TaskStatus::Verified,
        TaskStatus::Failed,
        TaskStatus::Escalated,
        TaskStatus::Closed,
    ];

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Escalated | TaskStatus::Closed)
    }

    /// Whether dependents of a task in this state may be dispatched.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Verified | TaskStatus::Closed)
    }

    /// Whether the task is waiting for dispatch.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Ready
        )
    }

    /// Whether an executor is (or was, before an interruption) working on the task.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Dispatched
                | TaskStatus::Testing
                | TaskStatus::Implementing
                | TaskStatus::Verifying
                | TaskStatus::Failed
        )
    }

    /// The edge table of the state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Blocked, Ready)
                | (Ready, Dispatched)
                | (Dispatched, Testing)
                | (Testing, Implementing)
                | (Testing, Escalated)
                | (Implementing, Verifying)
                | (Implementing, Failed)
                | (Verifying, Verified)
                | (Verifying, Failed)
                | (Failed, Implementing)
                | (Failed, Escalated)
                | (Verified, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Testing => "testing",
            TaskStatus::Implementing => "implementing",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Verified => "verified",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of orchestrated work, mirroring one tracker issue.
///
/// Metadata fields are public because the sync gateway refreshes them from
/// the tracker. `status` and `attempts` are private: the scheduler and the
/// retry policy are their only writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    status: TaskStatus,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Task that emitted this one during decomposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_failure: Option<String>,
    /// Set by pull when the tracker no longer lists the issue
    #[serde(default)]
    pub orphaned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new `Pending` task.
    ///
    /// # Errors
    /// Returns `Err` if the id or title is empty.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Result<Self, TaskError> {
        let id = id.into();
        let title = title.into();
        if id.as_str().trim().is_empty() {
            return Err(TaskError::EmptyId);
        }
        if title.trim().is_empty() {
            return Err(TaskError::EmptyTitle);
        }
        let now = Utc::now();
        Ok(Self {
            id,
            title,
            description: String::new(),
            category: String::new(),
            priority: 0,
            dependencies: BTreeSet::new(),
            execution_mode: ExecutionMode::default(),
            status: TaskStatus::Pending,
            verification_steps: Vec::new(),
            files_touched: BTreeSet::new(),
            attempts: 0,
            external_ref: None,
            parent: None,
            last_failure: None,
            orphaned: false,
            created_at: now,
            updated_at: now,
            archived_at: None,
        })
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_dependencies<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_verification_step(mut self, step: impl Into<String>) -> Self {
        self.verification_steps.push(step.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files_touched.insert(path.into());
        self
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// # Errors
    /// `TaskError::InvalidTransition` for any edge not in the table.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == TaskStatus::Closed {
            self.archived_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Record a failure and move to `Failed`.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        self.last_failure = Some(detail.into());
        Ok(())
    }

    /// Record the final failure and move to `Escalated`.
    pub fn escalate(&mut self, detail: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Escalated)?;
        self.last_failure = Some(detail.into());
        Ok(())
    }

    /// Put an interrupted in-flight task back to `Dispatched` so a later run
    /// can pick it up again. No-op for tasks already `Dispatched`.
    pub fn reset_to_dispatched(&mut self) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Dispatched => Ok(()),
            TaskStatus::Testing | TaskStatus::Implementing | TaskStatus::Verifying => {
                self.status = TaskStatus::Dispatched;
                self.updated_at = Utc::now();
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: other,
                to: TaskStatus::Dispatched,
            }),
        }
    }

    /// Mirror a close that happened on the tracker side.
    pub(crate) fn mirror_remote_close(&mut self) {
        if self.status != TaskStatus::Closed {
            self.status = TaskStatus::Closed;
            self.updated_at = Utc::now();
            self.archived_at = Some(self.updated_at);
        }
    }

    /// Count one consumed repair cycle.
    pub(crate) fn record_repair_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = Utc::now();
    }

    /// Sort key used for ready-set ordering.
    pub fn dispatch_key(&self) -> (u32, &TaskId) {
        (self.priority, &self.id)
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task id cannot be empty")]
    EmptyId,

    #[error("Task title cannot be empty")]
    EmptyTitle,

    #[error("Invalid state transition for task {id} from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}
