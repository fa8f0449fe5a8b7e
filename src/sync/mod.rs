//! Sync gateway between the task ledger and the external issue tracker.
//!
//! - `pull` lists tracker issues and reconciles them with local tasks
//! - `push` mirrors one task's progress upstream, idempotently
//!
//! Every tracker call retries transient errors with exponential backoff.
//! The gateway never writes the ledger itself: pull returns the merged task
//! set and the caller persists it.

mod github;
mod issue;
mod memory;
mod tracker;

pub use github::GhCliTracker;
pub use issue::{parse_issue, render_body, task_labels, IssueFields};
pub use memory::{CallCounts, InMemoryTracker};
pub use tracker::{
    Issue, IssueFilter, IssueSpec, IssueState, IssueTracker, TrackerError, TrackerErrorKind,
};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::task::verification::verification_summary;
use crate::task::{Task, TaskId, TaskStatus};

/// Default number of tries per tracker call.
pub const DEFAULT_SYNC_ATTEMPTS: u32 = 3;
/// Default first backoff delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Errors surfaced by the gateway after retries.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Tracker {op} failed after {attempts} attempts: {source}")]
    Exhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: TrackerError,
    },

    #[error("Tracker {op} failed: {source}")]
    Permanent {
        op: &'static str,
        #[source]
        source: TrackerError,
    },
}

/// Retry settings for tracker calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for SyncBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SYNC_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl SyncBackoff {
    /// Delay after the `attempt`-th failed try (1-based): base * 2^(attempt-1).
    pub fn delay(&self, attempt: u32, error: &TrackerError) -> Duration {
        if let Some(retry_after) = error.retry_after {
            return retry_after.min(MAX_BACKOFF);
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(MAX_BACKOFF)
    }
}

/// Result of a pull.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    /// Local tasks merged with tracker state, ready to be written
    pub tasks: Vec<Task>,
    /// New tasks imported from open issues
    pub created: Vec<TaskId>,
    /// Tasks moved to `Closed` because their issue was closed upstream
    pub closed: Vec<TaskId>,
    /// Tasks whose issue is no longer listed
    pub orphaned: Vec<TaskId>,
    pub synced_at: DateTime<Utc>,
}

/// What a push changed upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Issue number of the task, newly assigned when `created`
    pub external_ref: String,
    pub created: bool,
    pub labels_updated: bool,
    pub closed: bool,
}

impl PushOutcome {
    pub fn is_noop(&self) -> bool {
        !self.created && !self.labels_updated && !self.closed
    }
}

/// Last known remote state of one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteMirror {
    labels: BTreeSet<String>,
    open: bool,
}

#[derive(Default)]
struct MirrorState {
    issues: HashMap<String, RemoteMirror>,
    /// Local id -> issue number, for rendering `Depends on:` lines
    refs: HashMap<TaskId, String>,
}

pub struct SyncGateway {
    tracker: Arc<dyn IssueTracker>,
    /// Label every managed issue carries; also the pull filter
    label: Option<String>,
    backoff: SyncBackoff,
    mirror: Mutex<MirrorState>,
}

impl SyncGateway {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            tracker,
            label: None,
            backoff: SyncBackoff::default(),
            mirror: Mutex::new(MirrorState::default()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.label = (!label.trim().is_empty()).then_some(label);
        self
    }

    pub fn with_backoff(mut self, backoff: SyncBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn tracker_name(&self) -> &str {
        self.tracker.name()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(source) if !source.is_transient() => {
                    tracing::warn!("Tracker {} failed permanently: {}", op, source);
                    return Err(SyncError::Permanent { op, source });
                }
                Err(source) if attempt >= max_attempts => {
                    tracing::warn!("Tracker {} failed after {} attempts: {}", op, attempt, source);
                    return Err(SyncError::Exhausted {
                        op,
                        attempts: attempt,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.backoff.delay(attempt, &source);
                    tracing::warn!(
                        "Tracker {} failed (attempt {}/{}), retrying in {:?}: {}",
                        op,
                        attempt,
                        max_attempts,
                        delay,
                        source
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch tracker issues and reconcile them with `local`.
    ///
    /// - Closed issues close their task (imported as `Closed` if unknown)
    /// - Open issues without a local task become new `Pending` tasks
    /// - Tracker metadata refreshes local copies; status and attempts stay
    /// - Local tasks whose issue vanished are flagged `orphaned`, never dropped
    pub async fn pull(&self, local: &[Task]) -> Result<PullOutcome, SyncError> {
        let filter = IssueFilter {
            label: self.label.clone(),
        };
        let issues = self
            .with_retry("list", || self.tracker.list_issues(&filter))
            .await?;
        tracing::info!(
            "Pulled {} issues from {} tracker",
            issues.len(),
            self.tracker.name()
        );

        let mut tasks: Vec<Task> = local.to_vec();
        let mut by_ref: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.external_ref.clone().map(|r| (r, i)))
            .collect();
        let mut taken_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();

        let mut outcome = PullOutcome {
            synced_at: Utc::now(),
            ..PullOutcome::default()
        };

        // Pass 1: make sure every issue has a task so dependency refs resolve.
        for issue in &issues {
            if by_ref.contains_key(&issue.number) {
                continue;
            }
            let mut id = TaskId::new(issue.number.clone());
            if taken_ids.contains(&id) {
                id = TaskId::new(format!("issue-{}", issue.number));
            }
            let task = match Task::new(id.clone(), issue.title.clone()) {
                Ok(task) => task.with_external_ref(issue.number.clone()),
                Err(e) => {
                    tracing::warn!("Skipping issue #{}: {}", issue.number, e);
                    continue;
                }
            };
            taken_ids.insert(id.clone());
            by_ref.insert(issue.number.clone(), tasks.len());
            tasks.push(task);
            if issue.is_open() {
                outcome.created.push(id);
            }
        }

        let ref_to_id: HashMap<String, TaskId> = by_ref
            .iter()
            .map(|(r, i)| (r.clone(), tasks[*i].id.clone()))
            .collect();

        // Pass 2: refresh metadata and mirror closes.
        let mut listed = HashSet::new();
        let mut mirror = self.mirror.lock().await;
        for issue in &issues {
            let Some(&index) = by_ref.get(&issue.number) else {
                continue;
            };
            listed.insert(issue.number.clone());
            let task = &mut tasks[index];
            apply_issue(task, issue, &ref_to_id);
            task.orphaned = false;
            if !issue.is_open() && task.status() != TaskStatus::Closed {
                task.mirror_remote_close();
                outcome.closed.push(task.id.clone());
            }
            mirror.issues.insert(
                issue.number.clone(),
                RemoteMirror {
                    labels: issue.labels.clone(),
                    open: issue.is_open(),
                },
            );
            mirror.refs.insert(task.id.clone(), issue.number.clone());
        }

        for task in tasks.iter_mut() {
            if let Some(external_ref) = &task.external_ref {
                if !listed.contains(external_ref) && !task.orphaned {
                    tracing::warn!(
                        "Task {} (issue #{}) is no longer listed by the tracker",
                        task.id,
                        external_ref
                    );
                    task.orphaned = true;
                    outcome.orphaned.push(task.id.clone());
                }
            }
        }
        drop(mirror);

        outcome.created.sort();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        outcome.tasks = tasks;
        Ok(outcome)
    }

    /// Mirror the task's state upstream. Idempotent: pushing the same state
    /// twice makes no tracker calls the second time.
    pub async fn push(&self, task: &Task) -> Result<PushOutcome, SyncError> {
        self.push_with_artifacts(task, &HashMap::new()).await
    }

    /// Like [`push`](Self::push); `artifacts` from verification feed the close comment.
    pub async fn push_with_artifacts(
        &self,
        task: &Task,
        artifacts: &HashMap<String, String>,
    ) -> Result<PushOutcome, SyncError> {
        let mut managed = task_labels(task);
        if let Some(label) = &self.label {
            managed.insert(label.clone());
        }
        let want_open = task.status() != TaskStatus::Closed;

        let mut outcome = PushOutcome {
            external_ref: String::new(),
            created: false,
            labels_updated: false,
            closed: false,
        };

        let external_ref = match &task.external_ref {
            Some(external_ref) => external_ref.clone(),
            None => {
                let spec = IssueSpec {
                    title: task.title.clone(),
                    body: self.render_body(task).await,
                    labels: managed.clone(),
                };
                let issue = self
                    .with_retry("create", || self.tracker.create_issue(&spec))
                    .await?;
                tracing::info!("Created issue #{} for task {}", issue.number, task.id);
                let mut mirror = self.mirror.lock().await;
                mirror.issues.insert(
                    issue.number.clone(),
                    RemoteMirror {
                        labels: issue.labels.clone(),
                        open: issue.is_open(),
                    },
                );
                mirror.refs.insert(task.id.clone(), issue.number.clone());
                outcome.created = true;
                issue.number
            }
        };
        outcome.external_ref = external_ref.clone();

        let known = self.mirror.lock().await.issues.get(&external_ref).cloned();
        let current = known.unwrap_or(RemoteMirror {
            labels: BTreeSet::new(),
            open: true,
        });
        let desired_labels = issue::merge_labels(&current.labels, managed);

        // Close before relabelling: the issue never reads `status:closed` while open.
        if !want_open && current.open {
            let comment = verification_summary(task, artifacts);
            self.with_retry("close", || self.tracker.close_issue(&external_ref, &comment))
                .await?;
            outcome.closed = true;
            self.mirror
                .lock()
                .await
                .issues
                .entry(external_ref.clone())
                .or_insert_with(|| current.clone())
                .open = false;
        }

        if desired_labels != current.labels {
            let updated = self
                .with_retry("update_labels", || {
                    self.tracker.update_labels(&external_ref, &desired_labels)
                })
                .await;
            match updated {
                Ok(()) => {
                    outcome.labels_updated = true;
                    self.mirror
                        .lock()
                        .await
                        .issues
                        .entry(external_ref.clone())
                        .or_insert_with(|| current.clone())
                        .labels = desired_labels.clone();
                }
                // The close is confirmed; stale labels are fixed by the next push.
                Err(e) if outcome.closed => {
                    tracing::warn!(
                        "Issue #{} closed but its labels were not updated: {}",
                        external_ref,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.is_noop() {
            tracing::debug!("Push of task {} is a no-op", task.id);
        } else {
            tracing::info!(
                "Pushed task {} to issue #{} (status={}, created={}, closed={})",
                task.id,
                external_ref,
                task.status(),
                outcome.created,
                outcome.closed
            );
        }
        Ok(outcome)
    }

    async fn render_body(&self, task: &Task) -> String {
        let mirror = self.mirror.lock().await;
        render_body(task, |dep| {
            mirror
                .refs
                .get(dep)
                .cloned()
                .unwrap_or_else(|| dep.to_string())
        })
    }
}

/// Refresh tracker-owned metadata on `task`.
fn apply_issue(task: &mut Task, issue: &Issue, ref_to_id: &HashMap<String, TaskId>) {
    let fields = parse_issue(&issue.body, &issue.labels);
    if !issue.title.trim().is_empty() {
        task.title = issue.title.clone();
    }
    task.description = fields.description;
    task.dependencies = fields
        .dependency_refs
        .iter()
        .map(|r| ref_to_id.get(r).cloned().unwrap_or_else(|| TaskId::new(r.clone())))
        .collect();
    task.files_touched = fields.files_touched;
    task.verification_steps = fields.verification_steps;
    if let Some(category) = fields.category {
        task.category = category;
    }
    if let Some(priority) = fields.priority {
        task.priority = priority;
    }
    task.execution_mode = fields.execution_mode;
    task.updated_at = Utc::now();
}
