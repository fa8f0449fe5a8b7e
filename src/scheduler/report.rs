//! Run report: what happened to every task in one scheduler run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::graph::TaskGraph;
use crate::task::{Task, TaskId, TaskStatus};

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    /// Escalated ancestors keeping this task from running
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<TaskId>,
    /// Why the task is still `Verified` instead of `Closed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
    pub orphaned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub closed: usize,
    pub verified: usize,
    pub escalated: usize,
    pub blocked: usize,
    pub interrupted: usize,
    /// Tasks added by decomposition during the run
    pub discovered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub counts: RunCounts,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn task(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn status_of(&self, id: impl Into<TaskId>) -> Option<TaskStatus> {
        let id = id.into();
        self.task(&id).map(|t| t.status)
    }

    /// Whether every task ended in a success state.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self
                .tasks
                .iter()
                .all(|t| t.status.satisfies_dependency())
    }
}

/// Accumulates run facts that are not visible in the ledger.
#[derive(Debug, Default)]
pub(crate) struct ReportBuilder {
    pub interrupted: BTreeSet<TaskId>,
    pub push_errors: BTreeMap<TaskId, String>,
    pub discovered: usize,
    pub cancelled: bool,
}

impl ReportBuilder {
    pub fn finish(
        self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        tasks: Vec<Task>,
        graph: Option<&TaskGraph>,
    ) -> RunReport {
        let mut counts = RunCounts {
            interrupted: self.interrupted.len(),
            discovered: self.discovered,
            ..RunCounts::default()
        };
        let mut reports = Vec::with_capacity(tasks.len());

        for task in tasks {
            match task.status() {
                TaskStatus::Closed => counts.closed += 1,
                TaskStatus::Verified => counts.verified += 1,
                TaskStatus::Escalated => counts.escalated += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                _ => {}
            }
            let blocked_by = graph
                .filter(|_| task.status().is_waiting())
                .map(|g| g.escalated_ancestors(&task.id))
                .unwrap_or_default();
            reports.push(TaskReport {
                push_error: self.push_errors.get(&task.id).cloned(),
                id: task.id.clone(),
                title: task.title.clone(),
                status: task.status(),
                attempts: task.attempts(),
                external_ref: task.external_ref.clone(),
                last_failure: task.last_failure().map(str::to_string),
                blocked_by,
                orphaned: task.orphaned,
            });
        }

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: self.cancelled,
            counts,
            tasks: reports,
        }
    }
}
