//! Subtasks emitted by executors during decomposition.
//!
//! A design or planning step may break its task into children. Each child
//! arrives as a [`Subtask`] inside an execution result and becomes a full
//! `Pending` [`Task`] once the scheduler accepts it into the ledger.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ExecutionMode, Task, TaskError, TaskId};

/// A planned child task before it enters the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Explicit id; when absent one is derived from the parent
    #[serde(default)]
    pub id: Option<TaskId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
}

impl Subtask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: String::new(),
            category: None,
            priority: None,
            dependencies: BTreeSet::new(),
            execution_mode: ExecutionMode::default(),
            verification_steps: Vec::new(),
            files_touched: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Materialize the subtask as a child of `parent`.
    ///
    /// `index` is the position in the emitting batch and only matters when
    /// no explicit id was given. Category and priority default to the
    /// parent's.
    pub fn into_task(self, parent: &Task, index: usize) -> Result<Task, TaskError> {
        let id = self
            .id
            .unwrap_or_else(|| TaskId::new(format!("{}.{}", parent.id, index + 1)));
        let mut task = Task::new(id, self.title)?
            .with_description(self.description)
            .with_category(self.category.unwrap_or_else(|| parent.category.clone()))
            .with_priority(self.priority.unwrap_or(parent.priority))
            .with_dependencies(self.dependencies)
            .with_mode(self.execution_mode);
        task.verification_steps = self.verification_steps;
        task.files_touched = self.files_touched;
        task.parent = Some(parent.id.clone());
        Ok(task)
    }
}
