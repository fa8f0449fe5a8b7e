//! Task ledger with pluggable backends.
//!
//! The ledger is the single source of truth for task state during a run.
//! Every status transition is written through immediately, so a crash loses
//! at most the progress of the tasks that were in flight.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: versioned JSON snapshot plus a small summary index

mod file;
mod memory;

pub use file::FileLedger;
pub use memory::InMemoryLedger;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId};

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 1;

/// Cheap-to-read counts, kept fresh on every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub total: usize,
    /// Count per status label (`pending`, `verified`, ...)
    pub by_status: BTreeMap<String, usize>,
    pub orphaned: usize,
}

impl SummaryCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.total += 1;
            *counts
                .by_status
                .entry(task.status().as_str().to_string())
                .or_default() += 1;
            if task.orphaned {
                counts.orphaned += 1;
            }
        }
        counts
    }

    pub fn count(&self, status: crate::task::TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// The persisted ledger document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary_counts: SummaryCounts,
}

impl LedgerSnapshot {
    pub fn new(tasks: Vec<Task>, last_sync_timestamp: Option<DateTime<Utc>>) -> Self {
        let summary_counts = SummaryCounts::from_tasks(&tasks);
        Self {
            version: LEDGER_VERSION,
            tasks,
            last_sync_timestamp,
            summary_counts,
        }
    }
}

/// The small always-fresh companion of the snapshot, for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerIndex {
    pub version: u32,
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub summary_counts: SummaryCounts,
    pub updated_at: DateTime<Utc>,
}

/// Errors from ledger persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Unsupported ledger version {found} (this build reads up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Task {0} not found in ledger")]
    NotFound(TaskId),
}

/// Ledger trait - implemented by all storage backends.
///
/// Writers are the scheduler and the retry policy only; the sync gateway
/// hands its results to the orchestrator, which writes them.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Whether this ledger persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// All tasks, ordered by id.
    async fn tasks(&self) -> Result<Vec<Task>, LedgerError>;

    /// Get a single task by id.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, LedgerError>;

    /// Insert or replace one task (write-through).
    async fn put(&self, task: &Task) -> Result<(), LedgerError>;

    /// Insert or replace several tasks with a single persist.
    async fn put_many(&self, tasks: &[Task]) -> Result<(), LedgerError>;

    /// Timestamp of the last successful pull.
    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, LedgerError>;

    /// Record a successful pull.
    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), LedgerError>;

    /// Full snapshot in the persisted format.
    async fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let tasks = self.tasks().await?;
        let last_sync = self.last_sync().await?;
        Ok(LedgerSnapshot::new(tasks, last_sync))
    }

    /// Summary counts without copying the task list out.
    async fn summary(&self) -> Result<SummaryCounts, LedgerError> {
        Ok(SummaryCounts::from_tasks(&self.tasks().await?))
    }
}

/// Ledger backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerStoreType {
    Memory,
    #[default]
    File,
}

impl LedgerStoreType {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "file" | "json" => Self::File,
            _ => Self::default(),
        }
    }
}

/// Create a ledger based on type and configuration.
pub async fn create_ledger(
    store_type: LedgerStoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn TaskLedger>, LedgerError> {
    match store_type {
        LedgerStoreType::Memory => Ok(Box::new(InMemoryLedger::new())),
        LedgerStoreType::File => Ok(Box::new(FileLedger::open(base_dir).await?)),
    }
}
