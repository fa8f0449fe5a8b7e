//! Agent executors - the opaque workers behind each pipeline phase.
//!
//! The scheduler never knows what an agent is. It calls
//! [`AgentExecutor::execute`] with a task and a [`Phase`] and gets back an
//! [`ExecutionResult`]. Concrete backends:
//! - [`CommandExecutor`]: runs an agent CLI as a subprocess
//! - [`PhaseRouter`]: dispatches each phase to a registered executor
//!
//! # Caller responsibilities
//! - Executors must be idempotent or re-entrant-safe: an interrupted task is
//!   dispatched again by the next run
//! - Concurrent executors must not interfere; overlapping `files_touched`
//!   is only reported, never serialized

mod command;
mod router;

pub use command::{CommandExecutor, CommandExecutorConfig};
pub use router::PhaseRouter;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::task::{Subtask, Task};

/// Artifact key the test-writing phase uses to report how many tests fail.
pub const FAILING_TEST_COUNT: &str = "failingTestCount";

/// Pipeline phase an executor is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Write tests that fail before the implementation exists
    Testing,
    /// Make the tests pass
    Implementing,
    /// End-to-end verification against the task's verification steps
    Verifying,
    /// Fix the implementation using the previous failure detail
    Repairing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Testing => "testing",
            Phase::Implementing => "implementing",
            Phase::Verifying => "verifying",
            Phase::Repairing => "repairing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Structured outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    #[serde(default)]
    pub error_detail: String,
    /// Child tasks emitted by decomposition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered: Vec<Subtask>,
}

impl ExecutionResult {
    /// Create a successful result.
    pub fn success() -> Self {
        Self {
            status: ExecutionStatus::Success,
            artifacts: HashMap::new(),
            error_detail: String::new(),
            discovered: Vec::new(),
        }
    }

    /// Create a failure result.
    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            artifacts: HashMap::new(),
            error_detail: detail.into(),
            discovered: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.artifacts.insert(key.into(), value.into());
        self
    }

    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.discovered.push(subtask);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Parsed `failingTestCount` artifact, if present and numeric.
    pub fn failing_test_count(&self) -> Option<u64> {
        self.artifacts
            .get(FAILING_TEST_COUNT)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Per-invocation context handed to executors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    /// Repair attempt number, 0 for the first implementation
    pub attempt: u32,
    /// Failure detail from the previous attempt, threaded into repairs
    pub failure_detail: Option<String>,
    /// Default working directory for the agent
    pub working_dir: PathBuf,
    /// Run-level cancellation; executors should stop promptly when fired
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, working_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            attempt: 0,
            failure_detail: None,
            working_dir,
            cancel,
        }
    }

    pub fn for_repair(&self, attempt: u32, failure_detail: impl Into<String>) -> Self {
        Self {
            attempt,
            failure_detail: Some(failure_detail.into()),
            ..self.clone()
        }
    }
}

/// A unit of agent work.
///
/// # Invariants
/// - `execute()` never panics; problems are reported as `Failure` results
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Short identifier used in logs and the router.
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task, phase: Phase, ctx: &ExecutionContext) -> ExecutionResult;
}
