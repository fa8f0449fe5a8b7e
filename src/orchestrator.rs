//! End-to-end run: pull -> ledger -> schedule -> push.
//!
//! The orchestrator owns the run-level cancellation token. An operator
//! abort or the run timeout fires it; in-flight tasks are reset to
//! `Dispatched` and picked up again by the next run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::executor::AgentExecutor;
use crate::graph::GraphError;
use crate::ledger::{LedgerError, TaskLedger};
use crate::retry::RetryPolicy;
use crate::scheduler::{close_upstream, CloseOutcome, RunReport, Scheduler, SchedulerError};
use crate::sync::{PullOutcome, SyncError, SyncGateway};
use crate::task::{Task, TaskStatus};

/// Errors surfaced to the top-level caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task graph is invalid: {0}")]
    Structural(#[from] GraphError),

    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(SchedulerError),
}

impl From<SchedulerError> for OrchestratorError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Structural(e) => OrchestratorError::Structural(e),
            SchedulerError::Ledger(e) => OrchestratorError::Ledger(e),
            other => OrchestratorError::Scheduler(other),
        }
    }
}

pub struct Orchestrator {
    ledger: Arc<dyn TaskLedger>,
    gateway: Arc<SyncGateway>,
    executor: Arc<dyn AgentExecutor>,
    policy: RetryPolicy,
    parallelism_limit: Option<usize>,
    working_dir: PathBuf,
    run_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        gateway: Arc<SyncGateway>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            executor,
            policy: RetryPolicy::default(),
            parallelism_limit: None,
            working_dir: PathBuf::from("."),
            run_timeout: None,
        }
    }

    /// Apply the run settings from `config`.
    pub fn with_config(self, config: &Config) -> Self {
        self.with_policy(RetryPolicy::new(config.max_repair_attempts))
            .with_parallelism_limit(config.parallelism_limit)
            .with_working_dir(config.workspace_path.clone())
            .with_run_timeout(config.run_timeout)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parallelism_limit(mut self, limit: Option<usize>) -> Self {
        self.parallelism_limit = limit;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Pull tracker state and write the merged task set to the ledger.
    pub async fn sync(&self) -> Result<PullOutcome, OrchestratorError> {
        let local = self.ledger.tasks().await?;
        let outcome = self.gateway.pull(&local).await?;
        self.ledger.put_many(&outcome.tasks).await?;
        self.ledger.record_sync(outcome.synced_at).await?;
        tracing::info!(
            "Synced {} tasks: {} new, {} closed upstream, {} orphaned",
            outcome.tasks.len(),
            outcome.created.len(),
            outcome.closed.len(),
            outcome.orphaned.len()
        );
        Ok(outcome)
    }

    /// Retry the close of tasks a previous run verified but could not push.
    /// Returns how many were closed.
    async fn close_verified(&self) -> Result<usize, OrchestratorError> {
        let pending: Vec<Task> = self
            .ledger
            .tasks()
            .await?
            .into_iter()
            .filter(|t| t.status() == TaskStatus::Verified)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!("Retrying push for {} verified tasks", pending.len());
        let no_artifacts = HashMap::new();

        let pushes = pending.into_iter().map(|task| {
            close_upstream(&self.gateway, self.ledger.as_ref(), task, &no_artifacts)
        });

        let mut closed = 0;
        for outcome in join_all(pushes).await {
            match outcome? {
                CloseOutcome::Closed(_) => closed += 1,
                CloseOutcome::PushFailed(task, e) => {
                    tracing::warn!("Task {} stays verified, push failed: {}", task.id, e);
                }
            }
        }
        Ok(closed)
    }

    /// Run once: sync, retry pending closes, schedule until nothing can
    /// progress, and report.
    ///
    /// # Errors
    /// A failed pull aborts before any task is dispatched. Structural graph
    /// errors and ledger failures abort the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4();
        tracing::info!("Run {} starting with {} tracker", run_id, self.gateway.tracker_name());

        self.sync().await?;
        let closed = self.close_verified().await?;
        if closed > 0 {
            tracing::info!("Closed {} tasks verified by an earlier run", closed);
        }

        let scheduler = Scheduler::new(Arc::clone(&self.ledger), Arc::clone(&self.executor))
            .with_policy(self.policy)
            .with_gateway(Arc::clone(&self.gateway))
            .with_parallelism_limit(self.parallelism_limit)
            .with_working_dir(self.working_dir.clone())
            .with_run_id(run_id);

        let run_cancel = cancel.child_token();
        let timer = self.run_timeout.map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!("Run timeout of {:?} reached, cancelling", limit);
                token.cancel();
            })
        });

        let result = scheduler.run(run_cancel).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::executor::{ExecutionContext, ExecutionResult, Phase, FAILING_TEST_COUNT};
    use crate::ledger::InMemoryLedger;
    use crate::sync::{InMemoryTracker, IssueState, SyncBackoff, TrackerError, TrackerErrorKind};

    /// Passes every phase; the test phase reports one failing test.
    struct PassingExecutor;

    #[async_trait]
    impl AgentExecutor for PassingExecutor {
        fn name(&self) -> &str {
            "passing"
        }

        async fn execute(&self, _task: &Task, phase: Phase, _ctx: &ExecutionContext) -> ExecutionResult {
            match phase {
                Phase::Testing => ExecutionResult::success().with_artifact(FAILING_TEST_COUNT, "1"),
                _ => ExecutionResult::success(),
            }
        }
    }

    /// Never finishes on its own; returns once the run is cancelled.
    struct StallingExecutor;

    #[async_trait]
    impl AgentExecutor for StallingExecutor {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn execute(&self, _task: &Task, _phase: Phase, ctx: &ExecutionContext) -> ExecutionResult {
            ctx.cancel.cancelled().await;
            ExecutionResult::failure("cancelled")
        }
    }

    fn orchestrator(
        ledger: &Arc<InMemoryLedger>,
        tracker: &InMemoryTracker,
        executor: Arc<dyn AgentExecutor>,
    ) -> Orchestrator {
        let gateway = SyncGateway::new(Arc::new(tracker.clone()))
            .with_label("taskloom")
            .with_backoff(SyncBackoff {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            });
        Orchestrator::new(ledger.clone(), Arc::new(gateway), executor)
    }

    #[tokio::test]
    async fn test_issues_are_implemented_and_closed() {
        let tracker = InMemoryTracker::new();
        let login = tracker.add_issue("Add login", "Login form", &["taskloom"], IssueState::Open);
        let session = tracker.add_issue(
            "Persist session",
            &format!("Keep users signed in\n\nDepends on: #{}", login),
            &["taskloom"],
            IssueState::Open,
        );
        tracker.add_issue("Unrelated", "", &["question"], IssueState::Open);

        let ledger = Arc::new(InMemoryLedger::new());
        let report = assert_ok!(
            orchestrator(&ledger, &tracker, Arc::new(PassingExecutor))
                .run(CancellationToken::new())
                .await
        );

        assert!(report.is_success());
        assert_eq!(report.counts.closed, 2);
        assert_eq!(report.tasks.len(), 2);
        assert!(!tracker.issue(&login).unwrap().is_open());
        assert!(!tracker.issue(&session).unwrap().is_open());
        assert_eq!(tracker.comments(&session).len(), 1);
        assert!(ledger.last_sync().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pull_failure_aborts_before_dispatch() {
        let tracker = InMemoryTracker::new();
        tracker.add_issue("Add login", "", &["taskloom"], IssueState::Open);
        tracker.fail_next(TrackerError::new(TrackerErrorKind::Auth, "bad credentials"));

        let ledger = Arc::new(InMemoryLedger::new());
        let result = orchestrator(&ledger, &tracker, Arc::new(PassingExecutor))
            .run(CancellationToken::new())
            .await;

        assert!(matches!(assert_err!(result), OrchestratorError::Sync(SyncError::Permanent { .. })));
        assert!(ledger.tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_timeout_interrupts_in_flight_tasks() {
        let tracker = InMemoryTracker::new();
        let login = tracker.add_issue("Add login", "", &["taskloom"], IssueState::Open);

        let ledger = Arc::new(InMemoryLedger::new());
        let report = assert_ok!(
            orchestrator(&ledger, &tracker, Arc::new(StallingExecutor))
                .with_run_timeout(Some(Duration::from_millis(50)))
                .run(CancellationToken::new())
                .await
        );

        assert!(report.cancelled);
        assert_eq!(report.counts.interrupted, 1);
        let task = ledger.tasks().await.unwrap().remove(0);
        assert_eq!(task.status(), TaskStatus::Dispatched);
        assert!(tracker.issue(&login).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_verified_task_is_closed_on_next_run() {
        let tracker = InMemoryTracker::new();
        let login = tracker.add_issue("Add login", "", &["taskloom"], IssueState::Open);

        let mut task = Task::new(login.as_str(), "Add login")
            .unwrap()
            .with_external_ref(login.clone());
        for status in [
            TaskStatus::Ready,
            TaskStatus::Dispatched,
            TaskStatus::Testing,
            TaskStatus::Implementing,
            TaskStatus::Verifying,
            TaskStatus::Verified,
        ] {
            task.transition(status).unwrap();
        }
        let ledger = Arc::new(InMemoryLedger::with_tasks([task]));

        let report = assert_ok!(
            orchestrator(&ledger, &tracker, Arc::new(PassingExecutor))
                .run(CancellationToken::new())
                .await
        );

        assert_eq!(report.counts.closed, 1);
        assert!(!tracker.issue(&login).unwrap().is_open());
        assert_eq!(tracker.calls().close, 1);
    }
}
