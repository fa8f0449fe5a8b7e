//! Per-task pipeline: Testing -> Implementing -> Verifying, with repairs.
//!
//! Every status change is written to the ledger before the next executor
//! call, so an interrupted run resumes from the last recorded step.

use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::{AgentExecutor, ExecutionContext, ExecutionResult, Phase, FAILING_TEST_COUNT};
use crate::ledger::TaskLedger;
use crate::retry::{Failure, FailureClass, RepairContext, RetryAction, RetryPolicy};
use crate::sync::{SyncError, SyncGateway};
use crate::task::{Subtask, Task, TaskStatus};

use super::SchedulerError;

/// Shared collaborators of every pipeline in a run.
pub(crate) struct PipelineDeps {
    pub ledger: Arc<dyn TaskLedger>,
    pub executor: Arc<dyn AgentExecutor>,
    pub policy: RetryPolicy,
    pub gateway: Option<Arc<SyncGateway>>,
}

/// How one task's pipeline ended.
#[derive(Debug)]
pub(crate) struct PipelineOutcome {
    /// The task as last written to the ledger
    pub task: Task,
    pub interrupted: bool,
    pub push_error: Option<String>,
    /// Subtasks emitted by any phase
    pub discovered: Vec<Subtask>,
}

enum Step {
    Done(ExecutionResult),
    Interrupted,
}

enum TestPhase {
    /// Tests exist and fail; task is `Implementing`
    Failing,
    Escalated,
    Interrupted,
}

/// Result of [`close_upstream`].
#[derive(Debug)]
pub(crate) enum CloseOutcome {
    /// The tracker confirmed the close; the task is `Closed` in the ledger
    Closed(Task),
    /// The task is still `Verified`
    PushFailed(Task, SyncError),
}

/// Mirror a `Verified` task upstream, then close its issue.
///
/// The `Verified` state is pushed first so the issue shows `status:verified`
/// even when the close is refused. Only a confirmed close moves the task to
/// `Closed`; both states are written to the ledger as they are reached.
pub(crate) async fn close_upstream(
    gateway: &SyncGateway,
    ledger: &dyn TaskLedger,
    mut task: Task,
    artifacts: &HashMap<String, String>,
) -> Result<CloseOutcome, SchedulerError> {
    match gateway.push(&task).await {
        Ok(pushed) => {
            if task.external_ref.as_deref() != Some(pushed.external_ref.as_str()) {
                task.external_ref = Some(pushed.external_ref);
                ledger.put(&task).await?;
            }
        }
        Err(e) => return Ok(CloseOutcome::PushFailed(task, e)),
    }

    let mut closing = task.clone();
    closing.transition(TaskStatus::Closed)?;
    match gateway.push_with_artifacts(&closing, artifacts).await {
        Ok(_) => {
            ledger.put(&closing).await?;
            Ok(CloseOutcome::Closed(closing))
        }
        Err(e) => Ok(CloseOutcome::PushFailed(task, e)),
    }
}

/// Pipeline state for a single task.
struct Run<'a> {
    deps: &'a PipelineDeps,
    task: Task,
    ctx: ExecutionContext,
    discovered: Vec<Subtask>,
}

impl PipelineDeps {
    /// Drive one task from `Ready` (or the state an interrupted run left it
    /// in) to where this run can take it.
    pub async fn run(&self, task: Task, ctx: ExecutionContext) -> Result<PipelineOutcome, SchedulerError> {
        Run {
            deps: self,
            task,
            ctx,
            discovered: Vec::new(),
        }
        .drive()
        .await
    }
}

impl Run<'_> {
    async fn save(&self) -> Result<(), SchedulerError> {
        self.deps.ledger.put(&self.task).await?;
        Ok(())
    }

    async fn transition(&mut self, next: TaskStatus) -> Result<(), SchedulerError> {
        self.task.transition(next)?;
        self.save().await
    }

    fn finish(self, interrupted: bool, push_error: Option<String>) -> PipelineOutcome {
        PipelineOutcome {
            task: self.task,
            interrupted,
            push_error,
            discovered: self.discovered,
        }
    }

    async fn call(&mut self, phase: Phase, ctx: &ExecutionContext) -> Step {
        tracing::info!(
            "Task {} [{}] -> {} (attempt {})",
            self.task.id,
            self.task.title,
            phase,
            ctx.attempt
        );
        let mut result = self.deps.executor.execute(&self.task, phase, ctx).await;
        if ctx.cancel.is_cancelled() {
            return Step::Interrupted;
        }
        if !result.discovered.is_empty() {
            tracing::info!(
                "Task {} emitted {} subtasks during {}",
                self.task.id,
                result.discovered.len(),
                phase
            );
            self.discovered.append(&mut result.discovered);
        }
        Step::Done(result)
    }

    async fn interrupt(mut self) -> Result<PipelineOutcome, SchedulerError> {
        self.task.reset_to_dispatched()?;
        self.save().await?;
        tracing::warn!("Task {} interrupted, left {}", self.task.id, self.task.status());
        Ok(self.finish(true, None))
    }

    /// Record the failure and let the policy decide. Returns the repair
    /// context, or `None` once the task is escalated.
    async fn on_failure(&mut self, failure: Failure) -> Result<Option<RepairContext>, SchedulerError> {
        if self.task.status() != TaskStatus::Failed && failure.class.is_retryable() {
            self.task.fail(failure.describe())?;
            self.save().await?;
        }

        match self.deps.policy.on_failure(&mut self.task, &failure) {
            RetryAction::Retry(repair) => {
                tracing::info!(
                    "Task {} repair {}/{}: {}",
                    self.task.id,
                    repair.attempt,
                    self.deps.policy.max_repair_attempts,
                    repair.failure_detail
                );
                self.transition(TaskStatus::Implementing).await?;
                Ok(Some(repair))
            }
            RetryAction::Escalate { reason } => {
                tracing::warn!("Task {} escalated: {}", self.task.id, reason);
                self.task.escalate(reason)?;
                self.save().await?;
                self.mirror_escalation().await;
                Ok(None)
            }
        }
    }

    async fn drive(mut self) -> Result<PipelineOutcome, SchedulerError> {
        let mut repair = match self.task.status() {
            TaskStatus::Ready => {
                self.transition(TaskStatus::Dispatched).await?;
                None
            }
            TaskStatus::Dispatched => None,
            TaskStatus::Testing | TaskStatus::Implementing | TaskStatus::Verifying => {
                self.task.reset_to_dispatched()?;
                self.save().await?;
                None
            }
            // Crashed between recording a failure and deciding on it.
            TaskStatus::Failed => {
                let detail = self
                    .task
                    .last_failure()
                    .unwrap_or("interrupted after failure")
                    .to_string();
                match self.on_failure(Failure::recorded(FailureClass::Execution, detail)).await? {
                    Some(repair) => Some(repair),
                    None => return Ok(self.finish(false, None)),
                }
            }
            other => {
                tracing::debug!("Task {} not dispatchable from {}", self.task.id, other);
                return Ok(self.finish(false, None));
            }
        };

        if repair.is_none() {
            match self.write_tests().await? {
                TestPhase::Failing => {}
                TestPhase::Escalated => return Ok(self.finish(false, None)),
                TestPhase::Interrupted => return self.interrupt().await,
            }
        }

        loop {
            let (phase, ctx) = match &repair {
                Some(r) => (
                    Phase::Repairing,
                    self.ctx.for_repair(r.attempt, r.failure_detail.clone()),
                ),
                None => (Phase::Implementing, self.ctx.clone()),
            };

            let result = match self.call(phase, &ctx).await {
                Step::Done(result) => result,
                Step::Interrupted => return self.interrupt().await,
            };
            if !result.is_success() {
                let failure = Failure::new(FailureClass::Execution, result.error_detail);
                match self.on_failure(failure).await? {
                    Some(next) => {
                        repair = Some(next);
                        continue;
                    }
                    None => return Ok(self.finish(false, None)),
                }
            }

            self.transition(TaskStatus::Verifying).await?;
            let result = match self.call(Phase::Verifying, &ctx).await {
                Step::Done(result) => result,
                Step::Interrupted => return self.interrupt().await,
            };

            if result.is_success() {
                self.transition(TaskStatus::Verified).await?;
                tracing::info!("Task {} verified", self.task.id);
                return self.close(&result.artifacts).await;
            }

            let failure = Failure::new(FailureClass::Verification, result.error_detail);
            match self.on_failure(failure).await? {
                Some(next) => repair = Some(next),
                None => return Ok(self.finish(false, None)),
            }
        }
    }

    async fn write_tests(&mut self) -> Result<TestPhase, SchedulerError> {
        self.transition(TaskStatus::Testing).await?;
        let ctx = self.ctx.clone();
        let result = match self.call(Phase::Testing, &ctx).await {
            Step::Done(result) => result,
            Step::Interrupted => return Ok(TestPhase::Interrupted),
        };

        let failure = if !result.is_success() {
            Some(Failure::new(FailureClass::TestAuthoring, result.error_detail))
        } else {
            match result.failing_test_count() {
                Some(n) if n > 0 => None,
                Some(_) => Some(Failure::new(
                    FailureClass::NoFailingTests,
                    "test phase reported 0 failing tests",
                )),
                None => Some(Failure::new(
                    FailureClass::NoFailingTests,
                    format!("test phase did not report {}", FAILING_TEST_COUNT),
                )),
            }
        };

        match failure {
            Some(failure) => {
                self.on_failure(failure).await?;
                Ok(TestPhase::Escalated)
            }
            None => {
                self.transition(TaskStatus::Implementing).await?;
                Ok(TestPhase::Failing)
            }
        }
    }

    /// Push the verified task upstream and close it. Without a gateway, or
    /// when the push fails, the task stays `Verified`.
    async fn close(mut self, artifacts: &HashMap<String, String>) -> Result<PipelineOutcome, SchedulerError> {
        let Some(gateway) = self.deps.gateway.clone() else {
            return Ok(self.finish(false, None));
        };

        let task = self.task.clone();
        match close_upstream(&gateway, self.deps.ledger.as_ref(), task, artifacts).await? {
            CloseOutcome::Closed(closed) => {
                self.task = closed;
                tracing::info!("Task {} closed", self.task.id);
                Ok(self.finish(false, None))
            }
            CloseOutcome::PushFailed(verified, e) => {
                tracing::warn!("Task {} stays verified, push failed: {}", verified.id, e);
                self.task = verified;
                Ok(self.finish(false, Some(e.to_string())))
            }
        }
    }

    /// Best-effort label update so humans see the escalation on the tracker.
    async fn mirror_escalation(&self) {
        let Some(gateway) = &self.deps.gateway else {
            return;
        };
        if self.task.external_ref.is_none() {
            return;
        }
        if let Err(e) = gateway.push(&self.task).await {
            tracing::warn!("Failed to mirror escalation of task {}: {}", self.task.id, e);
        }
    }
}
