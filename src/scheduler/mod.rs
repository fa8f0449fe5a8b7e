//! Round-based scheduler.
//!
//! Each round snapshots the ledger, rebuilds the [`TaskGraph`], and
//! dispatches the ready set:
//! - Parallel rounds fan out on a `JoinSet`, bounded by a semaphore
//! - Sequential rounds run one task to completion at a time
//!
//! The loop ends when nothing is ready and nothing is in flight.
//!
//! ```text
//!   ledger --snapshot--> TaskGraph --ready_set--> DispatchRound*
//!     ^                                               |
//!     |                                               v
//!     +--------write-through---------- pipeline (Testing -> Implementing -> Verifying)
//! ```

mod pipeline;
mod report;

pub use report::{RunCounts, RunReport, TaskReport};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{AgentExecutor, ExecutionContext};
use crate::graph::{DispatchRound, GraphError, TaskGraph};
use crate::ledger::{LedgerError, TaskLedger};
use crate::retry::RetryPolicy;
use crate::sync::SyncGateway;
use crate::task::{ExecutionMode, Subtask, Task, TaskError, TaskId, TaskStatus};

pub(crate) use pipeline::{close_upstream, CloseOutcome};
use pipeline::{PipelineDeps, PipelineOutcome};
use report::ReportBuilder;

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task graph is invalid: {0}")]
    Structural(#[from] GraphError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Task state error: {0}")]
    Task(#[from] TaskError),

    #[error("Task pipeline panicked: {0}")]
    Panicked(String),
}

pub struct Scheduler {
    ledger: Arc<dyn TaskLedger>,
    executor: Arc<dyn AgentExecutor>,
    policy: RetryPolicy,
    gateway: Option<Arc<SyncGateway>>,
    parallelism_limit: Option<usize>,
    working_dir: PathBuf,
    run_id: Uuid,
}

impl Scheduler {
    pub fn new(ledger: Arc<dyn TaskLedger>, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            ledger,
            executor,
            policy: RetryPolicy::default(),
            gateway: None,
            parallelism_limit: None,
            working_dir: PathBuf::from("."),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<SyncGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_parallelism_limit(mut self, limit: Option<usize>) -> Self {
        self.parallelism_limit = limit.filter(|n| *n > 0);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run until no task can make progress or `cancel` fires.
    ///
    /// # Errors
    /// Structural graph errors, ledger write failures and invalid
    /// transitions abort the run. Task failures never do: they end in
    /// `Escalated` and the run continues with independent branches.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, SchedulerError> {
        let started_at = Utc::now();
        let deps = Arc::new(PipelineDeps {
            ledger: Arc::clone(&self.ledger),
            executor: Arc::clone(&self.executor),
            policy: self.policy,
            gateway: self.gateway.clone(),
        });
        let mut builder = ReportBuilder::default();
        let mut dispatched: HashSet<TaskId> = HashSet::new();
        let mut first_round = true;

        tracing::info!("Scheduler run {} starting", self.run_id);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let graph = TaskGraph::build(self.ledger.tasks().await?)?;
            self.mark_waiting(&graph).await?;

            let mut rounds = Vec::new();
            if first_round {
                let interrupted = graph.interrupted();
                if !interrupted.is_empty() {
                    tracing::info!("Resuming {} interrupted tasks", interrupted.len());
                }
                rounds.extend(graph.dispatch_rounds(&interrupted));
                first_round = false;
            }

            let ready: Vec<TaskId> = graph
                .ready_set()
                .into_iter()
                .filter(|id| !dispatched.contains(id))
                .collect();
            rounds.extend(graph.dispatch_rounds(&ready));

            if rounds.is_empty() {
                break;
            }

            for round in rounds {
                if cancel.is_cancelled() {
                    break;
                }
                dispatched.extend(round.tasks.iter().cloned());
                let outcomes = self.dispatch(&deps, &graph, round, &cancel).await?;
                for outcome in outcomes {
                    self.absorb(outcome, &mut builder).await?;
                }
            }
        }

        builder.cancelled = cancel.is_cancelled();
        let tasks = self.ledger.tasks().await?;
        let graph = TaskGraph::build(tasks.clone()).ok();
        if let Some(graph) = &graph {
            self.mark_waiting(graph).await?;
        }
        let tasks = self.ledger.tasks().await?;
        let report = builder.finish(self.run_id, started_at, tasks, graph.as_ref());

        tracing::info!(
            "Scheduler run {} finished: {} closed, {} verified, {} escalated, {} blocked, {} interrupted",
            self.run_id,
            report.counts.closed,
            report.counts.verified,
            report.counts.escalated,
            report.counts.blocked,
            report.counts.interrupted
        );
        Ok(report)
    }

    /// Ready tasks become `Ready`; `Pending` tasks with an unverified
    /// dependency become `Blocked`.
    async fn mark_waiting(&self, graph: &TaskGraph) -> Result<(), SchedulerError> {
        let mut changed = Vec::new();
        for id in graph.ready_set() {
            if let Some(task) = graph.get(&id) {
                if matches!(task.status(), TaskStatus::Pending | TaskStatus::Blocked) {
                    let mut task = task.clone();
                    task.transition(TaskStatus::Ready)?;
                    changed.push(task);
                }
            }
        }
        for id in graph.waiting_on_dependencies() {
            if let Some(task) = graph.get(&id) {
                if task.status() == TaskStatus::Pending {
                    let mut task = task.clone();
                    task.transition(TaskStatus::Blocked)?;
                    tracing::debug!(
                        "Task {} blocked on {:?}",
                        task.id,
                        graph.unsatisfied_dependencies(&id)
                    );
                    changed.push(task);
                }
            }
        }
        if !changed.is_empty() {
            self.ledger.put_many(&changed).await?;
        }
        Ok(())
    }

    fn context(&self, cancel: &CancellationToken) -> ExecutionContext {
        ExecutionContext::new(self.run_id, self.working_dir.clone(), cancel.child_token())
    }

    /// Run one round. Parallel rounds fan out; sequential rounds hold a
    /// single task.
    async fn dispatch(
        &self,
        deps: &Arc<PipelineDeps>,
        graph: &TaskGraph,
        round: DispatchRound,
        cancel: &CancellationToken,
    ) -> Result<Vec<PipelineOutcome>, SchedulerError> {
        // Status may have moved since the snapshot (e.g. marked Ready).
        let mut tasks = Vec::with_capacity(round.tasks.len());
        for id in &round.tasks {
            match self.ledger.get(id).await? {
                Some(task) => tasks.push(task),
                None => return Err(LedgerError::NotFound(id.clone()).into()),
            }
        }

        if round.mode == ExecutionMode::Sequential || tasks.len() == 1 {
            let mut outcomes = Vec::with_capacity(tasks.len());
            for task in tasks {
                if cancel.is_cancelled() {
                    break;
                }
                outcomes.push(deps.run(task, self.context(cancel)).await?);
            }
            return Ok(outcomes);
        }

        for conflict in graph.file_conflicts(&round) {
            tracing::warn!(
                "Tasks {} and {} run concurrently and both touch {}",
                conflict.first,
                conflict.second,
                conflict.path
            );
        }

        let limit = self
            .parallelism_limit
            .unwrap_or(tasks.len())
            .min(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set: JoinSet<(TaskId, Result<PipelineOutcome, SchedulerError>)> =
            JoinSet::new();

        tracing::info!(
            "Dispatching {} tasks concurrently (limit {})",
            tasks.len(),
            limit
        );

        for task in tasks {
            let deps = Arc::clone(deps);
            let semaphore = Arc::clone(&semaphore);
            let ctx = self.context(cancel);
            join_set.spawn(async move {
                let id = task.id.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (id, Ok(unstarted(task))),
                };
                if ctx.cancel.is_cancelled() {
                    return (id, Ok(unstarted(task)));
                }
                let result = deps.run(task, ctx).await;
                (id, result)
            });
        }

        let mut outcomes = Vec::new();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => outcomes.push(outcome),
                Ok((id, Err(e))) => {
                    tracing::error!("Task {} pipeline failed: {}", id, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("Pipeline task panicked: {}", e);
                    first_error.get_or_insert(SchedulerError::Panicked(e.to_string()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Fold a pipeline outcome into the run: report facts and subtasks.
    async fn absorb(
        &self,
        outcome: PipelineOutcome,
        builder: &mut ReportBuilder,
    ) -> Result<(), SchedulerError> {
        if outcome.interrupted {
            builder.interrupted.insert(outcome.task.id.clone());
        }
        if let Some(error) = outcome.push_error {
            builder.push_errors.insert(outcome.task.id.clone(), error);
        }
        if !outcome.discovered.is_empty() {
            builder.discovered += self.insert_subtasks(&outcome.task, outcome.discovered).await?;
        }
        Ok(())
    }

    /// Validate emitted subtasks against the current ledger and insert them
    /// as `Pending`. A batch that would break the graph is rejected whole.
    async fn insert_subtasks(
        &self,
        parent: &Task,
        subtasks: Vec<Subtask>,
    ) -> Result<usize, SchedulerError> {
        let existing = self.ledger.tasks().await?;
        let known: HashSet<TaskId> = existing.iter().map(|t| t.id.clone()).collect();

        let mut children = Vec::with_capacity(subtasks.len());
        for (index, subtask) in subtasks.into_iter().enumerate() {
            match subtask.into_task(parent, index) {
                Ok(child) if known.contains(&child.id) => {
                    tracing::warn!(
                        "Ignoring subtask {} of {}: id already exists",
                        child.id,
                        parent.id
                    );
                }
                Ok(child) => children.push(child),
                Err(e) => tracing::warn!("Ignoring invalid subtask of {}: {}", parent.id, e),
            }
        }
        if children.is_empty() {
            return Ok(0);
        }

        let mut trial = existing;
        trial.extend(children.iter().cloned());
        if let Err(e) = TaskGraph::build(trial) {
            tracing::warn!(
                "Rejected {} subtasks of task {}: {}",
                children.len(),
                parent.id,
                e
            );
            return Ok(0);
        }

        self.ledger.put_many(&children).await?;
        tracing::info!(
            "Added {} subtasks of task {} to the ledger",
            children.len(),
            parent.id
        );
        Ok(children.len())
    }
}

fn unstarted(task: Task) -> PipelineOutcome {
    PipelineOutcome {
        task,
        interrupted: false,
        push_error: None,
        discovered: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::executor::{ExecutionResult, Phase, FAILING_TEST_COUNT};
    use crate::ledger::{FileLedger, InMemoryLedger};
    use crate::sync::{InMemoryTracker, IssueState, SyncBackoff, TrackerError, TrackerErrorKind};

    #[derive(Debug, Clone)]
    struct Call {
        task: String,
        phase: Phase,
        attempt: u32,
        failure_detail: Option<String>,
    }

    #[derive(Default)]
    struct Script {
        results: HashMap<(String, Phase), VecDeque<ExecutionResult>>,
        calls: Vec<Call>,
        running: usize,
        max_running: usize,
    }

    /// Executor that replays queued results and records every call.
    #[derive(Clone, Default)]
    struct ScriptedExecutor {
        script: Arc<Mutex<Script>>,
        delay: Duration,
        cancel_on: Option<(String, Phase, CancellationToken)>,
    }

    impl ScriptedExecutor {
        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn cancel_on(mut self, task: &str, phase: Phase, token: CancellationToken) -> Self {
            self.cancel_on = Some((task.to_string(), phase, token));
            self
        }

        fn queue(&self, task: &str, phase: Phase, result: ExecutionResult) {
            self.script
                .lock()
                .unwrap()
                .results
                .entry((task.to_string(), phase))
                .or_default()
                .push_back(result);
        }

        fn calls(&self) -> Vec<Call> {
            self.script.lock().unwrap().calls.clone()
        }

        fn phases_of(&self, task: &str) -> Vec<Phase> {
            self.calls()
                .into_iter()
                .filter(|c| c.task == task)
                .map(|c| c.phase)
                .collect()
        }

        fn max_running(&self) -> usize {
            self.script.lock().unwrap().max_running
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, task: &Task, phase: Phase, ctx: &ExecutionContext) -> ExecutionResult {
            let result = {
                let mut script = self.script.lock().unwrap();
                script.calls.push(Call {
                    task: task.id.to_string(),
                    phase,
                    attempt: ctx.attempt,
                    failure_detail: ctx.failure_detail.clone(),
                });
                script.running += 1;
                script.max_running = script.max_running.max(script.running);
                script
                    .results
                    .get_mut(&(task.id.to_string(), phase))
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| match phase {
                        Phase::Testing => {
                            ExecutionResult::success().with_artifact(FAILING_TEST_COUNT, "2")
                        }
                        _ => ExecutionResult::success(),
                    })
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some((id, on_phase, token)) = &self.cancel_on {
                if id == task.id.as_str() && *on_phase == phase {
                    token.cancel();
                }
            }

            self.script.lock().unwrap().running -= 1;
            result
        }
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("Feature {}", id))
            .unwrap()
            .with_dependencies(deps.iter().copied())
    }

    fn scheduler(ledger: &Arc<InMemoryLedger>, executor: &ScriptedExecutor) -> Scheduler {
        Scheduler::new(ledger.clone(), Arc::new(executor.clone()))
    }

    async fn status(ledger: &dyn TaskLedger, id: &str) -> TaskStatus {
        ledger.get(&TaskId::new(id)).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_dependency_order() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[]), task("2", &["1"])]));
        let executor = ScriptedExecutor::default();

        let report = assert_ok!(scheduler(&ledger, &executor).run(CancellationToken::new()).await);

        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
        assert_eq!(report.status_of("2"), Some(TaskStatus::Verified));
        assert_eq!(report.counts.verified, 2);
        assert!(report.is_success());

        let order: Vec<(String, Phase)> = executor
            .calls()
            .into_iter()
            .map(|c| (c.task, c.phase))
            .collect();
        assert_eq!(
            order,
            vec![
                ("1".to_string(), Phase::Testing),
                ("1".to_string(), Phase::Implementing),
                ("1".to_string(), Phase::Verifying),
                ("2".to_string(), Phase::Testing),
                ("2".to_string(), Phase::Implementing),
                ("2".to_string(), Phase::Verifying),
            ]
        );
        assert_eq!(report.task(&TaskId::new("2")).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_verification_failure_is_repaired() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue("1", Phase::Verifying, ExecutionResult::failure("submit button missing"));

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
        assert_eq!(report.task(&TaskId::new("1")).unwrap().attempts, 1);
        assert_eq!(
            executor.phases_of("1"),
            vec![
                Phase::Testing,
                Phase::Implementing,
                Phase::Verifying,
                Phase::Repairing,
                Phase::Verifying
            ]
        );

        let repair = executor
            .calls()
            .into_iter()
            .find(|c| c.phase == Phase::Repairing)
            .unwrap();
        assert_eq!(repair.attempt, 1);
        assert!(repair
            .failure_detail
            .unwrap()
            .contains("submit button missing"));
    }

    #[tokio::test]
    async fn test_exhaustion_escalates_and_blocks_dependents_only() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([
            task("1", &[]),
            task("2", &["1"]),
            task("3", &[]),
        ]));
        let executor = ScriptedExecutor::default();
        for _ in 0..3 {
            executor.queue("1", Phase::Verifying, ExecutionResult::failure("still broken"));
        }

        let report = scheduler(&ledger, &executor)
            .with_policy(RetryPolicy::new(2))
            .run(CancellationToken::new())
            .await
            .unwrap();

        let escalated = report.task(&TaskId::new("1")).unwrap();
        assert_eq!(escalated.status, TaskStatus::Escalated);
        assert_eq!(escalated.attempts, 2);
        assert!(escalated.last_failure.as_deref().unwrap().contains("still broken"));

        let blocked = report.task(&TaskId::new("2")).unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.blocked_by, vec![TaskId::new("1")]);
        assert!(executor.phases_of("2").is_empty());

        assert_eq!(report.status_of("3"), Some(TaskStatus::Verified));
        assert_eq!(report.counts.escalated, 1);
        assert_eq!(report.counts.blocked, 1);
        assert_eq!(status(ledger.as_ref(), "2").await, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_no_failing_tests_escalates_without_implementation() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue(
            "1",
            Phase::Testing,
            ExecutionResult::success().with_artifact(FAILING_TEST_COUNT, "0"),
        );

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let task = report.task(&TaskId::new("1")).unwrap();
        assert_eq!(task.status, TaskStatus::Escalated);
        assert_eq!(task.attempts, 0);
        assert!(task.last_failure.as_deref().unwrap().contains("no failing tests"));
        assert_eq!(executor.phases_of("1"), vec![Phase::Testing]);
    }

    #[tokio::test]
    async fn test_test_authoring_failure_escalates() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue("1", Phase::Testing, ExecutionResult::failure("requirements are ambiguous"));

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status_of("1"), Some(TaskStatus::Escalated));
    }

    #[tokio::test]
    async fn test_sequential_tasks_never_overlap() {
        let ledger = Arc::new(InMemoryLedger::with_tasks(
            ["1", "2", "3"]
                .into_iter()
                .map(|id| task(id, &[]).with_mode(ExecutionMode::Sequential)),
        ));
        let executor = ScriptedExecutor::default().with_delay(Duration::from_millis(5));

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.counts.verified, 3);
        assert_eq!(executor.max_running(), 1);
        let firsts: Vec<String> = executor
            .calls()
            .into_iter()
            .filter(|c| c.phase == Phase::Testing)
            .map(|c| c.task)
            .collect();
        assert_eq!(firsts, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_parallel_round_respects_limit() {
        let ledger = Arc::new(InMemoryLedger::with_tasks(
            ["1", "2", "3", "4"].into_iter().map(|id| task(id, &[])),
        ));
        let executor = ScriptedExecutor::default().with_delay(Duration::from_millis(20));

        let report = scheduler(&ledger, &executor)
            .with_parallelism_limit(Some(2))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.counts.verified, 4);
        assert!(executor.max_running() <= 2);
        assert!(executor.max_running() >= 1);
    }

    #[tokio::test]
    async fn test_parallel_round_runs_concurrently() {
        let ledger = Arc::new(InMemoryLedger::with_tasks(
            ["1", "2", "3"].into_iter().map(|id| task(id, &[])),
        ));
        let executor = ScriptedExecutor::default().with_delay(Duration::from_millis(50));

        scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert!(executor.max_running() > 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_and_next_run_resumes() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[]), task("2", &["1"])]));
        let cancel = CancellationToken::new();
        let executor = ScriptedExecutor::default().cancel_on("1", Phase::Implementing, cancel.clone());

        let report = scheduler(&ledger, &executor).run(cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.counts.interrupted, 1);
        assert_eq!(status(ledger.as_ref(), "1").await, TaskStatus::Dispatched);
        assert!(executor.phases_of("2").is_empty());

        let resumed = ScriptedExecutor::default();
        let report = scheduler(&ledger, &resumed)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
        assert_eq!(report.status_of("2"), Some(TaskStatus::Verified));
        assert_eq!(resumed.phases_of("1")[0], Phase::Testing);
    }

    #[tokio::test]
    async fn test_discovered_subtasks_run_next_round() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue(
            "1",
            Phase::Implementing,
            ExecutionResult::success()
                .with_subtask(Subtask::new("Extract validation"))
                .with_subtask(Subtask::new("Wire validation").with_dependency("1.1")),
        );

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.counts.discovered, 2);
        assert_eq!(report.status_of("1.1"), Some(TaskStatus::Verified));
        assert_eq!(report.status_of("1.2"), Some(TaskStatus::Verified));
        let child = ledger.get(&TaskId::new("1.2")).await.unwrap().unwrap();
        assert_eq!(child.parent, Some(TaskId::new("1")));

        let calls = executor.calls();
        let first_child = calls.iter().position(|c| c.task == "1.1").unwrap();
        let second_child = calls.iter().position(|c| c.task == "1.2").unwrap();
        assert!(first_child < second_child);
    }

    #[tokio::test]
    async fn test_invalid_subtask_batch_is_rejected() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue(
            "1",
            Phase::Testing,
            ExecutionResult::success()
                .with_artifact(FAILING_TEST_COUNT, "1")
                .with_subtask(Subtask::new("Orphan").with_dependency("404")),
        );

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.counts.discovered, 0);
        assert_eq!(ledger.tasks().await.unwrap().len(), 1);
        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
    }

    #[tokio::test]
    async fn test_cycle_aborts_run() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &["2"]), task("2", &["1"])]));
        let executor = ScriptedExecutor::default();
        let result = scheduler(&ledger, &executor).run(CancellationToken::new()).await;
        let err = assert_err!(result);
        assert!(matches!(err, SchedulerError::Structural(GraphError::Cycle { .. })));
        assert!(executor.calls().is_empty());
    }

    fn gateway(tracker: &InMemoryTracker) -> Arc<SyncGateway> {
        Arc::new(
            SyncGateway::new(Arc::new(tracker.clone())).with_backoff(SyncBackoff {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            }),
        )
    }

    #[tokio::test]
    async fn test_verified_tasks_close_upstream_and_persist() {
        let tracker = InMemoryTracker::new();
        let first = tracker.add_issue("Setup", "", &[], IssueState::Open);
        let second = tracker.add_issue(
            "Login",
            &format!("Depends on: #{}\n\n## Verification\n- [ ] Can log in", first),
            &[],
            IssueState::Open,
        );
        let gateway = gateway(&tracker);

        let temp = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FileLedger::open(temp.path().to_path_buf()).await.unwrap());
        let pulled = gateway.pull(&[]).await.unwrap();
        ledger.put_many(&pulled.tasks).await.unwrap();

        let executor = ScriptedExecutor::default();
        let report = Scheduler::new(ledger.clone(), Arc::new(executor.clone()))
            .with_gateway(gateway)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.counts.closed, 2);
        assert!(!tracker.issue(&first).unwrap().is_open());
        assert!(!tracker.issue(&second).unwrap().is_open());
        assert!(tracker.comments(&second)[0].contains("- [x] Can log in"));

        let reopened = FileLedger::open(temp.path().to_path_buf()).await.unwrap();
        let closed = reopened.get(&TaskId::new(second)).await.unwrap().unwrap();
        assert_eq!(closed.status(), TaskStatus::Closed);
        assert!(closed.is_archived());
    }

    #[tokio::test]
    async fn test_failed_push_leaves_task_verified() {
        let tracker = InMemoryTracker::new();
        tracker.add_issue("Setup", "", &[], IssueState::Open);
        let gateway = gateway(&tracker);
        let ledger = Arc::new(InMemoryLedger::with_tasks(gateway.pull(&[]).await.unwrap().tasks));
        tracker.fail_next(TrackerError::new(TrackerErrorKind::Auth, "token expired"));

        let executor = ScriptedExecutor::default();
        let report = scheduler(&ledger, &executor)
            .with_gateway(gateway)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let task = report.task(&TaskId::new("1")).unwrap();
        assert_eq!(task.status, TaskStatus::Verified);
        assert!(task.push_error.as_deref().unwrap().contains("token expired"));
        assert!(tracker.issue("1").unwrap().is_open());
    }

    #[tokio::test]
    async fn test_close_refused_keeps_verified_label_upstream() {
        let tracker = InMemoryTracker::new();
        let n = tracker.add_issue("Setup", "", &["priority:0"], IssueState::Open);
        let gateway = gateway(&tracker);
        let ledger = Arc::new(InMemoryLedger::with_tasks(gateway.pull(&[]).await.unwrap().tasks));
        tracker.fail_next_close(TrackerError::new(TrackerErrorKind::Auth, "not allowed to close"));

        let executor = ScriptedExecutor::default();
        let report = scheduler(&ledger, &executor)
            .with_gateway(gateway)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
        assert_eq!(status(ledger.as_ref(), "1").await, TaskStatus::Verified);
        let issue = tracker.issue(&n).unwrap();
        assert!(issue.is_open());
        assert!(issue.labels.contains("status:verified"));
        assert!(!issue.labels.contains("status:closed"));
    }

    #[tokio::test]
    async fn test_unreported_failing_test_count_escalates() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([task("1", &[])]));
        let executor = ScriptedExecutor::default();
        executor.queue("1", Phase::Testing, ExecutionResult::success());

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let task = report.task(&TaskId::new("1")).unwrap();
        assert_eq!(task.status, TaskStatus::Escalated);
        assert!(task.last_failure.as_deref().unwrap().contains(FAILING_TEST_COUNT));
        assert_eq!(executor.phases_of("1"), vec![Phase::Testing]);
    }

    fn failed_after_verification(id: &str, detail: &str) -> Task {
        let mut task = task(id, &[]);
        for next in [
            TaskStatus::Ready,
            TaskStatus::Dispatched,
            TaskStatus::Testing,
            TaskStatus::Implementing,
            TaskStatus::Verifying,
        ] {
            task.transition(next).unwrap();
        }
        task.fail(detail).unwrap();
        task
    }

    #[tokio::test]
    async fn test_resumed_failure_keeps_recorded_detail() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([failed_after_verification(
            "1",
            "verification failed: step 2",
        )]));
        let executor = ScriptedExecutor::default();

        let report = scheduler(&ledger, &executor)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status_of("1"), Some(TaskStatus::Verified));
        let repair = executor.calls().remove(0);
        assert_eq!(repair.phase, Phase::Repairing);
        assert_eq!(repair.failure_detail.as_deref(), Some("verification failed: step 2"));
    }

    #[tokio::test]
    async fn test_resumed_failure_escalates_without_double_prefix() {
        let ledger = Arc::new(InMemoryLedger::with_tasks([failed_after_verification(
            "1",
            "verification failed: step 2",
        )]));
        let executor = ScriptedExecutor::default();

        let report = scheduler(&ledger, &executor)
            .with_policy(RetryPolicy::new(0))
            .run(CancellationToken::new())
            .await
            .unwrap();

        let task = report.task(&TaskId::new("1")).unwrap();
        assert_eq!(task.status, TaskStatus::Escalated);
        assert_eq!(
            task.last_failure.as_deref(),
            Some("verification failed: step 2 (after 0 repair attempts)")
        );
        assert!(executor.calls().is_empty());
    }
}
