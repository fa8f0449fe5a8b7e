use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{AgentExecutor, ExecutionContext, ExecutionResult, Phase};
use crate::task::Task;

/// Routes each phase to the executor registered for it.
///
/// Phases without a dedicated executor go to the fallback. With neither,
/// the call fails with a descriptive `Failure` result.
#[derive(Default)]
pub struct PhaseRouter {
    routes: HashMap<Phase, Arc<dyn AgentExecutor>>,
    fallback: Option<Arc<dyn AgentExecutor>>,
}

impl PhaseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<dyn AgentExecutor>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Some(fallback),
        }
    }

    pub fn register(&mut self, phase: Phase, executor: Arc<dyn AgentExecutor>) {
        self.routes.insert(phase, executor);
    }

    pub fn route(mut self, phase: Phase, executor: Arc<dyn AgentExecutor>) -> Self {
        self.register(phase, executor);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn AgentExecutor>> {
        self.routes
            .get(&phase)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl AgentExecutor for PhaseRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn execute(&self, task: &Task, phase: Phase, ctx: &ExecutionContext) -> ExecutionResult {
        match self.get(phase) {
            Some(executor) => {
                tracing::debug!(
                    "Routing task {} phase {} to {}",
                    task.id,
                    phase,
                    executor.name()
                );
                executor.execute(task, phase, ctx).await
            }
            None => ExecutionResult::failure(format!("No executor registered for phase {}", phase)),
        }
    }
}
