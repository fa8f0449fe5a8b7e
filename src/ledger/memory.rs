//! In-memory ledger (non-persistent).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{LedgerError, TaskLedger};
use crate::task::{Task, TaskId};

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    tasks: Arc<RwLock<BTreeMap<TaskId, Task>>>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a ledger with tasks (useful for tests and dry runs).
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks: Arc::new(RwLock::new(map)),
            last_sync: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl TaskLedger for InMemoryLedger {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn tasks(&self) -> Result<Vec<Task>, LedgerError> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, LedgerError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn put(&self, task: &Task) -> Result<(), LedgerError> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn put_many(&self, tasks: &[Task]) -> Result<(), LedgerError> {
        let mut map = self.tasks.write().await;
        for task in tasks {
            map.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        Ok(*self.last_sync.read().await)
    }

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        *self.last_sync.write().await = Some(at);
        Ok(())
    }
}
