//! JSON file-based ledger.
//!
//! Layout under the ledger directory:
//! - `tasks.json`: the full versioned [`LedgerSnapshot`]
//! - `tasks_index.json`: version, last sync and summary counts only
//!
//! Both files are replaced atomically (write to `*.tmp`, then rename). The
//! index is written after the snapshot, so it never describes data that is
//! not on disk yet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{LedgerError, LedgerIndex, LedgerSnapshot, TaskLedger, LEDGER_VERSION};
use crate::task::{Task, TaskId};

pub const SNAPSHOT_FILE: &str = "tasks.json";
pub const INDEX_FILE: &str = "tasks_index.json";

#[derive(Clone)]
pub struct FileLedger {
    dir: PathBuf,
    tasks: Arc<RwLock<BTreeMap<TaskId, Task>>>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    persist_lock: Arc<Mutex<()>>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileLedger {
    /// Open (or create) the ledger in `dir`.
    ///
    /// # Errors
    /// A missing snapshot yields an empty ledger. An unreadable, corrupt or
    /// newer-versioned snapshot is an error: the ledger is the source of
    /// truth and must not be silently reset.
    pub async fn open(dir: PathBuf) -> Result<Self, LedgerError> {
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        let path = dir.join(SNAPSHOT_FILE);

        let snapshot = match fs::read(&path).await {
            Ok(bytes) => Some(
                serde_json::from_slice::<LedgerSnapshot>(&bytes).map_err(|e| {
                    LedgerError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                })?,
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(io_err(&path)(err)),
        };

        let (tasks, last_sync) = match snapshot {
            Some(snapshot) => {
                if snapshot.version > LEDGER_VERSION {
                    return Err(LedgerError::UnsupportedVersion {
                        found: snapshot.version,
                        supported: LEDGER_VERSION,
                    });
                }
                tracing::info!(
                    "Loaded ledger {} ({} tasks)",
                    path.display(),
                    snapshot.tasks.len()
                );
                let tasks = snapshot
                    .tasks
                    .into_iter()
                    .map(|t| (t.id.clone(), t))
                    .collect();
                (tasks, snapshot.last_sync_timestamp)
            }
            None => {
                tracing::info!("No ledger at {}, starting empty", path.display());
                (BTreeMap::new(), None)
            }
        };

        Ok(Self {
            dir,
            tasks: Arc::new(RwLock::new(tasks)),
            last_sync: Arc::new(RwLock::new(last_sync)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Read the summary index without loading the full ledger.
    pub async fn read_index(dir: &Path) -> Result<Option<LedgerIndex>, LedgerError> {
        let path = dir.join(INDEX_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LedgerError::Corrupt {
                    path,
                    reason: e.to_string(),
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path)(err)),
        }
    }

    async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<(), LedgerError> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await.map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, path).await.map_err(io_err(path))?;
        Ok(())
    }

    async fn persist(&self) -> Result<(), LedgerError> {
        let _guard = self.persist_lock.lock().await;
        let tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        let last_sync = *self.last_sync.read().await;
        let snapshot = LedgerSnapshot::new(tasks, last_sync);

        let index = LedgerIndex {
            version: snapshot.version,
            last_sync_timestamp: snapshot.last_sync_timestamp,
            summary_counts: snapshot.summary_counts.clone(),
            updated_at: Utc::now(),
        };

        Self::write_atomic(&self.snapshot_path(), serde_json::to_vec_pretty(&snapshot)?).await?;
        Self::write_atomic(&self.index_path(), serde_json::to_vec_pretty(&index)?).await?;
        tracing::debug!("Persisted ledger ({} tasks)", snapshot.tasks.len());
        Ok(())
    }
}

#[async_trait]
impl TaskLedger for FileLedger {
    fn is_persistent(&self) -> bool {
        true
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
        self.persist().await
    }

    async fn put_many(&self, tasks: &[Task]) -> Result<(), LedgerError> {
        let mut map = self.tasks.write().await;
        for task in tasks {
            map.insert(task.id.clone(), task.clone());
        }
        drop(map);
        self.persist().await
    }

    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        Ok(*self.last_sync.read().await)
    }

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        *self.last_sync.write().await = Some(at);
        self.persist().await
    }
}
