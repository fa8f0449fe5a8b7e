//! Configuration management for taskloom.
//!
//! Configuration can be set via environment variables:
//! - `TASKLOOM_TRACKER_REPO` - Required. GitHub repository (`owner/name`) holding the issues.
//! - `TASKLOOM_TRACKER_LABEL` - Optional. Label marking managed issues. Defaults to `taskloom`.
//!   Set it empty to manage every issue in the repository.
//! - `TASKLOOM_LEDGER_DIR` - Optional. Ledger directory. Defaults to `.taskloom` in the workspace.
//! - `TASKLOOM_LEDGER_STORE` - Optional. `file` or `memory`. Defaults to `file`.
//! - `TASKLOOM_AGENT_COMMAND` - Optional. Agent CLI to run per phase. Defaults to `claude`.
//! - `TASKLOOM_AGENT_ARGS` - Optional. Whitespace-separated arguments for the agent CLI.
//!   Defaults to `--print --output-format json`.
//! - `TASKLOOM_AGENT_TIMEOUT_SECS` - Optional. Per-invocation limit. Defaults to none.
//! - `MAX_REPAIR_ATTEMPTS` - Optional. Repair cycles per task. Defaults to `3`.
//! - `PARALLELISM_LIMIT` - Optional. Concurrent pipelines. Defaults to unbounded.
//! - `SYNC_RETRIES` - Optional. Tries per tracker call. Defaults to `3`.
//! - `SYNC_BACKOFF_BASE_MS` - Optional. First backoff delay. Defaults to `1000`.
//! - `RUN_TIMEOUT_SECS` - Optional. Cancels the run after this long. Defaults to none.
//! - `WORKSPACE_PATH` - Optional. Working directory for agents. Defaults to current directory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::executor::CommandExecutorConfig;
use crate::ledger::LedgerStoreType;
use crate::retry::DEFAULT_MAX_REPAIR_ATTEMPTS;
use crate::sync::{SyncBackoff, DEFAULT_SYNC_ATTEMPTS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository the tracker reads and writes (`owner/name`)
    pub tracker_repo: String,

    /// Label filter for pulled issues, also added to created issues
    pub tracker_label: String,

    /// Directory holding `tasks.json` and `tasks_index.json`
    pub ledger_dir: PathBuf,

    pub ledger_store: LedgerStoreType,

    /// Agent CLI invocation
    pub agent: CommandExecutorConfig,

    pub max_repair_attempts: u32,

    /// `None` means unbounded
    pub parallelism_limit: Option<usize>,

    pub sync_backoff: SyncBackoff,

    /// Whole-run deadline
    pub run_timeout: Option<Duration>,

    /// Working directory handed to agents
    pub workspace_path: PathBuf,
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `TASKLOOM_TRACKER_REPO` is not set,
    /// and `ConfigError::InvalidValue` for unparsable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tracker_repo = std::env::var("TASKLOOM_TRACKER_REPO")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TASKLOOM_TRACKER_REPO".to_string()))?;
        if !tracker_repo.contains('/') {
            return Err(ConfigError::InvalidValue(
                "TASKLOOM_TRACKER_REPO".to_string(),
                format!("expected owner/name, got '{}'", tracker_repo),
            ));
        }

        let tracker_label =
            std::env::var("TASKLOOM_TRACKER_LABEL").unwrap_or_else(|_| "taskloom".to_string());

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let ledger_dir = std::env::var("TASKLOOM_LEDGER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_path.join(".taskloom"));

        let ledger_store = std::env::var("TASKLOOM_LEDGER_STORE")
            .map(|v| LedgerStoreType::parse(&v))
            .unwrap_or_default();

        let mut agent = CommandExecutorConfig::default();
        if let Ok(program) = std::env::var("TASKLOOM_AGENT_COMMAND") {
            if !program.trim().is_empty() {
                agent.program = program.trim().to_string();
            }
        }
        if let Ok(args) = std::env::var("TASKLOOM_AGENT_ARGS") {
            agent.args = args.split_whitespace().map(str::to_string).collect();
        }
        agent.timeout = parse_var::<u64>("TASKLOOM_AGENT_TIMEOUT_SECS")?.map(Duration::from_secs);

        let max_repair_attempts =
            parse_var("MAX_REPAIR_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_REPAIR_ATTEMPTS);

        let parallelism_limit = parse_var::<usize>("PARALLELISM_LIMIT")?.filter(|n| *n > 0);

        let sync_backoff = SyncBackoff {
            max_attempts: parse_var("SYNC_RETRIES")?.unwrap_or(DEFAULT_SYNC_ATTEMPTS),
            base_delay: parse_var::<u64>("SYNC_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(SyncBackoff::default().base_delay),
        };

        let run_timeout = parse_var::<u64>("RUN_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            tracker_repo,
            tracker_label,
            ledger_dir,
            ledger_store,
            agent,
            max_repair_attempts,
            parallelism_limit,
            sync_backoff,
            run_timeout,
            workspace_path,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(tracker_repo: impl Into<String>, workspace_path: PathBuf) -> Self {
        Self {
            tracker_repo: tracker_repo.into(),
            tracker_label: "taskloom".to_string(),
            ledger_dir: workspace_path.join(".taskloom"),
            ledger_store: LedgerStoreType::default(),
            agent: CommandExecutorConfig::default(),
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            parallelism_limit: None,
            sync_backoff: SyncBackoff::default(),
            run_timeout: None,
            workspace_path,
        }
    }
}
