//! Issue tracker abstraction and its error classification.
//!
//! Distinguishes between transient errors (retried with backoff by the
//! gateway) and permanent errors (surfaced at once).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

/// One tracker issue as the gateway sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Tracker-assigned number, stored on the task as `external_ref`
    pub number: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub state: IssueState,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.state == IssueState::Open
    }
}

/// Which issues a pull lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    /// Only issues carrying this label
    pub label: Option<String>,
}

/// A new issue to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSpec {
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
}

/// Error from tracker calls.
#[derive(Debug, Clone)]
pub struct TrackerError {
    pub kind: TrackerErrorKind,
    pub message: String,
    /// Suggested retry delay, when the tracker told us
    pub retry_after: Option<Duration>,
}

impl TrackerError {
    pub fn new(kind: TrackerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(TrackerErrorKind::RateLimited, message)
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TrackerErrorKind::Network, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TrackerErrorKind::NotFound, message)
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TrackerError {}

/// Classification of tracker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerErrorKind {
    /// Rate limited - transient, retry with backoff
    RateLimited,
    /// Connection reset, DNS, timeout - transient
    Network,
    /// 5xx from the tracker - transient
    Server,
    /// Issue or repository does not exist - permanent
    NotFound,
    /// Missing or rejected credentials - permanent
    Auth,
    /// Malformed request or response - permanent
    Invalid,
    /// The tracker client itself could not run - permanent
    Unavailable,
}

impl TrackerErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerErrorKind::RateLimited | TrackerErrorKind::Network | TrackerErrorKind::Server
        )
    }
}

impl std::fmt::Display for TrackerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerErrorKind::RateLimited => write!(f, "Rate limited"),
            TrackerErrorKind::Network => write!(f, "Network error"),
            TrackerErrorKind::Server => write!(f, "Tracker server error"),
            TrackerErrorKind::NotFound => write!(f, "Not found"),
            TrackerErrorKind::Auth => write!(f, "Authentication failed"),
            TrackerErrorKind::Invalid => write!(f, "Invalid request"),
            TrackerErrorKind::Unavailable => write!(f, "Tracker unavailable"),
        }
    }
}

/// The external issue tracker.
///
/// Implementations perform one remote call per method and never retry;
/// retries and backoff belong to the gateway.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// List open and closed issues matching the filter.
    async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>, TrackerError>;

    async fn create_issue(&self, spec: &IssueSpec) -> Result<Issue, TrackerError>;

    /// Replace the issue's label set.
    async fn update_labels(&self, number: &str, labels: &BTreeSet<String>) -> Result<(), TrackerError>;

    /// Close the issue, posting `comment` first.
    async fn close_issue(&self, number: &str, comment: &str) -> Result<(), TrackerError>;
}
