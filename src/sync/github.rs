//! GitHub issues via the `gh` CLI.
//!
//! ## Authentication
//!
//! `gh` uses its own login, or `GH_TOKEN` when set. Nothing is configured
//! here beyond the target repository.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use super::tracker::{
    Issue, IssueFilter, IssueSpec, IssueState, IssueTracker, TrackerError, TrackerErrorKind,
};

const DEFAULT_LIST_LIMIT: usize = 1000;
/// Largest listing attempted before giving up.
const MAX_LIST_LIMIT: usize = 64_000;

static ISSUE_URL_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/issues/(\d+)\s*$").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    state: String,
}

impl From<GhIssue> for Issue {
    fn from(raw: GhIssue) -> Self {
        Issue {
            number: raw.number.to_string(),
            title: raw.title,
            body: raw.body,
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            state: if raw.state.eq_ignore_ascii_case("open") {
                IssueState::Open
            } else {
                IssueState::Closed
            },
        }
    }
}

/// Issue tracker backed by `gh issue ...` commands.
pub struct GhCliTracker {
    repo: String,
    program: String,
    list_limit: usize,
}

impl GhCliTracker {
    /// `repo` is `owner/name`.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            program: "gh".to_string(),
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    /// Use a different `gh` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// First `--limit` used when listing. Full listings are repeated with a
    /// larger limit, so this only tunes the number of `gh` calls.
    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.clamp(1, MAX_LIST_LIMIT);
        self
    }

    async fn gh(&self, args: &[&str]) -> Result<String, TrackerError> {
        tracing::debug!("gh {} --repo {}", args.join(" "), self.repo);
        let output = Command::new(&self.program)
            .args(args)
            .args(["--repo", &self.repo])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                TrackerError::new(
                    TrackerErrorKind::Unavailable,
                    format!("Failed to run {}: {}", self.program, e),
                )
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn current_labels(&self, number: &str) -> Result<BTreeSet<String>, TrackerError> {
        #[derive(Deserialize)]
        struct Labels {
            labels: Vec<GhLabel>,
        }
        let raw = self.gh(&["issue", "view", number, "--json", "labels"]).await?;
        let parsed: Labels = serde_json::from_str(&raw).map_err(|e| {
            TrackerError::new(TrackerErrorKind::Invalid, format!("Unexpected gh output: {}", e))
        })?;
        Ok(parsed.labels.into_iter().map(|l| l.name).collect())
    }
}

/// Limit for another listing when `listed` filled the last one, `None` when
/// the listing was complete.
fn next_list_limit(limit: usize, listed: usize) -> Result<Option<usize>, TrackerError> {
    if listed < limit {
        return Ok(None);
    }
    if limit >= MAX_LIST_LIMIT {
        return Err(TrackerError::new(
            TrackerErrorKind::Invalid,
            format!(
                "Listing stopped at {} issues; narrow the label filter",
                listed
            ),
        ));
    }
    Ok(Some(limit.saturating_mul(4).min(MAX_LIST_LIMIT)))
}

/// Map `gh` stderr to an error kind.
pub fn classify_failure(stderr: &str) -> TrackerError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    let kind = if lower.contains("rate limit") || lower.contains("secondary rate") {
        TrackerErrorKind::RateLimited
    } else if lower.contains("could not resolve to")
        || lower.contains("could not find")
        || lower.contains("not found")
    {
        TrackerErrorKind::NotFound
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("could not resolve")
        || lower.contains("eof")
    {
        TrackerErrorKind::Network
    } else if ["http 500", "http 502", "http 503", "http 504"]
        .iter()
        .any(|code| lower.contains(code))
    {
        TrackerErrorKind::Server
    } else if lower.contains("auth") || lower.contains("http 401") || lower.contains("http 403") {
        TrackerErrorKind::Auth
    } else {
        TrackerErrorKind::Invalid
    };
    TrackerError::new(kind, message)
}

#[async_trait]
impl IssueTracker for GhCliTracker {
    fn name(&self) -> &str {
        "github"
    }

    async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>, TrackerError> {
        let mut limit = self.list_limit;
        loop {
            let limit_arg = limit.to_string();
            let mut args = vec![
                "issue",
                "list",
                "--state",
                "all",
                "--limit",
                limit_arg.as_str(),
                "--json",
                "number,title,body,labels,state",
            ];
            if let Some(label) = &filter.label {
                args.push("--label");
                args.push(label);
            }
            let raw = self.gh(&args).await?;
            let issues: Vec<GhIssue> = serde_json::from_str(&raw).map_err(|e| {
                TrackerError::new(TrackerErrorKind::Invalid, format!("Unexpected gh output: {}", e))
            })?;

            match next_list_limit(limit, issues.len())? {
                None => return Ok(issues.into_iter().map(Issue::from).collect()),
                Some(next) => {
                    tracing::info!(
                        "gh listed {} issues, the full limit; listing again with limit {}",
                        issues.len(),
                        next
                    );
                    limit = next;
                }
            }
        }
    }

    async fn create_issue(&self, spec: &IssueSpec) -> Result<Issue, TrackerError> {
        let mut args = vec![
            "issue",
            "create",
            "--title",
            spec.title.as_str(),
            "--body",
            spec.body.as_str(),
        ];
        for label in &spec.labels {
            args.push("--label");
            args.push(label);
        }
        let raw = self.gh(&args).await?;
        let number = ISSUE_URL_NUMBER
            .captures(raw.trim())
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                TrackerError::new(
                    TrackerErrorKind::Invalid,
                    format!("Could not read issue number from gh output: {}", raw.trim()),
                )
            })?;
        tracing::info!("Created issue #{} in {}", number, self.repo);
        Ok(Issue {
            number,
            title: spec.title.clone(),
            body: spec.body.clone(),
            labels: spec.labels.clone(),
            state: IssueState::Open,
        })
    }

    async fn update_labels(&self, number: &str, labels: &BTreeSet<String>) -> Result<(), TrackerError> {
        let current = self.current_labels(number).await?;
        let add: Vec<&str> = labels.difference(&current).map(String::as_str).collect();
        let remove: Vec<&str> = current.difference(labels).map(String::as_str).collect();
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        let add_joined = add.join(",");
        let remove_joined = remove.join(",");
        let mut args = vec!["issue", "edit", number];
        if !add.is_empty() {
            args.push("--add-label");
            args.push(&add_joined);
        }
        if !remove.is_empty() {
            args.push("--remove-label");
            args.push(&remove_joined);
        }
        self.gh(&args).await.map(|_| ())
    }

    async fn close_issue(&self, number: &str, comment: &str) -> Result<(), TrackerError> {
        self.gh(&["issue", "close", number, "--comment", comment])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gh_issue_json() {
        let raw = r#"[{"number": 12, "title": "Login", "body": "x", "labels": [{"name": "taskloom"}], "state": "OPEN"},
                      {"number": 3, "title": "Setup", "labels": [], "state": "CLOSED"}]"#;
        let issues: Vec<Issue> = serde_json::from_str::<Vec<GhIssue>>(raw)
            .unwrap()
            .into_iter()
            .map(Issue::from)
            .collect();
        assert_eq!(issues[0].number, "12");
        assert!(issues[0].is_open());
        assert!(issues[0].labels.contains("taskloom"));
        assert!(!issues[1].is_open());
        assert_eq!(issues[1].body, "");
    }

    #[test]
    fn test_issue_number_from_url() {
        let caps = ISSUE_URL_NUMBER
            .captures("https://github.com/acme/app/issues/42\n".trim())
            .unwrap();
        assert_eq!(&caps[1], "42");
    }

    #[test]
    fn test_full_listing_grows_the_limit() {
        assert_eq!(next_list_limit(1000, 999).unwrap(), None);
        assert_eq!(next_list_limit(1000, 1000).unwrap(), Some(4000));
        assert_eq!(next_list_limit(32_000, 32_000).unwrap(), Some(MAX_LIST_LIMIT));
        assert_eq!(next_list_limit(MAX_LIST_LIMIT, 100).unwrap(), None);

        let err = next_list_limit(MAX_LIST_LIMIT, MAX_LIST_LIMIT).unwrap_err();
        assert_eq!(err.kind, TrackerErrorKind::Invalid);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_failure_classification() {
        assert!(classify_failure("API rate limit exceeded for user").is_transient());
        assert!(classify_failure("HTTP 502: Bad Gateway").is_transient());
        assert!(classify_failure("dial tcp: connection refused").is_transient());
        assert_eq!(
            classify_failure("GraphQL: Could not resolve to an issue with the number of 99")
                .kind,
            TrackerErrorKind::NotFound
        );
        assert_eq!(
            classify_failure("gh auth login required").kind,
            TrackerErrorKind::Auth
        );
        assert!(!classify_failure("unknown flag: --bogus").is_transient());
    }

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let tracker = GhCliTracker::new("acme/app").with_program("definitely-not-gh");
        let err = tracker
            .list_issues(&IssueFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, TrackerErrorKind::Unavailable);
        assert!(!err.is_transient());
    }
}
