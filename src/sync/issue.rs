//! Mapping between tasks and tracker issues.
//!
//! Labels carry classification and progress:
//! `category:<c>`, `priority:<n>`, `status:<s>`, `mode:sequential`.
//!
//! The body carries everything else:
//!
//! ```text
//! <description>
//!
//! Depends on: #3, #4
//! Files: src/login.rs, src/session.rs
//!
//! ## Verification
//! - [ ] Login with valid credentials redirects to the dashboard
//! ```

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::task::verification::render_checklist;
use crate::task::{ExecutionMode, Task, TaskId, TaskStatus};

const CATEGORY_PREFIX: &str = "category:";
const PRIORITY_PREFIX: &str = "priority:";
const STATUS_PREFIX: &str = "status:";
const MODE_PREFIX: &str = "mode:";
const SEQUENTIAL_LABEL: &str = "mode:sequential";

static DEPENDS_ON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*depends\s+on\s*:\s*(.*)$").expect("valid regex"));
static ISSUE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid regex"));
static FILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*files\s*:\s*(.*)$").expect("valid regex"));
static VERIFICATION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*#{1,6}\s*verification\s*$").expect("valid regex"));
static CHECKLIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s*\[[ xX]\]\s+(.+?)\s*$").expect("valid regex"));

/// Task metadata recovered from an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFields {
    pub description: String,
    /// Issue numbers from the `Depends on:` line
    pub dependency_refs: Vec<String>,
    pub files_touched: BTreeSet<String>,
    pub verification_steps: Vec<String>,
    pub category: Option<String>,
    pub priority: Option<u32>,
    pub status: Option<TaskStatus>,
    pub execution_mode: ExecutionMode,
}

/// Whether the label is one taskloom owns and rewrites on push.
pub fn is_managed_label(label: &str) -> bool {
    [CATEGORY_PREFIX, PRIORITY_PREFIX, STATUS_PREFIX, MODE_PREFIX]
        .iter()
        .any(|prefix| label.starts_with(prefix))
}

/// Managed labels describing the task's current state.
pub fn task_labels(task: &Task) -> BTreeSet<String> {
    let mut labels = BTreeSet::new();
    if !task.category.trim().is_empty() {
        labels.insert(format!("{}{}", CATEGORY_PREFIX, task.category.trim()));
    }
    labels.insert(format!("{}{}", PRIORITY_PREFIX, task.priority));
    labels.insert(format!("{}{}", STATUS_PREFIX, task.status()));
    if task.execution_mode == ExecutionMode::Sequential {
        labels.insert(SEQUENTIAL_LABEL.to_string());
    }
    labels
}

/// Replace the managed part of `existing` with `managed`, keeping foreign labels.
pub fn merge_labels(existing: &BTreeSet<String>, managed: BTreeSet<String>) -> BTreeSet<String> {
    existing
        .iter()
        .filter(|label| !is_managed_label(label))
        .cloned()
        .chain(managed)
        .collect()
}

/// Render the issue body. `dependency_ref` maps a local dependency id to
/// the issue number the tracker knows it by.
pub fn render_body(task: &Task, dependency_ref: impl Fn(&TaskId) -> String) -> String {
    let mut body = String::new();
    if !task.description.trim().is_empty() {
        body.push_str(task.description.trim());
        body.push_str("\n\n");
    }
    if !task.dependencies.is_empty() {
        let refs: Vec<String> = task
            .dependencies
            .iter()
            .map(|dep| format!("#{}", dependency_ref(dep)))
            .collect();
        body.push_str(&format!("Depends on: {}\n", refs.join(", ")));
    }
    if !task.files_touched.is_empty() {
        let files: Vec<&str> = task.files_touched.iter().map(String::as_str).collect();
        body.push_str(&format!("Files: {}\n", files.join(", ")));
    }
    if !task.verification_steps.is_empty() {
        body.push_str("\n## Verification\n");
        body.push_str(&render_checklist(&task.verification_steps, false));
        body.push('\n');
    }
    body.trim().to_string()
}

/// Parse body and labels back into task metadata.
pub fn parse_issue(body: &str, labels: &BTreeSet<String>) -> IssueFields {
    let mut fields = IssueFields::default();
    let mut description = Vec::new();
    let mut in_verification = false;

    for line in body.lines() {
        if VERIFICATION_HEADING.is_match(line) {
            in_verification = true;
            continue;
        }
        if in_verification {
            if let Some(caps) = CHECKLIST_ITEM.captures(line) {
                fields.verification_steps.push(caps[1].to_string());
                continue;
            }
            if line.trim_start().starts_with('#') {
                in_verification = false;
            } else {
                continue;
            }
        }
        if let Some(caps) = DEPENDS_ON.captures(line) {
            fields.dependency_refs.extend(
                ISSUE_REF
                    .captures_iter(&caps[1])
                    .map(|c| c[1].trim_end_matches('.').to_string()),
            );
        } else if let Some(caps) = FILES.captures(line) {
            fields.files_touched.extend(
                caps[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string),
            );
        } else {
            description.push(line);
        }
    }
    fields.description = description.join("\n").trim().to_string();

    for label in labels {
        if let Some(category) = label.strip_prefix(CATEGORY_PREFIX) {
            fields.category = Some(category.trim().to_string());
        } else if let Some(priority) = label.strip_prefix(PRIORITY_PREFIX) {
            fields.priority = priority.trim().parse().ok();
        } else if let Some(status) = label.strip_prefix(STATUS_PREFIX) {
            fields.status = TaskStatus::parse(status);
        } else if label == SEQUENTIAL_LABEL {
            fields.execution_mode = ExecutionMode::Sequential;
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> BTreeSet<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_body_parses_back() {
        let task = Task::new("7", "Session handling")
            .unwrap()
            .with_description("Keep users signed in.\nExpire after 30 days.")
            .with_dependencies(["3", "4"])
            .with_file("src/session.rs")
            .with_file("src/login.rs")
            .with_verification_step("Reload keeps the session")
            .with_verification_step("Logout clears the cookie");

        let body = render_body(&task, |id| id.to_string());
        let fields = parse_issue(&body, &BTreeSet::new());

        assert_eq!(fields.description, "Keep users signed in.\nExpire after 30 days.");
        assert_eq!(fields.dependency_refs, vec!["3", "4"]);
        assert_eq!(fields.files_touched.len(), 2);
        assert_eq!(
            fields.verification_steps,
            vec!["Reload keeps the session", "Logout clears the cookie"]
        );
    }

    #[test]
    fn test_handwritten_body() {
        let body = "Add a search box.\n\ndepends on: #12 and #15.\n\n### Verification\n* [x] Typing filters\n- [ ] Empty query shows all\n\n## Notes\nRemember mobile.";
        let fields = parse_issue(body, &BTreeSet::new());
        assert_eq!(fields.dependency_refs, vec!["12", "15"]);
        assert_eq!(fields.verification_steps, vec!["Typing filters", "Empty query shows all"]);
        assert!(fields.description.contains("Add a search box."));
        assert!(fields.description.contains("Remember mobile."));
    }

    #[test]
    fn test_labels_parse() {
        let fields = parse_issue(
            "",
            &labels(&["category:auth", "priority:2", "status:verified", "mode:sequential", "bug"]),
        );
        assert_eq!(fields.category.as_deref(), Some("auth"));
        assert_eq!(fields.priority, Some(2));
        assert_eq!(fields.status, Some(TaskStatus::Verified));
        assert_eq!(fields.execution_mode, ExecutionMode::Sequential);
    }

    #[test]
    fn test_merge_keeps_foreign_labels() {
        let task = Task::new("1", "Feature")
            .unwrap()
            .with_category("ui")
            .with_priority(1);
        let merged = merge_labels(
            &labels(&["bug", "taskloom", "status:pending", "category:old"]),
            task_labels(&task),
        );
        assert_eq!(
            merged,
            labels(&["bug", "category:ui", "priority:1", "status:pending", "taskloom"])
        );
    }
}
