//! Verification steps and the summary posted when a task closes.
//!
//! Steps are opaque to the core: they travel to the verification executor
//! and back to the tracker, nothing in the scheduler interprets them.

use std::collections::HashMap;

use super::Task;

/// Artifact key carrying the verification executor's free-form report.
pub const REPORT_ARTIFACT: &str = "report";

/// Render verification steps as a markdown checklist.
pub fn render_checklist(steps: &[String], checked: bool) -> String {
    let mark = if checked { "x" } else { " " };
    steps
        .iter()
        .map(|step| format!("- [{}] {}", mark, step))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the comment posted when the tracker issue is closed.
pub fn verification_summary(task: &Task, artifacts: &HashMap<String, String>) -> String {
    let mut out = format!("Verified by taskloom: **{}**\n", task.title);

    if !task.verification_steps.is_empty() {
        out.push_str("\n### Verification\n");
        out.push_str(&render_checklist(&task.verification_steps, true));
        out.push('\n');
    }

    if task.attempts() > 0 {
        out.push_str(&format!("\nRepair attempts: {}\n", task.attempts()));
    }

    if let Some(report) = artifacts.get(REPORT_ARTIFACT).filter(|r| !r.trim().is_empty()) {
        out.push_str("\n### Report\n");
        out.push_str(report.trim());
        out.push('\n');
    }

    out
}
