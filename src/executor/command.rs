//! Executor backed by an agent CLI subprocess.
//!
//! The rendered phase prompt is written to the child's stdin. The child is
//! expected to print a JSON result object, either as the whole of stdout or
//! as its last JSON line:
//!
//! ```text
//! {"status": "success", "artifacts": {"failingTestCount": 3}, "error_detail": ""}
//! ```
//!
//! CLIs that wrap their answer (`{"type": "result", "result": "..."}`) are
//! unwrapped once. Without any parseable object the exit code decides.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AgentExecutor, ExecutionContext, ExecutionResult, ExecutionStatus, Phase, FAILING_TEST_COUNT};
use crate::task::verification::{render_checklist, REPORT_ARTIFACT};
use crate::task::{Subtask, Task};

/// Configuration for the subprocess executor.
#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Hard limit per invocation
    pub timeout: Option<Duration>,
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            timeout: None,
        }
    }
}

pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    async fn run(&self, prompt: String, ctx: &ExecutionContext) -> ExecutionResult {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn agent command {}: {}", self.config.program, e);
                return ExecutionResult::failure(format!(
                    "Failed to spawn agent command '{}': {}",
                    self.config.program, e
                ));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::warn!("Failed to write prompt to agent stdin: {}", e);
            }
            // Dropping stdin closes it so the agent sees EOF.
        }

        let wait = child.wait_with_output();
        let output = match self.config.timeout {
            Some(limit) => tokio::select! {
                _ = ctx.cancel.cancelled() => return ExecutionResult::failure("Cancelled"),
                res = tokio::time::timeout(limit, wait) => match res {
                    Ok(out) => out,
                    Err(_) => {
                        return ExecutionResult::failure(format!(
                            "Agent command timed out after {}s",
                            limit.as_secs()
                        ))
                    }
                },
            },
            None => tokio::select! {
                _ = ctx.cancel.cancelled() => return ExecutionResult::failure("Cancelled"),
                out = wait => out,
            },
        };

        match output {
            Ok(output) => parse_output(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
                output.status.success(),
            ),
            Err(e) => ExecutionResult::failure(format!("Failed to wait for agent command: {}", e)),
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(CommandExecutorConfig::default())
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn execute(&self, task: &Task, phase: Phase, ctx: &ExecutionContext) -> ExecutionResult {
        tracing::info!(
            "Running {} for task {} (phase={}, attempt={})",
            self.config.program,
            task.id,
            phase,
            ctx.attempt
        );
        self.run(render_prompt(task, phase, ctx), ctx).await
    }
}

/// Build the prompt for one phase.
pub fn render_prompt(task: &Task, phase: Phase, ctx: &ExecutionContext) -> String {
    let instructions = match phase {
        Phase::Testing => format!(
            "Write automated tests for this feature. Do not implement it. \
             Run the tests and confirm they FAIL. Report the number of failing \
             tests in artifacts.{}.",
            FAILING_TEST_COUNT
        ),
        Phase::Implementing => "Implement the feature until every test written for it passes. \
             Do not weaken or delete tests."
            .to_string(),
        Phase::Verifying => "Verify the feature end to end against every verification step. \
             Report status \"success\" only if all steps pass; otherwise \"failure\" \
             with the failing step in error_detail."
            .to_string(),
        Phase::Repairing => "A previous attempt failed. Fix the implementation so the tests and \
             verification steps pass."
            .to_string(),
    };

    let mut prompt = format!(
        "# Task {id}: {title}\n\nPhase: {phase}\n\n{instructions}\n",
        id = task.id,
        title = task.title,
        phase = phase,
        instructions = instructions
    );

    if !task.description.trim().is_empty() {
        prompt.push_str(&format!("\n## Description\n{}\n", task.description.trim()));
    }
    if !task.verification_steps.is_empty() {
        prompt.push_str("\n## Verification steps\n");
        prompt.push_str(&render_checklist(&task.verification_steps, false));
        prompt.push('\n');
    }
    if !task.files_touched.is_empty() {
        let files: Vec<&str> = task.files_touched.iter().map(String::as_str).collect();
        prompt.push_str(&format!("\n## Files\n{}\n", files.join(", ")));
    }
    if let Some(detail) = &ctx.failure_detail {
        prompt.push_str(&format!(
            "\n## Previous failure (attempt {})\n{}\n",
            ctx.attempt, detail
        ));
    }

    prompt.push_str(
        "\n## Response\nFinish with a single JSON object on its own line: \
         {\"status\": \"success\" | \"failure\", \"artifacts\": {}, \"error_detail\": \"\", \
         \"subtasks\": []}\n",
    );
    prompt
}

#[derive(Deserialize)]
struct WireResult {
    status: String,
    #[serde(default)]
    artifacts: HashMap<String, serde_json::Value>,
    #[serde(default, alias = "errorDetail")]
    error_detail: String,
    #[serde(default, alias = "subtasks")]
    discovered: Vec<Subtask>,
}

impl WireResult {
    fn into_result(self) -> Option<ExecutionResult> {
        let status = match self.status.to_lowercase().as_str() {
            "success" | "pass" | "passed" | "ok" => ExecutionStatus::Success,
            "failure" | "fail" | "failed" | "error" => ExecutionStatus::Failure,
            _ => return None,
        };
        let artifacts = self
            .artifacts
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        Some(ExecutionResult {
            status,
            artifacts,
            error_detail: self.error_detail,
            discovered: self.discovered,
        })
    }
}

fn parse_object(text: &str, depth: u8) -> Option<ExecutionResult> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    if value.get("status").is_some() {
        if let Some(result) = serde_json::from_value::<WireResult>(value.clone())
            .ok()
            .and_then(WireResult::into_result)
        {
            return Some(result);
        }
    }
    // Wrapped CLI output: look inside the text answer once.
    match value.get("result").and_then(|r| r.as_str()) {
        Some(inner) if depth == 0 => find_result(inner, depth + 1),
        _ => None,
    }
}

fn find_result(text: &str, depth: u8) -> Option<ExecutionResult> {
    parse_object(text, depth).or_else(|| {
        text.lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| parse_object(line, depth))
    })
}

/// Turn raw process output into a result.
pub fn parse_output(stdout: &str, stderr: &str, exit_ok: bool) -> ExecutionResult {
    if let Some(result) = find_result(stdout, 0) {
        return result;
    }
    if exit_ok {
        ExecutionResult::success().with_artifact(REPORT_ARTIFACT, stdout.trim())
    } else {
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        ExecutionResult::failure(format!("Agent command exited with failure: {}", detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), PathBuf::from("."), CancellationToken::new())
    }

    #[test]
    fn test_parse_last_json_line() {
        let stdout = "working...\nwrote 3 tests\n{\"status\": \"success\", \"artifacts\": {\"failingTestCount\": 3}}\n";
        let result = parse_output(stdout, "", true);
        assert!(result.is_success());
        assert_eq!(result.failing_test_count(), Some(3));
    }

    #[test]
    fn test_parse_wrapped_cli_result() {
        let inner = "Done.\n{\"status\": \"fail\", \"errorDetail\": \"step 2 failed\"}";
        let stdout = serde_json::json!({ "type": "result", "result": inner }).to_string();
        let result = parse_output(&stdout, "", true);
        assert!(!result.is_success());
        assert_eq!(result.error_detail, "step 2 failed");
    }

    #[test]
    fn test_parse_subtasks() {
        let stdout = r#"{"status": "success", "subtasks": [{"title": "Split A"}, {"title": "Split B"}]}"#;
        let result = parse_output(stdout, "", true);
        assert_eq!(result.discovered.len(), 2);
    }

    #[test]
    fn test_exit_code_fallback() {
        assert!(parse_output("all good", "", true).is_success());
        let failed = parse_output("", "boom", false);
        assert!(!failed.is_success());
        assert!(failed.error_detail.contains("boom"));
    }

    #[test]
    fn test_prompt_threads_failure_detail() {
        let task = Task::new("5", "Search box")
            .unwrap()
            .with_verification_step("Typing filters results");
        let repair = ctx().for_repair(1, "verification failed: results not filtered");
        let prompt = render_prompt(&task, Phase::Repairing, &repair);
        assert!(prompt.contains("# Task 5: Search box"));
        assert!(prompt.contains("- [ ] Typing filters results"));
        assert!(prompt.contains("results not filtered"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_round_trip() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"status":"success","artifacts":{"failingTestCount":2}}'"#
                    .to_string(),
            ],
            timeout: Some(Duration::from_secs(10)),
        });
        let task = Task::new("1", "Feature").unwrap();
        let result = executor.execute(&task, Phase::Testing, &ctx()).await;
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(result.failing_test_count(), Some(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_subprocess() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            timeout: None,
        });
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let task = Task::new("1", "Feature").unwrap();
        let started = std::time::Instant::now();
        let result = executor.execute(&task, Phase::Implementing, &ctx).await;
        assert!(!result.is_success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_fails_cleanly() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            program: "definitely-not-an-agent-cli".to_string(),
            args: Vec::new(),
            timeout: None,
        });
        let task = Task::new("1", "Feature").unwrap();
        let result = executor.execute(&task, Phase::Testing, &ctx()).await;
        assert!(!result.is_success());
        assert!(result.error_detail.contains("Failed to spawn"));
    }
}
