//! Repair loop policy.
//!
//! Classifies why a phase failed and decides whether the task gets another
//! implementation attempt or is escalated to a human:
//! - Verification and implementation failures are repaired, up to a bound
//! - Test authoring problems are requirement problems: escalate at once
//! - Structural errors are never retried

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Default bound on repair cycles per task.
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u32 = 3;

/// Why a phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The test-writing executor reported failure
    TestAuthoring,
    /// Test writing "succeeded" without reporting at least one failing test
    NoFailingTests,
    /// The implementation executor reported failure
    Execution,
    /// End-to-end verification reported FAIL
    Verification,
    /// Graph-level problem (cycle, unknown dependency)
    Structural,
}

impl FailureClass {
    /// Whether a repair attempt can fix this class of failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Execution | FailureClass::Verification)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TestAuthoring => "test authoring failed",
            FailureClass::NoFailingTests => "no failing tests",
            FailureClass::Execution => "execution failed",
            FailureClass::Verification => "verification failed",
            FailureClass::Structural => "structural error",
        }
    }
}

/// A classified failure with the executor's detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub class: FailureClass,
    pub detail: String,
    /// `detail` already carries its class prefix (read back from a task)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub described: bool,
}

impl Failure {
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
            described: false,
        }
    }

    /// A failure whose description was recorded earlier by [`describe`](Self::describe).
    pub fn recorded(class: FailureClass, description: impl Into<String>) -> Self {
        Self {
            described: true,
            ..Self::new(class, description)
        }
    }

    /// The detail as stored on the task and shown in the run report.
    pub fn describe(&self) -> String {
        if self.described {
            self.detail.trim().to_string()
        } else if self.detail.trim().is_empty() {
            self.class.as_str().to_string()
        } else {
            format!("{}: {}", self.class.as_str(), self.detail.trim())
        }
    }
}

/// Context threaded into the repair dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairContext {
    /// 1-based repair attempt number
    pub attempt: u32,
    pub failure_detail: String,
}

/// What to do after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Retry(RepairContext),
    Escalate { reason: String },
}

/// Bounded repair policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_repair_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_repair_attempts: u32) -> Self {
        Self {
            max_repair_attempts,
        }
    }

    /// Decide on a failure and account for the attempt on the task.
    ///
    /// # Postconditions
    /// - `Retry` only when `task.attempts()` was below the bound; the count
    ///   is incremented before returning
    /// - `task.attempts() <= max_repair_attempts` always holds
    /// - Non-retryable classes never touch the count
    pub fn on_failure(&self, task: &mut Task, failure: &Failure) -> RetryAction {
        if !failure.class.is_retryable() {
            return RetryAction::Escalate {
                reason: failure.describe(),
            };
        }

        if task.attempts() >= self.max_repair_attempts {
            return RetryAction::Escalate {
                reason: format!(
                    "{} (after {} repair attempts)",
                    failure.describe(),
                    task.attempts()
                ),
            };
        }

        task.record_repair_attempt();
        RetryAction::Retry(RepairContext {
            attempt: task.attempts(),
            failure_detail: failure.describe(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("1", "Feature").unwrap()
    }

    #[test]
    fn test_retries_until_bound_then_escalates() {
        let policy = RetryPolicy::new(2);
        let mut task = task();
        let failure = Failure::new(FailureClass::Verification, "button missing");

        for expected_attempt in 1..=2 {
            match policy.on_failure(&mut task, &failure) {
                RetryAction::Retry(ctx) => {
                    assert_eq!(ctx.attempt, expected_attempt);
                    assert!(ctx.failure_detail.contains("button missing"));
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }

        // Third failure: the (max + 1)-th always escalates.
        assert!(matches!(
            policy.on_failure(&mut task, &failure),
            RetryAction::Escalate { .. }
        ));
        assert_eq!(task.attempts(), 2);
    }

    #[test]
    fn test_structural_classes_never_retry() {
        let policy = RetryPolicy::default();
        for class in [
            FailureClass::NoFailingTests,
            FailureClass::TestAuthoring,
            FailureClass::Structural,
        ] {
            let mut task = task();
            let action = policy.on_failure(&mut task, &Failure::new(class, ""));
            assert!(matches!(action, RetryAction::Escalate { .. }));
            assert_eq!(task.attempts(), 0);
        }
    }

    #[test]
    fn test_zero_bound_escalates_first_failure() {
        let policy = RetryPolicy::new(0);
        let mut task = task();
        let action = policy.on_failure(&mut task, &Failure::new(FailureClass::Execution, "panic"));
        assert_eq!(
            action,
            RetryAction::Escalate {
                reason: "execution failed: panic (after 0 repair attempts)".to_string()
            }
        );
    }

    #[test]
    fn test_describe_without_detail() {
        assert_eq!(
            Failure::new(FailureClass::NoFailingTests, " ").describe(),
            "no failing tests"
        );
    }

    #[test]
    fn test_recorded_failure_keeps_its_prefix() {
        let recorded = Failure::recorded(FailureClass::Execution, "verification failed: step 2");
        assert_eq!(recorded.describe(), "verification failed: step 2");
    }
}
