//! In-memory issue tracker (non-persistent, for testing and dry runs).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::tracker::{Issue, IssueFilter, IssueSpec, IssueState, IssueTracker, TrackerError};

/// Number of mutating and listing calls received, for idempotency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub create: usize,
    pub update_labels: usize,
    pub close: usize,
}

impl CallCounts {
    pub fn mutations(&self) -> usize {
        self.create + self.update_labels + self.close
    }
}

#[derive(Default)]
struct State {
    issues: BTreeMap<u64, Issue>,
    comments: BTreeMap<u64, Vec<String>>,
    next_number: u64,
    calls: CallCounts,
    /// Errors returned, in order, by the next calls
    scripted_failures: VecDeque<TrackerError>,
    /// Errors returned only by `close_issue`, ahead of `scripted_failures`
    close_failures: VecDeque<TrackerError>,
}

#[derive(Clone, Default)]
pub struct InMemoryTracker {
    state: Arc<Mutex<State>>,
}

fn parse_number(number: &str) -> Result<u64, TrackerError> {
    number
        .trim()
        .trim_start_matches('#')
        .parse()
        .map_err(|_| TrackerError::not_found(format!("issue {}", number)))
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an issue with the next free number and return that number.
    pub fn add_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[&str],
        state: IssueState,
    ) -> String {
        let mut guard = self.lock();
        guard.next_number += 1;
        let number = guard.next_number;
        guard.issues.insert(
            number,
            Issue {
                number: number.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                state,
            },
        );
        number.to_string()
    }

    /// Remove an issue as if it had been deleted upstream.
    pub fn remove_issue(&self, number: &str) {
        if let Ok(n) = parse_number(number) {
            self.lock().issues.remove(&n);
        }
    }

    /// Close an issue out of band, as a human would.
    pub fn close_remotely(&self, number: &str) {
        if let Ok(n) = parse_number(number) {
            if let Some(issue) = self.lock().issues.get_mut(&n) {
                issue.state = IssueState::Closed;
            }
        }
    }

    pub fn issue(&self, number: &str) -> Option<Issue> {
        let n = parse_number(number).ok()?;
        self.lock().issues.get(&n).cloned()
    }

    pub fn comments(&self, number: &str) -> Vec<String> {
        parse_number(number)
            .ok()
            .and_then(|n| self.lock().comments.get(&n).cloned())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Make the next call fail with `error`. Queued errors are consumed in order.
    pub fn fail_next(&self, error: TrackerError) {
        self.lock().scripted_failures.push_back(error);
    }

    /// Make the next `close_issue` call fail, leaving other calls alone.
    pub fn fail_next_close(&self, error: TrackerError) {
        self.lock().close_failures.push_back(error);
    }

    fn take_failure(state: &mut State) -> Result<(), TrackerError> {
        match state.scripted_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>, TrackerError> {
        let mut state = self.lock();
        state.calls.list += 1;
        Self::take_failure(&mut state)?;
        Ok(state
            .issues
            .values()
            .filter(|issue| match &filter.label {
                Some(label) => issue.labels.contains(label),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn create_issue(&self, spec: &IssueSpec) -> Result<Issue, TrackerError> {
        let mut state = self.lock();
        state.calls.create += 1;
        Self::take_failure(&mut state)?;
        state.next_number += 1;
        let number = state.next_number;
        let issue = Issue {
            number: number.to_string(),
            title: spec.title.clone(),
            body: spec.body.clone(),
            labels: spec.labels.clone(),
            state: IssueState::Open,
        };
        state.issues.insert(number, issue.clone());
        Ok(issue)
    }

    async fn update_labels(&self, number: &str, labels: &BTreeSet<String>) -> Result<(), TrackerError> {
        let n = parse_number(number)?;
        let mut state = self.lock();
        state.calls.update_labels += 1;
        Self::take_failure(&mut state)?;
        let issue = state
            .issues
            .get_mut(&n)
            .ok_or_else(|| TrackerError::not_found(format!("issue {}", number)))?;
        issue.labels = labels.clone();
        Ok(())
    }

    async fn close_issue(&self, number: &str, comment: &str) -> Result<(), TrackerError> {
        let n = parse_number(number)?;
        let mut state = self.lock();
        state.calls.close += 1;
        if let Some(error) = state.close_failures.pop_front() {
            return Err(error);
        }
        Self::take_failure(&mut state)?;
        let issue = state
            .issues
            .get_mut(&n)
            .ok_or_else(|| TrackerError::not_found(format!("issue {}", number)))?;
        issue.state = IssueState::Closed;
        state.comments.entry(n).or_default().push(comment.to_string());
        Ok(())
    }
}
