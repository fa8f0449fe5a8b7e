//! Task module - defines tasks, their state machine, and decomposition.
//!
//! This module keeps the state machine explicit:
//! - Status edges live in one table (`TaskStatus::can_transition_to`)
//! - Only the scheduler and retry policy mutate status and attempts
//! - Pure functions are separated from IO operations

pub mod task;
mod subtask;
pub mod verification;

pub use subtask::Subtask;
pub use task::{ExecutionMode, Task, TaskError, TaskId, TaskStatus};
