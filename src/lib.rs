//! # taskloom
//!
//! Dependency-aware orchestration of coding agents over a task graph.
//!
//! This library provides:
//! - A persisted task ledger with an explicit task state machine
//! - A DAG of tasks with cycle detection and dispatch-round planning
//! - A round-based scheduler running each task through test-first phases
//! - Two-way sync with an issue tracker (GitHub via the `gh` CLI)
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐  pull   ┌──────────────┐  snapshot  ┌─────────────┐
//!   │ IssueTracker │ ──────▶ │  TaskLedger  │ ─────────▶ │  TaskGraph  │
//!   └──────────────┘         └──────────────┘            └──────┬──────┘
//!          ▲                        ▲                           │ rounds
//!          │ push                   │ write-through             ▼
//!   ┌──────┴───────┐         ┌──────┴───────┐  execute   ┌─────────────┐
//!   │ SyncGateway  │ ◀────── │  Scheduler   │ ─────────▶ │AgentExecutor│
//!   └──────────────┘ verified└──────────────┘            └─────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Pull open issues into the ledger
//! 2. Dispatch every task whose dependencies are verified
//! 3. Testing -> Implementing -> Verifying, repairing on failure
//! 4. Close the issue of each verified task
//!
//! ## Modules
//! - `task`: Task definitions and the state machine
//! - `graph`: Dependency graph queries
//! - `scheduler`: Dispatch rounds and per-task pipelines
//! - `sync`: Issue tracker gateway

pub mod config;
pub mod executor;
pub mod graph;
pub mod ledger;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod sync;
pub mod task;

pub use config::Config;
pub use executor::{AgentExecutor, ExecutionContext, ExecutionResult, Phase};
pub use graph::{GraphError, TaskGraph};
pub use ledger::{FileLedger, InMemoryLedger, TaskLedger};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use retry::RetryPolicy;
pub use scheduler::{RunReport, Scheduler};
pub use sync::SyncGateway;
pub use task::{Task, TaskId, TaskStatus};
