//! # procweave
//!
//! Orchestration core that turns declared tasks with dependencies and
//! priorities into an executed schedule under a concurrency cap.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Task entries, dependency resolution, processes and the task manager
//! - **[`scheduler`]**: Worker pool, resource ledger and the process scheduler
//! - **[`cli`]**: Configuration discovery, plan files and the shell executor
//! - **[`error`]**: Infrastructure errors shared by every module
//!
//! ## Features
//!
//! ### Execution modes
//! - **Sequential**: one entry at a time in dependency then priority order
//! - **Parallel**: every ready entry dispatched as soon as it becomes ready
//! - **Hybrid**: dependency waves, each run to completion before the next
//!
//! ### Scheduling
//! - **Concurrency cap**: long-lived semaphore pools per process, scheduler and task manager
//! - **Resource ledger**: clamped allocations released on every exit path
//! - **Triggers**: conditional, event-driven and iterative execution
//! - **Recovery**: caller-initiated retries of failed entries and processes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use procweave::{EchoExecutor, ExecutionMode, Process, ProcessScheduler, SchedulerConfig, TaskEntry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let process = Process::new("build", ExecutionMode::Hybrid, Arc::new(EchoExecutor::new()));
//!     process.add_task(TaskEntry::new("fetch", json!("fetch"))).await?;
//!     process
//!         .add_task(TaskEntry::new("compile", json!("compile")).depends_on(["fetch"]))
//!         .await?;
//!
//!     let scheduler = ProcessScheduler::new(SchedulerConfig::default());
//!     scheduler.add_process(process)?;
//!     let report = scheduler.schedule_hybrid(None).await?;
//!
//!     println!("completed: {:?}", report.completed());
//!     Ok(())
//! }
//! ```

/// Errors raised by orchestration calls.
pub mod error;

/// Task entries, processes and the task manager.
///
/// Provides dependency resolution, the shared execution engine, execution
/// reports and structured events.
pub mod task;

/// Process scheduling.
///
/// Bounded worker pools, the resource ledger and the multi-strategy process
/// scheduler with conditional, event-driven and iterative triggers.
pub mod scheduler;

// CLI module for command-line interface
pub mod cli;

pub use error::{OrchestratorError, Result};

// Re-export main task types
pub use task::{
    EchoExecutor, ExecutionContext, ExecutionMode, ExecutionReport, Executor, FnExecutor, Process,
    ProcessStatus, RetryReport, TaskEntry, TaskManager, TaskManagerConfig, TaskStatus,
};

// Re-export scheduler types
pub use scheduler::{ProcessScheduler, ResourceGrant, Resources, ScheduleReport, SchedulerConfig};
