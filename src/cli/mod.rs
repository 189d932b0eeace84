//! CLI-specific functionality for the `procweave` binary
//!
//! This module contains argument parsing, configuration discovery, plan file
//! loading and the shell executor used to run plan tasks.

pub mod args;
pub mod config;
pub mod plan;
pub mod shell;

pub use args::{Args, Commands};
pub use config::{ConfigDiscovery, OrchestratorConfig, ProcessDefaults, RunDefaults};
pub use plan::{PlanFile, PlanValidation, ProcessSpec, TaskSpec};
pub use shell::ShellExecutor;
