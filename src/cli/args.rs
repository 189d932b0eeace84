//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Execute a plan file
//! - `validate`: Resolve a plan file without executing it
//! - `show-config`: Show configuration discovery information

use crate::task::ExecutionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "procweave")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run dependency-ordered processes under a concurrency cap")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute every process of a plan file
    Run {
        /// Path to the plan (TOML)
        plan: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Scheduling strategy: sequential, parallel or hybrid
        #[arg(short = 's', long = "strategy", value_parser = parse_strategy)]
        strategy: Option<ExecutionMode>,
        /// Maximum number of processes running at once
        #[arg(short = 'j', long = "max-concurrent")]
        max_concurrent: Option<usize>,
        /// Retry attempts per failed task after the first pass
        #[arg(short = 'r', long = "retries")]
        retries: Option<u32>,
        /// Show what would be executed without running
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
        /// Print the full report as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Resolve a plan file and report ordering problems
    Validate {
        /// Path to the plan (TOML)
        plan: PathBuf,
    },
    /// Show configuration discovery and the effective configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

fn parse_strategy(value: &str) -> Result<ExecutionMode, String> {
    value.parse().map_err(|e: crate::error::OrchestratorError| e.to_string())
}
