//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Explicit path (`--config`)
//! 2. `$PROCWEAVE_CONFIG`
//! 3. Current directory: ./procweave.toml or ./.procweave/config.toml
//! 4. Built-in defaults

use crate::error::{OrchestratorError, Result};
use crate::scheduler::SchedulerConfig;
use crate::task::{ExecutionMode, TaskManagerConfig};
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable pointing at a configuration file
pub const CONFIG_ENV_VAR: &str = "PROCWEAVE_CONFIG";

/// Configuration file name in the current directory
pub const CONFIG_FILE_NAME: &str = "procweave.toml";

/// Hidden directory holding `config.toml`
pub const LOCAL_DIR_NAME: &str = ".procweave";

/// Complete configuration of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub tasks: TaskManagerConfig,
    pub process: ProcessDefaults,
    pub run: RunDefaults,
}

/// Defaults applied to processes built from a plan file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessDefaults {
    pub max_workers: usize,
    pub task_timeout_secs: Option<u64>,
}

/// Defaults of the `run` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunDefaults {
    pub strategy: ExecutionMode,
    /// Retry attempts per failed entry after the first pass
    pub retries: u32,
}

impl Default for ProcessDefaults {
    fn default() -> Self {
        Self {
            max_workers: crate::task::DEFAULT_PROCESS_WORKERS,
            task_timeout_secs: None,
        }
    }
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            strategy: ExecutionMode::Hybrid,
            retries: 0,
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: OrchestratorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject values the runtime can not honour
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(OrchestratorError::Config(message.to_string()));

        if self.scheduler.max_concurrent == 0 {
            return invalid("scheduler.max_concurrent must be at least 1");
        }
        if !self.scheduler.resources.is_non_negative() {
            return invalid("scheduler.resources must not be negative");
        }
        if !(self.scheduler.allocation_slice > 0.0 && self.scheduler.allocation_slice <= 1.0) {
            return invalid("scheduler.allocation_slice must be in (0, 1]");
        }
        if self.tasks.max_concurrent_tasks == 0 {
            return invalid("tasks.max_concurrent_tasks must be at least 1");
        }
        if self.process.max_workers == 0 {
            return invalid("process.max_workers must be at least 1");
        }
        if self.process.task_timeout_secs == Some(0) || self.tasks.task_timeout_secs == Some(0) {
            return invalid("task timeouts must be positive");
        }
        Ok(())
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the first configuration found, or defaults.
    ///
    /// An explicit path must exist; discovered candidates are optional.
    pub fn discover_config(explicit: Option<&Path>) -> Result<(OrchestratorConfig, Option<PathBuf>)> {
        if let Some(path) = explicit {
            info!("Loading configuration override from: {:?}", path);
            return Ok((OrchestratorConfig::from_toml_file(path)?, Some(path.to_path_buf())));
        }

        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            let config = OrchestratorConfig::from_toml_file(&config_path)?;
            return Ok((config, Some(config_path)));
        }

        info!("No configuration file found, using defaults");
        Ok((OrchestratorConfig::default(), None))
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Candidate paths in priority order
    pub fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(path) = std_env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                candidates.push(PathBuf::from(path));
            }
        }

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(CONFIG_FILE_NAME));
            candidates.push(current_dir.join(LOCAL_DIR_NAME).join("config.toml"));
        }

        candidates
    }

    /// Show configuration discovery information
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
