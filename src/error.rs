//! Error types for the orchestration core.
//!
//! Only infrastructure problems surface as [`OrchestratorError`]. Executor
//! failures, skipped entries and saturated pools are ordinary outcomes and are
//! recorded in reports instead.

use std::path::PathBuf;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that abort an orchestration call
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Operation not allowed in the current state of the owner
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An entry was asked to make a transition its lifecycle forbids
    #[error("Illegal transition for entry {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// An id was registered twice in the same owner
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// The scheduler was shut down
    #[error("Scheduler is not active")]
    SchedulerInactive,

    /// The worker pool semaphore was closed underneath a waiter
    #[error("Worker pool closed")]
    PoolClosed,

    /// A worker task was cancelled or aborted by the runtime
    #[error("Worker join failure: {0}")]
    WorkerJoin(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

impl From<tokio::sync::AcquireError> for OrchestratorError {
    fn from(_: tokio::sync::AcquireError) -> Self {
        Self::PoolClosed
    }
}
