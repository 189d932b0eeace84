use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a task entry, unique within its owner
pub type EntryId = String;

/// Opaque work descriptor handed to executors unchanged
pub type Payload = serde_json::Value;

/// A single unit of declared work
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskEntry {
    pub id: EntryId,
    pub payload: Payload,
    pub dependencies: Vec<EntryId>,
    pub priority: i32,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    /// Number of times an executor has been invoked for this entry
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TaskStatus {
    /// Waiting for dependencies or a worker
    Pending,
    /// Currently held by a worker
    Running { started_at: DateTime<Utc> },
    /// Executor returned a value
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Executor returned an error, panicked or timed out
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: TaskError,
        attempts: u32,
    },
    /// Never ran because a dependency can not complete
    Skipped {
        reason: SkipReason,
        skipped_at: DateTime<Utc>,
    },
}

/// Outcome stored on an entry once it has run
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TaskResult {
    Success { output: Payload },
    Failure { error: TaskError },
}

/// Payload-level failures, recorded on the entry rather than propagated
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("execution failed: {message}")]
    Execution { message: String },
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("executor panicked: {message}")]
    Panicked { message: String },
    #[error("no executor available")]
    NoExecutor,
}

/// Why an entry (or process) was skipped
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// A dependency refers to an id that is not registered
    MissingDependency { dependency: String },
    /// The entry is part of a dependency cycle
    DependencyCycle,
    /// A dependency failed, was skipped, or is itself unresolvable
    DependencyUnavailable { dependency: String },
    /// The run was cancelled before the entry was dispatched
    Cancelled,
    /// A conditional trigger evaluated to false
    ConditionNotMet,
}

/// How a process runs its entries
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One entry at a time in resolved order
    #[default]
    Sequential,
    /// Every ready entry dispatched as soon as it becomes ready
    Parallel,
    /// Ready set executed wave by wave
    Hybrid,
}

impl TaskEntry {
    /// Create a pending entry with no dependencies and priority 0
    pub fn new(id: impl Into<EntryId>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            dependencies: Vec::new(),
            priority: 0,
            status: TaskStatus::Pending,
            result: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntryId>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Running { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, TaskStatus::Skipped { .. })
    }

    /// Completed, Failed and Skipped are terminal for a single invocation
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed() || self.is_skipped()
    }

    /// `Pending -> Running`
    pub fn start(&mut self) -> Result<()> {
        if !self.is_pending() {
            return Err(self.illegal("Running"));
        }
        self.begin_attempt();
        Ok(())
    }

    /// `Failed -> Running`, only reachable through retry
    pub fn restart(&mut self) -> Result<()> {
        if !self.is_failed() {
            return Err(self.illegal("Running"));
        }
        self.begin_attempt();
        Ok(())
    }

    /// `Running -> Completed`
    pub fn complete(&mut self, output: Payload) -> Result<()> {
        let TaskStatus::Running { started_at } = self.status else {
            return Err(self.illegal("Completed"));
        };
        self.status = TaskStatus::Completed {
            started_at,
            completed_at: Utc::now(),
        };
        self.result = Some(TaskResult::Success { output });
        Ok(())
    }

    /// `Running -> Failed`
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        let TaskStatus::Running { started_at } = self.status else {
            return Err(self.illegal("Failed"));
        };
        self.status = TaskStatus::Failed {
            started_at,
            failed_at: Utc::now(),
            error: error.clone(),
            attempts: self.attempts,
        };
        self.result = Some(TaskResult::Failure { error });
        Ok(())
    }

    /// `Pending -> Skipped`
    pub fn skip(&mut self, reason: SkipReason) -> Result<()> {
        if !self.is_pending() {
            return Err(self.illegal("Skipped"));
        }
        self.status = TaskStatus::Skipped {
            reason,
            skipped_at: Utc::now(),
        };
        Ok(())
    }

    /// Put the entry back to `Pending` ahead of a fresh invocation
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.attempts = 0;
    }

    /// Wall time of the last run, if it finished successfully
    pub fn duration_ms(&self) -> Option<u64> {
        match self.status {
            TaskStatus::Completed {
                started_at,
                completed_at,
            } => Some(
                completed_at
                    .signed_duration_since(started_at)
                    .num_milliseconds()
                    .max(0) as u64,
            ),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Payload> {
        match &self.result {
            Some(TaskResult::Success { output }) => Some(output),
            _ => None,
        }
    }

    fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = TaskStatus::Running {
            started_at: Utc::now(),
        };
    }

    fn illegal(&self, to: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            id: self.id.clone(),
            from: self.status.label(),
            to,
        }
    }
}

impl TaskStatus {
    /// Short name of the variant
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running { .. } => "Running",
            TaskStatus::Completed { .. } => "Completed",
            TaskStatus::Failed { .. } => "Failed",
            TaskStatus::Skipped { .. } => "Skipped",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingDependency { dependency } => {
                write!(f, "missing dependency: {dependency}")
            }
            SkipReason::DependencyCycle => write!(f, "dependency cycle"),
            SkipReason::DependencyUnavailable { dependency } => {
                write!(f, "dependency {dependency} did not complete")
            }
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::ConditionNotMet => write!(f, "condition not met"),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "hybrid" => Ok(ExecutionMode::Hybrid),
            other => Err(OrchestratorError::Config(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}
