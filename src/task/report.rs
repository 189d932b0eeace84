//! Reports returned by `execute`, `retry_failed`, `orchestrate_tasks` and
//! the scheduler strategies.
//!
//! Partial failure never raises: callers inspect the per-item outcomes.

use crate::task::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a process (and of a task manager orchestration run)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Final state of one item in a report
#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum OutcomeState {
    Completed { output: Payload },
    Failed { error: TaskError },
    Skipped { reason: SkipReason },
    /// Not run in this call; the caller may try again later
    Queued { reason: QueueReason },
    /// Still held by a worker when the report was taken
    InFlight,
}

/// Why an item was deferred instead of run
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub enum QueueReason {
    ConcurrencyLimit { limit: usize },
    AwaitingDependencies { pending: Vec<String> },
    OrchestrationInProgress,
}

/// Outcome of one entry
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ItemOutcome {
    pub id: EntryId,
    pub state: OutcomeState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One hybrid wave
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WaveRecord {
    pub index: usize,
    pub entries: Vec<EntryId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Aggregate metrics of one run
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct RunMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub peak_concurrency: usize,
    pub waves: usize,
}

/// Whether a run actually happened
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunDisposition {
    Executed,
    /// Another invocation on the same owner was in progress; nothing ran
    AlreadyRunning,
}

/// Result of `Process::execute` or `TaskManager::orchestrate_tasks`
#[derive(Serialize, Clone, Debug)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub scope: String,
    pub disposition: RunDisposition,
    pub mode: ExecutionMode,
    pub status: ProcessStatus,
    pub outcomes: Vec<ItemOutcome>,
    pub waves: Vec<WaveRecord>,
    pub metrics: RunMetrics,
}

/// Result of `retry_failed`
#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum RetryReport {
    NothingToRetry,
    Retried {
        outcomes: Vec<ItemOutcome>,
        recovered: usize,
        still_failed: usize,
    },
}

/// Structured execution log line
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionLog {
    pub at: DateTime<Utc>,
    pub entry_id: EntryId,
    pub attempt: u32,
    pub kind: LogKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LogKind {
    Started,
    Completed,
    Failed { error: TaskError },
    Skipped { reason: SkipReason },
    Retried { succeeded: bool },
}

impl ItemOutcome {
    pub fn from_entry(entry: &TaskEntry) -> Self {
        let (state, started_at, finished_at) = match &entry.status {
            TaskStatus::Pending => (
                OutcomeState::Queued {
                    reason: QueueReason::AwaitingDependencies {
                        pending: entry.dependencies.clone(),
                    },
                },
                None,
                None,
            ),
            TaskStatus::Running { started_at } => (OutcomeState::InFlight, Some(*started_at), None),
            TaskStatus::Completed {
                started_at,
                completed_at,
            } => (
                OutcomeState::Completed {
                    output: entry.output().cloned().unwrap_or_default(),
                },
                Some(*started_at),
                Some(*completed_at),
            ),
            TaskStatus::Failed {
                started_at,
                failed_at,
                error,
                ..
            } => (
                OutcomeState::Failed {
                    error: error.clone(),
                },
                Some(*started_at),
                Some(*failed_at),
            ),
            TaskStatus::Skipped { reason, skipped_at } => (
                OutcomeState::Skipped {
                    reason: reason.clone(),
                },
                None,
                Some(*skipped_at),
            ),
        };

        Self {
            id: entry.id.clone(),
            state,
            attempts: entry.attempts,
            started_at,
            finished_at,
        }
    }

    pub fn queued(id: impl Into<EntryId>, reason: QueueReason) -> Self {
        Self {
            id: id.into(),
            state: OutcomeState::Queued { reason },
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, OutcomeState::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, OutcomeState::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.state, OutcomeState::Skipped { .. })
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.state, OutcomeState::Queued { .. })
    }
}

impl RunMetrics {
    pub fn from_entries(
        entries: &[TaskEntry],
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        peak_concurrency: usize,
        waves: usize,
    ) -> Self {
        let completed = entries.iter().filter(|e| e.is_completed()).count();
        let failed = entries.iter().filter(|e| e.is_failed()).count();
        let skipped = entries.iter().filter(|e| e.is_skipped()).count();
        let finished = completed + failed + skipped;

        Self {
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            elapsed_ms: finished_at
                .signed_duration_since(started_at)
                .num_milliseconds()
                .max(0) as u64,
            total: entries.len(),
            completed,
            failed,
            skipped,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64
            } else {
                0.0
            },
            peak_concurrency,
            waves,
        }
    }
}

impl ExecutionReport {
    pub fn already_running(scope: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scope: scope.into(),
            disposition: RunDisposition::AlreadyRunning,
            mode,
            status: ProcessStatus::Running,
            outcomes: Vec::new(),
            waves: Vec::new(),
            metrics: RunMetrics::default(),
        }
    }

    pub fn is_already_running(&self) -> bool {
        self.disposition == RunDisposition::AlreadyRunning
    }

    pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// True when anything failed or was skipped
    pub fn is_degraded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.is_failed() || o.is_skipped())
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }
}

impl RetryReport {
    pub fn is_noop(&self) -> bool {
        matches!(self, RetryReport::NothingToRetry)
    }

    pub fn recovered(&self) -> usize {
        match self {
            RetryReport::NothingToRetry => 0,
            RetryReport::Retried { recovered, .. } => *recovered,
        }
    }
}

impl ExecutionLog {
    pub fn new(entry: &TaskEntry, kind: LogKind) -> Self {
        Self {
            at: Utc::now(),
            entry_id: entry.id.clone(),
            attempt: entry.attempts,
            kind,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessStatus::Idle => "idle",
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}
