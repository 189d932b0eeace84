use crate::error::{OrchestratorError, Result};
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::resources::{ResourceGrant, Resources};
use crate::task::engine::{self, Board, EngineContext, SharedBoard};
use crate::task::events::{EventBus, EventSink, OrchestratorEvent};
use crate::task::execution::{Executor, ExecutorChoice};
use crate::task::report::*;
use crate::task::resolver::{DependencyNode, NodeState};
use crate::task::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of workers a process runs entries on
pub const DEFAULT_PROCESS_WORKERS: usize = 4;

/// A bundle of task entries executed together under one mode
pub struct Process {
    id: String,
    name: String,
    mode: ExecutionMode,
    priority: i32,
    dependencies: Vec<String>,
    resource_request: Option<Resources>,
    task_timeout: Option<Duration>,
    executor: Arc<dyn Executor>,
    pool: WorkerPool,
    events: EventBus,
    board: SharedBoard,
    created_at: DateTime<Utc>,
}

/// Read-only view of a process for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub name: String,
    pub mode: ExecutionMode,
    pub status: ProcessStatus,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub runs: u32,
    pub total_entries: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub max_workers: usize,
    pub in_flight: usize,
    pub last_run: Option<RunMetrics>,
    pub waves: Vec<WaveRecord>,
    pub resources: Option<ResourceGrant>,
    pub entries: Vec<EntrySnapshot>,
    pub log_lines: usize,
    pub created_at: DateTime<Utc>,
}

/// Per-entry line of a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: String,
    pub status: String,
    pub priority: i32,
    pub attempts: u32,
    pub dependencies: Vec<String>,
    pub duration_ms: Option<u64>,
}

/// Dependency-graph view of a process used by the scheduler
#[derive(Debug, Clone)]
pub struct ProcessNode {
    pub id: String,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub state: NodeState,
}

impl DependencyNode for ProcessNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn node_dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn node_priority(&self) -> i32 {
        self.priority
    }

    fn node_state(&self) -> NodeState {
        self.state
    }
}

impl Process {
    /// Create an empty, idle process
    pub fn new(id: impl Into<String>, mode: ExecutionMode, executor: Arc<dyn Executor>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            mode,
            priority: 0,
            dependencies: Vec::new(),
            resource_request: None,
            task_timeout: None,
            executor,
            pool: WorkerPool::new(DEFAULT_PROCESS_WORKERS),
            events: EventBus::new(),
            board: Arc::new(RwLock::new(Board::default())),
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Size of the worker pool entries run on
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.pool = WorkerPool::new(workers);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Processes that must complete before the scheduler runs this one
    pub fn depends_on<I, S>(mut self, processes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(processes.into_iter().map(Into::into));
        self
    }

    /// Resources to request from a scheduler instead of its default slice
    pub fn with_resource_request(mut self, request: Resources) -> Self {
        self.resource_request = Some(request);
        self
    }

    /// Per-entry time limit; an entry exceeding it fails with a timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events.add_sink(sink);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn resource_request(&self) -> Option<Resources> {
        self.resource_request
    }

    pub fn max_workers(&self) -> usize {
        self.pool.size()
    }

    pub async fn status(&self) -> ProcessStatus {
        self.board.read().await.status
    }

    pub async fn entries(&self) -> Vec<TaskEntry> {
        self.board.read().await.entries.clone()
    }

    pub async fn entry(&self, id: &str) -> Option<TaskEntry> {
        let board = self.board.read().await;
        board.position(id).map(|i| board.entries[i].clone())
    }

    pub async fn logs(&self) -> Vec<ExecutionLog> {
        self.board.read().await.logs.clone()
    }

    /// Append an entry; only allowed while the process is idle
    pub async fn add_task(&self, entry: TaskEntry) -> Result<()> {
        let mut board = self.board.write().await;
        if board.status != ProcessStatus::Idle {
            return Err(OrchestratorError::invalid_state(format!(
                "process {} is {}; tasks can only be added while idle",
                self.id, board.status
            )));
        }
        debug!("Adding entry {} to process {}", entry.id, self.id);
        board.insert(entry)
    }

    /// Run every entry according to the execution mode.
    ///
    /// Returns an `AlreadyRunning` report without side effects if another
    /// `execute` or `retry_failed` is in progress.
    pub async fn execute(&self, resources: ResourceGrant) -> Result<ExecutionReport> {
        let cancel = CancellationToken::new();
        let started_at = Utc::now();
        {
            let mut board = self.board.write().await;
            match board.status {
                ProcessStatus::Running => {
                    debug!("Process {} already running; ignoring execute", self.id);
                    return Ok(ExecutionReport::already_running(&self.id, self.mode));
                }
                ProcessStatus::Completed | ProcessStatus::Failed => {
                    return Err(OrchestratorError::invalid_state(format!(
                        "process {} has already run ({}); reset it first",
                        self.id, board.status
                    )));
                }
                ProcessStatus::Idle => {}
            }
            board.status = ProcessStatus::Running;
            board.cancel = Some(cancel.clone());
            board.grant = Some(resources.clone());
            board.waves.clear();
            board.runs += 1;
        }

        info!(
            "Executing process {} ({} mode, {} workers)",
            self.id,
            self.mode,
            self.pool.size()
        );
        self.pool.reset_peak();
        self.events.emit(OrchestratorEvent::ProcessStarted {
            process_id: self.id.clone(),
        });

        let ctx = self.engine_context(resources, cancel);
        let result = engine::run(&ctx, self.mode).await;

        let mut board = self.board.write().await;
        board.cancel = None;
        let finished_at = Utc::now();

        let waves = match result {
            Ok(waves) => waves,
            Err(e) => {
                board.status = ProcessStatus::Failed;
                drop(board);
                error!("Process {} aborted: {}", self.id, e);
                self.emit_finished(ProcessStatus::Failed, started_at, finished_at);
                return Err(e);
            }
        };

        let metrics = RunMetrics::from_entries(
            &board.entries,
            started_at,
            finished_at,
            self.pool.peak(),
            waves.len(),
        );
        board.status = if board.has_failures() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
        board.last_run = Some(metrics.clone());
        board.waves = waves.clone();

        let report = ExecutionReport {
            run_id: uuid::Uuid::new_v4(),
            scope: self.id.clone(),
            disposition: RunDisposition::Executed,
            mode: self.mode,
            status: board.status,
            outcomes: board.outcomes(),
            waves,
            metrics,
        };
        drop(board);

        if report.status == ProcessStatus::Failed {
            warn!(
                "Process {} finished with {} failed entries",
                self.id, report.metrics.failed
            );
        }
        self.emit_finished(report.status, started_at, finished_at);
        Ok(report)
    }

    /// Re-attempt failed entries, at most `max_retries` attempts each.
    ///
    /// Entries skipped because of the original failure stay skipped.
    pub async fn retry_failed(&self, max_retries: u32) -> Result<RetryReport> {
        self.retry_with_grant(max_retries, None).await
    }

    /// Retry under a fresh grant, or the one from the last run when `None`
    pub(crate) async fn retry_with_grant(
        &self,
        max_retries: u32,
        grant: Option<ResourceGrant>,
    ) -> Result<RetryReport> {
        let cancel = CancellationToken::new();
        let resources = {
            let mut board = self.board.write().await;
            if board.status == ProcessStatus::Running {
                return Err(OrchestratorError::invalid_state(format!(
                    "process {} is running; retry after it finishes",
                    self.id
                )));
            }
            if !board.has_failures() {
                return Ok(RetryReport::NothingToRetry);
            }
            board.status = ProcessStatus::Running;
            board.cancel = Some(cancel.clone());
            if grant.is_some() {
                board.grant = grant;
            }
            board.grant.clone().unwrap_or_default()
        };

        let ctx = self.engine_context(resources, cancel);
        let result = engine::retry_failed(&ctx, max_retries).await;

        let mut guard = self.board.write().await;
        let board = &mut *guard;
        board.cancel = None;
        board.status = if result.is_err() || board.has_failures() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
        if let Some(metrics) = board.last_run.as_mut() {
            *metrics = RunMetrics::from_entries(
                &board.entries,
                metrics.started_at.unwrap_or_else(Utc::now),
                Utc::now(),
                metrics.peak_concurrency.max(self.pool.peak()),
                metrics.waves,
            );
        }
        let status = board.status;
        drop(guard);

        info!("Retry of process {} finished: {}", self.id, status);
        result
    }

    /// Stop dispatching new entries in the current run.
    ///
    /// In-flight entries finish; entries not yet started become skipped.
    /// Returns false when nothing is running.
    pub async fn cancel(&self) -> bool {
        let board = self.board.read().await;
        match &board.cancel {
            Some(token) => {
                info!("Cancelling process {}", self.id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Return to `Idle` with every entry pending again; logs are kept
    pub async fn reset(&self) -> Result<()> {
        let mut board = self.board.write().await;
        if board.status == ProcessStatus::Running {
            return Err(OrchestratorError::invalid_state(format!(
                "process {} is running and can not be reset",
                self.id
            )));
        }
        for entry in board.entries.iter_mut() {
            entry.reset();
        }
        board.status = ProcessStatus::Idle;
        board.waves.clear();
        board.grant = None;
        debug!("Reset process {}", self.id);
        Ok(())
    }

    /// Snapshot of status, counts, timings and resource usage
    pub async fn get_monitoring_data(&self) -> ProcessSnapshot {
        let board = self.board.read().await;
        let count = |pred: fn(&TaskEntry) -> bool| board.entries.iter().filter(|e| pred(e)).count();

        ProcessSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            mode: self.mode,
            status: board.status,
            priority: self.priority,
            dependencies: self.dependencies.clone(),
            runs: board.runs,
            total_entries: board.entries.len(),
            pending: count(TaskEntry::is_pending),
            running: count(TaskEntry::is_running),
            completed: count(TaskEntry::is_completed),
            failed: count(TaskEntry::is_failed),
            skipped: count(TaskEntry::is_skipped),
            max_workers: self.pool.size(),
            in_flight: self.pool.in_flight(),
            last_run: board.last_run.clone(),
            waves: board.waves.clone(),
            resources: board.grant.clone(),
            entries: board
                .entries
                .iter()
                .map(|e| EntrySnapshot {
                    id: e.id.clone(),
                    status: e.status.label().to_string(),
                    priority: e.priority,
                    attempts: e.attempts,
                    dependencies: e.dependencies.clone(),
                    duration_ms: e.duration_ms(),
                })
                .collect(),
            log_lines: board.logs.len(),
            created_at: self.created_at,
        }
    }

    /// Graph node for scheduler-level dependency resolution
    pub async fn node(&self) -> ProcessNode {
        let state = match self.status().await {
            ProcessStatus::Idle => NodeState::Pending,
            ProcessStatus::Running => NodeState::Running,
            ProcessStatus::Completed => NodeState::Completed,
            ProcessStatus::Failed => NodeState::Unavailable,
        };
        ProcessNode {
            id: self.id.clone(),
            dependencies: self.dependencies.clone(),
            priority: self.priority,
            state,
        }
    }

    fn engine_context(&self, grant: ResourceGrant, cancel: CancellationToken) -> EngineContext {
        EngineContext {
            board: self.board.clone(),
            pool: self.pool.clone(),
            executors: ExecutorChoice::Single(self.executor.clone()),
            events: self.events.clone(),
            scope: self.id.clone(),
            timeout: self.task_timeout,
            grant,
            cancel,
        }
    }

    fn emit_finished(&self, status: ProcessStatus, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        self.events.emit(OrchestratorEvent::ProcessFinished {
            process_id: self.id.clone(),
            status: status.to_string(),
            elapsed_ms: finished_at
                .signed_duration_since(started_at)
                .num_milliseconds()
                .max(0) as u64,
        });
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("executor", &self.executor.name())
            .finish()
    }
}
