use crate::error::{OrchestratorError, Result};
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::resources::ResourceGrant;
use crate::task::engine::{self, Board, EngineContext, SharedBoard};
use crate::task::events::{EventBus, EventSink};
use crate::task::execution::{Executor, ExecutorChoice, ExecutorSelector};
use crate::task::report::*;
use crate::task::resolver::{DependencyNode, DependencyResolver, NodeState};
use crate::task::types::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry of standalone tasks with direct assignment and wave orchestration
pub struct TaskManager {
    config: TaskManagerConfig,
    board: SharedBoard,
    pool: WorkerPool,
    /// Held shared by `assign_task`, exclusively by orchestration and removal
    gate: RwLock<()>,
    discovery: DashMap<EntryId, TaskDiscovery>,
    default_executor: Option<Arc<dyn Executor>>,
    events: EventBus,
}

/// Configuration for task manager
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Name used as the scope of events and reports
    pub scope: String,
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: Option<u64>,
}

/// Discovery metadata attached to a registered task
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskDiscovery {
    pub description: String,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// Monitoring view of a task manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub scope: String,
    pub orchestrating: bool,
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Completed over finished tasks
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub peak_concurrency: usize,
    pub orchestrations: u32,
    pub last_run: Option<RunMetrics>,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: EntryId,
    pub status: String,
    pub priority: i32,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
    pub discovery: Option<TaskDiscovery>,
}

impl TaskManager {
    /// Create a new task manager
    pub fn new(config: TaskManagerConfig) -> Self {
        let pool = WorkerPool::new(config.max_concurrent_tasks);
        Self {
            config,
            board: Arc::new(RwLock::new(Board::default())),
            pool,
            gate: RwLock::new(()),
            discovery: DashMap::new(),
            default_executor: None,
            events: EventBus::new(),
        }
    }

    /// Executor used by orchestration when no selector picks one
    pub fn with_default_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.default_executor = Some(executor);
        self
    }

    /// Add event sink
    pub fn add_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Register a pending task together with its discovery metadata
    pub async fn add_task(&self, entry: TaskEntry, discovery: TaskDiscovery) -> Result<()> {
        if !entry.is_pending() {
            return Err(OrchestratorError::invalid_state(format!(
                "task {} must be pending to be registered",
                entry.id
            )));
        }

        let id = entry.id.clone();
        self.board.write().await.insert(entry)?;
        self.discovery.insert(id.clone(), discovery);
        debug!("Registered task {} in {}", id, self.config.scope);
        Ok(())
    }

    /// Unregister a task that is not currently running
    pub async fn remove_task(&self, id: &str) -> Result<TaskEntry> {
        let Ok(_exclusive) = self.gate.try_write() else {
            return Err(OrchestratorError::invalid_state(format!(
                "can not remove {id} while tasks are being executed"
            )));
        };

        let mut board = self.board.write().await;
        if board.status == ProcessStatus::Running {
            return Err(OrchestratorError::invalid_state(format!(
                "can not remove {id} during orchestration"
            )));
        }
        let idx = board
            .position(id)
            .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;
        if board.entries[idx].is_running() {
            return Err(OrchestratorError::invalid_state(format!(
                "task {id} is running"
            )));
        }

        let entry = board.entries.remove(idx);
        drop(board);
        self.discovery.remove(id);
        debug!("Removed task {} from {}", id, self.config.scope);
        Ok(entry)
    }

    /// Registered task ids in execution order
    pub async fn prioritize_tasks(&self) -> Vec<EntryId> {
        let board = self.board.read().await;
        DependencyResolver::order_ids(&board.entries)
    }

    /// Run one task right now on the given executor if a slot is free.
    ///
    /// Never waits: a saturated pool, pending dependencies or a running
    /// orchestration come back as a `Queued` outcome.
    pub async fn assign_task(&self, id: &str, executor: Arc<dyn Executor>) -> Result<ItemOutcome> {
        let Ok(_shared) = self.gate.try_read() else {
            return Ok(ItemOutcome::queued(id, QueueReason::OrchestrationInProgress));
        };

        let (idx, slot) = {
            let mut board = self.board.write().await;
            if board.status == ProcessStatus::Running {
                return Ok(ItemOutcome::queued(id, QueueReason::OrchestrationInProgress));
            }
            let idx = board
                .position(id)
                .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;
            if !board.entries[idx].is_pending() {
                return Err(OrchestratorError::invalid_state(format!(
                    "task {} is {} and can not be assigned",
                    id,
                    board.entries[idx].status.label()
                )));
            }

            let unresolvable = DependencyResolver::resolve(&board.entries)
                .unresolvable
                .into_iter()
                .find_map(|(i, reason)| (i == idx).then_some(reason));
            if let Some(reason) = Self::unavailable_dependency(&board.entries, idx).or(unresolvable) {
                let event = board.skip(idx, reason, &self.config.scope)?;
                let outcome = ItemOutcome::from_entry(&board.entries[idx]);
                drop(board);
                self.events.emit(event);
                return Ok(outcome);
            }

            let pending = Self::pending_dependencies(&board.entries, idx);
            if !pending.is_empty() {
                debug!("Task {} waits for {:?}", id, pending);
                return Ok(ItemOutcome::queued(
                    id,
                    QueueReason::AwaitingDependencies { pending },
                ));
            }

            let Some(slot) = self.pool.try_acquire() else {
                debug!("No free slot for task {}", id);
                return Ok(ItemOutcome::queued(
                    id,
                    QueueReason::ConcurrencyLimit {
                        limit: self.pool.size(),
                    },
                ));
            };
            (idx, slot)
        };

        info!("Assigning task {} to executor '{}'", id, executor.name());
        let ctx = self.engine_context(ExecutorChoice::Single(executor), CancellationToken::new());
        engine::run_in_slot(ctx, idx, slot).await?;

        let board = self.board.read().await;
        Ok(ItemOutcome::from_entry(&board.entries[idx]))
    }

    /// Run every pending task in dependency waves.
    ///
    /// The executor for each task comes from `selector`, falling back to the
    /// default executor. A second call while one is in progress returns an
    /// `AlreadyRunning` report.
    pub async fn orchestrate_tasks(
        &self,
        selector: Option<Arc<dyn ExecutorSelector>>,
    ) -> Result<ExecutionReport> {
        let cancel = CancellationToken::new();
        {
            let mut board = self.board.write().await;
            if board.status == ProcessStatus::Running {
                debug!("Orchestration of {} already in progress", self.config.scope);
                return Ok(ExecutionReport::already_running(
                    &self.config.scope,
                    ExecutionMode::Hybrid,
                ));
            }
            board.status = ProcessStatus::Running;
            board.cancel = Some(cancel.clone());
            board.runs += 1;
        }

        // wait for direct assignments to drain
        let _exclusive = self.gate.write().await;
        let started_at = Utc::now();
        self.pool.reset_peak();

        let executors = match selector {
            Some(selector) => ExecutorChoice::Selected {
                selector,
                fallback: self.default_executor.clone(),
            },
            None => ExecutorChoice::Fallback(self.default_executor.clone()),
        };
        info!("Orchestrating tasks of {}", self.config.scope);

        let ctx = self.engine_context(executors, cancel);
        let result = engine::run(&ctx, ExecutionMode::Hybrid).await;

        let mut board = self.board.write().await;
        board.cancel = None;
        let waves = match result {
            Ok(waves) => waves,
            Err(e) => {
                board.status = ProcessStatus::Failed;
                return Err(e);
            }
        };

        let metrics = RunMetrics::from_entries(
            &board.entries,
            started_at,
            Utc::now(),
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

        if metrics.failed > 0 {
            warn!(
                "Orchestration of {} finished with {} failed tasks",
                self.config.scope, metrics.failed
            );
        }

        Ok(ExecutionReport {
            run_id: uuid::Uuid::new_v4(),
            scope: self.config.scope.clone(),
            disposition: RunDisposition::Executed,
            mode: ExecutionMode::Hybrid,
            status: board.status,
            outcomes: board.outcomes(),
            waves,
            metrics,
        })
    }

    /// Re-attempt failed tasks, at most `max_retries` attempts each
    pub async fn retry_failed(
        &self,
        max_retries: u32,
        selector: Option<Arc<dyn ExecutorSelector>>,
    ) -> Result<RetryReport> {
        let cancel = CancellationToken::new();
        {
            let mut board = self.board.write().await;
            if board.status == ProcessStatus::Running {
                return Err(OrchestratorError::invalid_state(format!(
                    "orchestration of {} is in progress",
                    self.config.scope
                )));
            }
            if !board.has_failures() {
                return Ok(RetryReport::NothingToRetry);
            }
            board.status = ProcessStatus::Running;
            board.cancel = Some(cancel.clone());
        }

        let _exclusive = self.gate.write().await;
        let executors = match selector {
            Some(selector) => ExecutorChoice::Selected {
                selector,
                fallback: self.default_executor.clone(),
            },
            None => ExecutorChoice::Fallback(self.default_executor.clone()),
        };
        let ctx = self.engine_context(executors, cancel);
        let result = engine::retry_failed(&ctx, max_retries).await;

        let mut board = self.board.write().await;
        board.cancel = None;
        board.status = if result.is_err() || board.has_failures() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
        result
    }

    /// Stop dispatching further waves of the current orchestration
    pub async fn cancel(&self) -> bool {
        let board = self.board.read().await;
        board.cancel.as_ref().map(CancellationToken::cancel).is_some()
    }

    pub async fn task(&self, id: &str) -> Option<TaskEntry> {
        let board = self.board.read().await;
        board.position(id).map(|i| board.entries[i].clone())
    }

    pub async fn tasks(&self) -> Vec<TaskEntry> {
        self.board.read().await.entries.clone()
    }

    pub fn discovery(&self, id: &str) -> Option<TaskDiscovery> {
        self.discovery.get(id).map(|d| d.value().clone())
    }

    /// Ids of tasks advertising `capability`
    pub fn find_by_capability(&self, capability: &str) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .discovery
            .iter()
            .filter(|d| d.value().capabilities.iter().any(|c| c == capability))
            .map(|d| d.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn logs(&self) -> Vec<ExecutionLog> {
        self.board.read().await.logs.clone()
    }

    /// Success rate, average duration and per-task status
    pub async fn get_monitoring_data(&self) -> ManagerSnapshot {
        let board = self.board.read().await;
        let entries = &board.entries;

        let completed = entries.iter().filter(|e| e.is_completed()).count();
        let failed = entries.iter().filter(|e| e.is_failed()).count();
        let skipped = entries.iter().filter(|e| e.is_skipped()).count();
        let finished = completed + failed + skipped;

        let durations: Vec<u64> = entries
            .iter()
            .filter(|e| e.is_completed())
            .filter_map(TaskEntry::duration_ms)
            .collect();
        let average_duration_ms = (!durations.is_empty())
            .then(|| durations.iter().sum::<u64>() as f64 / durations.len() as f64);

        ManagerSnapshot {
            scope: self.config.scope.clone(),
            orchestrating: board.status == ProcessStatus::Running,
            total_tasks: entries.len(),
            pending: entries.iter().filter(|e| e.is_pending()).count(),
            running: entries.iter().filter(|e| e.is_running()).count(),
            completed,
            failed,
            skipped,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64
            } else {
                0.0
            },
            average_duration_ms,
            max_concurrent: self.pool.size(),
            in_flight: self.pool.in_flight(),
            peak_concurrency: self.pool.peak(),
            orchestrations: board.runs,
            last_run: board.last_run.clone(),
            tasks: entries
                .iter()
                .map(|e| TaskSummary {
                    id: e.id.clone(),
                    status: e.status.label().to_string(),
                    priority: e.priority,
                    attempts: e.attempts,
                    duration_ms: e.duration_ms(),
                    discovery: self.discovery(&e.id),
                })
                .collect(),
        }
    }

    /// Export the monitoring snapshot as pretty JSON
    pub async fn export_to_json(&self) -> Result<String> {
        let snapshot = self.get_monitoring_data().await;
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Validate registry integrity
    pub async fn validate_integrity(&self) -> Vec<String> {
        let board = self.board.read().await;
        let mut issues = Vec::new();

        for entry in &board.entries {
            for dep in &entry.dependencies {
                if board.position(dep).is_none() {
                    issues.push(format!(
                        "Task {} depends on unknown task {}",
                        entry.id, dep
                    ));
                }
            }
        }

        for id in DependencyResolver::cycle_members(&board.entries) {
            issues.push(format!("Task {} has circular dependency", id));
        }

        issues
    }

    fn engine_context(&self, executors: ExecutorChoice, cancel: CancellationToken) -> EngineContext {
        EngineContext {
            board: self.board.clone(),
            pool: self.pool.clone(),
            executors,
            events: self.events.clone(),
            scope: self.config.scope.clone(),
            timeout: self.config.task_timeout_secs.map(Duration::from_secs),
            grant: ResourceGrant::none(),
            cancel,
        }
    }

    /// First dependency that is missing, failed or skipped
    fn unavailable_dependency(entries: &[TaskEntry], idx: usize) -> Option<SkipReason> {
        entries[idx].dependencies.iter().find_map(|dep| {
            match entries.iter().find(|e| &e.id == dep) {
                None => Some(SkipReason::MissingDependency {
                    dependency: dep.clone(),
                }),
                Some(e) if e.node_state() == NodeState::Unavailable => {
                    Some(SkipReason::DependencyUnavailable {
                        dependency: dep.clone(),
                    })
                }
                Some(_) => None,
            }
        })
    }

    fn pending_dependencies(entries: &[TaskEntry], idx: usize) -> Vec<EntryId> {
        entries[idx]
            .dependencies
            .iter()
            .filter(|dep| {
                entries
                    .iter()
                    .any(|e| &e.id == *dep && !e.is_completed())
            })
            .cloned()
            .collect()
    }
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            scope: "tasks".to_string(),
            max_concurrent_tasks: 3,
            task_timeout_secs: None,
        }
    }
}

impl TaskDiscovery {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for TaskDiscovery {
    fn default() -> Self {
        Self::new("")
    }
}
