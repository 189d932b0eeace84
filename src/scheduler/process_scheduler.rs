//! Process scheduler.
//!
//! Runs registered processes under a global concurrency cap and a resource
//! ledger. Every run holds a [`ProcessLease`] (worker slot, resource grant and
//! running-set membership) that is returned when the lease drops, whether the
//! run succeeded, failed or errored.

use crate::error::{OrchestratorError, Result};
use crate::scheduler::pool::{WorkerPool, WorkerSlot};
use crate::scheduler::resources::{ResourceGrant, ResourceLedger, Resources};
use crate::task::events::{EventBus, EventSink, OrchestratorEvent};
use crate::task::process::{Process, ProcessNode, ProcessSnapshot};
use crate::task::report::{ExecutionReport, ProcessStatus, RetryReport};
use crate::task::resolver::{DependencyResolver, NodeState};
use crate::task::types::{ExecutionMode, Payload, SkipReason};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Callback registered for a named event type
pub type EventListener = Arc<dyn Fn(&SchedulerEvent) -> anyhow::Result<()> + Send + Sync>;

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of processes running at once
    pub max_concurrent: usize,
    /// Total resources the ledger starts with
    pub resources: Resources,
    /// Fraction of capacity granted to a process without its own request
    pub allocation_slice: f64,
}

/// Named event delivered to listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerEvent {
    pub event_type: String,
    pub payload: Payload,
    pub raised_at: DateTime<Utc>,
}

/// How a scheduled process ended up
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum ProcessRunState {
    Completed,
    /// Some entries failed, or `error` aborted the run
    Failed { error: Option<String> },
    Skipped { reason: SkipReason },
    /// Another run of the same process was in progress
    AlreadyRunning,
    /// Not idle when scheduled; reset it to run it again
    NotIdle { status: ProcessStatus },
    Unknown,
}

/// Per-process line of a schedule report
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub process_id: String,
    pub state: ProcessRunState,
    /// No worker slot was free at dispatch time
    pub queued: bool,
    pub grant: Option<ResourceGrant>,
    pub report: Option<ExecutionReport>,
}

/// Result of one scheduling strategy call
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub strategy: ExecutionMode,
    pub outcomes: Vec<ProcessOutcome>,
    /// Process ids per hybrid wave
    pub waves: Vec<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub peak_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListenerFailure {
    /// Position of the listener in registration order
    pub listener: usize,
    pub message: String,
    pub panicked: bool,
}

/// What happened when an event was delivered
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventDispatchReport {
    pub event_type: String,
    pub delivered: usize,
    pub failures: Vec<ListenerFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDrivenReport {
    pub outcome: ProcessOutcome,
    pub dispatch: EventDispatchReport,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum IterationStop {
    ConditionFalse,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterativeReport {
    pub process_id: String,
    pub iterations: Vec<ProcessOutcome>,
    pub stopped_by: IterationStop,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecovery {
    pub process_id: String,
    pub status: ProcessStatus,
    pub retry: Option<RetryReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RecoveryReport {
    pub processes: Vec<ProcessRecovery>,
}

/// Monitoring view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub active: bool,
    pub max_concurrent: usize,
    pub running: Vec<String>,
    pub in_flight: usize,
    pub peak_concurrency: usize,
    pub capacity: Resources,
    pub available: Resources,
    pub outstanding_grants: usize,
    pub cpu_utilization: f64,
    pub listeners: usize,
    pub processes: Vec<ProcessSnapshot>,
}

struct SchedulerState {
    processes: HashMap<String, Arc<Process>>,
    order: Vec<String>,
    running: HashSet<String>,
    ledger: ResourceLedger,
    listeners: HashMap<String, Vec<EventListener>>,
}

/// Slot, grant and running-set membership of one process run
struct ProcessLease {
    process_id: String,
    grant: ResourceGrant,
    state: Arc<Mutex<SchedulerState>>,
    _slot: WorkerSlot,
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.ledger.release(&self.grant);
        state.running.remove(&self.process_id);
        debug!("Released lease of process {}", self.process_id);
    }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Targets of one strategy call; `nodes[..processes.len()]` mirror
/// `processes`, the rest are registered processes referenced as dependencies
struct Plan {
    processes: Vec<Arc<Process>>,
    nodes: Vec<ProcessNode>,
    outcomes: Vec<ProcessOutcome>,
}

impl Plan {
    fn is_target(&self, idx: usize) -> bool {
        idx < self.processes.len()
    }

    fn skip(&mut self, idx: usize, reason: SkipReason) {
        info!("Skipping process {}: {}", self.nodes[idx].id, reason);
        self.nodes[idx].state = NodeState::Unavailable;
        self.outcomes
            .push(ProcessOutcome::without_run(&self.nodes[idx].id, ProcessRunState::Skipped { reason }));
    }

    fn record(&mut self, idx: usize, outcome: ProcessOutcome) {
        self.nodes[idx].state = if outcome.state == ProcessRunState::Completed {
            NodeState::Completed
        } else {
            NodeState::Unavailable
        };
        self.outcomes.push(outcome);
    }

    /// Skip pending targets whose dependencies can no longer complete
    fn propagate_skips(&mut self) {
        loop {
            let blocked: Vec<(usize, SkipReason)> = DependencyResolver::blocked(&self.nodes)
                .into_iter()
                .filter(|(idx, _)| self.is_target(*idx))
                .collect();
            if blocked.is_empty() {
                return;
            }
            for (idx, reason) in blocked {
                self.skip(idx, reason);
            }
        }
    }

    fn ready(&self) -> Vec<usize> {
        DependencyResolver::ready_set(&self.nodes)
            .into_iter()
            .filter(|&idx| self.is_target(idx))
            .collect()
    }
}

/// Schedules processes with a concurrency cap and a resource ledger
pub struct ProcessScheduler {
    config: SchedulerConfig,
    active: AtomicBool,
    state: Arc<Mutex<SchedulerState>>,
    pool: WorkerPool,
    events: EventBus,
}

impl ProcessScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let state = SchedulerState {
            processes: HashMap::new(),
            order: Vec::new(),
            running: HashSet::new(),
            ledger: ResourceLedger::new(config.resources),
            listeners: HashMap::new(),
        };
        Self {
            pool: WorkerPool::new(config.max_concurrent),
            config,
            active: AtomicBool::new(true),
            state: Arc::new(Mutex::new(state)),
            events: EventBus::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events.add_sink(sink);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Re-enable a scheduler after `shutdown`
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        info!("Process scheduler activated");
    }

    /// Refuse further operations and cancel running processes.
    ///
    /// In-flight entries finish; their leases are released as they do.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let running: Vec<Arc<Process>> = {
            let state = lock(&self.state);
            state
                .running
                .iter()
                .filter_map(|id| state.processes.get(id).cloned())
                .collect()
        };
        for process in &running {
            process.cancel().await;
        }
        info!(
            "Process scheduler shut down ({} running processes cancelled)",
            running.len()
        );
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(OrchestratorError::SchedulerInactive)
        }
    }

    /// Register a process; returns the shared handle
    pub fn add_process(&self, process: Process) -> Result<Arc<Process>> {
        self.ensure_active()?;
        let process = Arc::new(process);
        let mut state = lock(&self.state);
        if state.processes.contains_key(process.id()) {
            return Err(OrchestratorError::DuplicateId(process.id().to_string()));
        }
        state.order.push(process.id().to_string());
        state
            .processes
            .insert(process.id().to_string(), process.clone());
        debug!("Registered process {}", process.id());
        Ok(process)
    }

    /// Unregister a process that is not running
    pub async fn remove_process(&self, id: &str) -> Result<Arc<Process>> {
        self.ensure_active()?;
        let process = self.process(id)?;
        if process.status().await == ProcessStatus::Running {
            return Err(OrchestratorError::invalid_state(format!(
                "process {id} is running"
            )));
        }

        let mut state = lock(&self.state);
        if state.running.contains(id) {
            return Err(OrchestratorError::invalid_state(format!(
                "process {id} is running"
            )));
        }
        state.order.retain(|p| p != id);
        state
            .processes
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownProcess(id.to_string()))
    }

    pub fn process(&self, id: &str) -> Result<Arc<Process>> {
        lock(&self.state)
            .processes
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProcess(id.to_string()))
    }

    /// Registered processes in registration order
    pub fn processes(&self) -> Vec<Arc<Process>> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .filter_map(|id| state.processes.get(id).cloned())
            .collect()
    }

    /// Run the targets with the given strategy
    pub async fn schedule(&self, strategy: ExecutionMode, ids: Option<&[String]>) -> Result<ScheduleReport> {
        match strategy {
            ExecutionMode::Sequential => self.schedule_sequential(ids).await,
            ExecutionMode::Parallel => self.schedule_parallel(ids).await,
            ExecutionMode::Hybrid => self.schedule_hybrid(ids).await,
        }
    }

    /// One process at a time, in dependency then priority order
    pub async fn schedule_sequential(&self, ids: Option<&[String]>) -> Result<ScheduleReport> {
        let started_at = Utc::now();
        let mut plan = self.plan(ids).await?;
        let order = self.skip_unresolvable(&mut plan);

        for idx in order {
            if !plan.is_target(idx) || plan.nodes[idx].state != NodeState::Pending {
                continue;
            }
            if !self.is_active() {
                break;
            }
            if let Some(reason) = DependencyResolver::first_unmet(&plan.nodes, idx) {
                plan.skip(idx, reason);
                continue;
            }

            let slot = self.pool.try_acquire();
            let outcome = self.dispatch(plan.processes[idx].clone(), slot).await;
            plan.record(idx, outcome);
        }

        Ok(self.finish(plan, ExecutionMode::Sequential, Vec::new(), started_at))
    }

    /// Every ready process dispatched at once; dependents follow as their
    /// dependencies complete
    pub async fn schedule_parallel(&self, ids: Option<&[String]>) -> Result<ScheduleReport> {
        let started_at = Utc::now();
        let mut plan = self.plan(ids).await?;
        self.skip_unresolvable(&mut plan);

        let mut in_flight = FuturesUnordered::new();
        loop {
            if self.is_active() {
                plan.propagate_skips();
                for idx in plan.ready() {
                    plan.nodes[idx].state = NodeState::Running;
                    let process = plan.processes[idx].clone();
                    let slot = self.pool.try_acquire();
                    in_flight.push(async move { (idx, self.dispatch(process, slot).await) });
                }
            }

            match in_flight.next().await {
                Some((idx, outcome)) => plan.record(idx, outcome),
                None => break,
            }
        }

        Ok(self.finish(plan, ExecutionMode::Parallel, Vec::new(), started_at))
    }

    /// Dependency waves: each wave is the ready set, run together
    pub async fn schedule_hybrid(&self, ids: Option<&[String]>) -> Result<ScheduleReport> {
        let started_at = Utc::now();
        let mut plan = self.plan(ids).await?;
        self.skip_unresolvable(&mut plan);
        let mut waves = Vec::new();

        while self.is_active() {
            plan.propagate_skips();
            let ready = plan.ready();
            if ready.is_empty() {
                break;
            }

            let wave: Vec<String> = ready.iter().map(|&i| plan.nodes[i].id.clone()).collect();
            debug!("Process wave {}: {:?}", waves.len(), wave);
            for &idx in &ready {
                plan.nodes[idx].state = NodeState::Running;
            }

            let dispatches: Vec<_> = ready
                .iter()
                .map(|&idx| {
                    let process = plan.processes[idx].clone();
                    let slot = self.pool.try_acquire();
                    async move { (idx, self.dispatch(process, slot).await) }
                })
                .collect();
            for (idx, outcome) in join_all(dispatches).await {
                plan.record(idx, outcome);
            }
            waves.push(wave);
        }

        Ok(self.finish(plan, ExecutionMode::Hybrid, waves, started_at))
    }

    /// Run the process only if `condition` holds now
    pub async fn execute_conditional<F>(&self, id: &str, condition: F) -> Result<ProcessOutcome>
    where
        F: FnOnce() -> bool,
    {
        self.ensure_active()?;
        let process = self.process(id)?;
        if !condition() {
            debug!("Condition for process {} not met", id);
            return Ok(ProcessOutcome::without_run(
                id,
                ProcessRunState::Skipped {
                    reason: SkipReason::ConditionNotMet,
                },
            ));
        }
        Ok(self.dispatch(process, self.pool.try_acquire()).await)
    }

    /// Run the process, then hand `event` to the listeners of its type
    pub async fn execute_event_driven(&self, event: SchedulerEvent, id: &str) -> Result<EventDrivenReport> {
        self.ensure_active()?;
        let process = self.process(id)?;
        info!("Process {} triggered by event '{}'", id, event.event_type);
        let outcome = self.dispatch(process, self.pool.try_acquire()).await;
        let dispatch = self.trigger_event(&event)?;
        Ok(EventDrivenReport { outcome, dispatch })
    }

    /// Re-run the process while `condition(iteration)` holds, at most
    /// `max_iterations` times. The process is reset before every run after
    /// the first, and before the first if it has already run.
    pub async fn execute_iterative<F>(
        &self,
        id: &str,
        mut condition: F,
        max_iterations: u32,
    ) -> Result<IterativeReport>
    where
        F: FnMut(u32) -> bool,
    {
        self.ensure_active()?;
        let process = self.process(id)?;
        let mut iterations = Vec::new();
        let mut stopped_by = IterationStop::MaxIterations;

        for iteration in 0..max_iterations {
            if !self.is_active() {
                return Err(OrchestratorError::SchedulerInactive);
            }
            if !condition(iteration) {
                stopped_by = IterationStop::ConditionFalse;
                break;
            }
            if process.status().await != ProcessStatus::Idle {
                process.reset().await?;
            }
            debug!("Process {} iteration {}", id, iteration);
            let outcome = self.dispatch(process.clone(), self.pool.try_acquire()).await;
            iterations.push(outcome);
        }

        info!(
            "Process {} ran {} iterations ({:?})",
            id,
            iterations.len(),
            stopped_by
        );
        Ok(IterativeReport {
            process_id: id.to_string(),
            iterations,
            stopped_by,
        })
    }

    pub fn register_event_listener<F>(&self, event_type: impl Into<String>, listener: F) -> Result<()>
    where
        F: Fn(&SchedulerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let event_type = event_type.into();
        debug!("Registering listener for '{}'", event_type);
        lock(&self.state)
            .listeners
            .entry(event_type)
            .or_default()
            .push(Arc::new(listener));
        Ok(())
    }

    /// Deliver `event` to its listeners; their errors and panics are
    /// collected, never propagated
    pub fn trigger_event(&self, event: &SchedulerEvent) -> Result<EventDispatchReport> {
        self.ensure_active()?;
        let listeners = lock(&self.state)
            .listeners
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Listener {} for '{}' failed: {:#}", index, event.event_type, e);
                    failures.push(ListenerFailure {
                        listener: index,
                        message: format!("{e:#}"),
                        panicked: false,
                    });
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|m| m.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!("Listener {} for '{}' panicked: {}", index, event.event_type, message);
                    failures.push(ListenerFailure {
                        listener: index,
                        message,
                        panicked: true,
                    });
                }
            }
        }

        Ok(EventDispatchReport {
            event_type: event.event_type.clone(),
            delivered: listeners.len(),
            failures,
        })
    }

    /// Retry failed entries of every failed process, concurrently within
    /// the scheduler's concurrency cap
    pub async fn recover_failed_processes(&self, max_retries: u32) -> Result<RecoveryReport> {
        self.ensure_active()?;
        let mut failed = Vec::new();
        for process in self.processes() {
            if process.status().await == ProcessStatus::Failed {
                failed.push(process);
            }
        }
        if failed.is_empty() {
            debug!("No failed processes to recover");
            return Ok(RecoveryReport::default());
        }
        info!("Recovering {} failed processes", failed.len());

        let processes = join_all(failed.iter().map(|process| async move {
            let result = match self.pool.acquire().await {
                Ok(slot) => {
                    let lease = self.lease(process, slot);
                    let grant = lease.grant.clone();
                    let result = process.retry_with_grant(max_retries, Some(grant)).await;
                    drop(lease);
                    result
                }
                Err(e) => Err(e),
            };
            let status = process.status().await;
            let (retry, error) = match result {
                Ok(retry) => (Some(retry), None),
                Err(e) => (None, Some(e.to_string())),
            };
            ProcessRecovery {
                process_id: process.id().to_string(),
                status,
                retry,
                error,
            }
        }))
        .await;

        Ok(RecoveryReport { processes })
    }

    /// Reserve the process's request, or the default slice of capacity
    pub fn allocate_resources(&self, id: &str) -> Result<ResourceGrant> {
        self.ensure_active()?;
        let process = self.process(id)?;
        let mut state = lock(&self.state);
        Ok(self.allocate_locked(&mut state, &process))
    }

    /// Return a grant to the ledger; returns the amount given back.
    ///
    /// Fails with `InvalidState` if the grant is unknown or was already
    /// released.
    pub fn release_resources(&self, grant: &ResourceGrant) -> Result<Resources> {
        self.ensure_active()?;
        lock(&self.state).ledger.release(grant).ok_or_else(|| {
            warn!("Ignoring release of grant {} that is not outstanding", grant.id);
            OrchestratorError::invalid_state(format!("grant {} is not outstanding", grant.id))
        })
    }

    pub fn available_resources(&self) -> Resources {
        lock(&self.state).ledger.available()
    }

    /// Ids of processes currently holding a lease
    pub fn running_processes(&self) -> Vec<String> {
        let mut running: Vec<String> = lock(&self.state).running.iter().cloned().collect();
        running.sort();
        running
    }

    /// Highest number of simultaneously running processes observed
    pub fn peak_concurrency(&self) -> usize {
        self.pool.peak()
    }

    pub async fn get_monitoring_data(&self) -> SchedulerSnapshot {
        let processes = self.processes();
        let snapshots = join_all(processes.iter().map(|p| p.get_monitoring_data())).await;

        let state = lock(&self.state);
        let mut running: Vec<String> = state.running.iter().cloned().collect();
        running.sort();

        SchedulerSnapshot {
            active: self.is_active(),
            max_concurrent: self.pool.size(),
            running,
            in_flight: self.pool.in_flight(),
            peak_concurrency: self.pool.peak(),
            capacity: state.ledger.capacity(),
            available: state.ledger.available(),
            outstanding_grants: state.ledger.outstanding(),
            cpu_utilization: state.ledger.cpu_utilization(),
            listeners: state.listeners.values().map(Vec::len).sum(),
            processes: snapshots,
        }
    }

    fn allocate_locked(&self, state: &mut SchedulerState, process: &Process) -> ResourceGrant {
        let request = process
            .resource_request()
            .unwrap_or_else(|| state.ledger.capacity().scaled(self.config.allocation_slice));
        let grant = state.ledger.allocate(request);
        if grant.clamped {
            warn!(
                "Process {} granted {:?} of requested {:?}",
                process.id(),
                grant.granted,
                grant.requested
            );
        }
        grant
    }

    fn lease(&self, process: &Process, slot: WorkerSlot) -> ProcessLease {
        let mut state = lock(&self.state);
        state.running.insert(process.id().to_string());
        let grant = self.allocate_locked(&mut state, process);
        ProcessLease {
            process_id: process.id().to_string(),
            grant,
            state: self.state.clone(),
            _slot: slot,
        }
    }

    /// Run one process under a lease, waiting for a slot if none was free
    async fn dispatch(&self, process: Arc<Process>, slot: Option<WorkerSlot>) -> ProcessOutcome {
        let queued = slot.is_none();
        let slot = match slot {
            Some(slot) => slot,
            None => {
                debug!("Process {} queued for a worker slot", process.id());
                self.events.emit(OrchestratorEvent::ProcessQueued {
                    process_id: process.id().to_string(),
                });
                match self.pool.acquire().await {
                    Ok(slot) => slot,
                    Err(e) => {
                        return ProcessOutcome {
                            process_id: process.id().to_string(),
                            state: ProcessRunState::Failed {
                                error: Some(e.to_string()),
                            },
                            queued,
                            grant: None,
                            report: None,
                        };
                    }
                }
            }
        };

        let lease = self.lease(&process, slot);
        let grant = lease.grant.clone();
        let result = process.execute(grant.clone()).await;
        drop(lease);

        let (state, report) = match result {
            Ok(report) if report.is_already_running() => (ProcessRunState::AlreadyRunning, Some(report)),
            Ok(report) if report.status == ProcessStatus::Completed => {
                (ProcessRunState::Completed, Some(report))
            }
            Ok(report) => (ProcessRunState::Failed { error: None }, Some(report)),
            Err(e) => {
                warn!("Process {} aborted: {}", process.id(), e);
                (
                    ProcessRunState::Failed {
                        error: Some(e.to_string()),
                    },
                    None,
                )
            }
        };

        ProcessOutcome {
            process_id: process.id().to_string(),
            state,
            queued,
            grant: Some(grant),
            report,
        }
    }

    /// Collect targets and the registered processes they depend on
    async fn plan(&self, ids: Option<&[String]>) -> Result<Plan> {
        self.ensure_active()?;
        let (registered, order) = {
            let state = lock(&self.state);
            (state.processes.clone(), state.order.clone())
        };
        let requested = ids.map(<[String]>::to_vec).unwrap_or(order);

        let mut seen = HashSet::new();
        let mut processes = Vec::new();
        let mut outcomes = Vec::new();
        for id in requested {
            if !seen.insert(id.clone()) {
                continue;
            }
            match registered.get(&id) {
                None => {
                    warn!("Cannot schedule unknown process {}", id);
                    outcomes.push(ProcessOutcome::without_run(&id, ProcessRunState::Unknown));
                }
                Some(process) => match process.status().await {
                    ProcessStatus::Idle => processes.push(process.clone()),
                    status => {
                        debug!("Process {} is {}; not scheduling", id, status);
                        outcomes.push(ProcessOutcome::without_run(
                            &id,
                            ProcessRunState::NotIdle { status },
                        ));
                    }
                },
            }
        }

        let mut nodes: Vec<ProcessNode> = join_all(processes.iter().map(|p| p.node())).await;
        for node in nodes.iter_mut() {
            node.state = NodeState::Pending;
        }

        // Dependencies outside the idle targets keep their current state:
        // completed satisfies, anything else is unavailable.
        let mut known: HashSet<String> = processes.iter().map(|p| p.id().to_string()).collect();
        let referenced: Vec<String> = nodes
            .iter()
            .flat_map(|n| n.dependencies.iter().cloned())
            .collect();
        for dep in referenced {
            if !known.insert(dep.clone()) {
                continue;
            }
            if let Some(process) = registered.get(&dep) {
                let mut node = process.node().await;
                if node.state != NodeState::Completed {
                    node.state = NodeState::Unavailable;
                }
                node.dependencies.clear();
                nodes.push(node);
            }
        }

        Ok(Plan {
            processes,
            nodes,
            outcomes,
        })
    }

    /// Skip targets that can never run; returns the resolved order
    fn skip_unresolvable(&self, plan: &mut Plan) -> Vec<usize> {
        let resolution = DependencyResolver::resolve(&plan.nodes);
        for (idx, reason) in resolution.unresolvable {
            if plan.is_target(idx) {
                plan.skip(idx, reason);
            }
        }
        resolution.order
    }

    fn finish(
        &self,
        mut plan: Plan,
        strategy: ExecutionMode,
        waves: Vec<Vec<String>>,
        started_at: DateTime<Utc>,
    ) -> ScheduleReport {
        plan.propagate_skips();
        let leftovers: Vec<usize> = (0..plan.processes.len())
            .filter(|&i| plan.nodes[i].state == NodeState::Pending)
            .collect();
        for idx in leftovers {
            let reason = if self.is_active() {
                DependencyResolver::first_unmet(&plan.nodes, idx).unwrap_or(SkipReason::Cancelled)
            } else {
                SkipReason::Cancelled
            };
            plan.skip(idx, reason);
        }

        let report = ScheduleReport {
            strategy,
            outcomes: plan.outcomes,
            waves,
            started_at,
            finished_at: Utc::now(),
            peak_concurrency: self.pool.peak(),
        };
        info!(
            "{} schedule finished: {} completed, {} failed, {} skipped",
            strategy,
            report.completed().len(),
            report.failed().len(),
            report.skipped().len()
        );
        report
    }
}

impl ProcessOutcome {
    fn without_run(id: &str, state: ProcessRunState) -> Self {
        Self {
            process_id: id.to_string(),
            state,
            queued: false,
            grant: None,
            report: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == ProcessRunState::Completed
    }
}

impl ScheduleReport {
    pub fn outcome(&self, id: &str) -> Option<&ProcessOutcome> {
        self.outcomes.iter().find(|o| o.process_id == id)
    }

    fn ids_where(&self, pred: impl Fn(&ProcessRunState) -> bool) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| pred(&o.state))
            .map(|o| o.process_id.clone())
            .collect()
    }

    pub fn completed(&self) -> Vec<String> {
        self.ids_where(|s| *s == ProcessRunState::Completed)
    }

    pub fn failed(&self) -> Vec<String> {
        self.ids_where(|s| matches!(s, ProcessRunState::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<String> {
        self.ids_where(|s| matches!(s, ProcessRunState::Skipped { .. }))
    }

    /// Processes that had to wait for a worker slot
    pub fn queued(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.queued)
            .map(|o| o.process_id.clone())
            .collect()
    }

    /// True unless any process failed
    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }
}

impl SchedulerEvent {
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            raised_at: Utc::now(),
        }
    }
}

impl RecoveryReport {
    pub fn recovered(&self) -> Vec<String> {
        self.processes
            .iter()
            .filter(|p| p.status == ProcessStatus::Completed)
            .map(|p| p.process_id.clone())
            .collect()
    }

    pub fn still_failed(&self) -> Vec<String> {
        self.processes
            .iter()
            .filter(|p| p.status != ProcessStatus::Completed)
            .map(|p| p.process_id.clone())
            .collect()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            resources: Resources::new(8.0, 8192.0),
            allocation_slice: 0.25,
        }
    }
}
