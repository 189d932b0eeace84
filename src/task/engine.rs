//! Execution engine shared by `Process` and `TaskManager`.
//!
//! State lives on a [`Board`] behind one `RwLock` per owner. Workers claim an
//! entry (`Pending -> Running`) under the write lock after taking a pool slot,
//! which is what rules out double execution.

use crate::error::{OrchestratorError, Result};
use crate::scheduler::pool::{WorkerPool, WorkerSlot};
use crate::scheduler::resources::ResourceGrant;
use crate::task::events::{EventBus, OrchestratorEvent};
use crate::task::execution::{ExecutionContext, ExecutorChoice, invoke};
use crate::task::report::*;
use crate::task::resolver::DependencyResolver;
use crate::task::types::*;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Entries plus the run state of their owner
#[derive(Debug, Default)]
pub(crate) struct Board {
    pub entries: Vec<TaskEntry>,
    pub logs: Vec<ExecutionLog>,
    pub status: ProcessStatus,
    pub last_run: Option<RunMetrics>,
    pub waves: Vec<WaveRecord>,
    pub grant: Option<ResourceGrant>,
    pub cancel: Option<CancellationToken>,
    pub runs: u32,
}

pub(crate) type SharedBoard = Arc<RwLock<Board>>;

impl Board {
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn insert(&mut self, entry: TaskEntry) -> Result<()> {
        if self.position(&entry.id).is_some() {
            return Err(OrchestratorError::DuplicateId(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn outcomes(&self) -> Vec<ItemOutcome> {
        self.entries.iter().map(ItemOutcome::from_entry).collect()
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| e.is_failed())
    }

    /// Skip one pending entry, logging it and returning the event to emit
    pub fn skip(&mut self, idx: usize, reason: SkipReason, scope: &str) -> Result<OrchestratorEvent> {
        let entry = &mut self.entries[idx];
        entry.skip(reason.clone())?;
        self.logs.push(ExecutionLog::new(
            entry,
            LogKind::Skipped {
                reason: reason.clone(),
            },
        ));
        Ok(OrchestratorEvent::EntrySkipped {
            scope: scope.to_string(),
            entry_id: entry.id.clone(),
            reason,
        })
    }

    /// Skip everything downstream of a failed, skipped or missing dependency
    fn propagate_skips(&mut self, scope: &str) -> Result<Vec<OrchestratorEvent>> {
        let mut events = Vec::new();
        loop {
            let blocked = DependencyResolver::blocked(&self.entries);
            if blocked.is_empty() {
                return Ok(events);
            }
            for (idx, reason) in blocked {
                events.push(self.skip(idx, reason, scope)?);
            }
        }
    }
}

/// Everything a worker needs to run entries of one owner
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub board: SharedBoard,
    pub pool: WorkerPool,
    pub executors: ExecutorChoice,
    pub events: EventBus,
    pub scope: String,
    pub timeout: Option<Duration>,
    pub grant: ResourceGrant,
    pub cancel: CancellationToken,
}

impl EngineContext {
    fn emit_all(&self, events: Vec<OrchestratorEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

/// Run every pending entry on the board according to `mode`
pub(crate) async fn run(ctx: &EngineContext, mode: ExecutionMode) -> Result<Vec<WaveRecord>> {
    let order = prepare(ctx).await?;

    let waves = match mode {
        ExecutionMode::Sequential => {
            run_sequential(ctx, &order).await?;
            Vec::new()
        }
        ExecutionMode::Parallel => {
            run_parallel(ctx).await?;
            Vec::new()
        }
        ExecutionMode::Hybrid => run_waves(ctx).await?,
    };

    finalize(ctx).await?;
    Ok(waves)
}

/// Resolve the graph once and skip entries that can never run
async fn prepare(ctx: &EngineContext) -> Result<Vec<usize>> {
    let mut board = ctx.board.write().await;
    let resolution = DependencyResolver::resolve(&board.entries);

    let mut events = Vec::new();
    for (idx, reason) in resolution.unresolvable {
        if board.entries[idx].is_pending() {
            events.push(board.skip(idx, reason, &ctx.scope)?);
        }
    }
    drop(board);

    if !events.is_empty() {
        info!(
            "[{}] {} entries can never become ready",
            ctx.scope,
            events.len()
        );
    }
    ctx.emit_all(events);
    Ok(resolution.order)
}

async fn run_sequential(ctx: &EngineContext, order: &[usize]) -> Result<()> {
    for &idx in order {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let runnable = {
            let mut board = ctx.board.write().await;
            if !board.entries[idx].is_pending() {
                continue;
            }
            match DependencyResolver::first_unmet(&board.entries, idx) {
                Some(reason) => {
                    let event = board.skip(idx, reason, &ctx.scope)?;
                    drop(board);
                    ctx.events.emit(event);
                    false
                }
                None => true,
            }
        };

        if runnable {
            run_entry(ctx.clone(), idx).await?;
        }
    }
    Ok(())
}

async fn run_parallel(ctx: &EngineContext) -> Result<()> {
    let mut dispatched = HashSet::new();
    let mut workers = JoinSet::new();

    loop {
        if !ctx.cancel.is_cancelled() {
            let (ready, events) = {
                let mut board = ctx.board.write().await;
                let events = board.propagate_skips(&ctx.scope)?;
                (DependencyResolver::ready_set(&board.entries), events)
            };
            ctx.emit_all(events);

            for idx in ready {
                if dispatched.insert(idx) {
                    workers.spawn(run_entry(ctx.clone(), idx));
                }
            }
        }

        match workers.join_next().await {
            Some(joined) => {
                joined.map_err(|e| OrchestratorError::WorkerJoin(e.to_string()))??;
            }
            None => return Ok(()),
        }
    }
}

async fn run_waves(ctx: &EngineContext) -> Result<Vec<WaveRecord>> {
    let mut waves = Vec::new();

    while !ctx.cancel.is_cancelled() {
        let (ready, ids, events) = {
            let mut board = ctx.board.write().await;
            let events = board.propagate_skips(&ctx.scope)?;
            let ready = DependencyResolver::ready_set(&board.entries);
            let ids: Vec<EntryId> = ready.iter().map(|&i| board.entries[i].id.clone()).collect();
            (ready, ids, events)
        };
        ctx.emit_all(events);

        if ready.is_empty() {
            break;
        }

        let started_at = Utc::now();
        debug!(
            "[{}] wave {} dispatching {} entries",
            ctx.scope,
            waves.len(),
            ready.len()
        );

        let mut workers = JoinSet::new();
        for idx in ready {
            workers.spawn(run_entry(ctx.clone(), idx));
        }
        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| OrchestratorError::WorkerJoin(e.to_string()))??;
        }

        waves.push(WaveRecord {
            index: waves.len(),
            entries: ids,
            started_at,
            finished_at: Utc::now(),
        });
    }

    Ok(waves)
}

/// Skip whatever is still pending once no more work can be dispatched
async fn finalize(ctx: &EngineContext) -> Result<()> {
    let mut board = ctx.board.write().await;
    let mut events = board.propagate_skips(&ctx.scope)?;

    let cancelled = ctx.cancel.is_cancelled();
    let leftovers: Vec<(usize, SkipReason)> = (0..board.entries.len())
        .filter(|&i| board.entries[i].is_pending())
        .map(|i| {
            let reason = if cancelled {
                SkipReason::Cancelled
            } else {
                DependencyResolver::first_unmet(&board.entries, i)
                    .unwrap_or(SkipReason::Cancelled)
            };
            (i, reason)
        })
        .collect();

    for (idx, reason) in leftovers {
        events.push(board.skip(idx, reason, &ctx.scope)?);
    }
    drop(board);

    ctx.emit_all(events);
    Ok(())
}

/// Take a worker slot, claim the entry and run it once.
///
/// Returns `false` when the entry was no longer pending or the run was
/// cancelled while waiting for a slot.
pub(crate) async fn run_entry(ctx: EngineContext, idx: usize) -> Result<bool> {
    let slot = ctx.pool.acquire().await?;
    run_in_slot(ctx, idx, slot).await
}

/// Same as [`run_entry`] for a caller that already holds a slot
pub(crate) async fn run_in_slot(ctx: EngineContext, idx: usize, _slot: WorkerSlot) -> Result<bool> {
    if ctx.cancel.is_cancelled() {
        return Ok(false);
    }

    let entry = {
        let mut guard = ctx.board.write().await;
        let board = &mut *guard;
        let entry = &mut board.entries[idx];
        if !entry.is_pending() {
            return Ok(false);
        }
        entry.start()?;
        board.logs.push(ExecutionLog::new(entry, LogKind::Started));
        entry.clone()
    };

    ctx.events.emit(OrchestratorEvent::EntryStarted {
        scope: ctx.scope.clone(),
        entry_id: entry.id.clone(),
        attempt: entry.attempts,
    });

    let result = execute_payload(&ctx, &entry).await;
    record(&ctx, idx, result, false).await?;
    Ok(true)
}

async fn execute_payload(
    ctx: &EngineContext,
    entry: &TaskEntry,
) -> std::result::Result<Payload, TaskError> {
    let Some(executor) = ctx.executors.resolve(entry) else {
        return Err(TaskError::NoExecutor);
    };
    let context = ExecutionContext {
        entry_id: entry.id.clone(),
        scope: ctx.scope.clone(),
        attempt: entry.attempts,
        grant: ctx.grant.clone(),
        started_at: Utc::now(),
    };
    invoke(executor, entry.payload.clone(), context, ctx.timeout).await
}

/// Store an executor result on the entry. Returns whether it succeeded.
async fn record(
    ctx: &EngineContext,
    idx: usize,
    result: std::result::Result<Payload, TaskError>,
    retry: bool,
) -> Result<bool> {
    let mut guard = ctx.board.write().await;
    let board = &mut *guard;
    let entry = &mut board.entries[idx];
    let succeeded = result.is_ok();

    let event = match result {
        Ok(output) => {
            entry.complete(output)?;
            board.logs.push(ExecutionLog::new(entry, LogKind::Completed));
            OrchestratorEvent::EntryCompleted {
                scope: ctx.scope.clone(),
                entry_id: entry.id.clone(),
                duration_ms: entry.duration_ms().unwrap_or_default(),
            }
        }
        Err(error) => {
            entry.fail(error.clone())?;
            board.logs.push(ExecutionLog::new(
                entry,
                LogKind::Failed {
                    error: error.clone(),
                },
            ));
            OrchestratorEvent::EntryFailed {
                scope: ctx.scope.clone(),
                entry_id: entry.id.clone(),
                error,
            }
        }
    };

    let retried = retry.then(|| {
        board.logs.push(ExecutionLog::new(entry, LogKind::Retried { succeeded }));
        OrchestratorEvent::EntryRetried {
            scope: ctx.scope.clone(),
            entry_id: entry.id.clone(),
            attempt: entry.attempts,
            succeeded,
        }
    });
    drop(guard);

    ctx.events.emit(event);
    if let Some(event) = retried {
        ctx.events.emit(event);
    }
    Ok(succeeded)
}

/// Re-attempt every failed entry up to `max_retries` times each.
///
/// Failed entries can not depend on one another (a failure skips its
/// dependents), so they are retried concurrently on the pool.
pub(crate) async fn retry_failed(ctx: &EngineContext, max_retries: u32) -> Result<RetryReport> {
    let failed: Vec<usize> = {
        let board = ctx.board.read().await;
        (0..board.entries.len())
            .filter(|&i| board.entries[i].is_failed())
            .collect()
    };

    if failed.is_empty() {
        debug!("[{}] nothing to retry", ctx.scope);
        return Ok(RetryReport::NothingToRetry);
    }

    info!(
        "[{}] retrying {} failed entries (max {} attempts each)",
        ctx.scope,
        failed.len(),
        max_retries
    );

    let mut workers = JoinSet::new();
    for &idx in &failed {
        workers.spawn(retry_entry(ctx.clone(), idx, max_retries));
    }
    while let Some(joined) = workers.join_next().await {
        joined.map_err(|e| OrchestratorError::WorkerJoin(e.to_string()))??;
    }

    let board = ctx.board.read().await;
    let outcomes: Vec<ItemOutcome> = failed
        .iter()
        .map(|&i| ItemOutcome::from_entry(&board.entries[i]))
        .collect();
    let recovered = outcomes.iter().filter(|o| o.is_completed()).count();

    Ok(RetryReport::Retried {
        still_failed: outcomes.len() - recovered,
        recovered,
        outcomes,
    })
}

async fn retry_entry(ctx: EngineContext, idx: usize, max_retries: u32) -> Result<bool> {
    let _slot = ctx.pool.acquire().await?;

    for _ in 0..max_retries {
        let entry = {
            let mut guard = ctx.board.write().await;
            let board = &mut *guard;
            let entry = &mut board.entries[idx];
            if !entry.is_failed() {
                return Ok(entry.is_completed());
            }
            entry.restart()?;
            board.logs.push(ExecutionLog::new(entry, LogKind::Started));
            entry.clone()
        };

        ctx.events.emit(OrchestratorEvent::EntryStarted {
            scope: ctx.scope.clone(),
            entry_id: entry.id.clone(),
            attempt: entry.attempts,
        });

        let result = execute_payload(&ctx, &entry).await;
        if record(&ctx, idx, result, true).await? {
            return Ok(true);
        }
    }
    Ok(false)
}
