//! Integration tests for the process scheduler
//!
//! Cover the strategies, triggers, recovery and the resource ledger through
//! the public API only.

use anyhow::anyhow;
use async_trait::async_trait;
use procweave::scheduler::{
    IterationStop, ProcessRunState, ProcessScheduler, SchedulerConfig, SchedulerEvent,
};
use procweave::task::{
    EchoExecutor, ExecutionContext, ExecutionMode, Executor, FnExecutor, Payload, Process,
    ProcessStatus, SkipReason, TaskEntry,
};
use procweave::{OrchestratorError, Resources};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Tracks how many invocations overlap; the first `failures` calls fail
#[derive(Default)]
struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
    delay_ms: u64,
    failures: AtomicU32,
}

#[async_trait]
impl Executor for ConcurrencyGauge {
    async fn run(&self, payload: &Payload, _context: &ExecutionContext) -> anyhow::Result<Payload> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            Err(anyhow!("planned failure"))
        } else {
            Ok(payload.clone())
        }
    }
}

fn echo() -> Arc<dyn Executor> {
    Arc::new(EchoExecutor::new())
}

fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        resources: Resources::new(8.0, 1024.0),
        allocation_slice: 0.25,
    }
}

async fn single_task_process(id: &str, executor: Arc<dyn Executor>) -> Process {
    let process = Process::new(id, ExecutionMode::Sequential, executor);
    process
        .add_task(TaskEntry::new(format!("{id}-task"), json!(id)))
        .await
        .unwrap();
    process
}

fn failing_first(times: u32) -> Arc<dyn Executor> {
    let calls = AtomicU32::new(0);
    Arc::new(FnExecutor::new(
        "failing-first",
        move |payload: &Payload, _: &ExecutionContext| -> anyhow::Result<Payload> {
            if calls.fetch_add(1, Ordering::SeqCst) < times {
                Err(anyhow!("not yet"))
            } else {
                Ok(payload.clone())
            }
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_respects_concurrency_cap() {
    let gauge = Arc::new(ConcurrencyGauge {
        delay_ms: 50,
        ..Default::default()
    });
    let scheduler = ProcessScheduler::new(config(3));
    for i in 0..10 {
        let process = single_task_process(&format!("p{i}"), gauge.clone()).await;
        scheduler.add_process(process).unwrap();
    }

    let report = scheduler.schedule_parallel(None).await.unwrap();

    assert_eq!(report.completed().len(), 10);
    assert_eq!(report.queued().len(), 7);
    assert_eq!(gauge.max.load(Ordering::SeqCst), 3);
    assert_eq!(report.peak_concurrency, 3);
    assert!(scheduler.running_processes().is_empty());
    assert_eq!(scheduler.available_resources(), Resources::new(8.0, 1024.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hybrid_wave_larger_than_cap() {
    let gauge = Arc::new(ConcurrencyGauge {
        delay_ms: 50,
        ..Default::default()
    });
    let scheduler = ProcessScheduler::new(config(2));
    for i in 0..6 {
        let process = single_task_process(&format!("w{i}"), gauge.clone()).await;
        scheduler.add_process(process).unwrap();
    }

    let report = scheduler.schedule_hybrid(None).await.unwrap();

    assert_eq!(report.waves.len(), 1);
    assert_eq!(report.waves[0].len(), 6);
    assert_eq!(report.completed().len(), 6);
    assert_eq!(report.queued().len(), 4);
    assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
    assert!(scheduler.running_processes().is_empty());
    assert_eq!(scheduler.available_resources(), Resources::new(8.0, 1024.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_of_more_processes_than_cap() {
    let gauge = Arc::new(ConcurrencyGauge {
        delay_ms: 50,
        failures: AtomicU32::new(5),
        ..Default::default()
    });
    let scheduler = ProcessScheduler::new(config(2));
    for i in 0..5 {
        let process = single_task_process(&format!("r{i}"), gauge.clone()).await;
        scheduler.add_process(process).unwrap();
    }

    let report = scheduler.schedule_parallel(None).await.unwrap();
    assert_eq!(report.failed().len(), 5);

    gauge.max.store(0, Ordering::SeqCst);
    let recovery = scheduler.recover_failed_processes(1).await.unwrap();

    assert_eq!(recovery.recovered().len(), 5);
    assert!(recovery.still_failed().is_empty());
    assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
    assert!(scheduler.running_processes().is_empty());
    assert_eq!(scheduler.available_resources(), Resources::new(8.0, 1024.0));
    assert_eq!(scheduler.get_monitoring_data().await.outstanding_grants, 0);
}

#[tokio::test]
async fn test_completed_dependency_from_earlier_call_is_satisfied() {
    let scheduler = ProcessScheduler::new(config(2));
    scheduler
        .add_process(single_task_process("a", echo()).await)
        .unwrap();
    scheduler
        .add_process(Process::new("b", ExecutionMode::Sequential, echo()).depends_on(["a"]))
        .unwrap();
    let broken = single_task_process("broken", failing_first(u32::MAX)).await;
    scheduler.add_process(broken).unwrap();
    scheduler
        .add_process(Process::new("c", ExecutionMode::Sequential, echo()).depends_on(["broken"]))
        .unwrap();

    let targets = vec!["a".to_string(), "broken".to_string()];
    let first = scheduler
        .schedule_sequential(Some(targets.as_slice()))
        .await
        .unwrap();
    assert_eq!(first.completed(), vec!["a"]);
    assert_eq!(first.failed(), vec!["broken"]);

    let second = scheduler.schedule_sequential(None).await.unwrap();
    assert_eq!(
        second.outcome("a").unwrap().state,
        ProcessRunState::NotIdle {
            status: ProcessStatus::Completed
        }
    );
    assert!(second.outcome("b").unwrap().is_completed());
    assert_eq!(
        second.outcome("c").unwrap().state,
        ProcessRunState::Skipped {
            reason: SkipReason::DependencyUnavailable {
                dependency: "broken".to_string()
            }
        }
    );

    let retargeted = vec!["c".to_string(), "broken".to_string()];
    let third = scheduler
        .schedule_hybrid(Some(retargeted.as_slice()))
        .await
        .unwrap();
    assert!(third.waves.is_empty());
    assert_eq!(third.skipped(), vec!["c"]);
}

#[tokio::test]
async fn test_sequential_follows_priority_and_dependencies() {
    let scheduler = ProcessScheduler::new(config(2));
    let deploy = Process::new("deploy", ExecutionMode::Sequential, echo())
        .with_priority(10)
        .depends_on(["build"]);
    let build = Process::new("build", ExecutionMode::Sequential, echo());
    let docs = Process::new("docs", ExecutionMode::Sequential, echo()).with_priority(5);
    scheduler.add_process(deploy).unwrap();
    scheduler.add_process(build).unwrap();
    scheduler.add_process(docs).unwrap();

    let report = scheduler.schedule_sequential(None).await.unwrap();
    let order: Vec<&str> = report
        .outcomes
        .iter()
        .map(|o| o.process_id.as_str())
        .collect();
    assert_eq!(order, vec!["docs", "build", "deploy"]);
    assert!(report.is_success());
    assert!(report.queued().is_empty());
}

#[tokio::test]
async fn test_hybrid_waves_and_failed_upstream() {
    let scheduler = ProcessScheduler::new(config(4));

    let broken = Process::new("broken", ExecutionMode::Sequential, failing_first(u32::MAX));
    broken
        .add_task(TaskEntry::new("step", json!(null)))
        .await
        .unwrap();
    scheduler.add_process(broken).unwrap();
    scheduler
        .add_process(Process::new("a", ExecutionMode::Parallel, echo()))
        .unwrap();
    scheduler
        .add_process(Process::new("b", ExecutionMode::Parallel, echo()).depends_on(["a"]))
        .unwrap();
    scheduler
        .add_process(Process::new("after-broken", ExecutionMode::Parallel, echo()).depends_on(["broken"]))
        .unwrap();
    scheduler
        .add_process(Process::new("orphan", ExecutionMode::Parallel, echo()).depends_on(["ghost"]))
        .unwrap();

    let report = scheduler.schedule_hybrid(None).await.unwrap();

    assert_eq!(report.waves.len(), 2);
    assert_eq!(report.waves[0], vec!["broken", "a"]);
    assert_eq!(report.waves[1], vec!["b"]);
    assert_eq!(report.failed(), vec!["broken"]);
    assert_eq!(
        report.outcome("after-broken").unwrap().state,
        ProcessRunState::Skipped {
            reason: SkipReason::DependencyUnavailable {
                dependency: "broken".to_string()
            }
        }
    );
    assert_eq!(
        report.outcome("orphan").unwrap().state,
        ProcessRunState::Skipped {
            reason: SkipReason::MissingDependency {
                dependency: "ghost".to_string()
            }
        }
    );
}

#[tokio::test]
async fn test_unknown_and_finished_targets_are_reported() {
    let scheduler = ProcessScheduler::new(config(2));
    scheduler
        .add_process(Process::new("a", ExecutionMode::Sequential, echo()))
        .unwrap();

    let first = scheduler.schedule_parallel(None).await.unwrap();
    assert_eq!(first.completed(), vec!["a"]);

    let targets = vec!["a".to_string(), "nope".to_string()];
    let second = scheduler.schedule_parallel(Some(targets.as_slice())).await.unwrap();
    assert_eq!(
        second.outcome("a").unwrap().state,
        ProcessRunState::NotIdle {
            status: ProcessStatus::Completed
        }
    );
    assert_eq!(second.outcome("nope").unwrap().state, ProcessRunState::Unknown);
}

#[tokio::test]
async fn test_conditional_execution() {
    let scheduler = ProcessScheduler::new(config(1));
    scheduler
        .add_process(single_task_process("gated", echo()).await)
        .unwrap();

    let skipped = scheduler.execute_conditional("gated", || false).await.unwrap();
    assert_eq!(
        skipped.state,
        ProcessRunState::Skipped {
            reason: SkipReason::ConditionNotMet
        }
    );
    assert_eq!(
        scheduler.process("gated").unwrap().status().await,
        ProcessStatus::Idle
    );

    let ran = scheduler.execute_conditional("gated", || true).await.unwrap();
    assert!(ran.is_completed());
    assert!(matches!(
        scheduler.execute_conditional("missing", || true).await,
        Err(OrchestratorError::UnknownProcess(_))
    ));
}

#[tokio::test]
async fn test_event_driven_execution_notifies_listeners() {
    let scheduler = ProcessScheduler::new(config(1));
    scheduler
        .add_process(single_task_process("on-push", echo()).await)
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    scheduler
        .register_event_listener("push", move |event| {
            assert_eq!(event.payload["branch"], "main");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    scheduler
        .register_event_listener("push", |_| Err(anyhow!("listener offline")))
        .unwrap();
    scheduler
        .register_event_listener("push", |_| panic!("listener crashed"))
        .unwrap();

    let result = scheduler
        .execute_event_driven(SchedulerEvent::new("push", json!({"branch": "main"})), "on-push")
        .await
        .unwrap();

    assert!(result.outcome.is_completed());
    assert_eq!(result.dispatch.delivered, 3);
    assert_eq!(result.dispatch.failures.len(), 2);
    assert!(!result.dispatch.failures[0].panicked);
    assert!(result.dispatch.failures[1].panicked);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let unrelated = scheduler
        .trigger_event(&SchedulerEvent::new("tag", json!(null)))
        .unwrap();
    assert_eq!(unrelated.delivered, 0);
}

#[tokio::test]
async fn test_iterative_execution_resets_between_runs() {
    let scheduler = ProcessScheduler::new(config(1));
    let handle = scheduler
        .add_process(single_task_process("poll", echo()).await)
        .unwrap();

    let report = scheduler
        .execute_iterative("poll", |iteration| iteration < 3, 10)
        .await
        .unwrap();
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(report.stopped_by, IterationStop::ConditionFalse);
    assert!(report.iterations.iter().all(|o| o.is_completed()));
    assert_eq!(handle.get_monitoring_data().await.runs, 3);

    let capped = scheduler
        .execute_iterative("poll", |_| true, 2)
        .await
        .unwrap();
    assert_eq!(capped.iterations.len(), 2);
    assert_eq!(capped.stopped_by, IterationStop::MaxIterations);
    assert_eq!(scheduler.available_resources(), Resources::new(8.0, 1024.0));
}

#[tokio::test]
async fn test_recover_failed_processes() {
    let scheduler = ProcessScheduler::new(config(2));
    scheduler
        .add_process(single_task_process("flaky", failing_first(1)).await)
        .unwrap();
    scheduler
        .add_process(single_task_process("hopeless", failing_first(u32::MAX)).await)
        .unwrap();
    scheduler
        .add_process(single_task_process("fine", echo()).await)
        .unwrap();

    let report = scheduler.schedule_parallel(None).await.unwrap();
    assert_eq!(report.failed().len(), 2);

    let recovery = scheduler.recover_failed_processes(2).await.unwrap();
    assert_eq!(recovery.processes.len(), 2);
    assert_eq!(recovery.recovered(), vec!["flaky"]);
    assert_eq!(recovery.still_failed(), vec!["hopeless"]);
    assert_eq!(scheduler.available_resources(), Resources::new(8.0, 1024.0));

    let nothing = scheduler.recover_failed_processes(1).await.unwrap();
    assert_eq!(nothing.still_failed(), vec!["hopeless"]);
}

#[tokio::test]
async fn test_resource_allocation_is_clamped_and_never_over_released() {
    let scheduler = ProcessScheduler::new(SchedulerConfig {
        max_concurrent: 2,
        resources: Resources::new(4.0, 400.0),
        allocation_slice: 0.5,
    });
    scheduler
        .add_process(Process::new("big", ExecutionMode::Sequential, echo()).with_resource_request(Resources::new(3.0, 100.0)))
        .unwrap();
    scheduler
        .add_process(Process::new("default", ExecutionMode::Sequential, echo()))
        .unwrap();

    let big = scheduler.allocate_resources("big").unwrap();
    assert!(!big.clamped);
    let slice = scheduler.allocate_resources("default").unwrap();
    assert!(slice.clamped);
    assert_eq!(slice.granted, Resources::new(1.0, 200.0));
    assert_eq!(scheduler.available_resources(), Resources::new(0.0, 100.0));

    assert_eq!(
        scheduler.release_resources(&slice).unwrap(),
        Resources::new(1.0, 200.0)
    );
    assert!(matches!(
        scheduler.release_resources(&slice),
        Err(OrchestratorError::InvalidState(_))
    ));
    assert_eq!(scheduler.available_resources(), Resources::new(1.0, 300.0));

    let next = scheduler.allocate_resources("big").unwrap();
    assert!(next.clamped);
    assert_eq!(next.granted, Resources::new(1.0, 100.0));
    assert!(big.granted.cpu + next.granted.cpu <= 4.0);

    scheduler.release_resources(&big).unwrap();
    scheduler.release_resources(&next).unwrap();
    assert_eq!(scheduler.available_resources(), Resources::new(4.0, 400.0));
}

#[tokio::test]
async fn test_shutdown_rejects_operations() {
    let scheduler = ProcessScheduler::new(config(1));
    scheduler
        .add_process(Process::new("a", ExecutionMode::Sequential, echo()))
        .unwrap();

    scheduler.shutdown().await;
    assert!(!scheduler.is_active());
    assert!(matches!(
        scheduler.schedule_hybrid(None).await,
        Err(OrchestratorError::SchedulerInactive)
    ));
    assert!(matches!(
        scheduler.add_process(Process::new("b", ExecutionMode::Sequential, echo())),
        Err(OrchestratorError::SchedulerInactive)
    ));

    scheduler.activate();
    assert!(scheduler.schedule_hybrid(None).await.unwrap().is_success());
}

#[tokio::test]
async fn test_monitoring_and_removal() {
    let scheduler = ProcessScheduler::new(config(2));
    scheduler
        .add_process(single_task_process("a", echo()).await)
        .unwrap();
    assert!(matches!(
        scheduler.add_process(Process::new("a", ExecutionMode::Sequential, echo())),
        Err(OrchestratorError::DuplicateId(_))
    ));

    scheduler.schedule_sequential(None).await.unwrap();
    let snapshot = scheduler.get_monitoring_data().await;
    assert!(snapshot.active);
    assert_eq!(snapshot.processes.len(), 1);
    assert_eq!(snapshot.processes[0].completed, 1);
    assert_eq!(snapshot.outstanding_grants, 0);
    assert!(serde_json::to_string(&snapshot).is_ok());

    scheduler.remove_process("a").await.unwrap();
    assert!(scheduler.processes().is_empty());
}
