//! Plan files and the shell executor driven through the scheduler

use procweave::cli::{PlanFile, ProcessDefaults, ShellExecutor};
use procweave::scheduler::{ProcessRunState, ProcessScheduler, SchedulerConfig};
use procweave::task::{
    EchoExecutor, ExecutionMode, Executor, SkipReason, TaskError, TaskResult,
};
use procweave::OrchestratorError;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PLAN: &str = r#"
[[process]]
id = "prepare"
name = "Prepare workspace"
mode = "sequential"
priority = 5

[[process.task]]
id = "mkdir"
command = "mkdir -p out"

[[process.task]]
id = "stamp"
command = "echo ready > out/stamp"
depends_on = ["mkdir"]

[[process]]
id = "render"
mode = "parallel"
depends_on = ["prepare"]
max_workers = 2
task_timeout_secs = 5

[[process.task]]
id = "a"
command = "cat out/stamp > out/a"

[[process.task]]
id = "b"
command = "cat out/stamp > out/b"

[[process]]
id = "publish"
mode = "hybrid"
depends_on = ["render"]

[[process.task]]
id = "bundle"
command = "cat out/a out/b > out/bundle"
"#;

#[test]
fn test_load_and_validate_plan_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("plan.toml");
    fs::write(&path, PLAN).unwrap();

    let plan = PlanFile::load(&path).unwrap();
    assert_eq!(plan.processes.len(), 3);
    assert_eq!(plan.task_count(), 5);
    assert_eq!(plan.processes[0].name.as_deref(), Some("Prepare workspace"));
    assert_eq!(plan.processes[1].mode, ExecutionMode::Parallel);

    let validation = plan.validate();
    assert!(validation.is_clean());
    assert_eq!(validation.process_order, vec!["prepare", "render", "publish"]);
    assert_eq!(validation.processes[0].task_order, vec!["mkdir", "stamp"]);
}

#[test]
fn test_validation_reports_problems() {
    let plan = PlanFile::parse(
        r#"
[[process]]
id = "loop"

[[process.task]]
id = "x"
command = "true"
depends_on = ["y"]

[[process.task]]
id = "y"
command = "true"
depends_on = ["x"]

[[process]]
id = "dangling"
depends_on = ["nowhere"]
"#,
    )
    .unwrap();

    let validation = plan.validate();
    assert!(!validation.is_clean());
    assert_eq!(validation.unresolvable_processes.len(), 1);
    assert_eq!(validation.unresolvable_processes[0].0, "dangling");
    assert_eq!(validation.processes[0].cycles, vec!["x", "y"]);
}

#[test]
fn test_duplicate_process_ids_are_rejected() {
    let result = PlanFile::parse("[[process]]\nid = \"a\"\n\n[[process]]\nid = \"a\"\n");
    assert!(matches!(result, Err(OrchestratorError::DuplicateId(id)) if id == "a"));
}

#[tokio::test]
async fn test_build_applies_defaults() {
    let plan = PlanFile::parse(PLAN).unwrap();
    let defaults = ProcessDefaults {
        max_workers: 3,
        task_timeout_secs: Some(60),
    };
    let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::new());
    let processes = plan.build(&defaults, executor).await.unwrap();

    assert_eq!(processes.len(), 3);
    assert_eq!(processes[0].name(), "Prepare workspace");
    assert_eq!(processes[0].max_workers(), 3);
    assert_eq!(processes[1].max_workers(), 2);
    assert_eq!(processes[1].dependencies(), ["prepare".to_string()]);
    assert_eq!(processes[2].entries().await.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_plan_runs_through_shell() {
    let temp_dir = TempDir::new().unwrap();
    let plan = PlanFile::parse(PLAN).unwrap();
    let executor: Arc<dyn Executor> =
        Arc::new(ShellExecutor::new().unwrap().with_working_dir(temp_dir.path()));

    let scheduler = ProcessScheduler::new(SchedulerConfig::default());
    for process in plan.build(&ProcessDefaults::default(), executor).await.unwrap() {
        scheduler.add_process(process).unwrap();
    }

    let report = scheduler.schedule(ExecutionMode::Hybrid, None).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.completed(), vec!["prepare", "render", "publish"]);
    assert_eq!(report.waves.len(), 3);

    let bundle = fs::read_to_string(temp_dir.path().join("out/bundle")).unwrap();
    assert_eq!(bundle, "ready\nready\n");

    let publish = scheduler.process("publish").unwrap();
    let entry = publish.entry("bundle").await.unwrap();
    let output = entry.output().unwrap();
    assert_eq!(output["exit_code"], 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_command_skips_downstream_processes() {
    let temp_dir = TempDir::new().unwrap();
    let plan = PlanFile::parse(
        r#"
[[process]]
id = "check"

[[process.task]]
id = "fail"
command = "echo broken >&2; exit 3"

[[process]]
id = "deploy"
depends_on = ["check"]

[[process.task]]
id = "ship"
command = "touch shipped"
"#,
    )
    .unwrap();
    let executor: Arc<dyn Executor> =
        Arc::new(ShellExecutor::new().unwrap().with_working_dir(temp_dir.path()));

    let scheduler = ProcessScheduler::new(SchedulerConfig::default());
    for process in plan.build(&ProcessDefaults::default(), executor).await.unwrap() {
        scheduler.add_process(process).unwrap();
    }

    let report = scheduler.schedule_sequential(None).await.unwrap();
    assert_eq!(report.failed(), vec!["check"]);
    assert_eq!(
        report.outcome("deploy").unwrap().state,
        ProcessRunState::Skipped {
            reason: SkipReason::DependencyUnavailable {
                dependency: "check".to_string()
            }
        }
    );
    assert!(!temp_dir.path().join("shipped").exists());

    let check = scheduler.process("check").unwrap();
    let entry = check.entry("fail").await.unwrap();
    match entry.result {
        Some(TaskResult::Failure {
            error: TaskError::Execution { message },
        }) => {
            assert!(message.contains("status 3"));
            assert!(message.contains("broken"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_task_timeout_fails_slow_command() {
    let plan = PlanFile::parse(
        r#"
[[process]]
id = "slow"
task_timeout_secs = 1

[[process.task]]
id = "sleep"
command = "sleep 5"
"#,
    )
    .unwrap();
    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor::new().unwrap());
    let processes = plan.build(&ProcessDefaults::default(), executor).await.unwrap();

    let scheduler = ProcessScheduler::new(SchedulerConfig::default());
    for process in processes {
        scheduler.add_process(process).unwrap();
    }

    let started = std::time::Instant::now();
    let report = scheduler.schedule_parallel(None).await.unwrap();
    assert_eq!(report.failed(), vec!["slow"]);
    assert!(started.elapsed() < Duration::from_secs(4));
}
