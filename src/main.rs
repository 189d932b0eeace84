use anyhow::{Context, Result};
use clap::Parser;
use procweave::cli::{Args, Commands, ConfigDiscovery, OrchestratorConfig, PlanFile, ShellExecutor};
use procweave::scheduler::{ProcessRunState, ProcessScheduler, RecoveryReport, ScheduleReport};
use procweave::task::{ExecutionMode, Executor, LoggingEventSink};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("procweave=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            plan,
            config,
            strategy,
            max_concurrent,
            retries,
            dry_run,
            json,
        } => {
            let options = RunOptions {
                plan,
                config,
                strategy,
                max_concurrent,
                retries,
                dry_run,
                json,
            };
            let success = run_plan(options).await?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Validate { plan } => {
            let clean = validate_plan(&plan)?;
            if !clean {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::ShowConfig { config } => show_config(config.as_deref()),
    }
}

struct RunOptions {
    plan: PathBuf,
    config: Option<PathBuf>,
    strategy: Option<ExecutionMode>,
    max_concurrent: Option<usize>,
    retries: Option<u32>,
    dry_run: bool,
    json: bool,
}

async fn run_plan(options: RunOptions) -> Result<bool> {
    let (mut config, source) = ConfigDiscovery::discover_config(options.config.as_deref())?;
    if let Some(max_concurrent) = options.max_concurrent {
        config.scheduler.max_concurrent = max_concurrent;
    }
    config.validate()?;
    let strategy = options.strategy.unwrap_or(config.run.strategy);
    let retries = options.retries.unwrap_or(config.run.retries);

    let plan = PlanFile::load(&options.plan)
        .with_context(|| format!("failed to load plan {:?}", options.plan))?;
    info!(
        "Loaded plan {:?}: {} processes, {} tasks (config: {})",
        options.plan,
        plan.processes.len(),
        plan.task_count(),
        source
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string())
    );

    let shell = ShellExecutor::new()?;

    if options.dry_run {
        print_dry_run(&plan, &shell, strategy, &config);
        return Ok(true);
    }

    let executor: Arc<dyn Executor> = Arc::new(shell);
    let scheduler =
        ProcessScheduler::new(config.scheduler.clone()).with_event_sink(Arc::new(LoggingEventSink));
    for process in plan.build(&config.process, executor).await? {
        scheduler.add_process(process.with_event_sink(Arc::new(LoggingEventSink)))?;
    }

    let report = scheduler.schedule(strategy, None).await?;
    let recovery = if retries > 0 && !report.failed().is_empty() {
        Some(scheduler.recover_failed_processes(retries).await?)
    } else {
        None
    };

    let success = match &recovery {
        Some(recovery) => recovery.still_failed().is_empty(),
        None => report.is_success(),
    };

    if options.json {
        let monitoring = scheduler.get_monitoring_data().await;
        let document = json!({
            "schedule": report,
            "recovery": recovery,
            "monitoring": monitoring,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        print_summary(&report, recovery.as_ref());
    }

    scheduler.shutdown().await;
    if !success {
        warn!("Plan finished with failures");
    }
    Ok(success)
}

fn print_dry_run(plan: &PlanFile, shell: &ShellExecutor, strategy: ExecutionMode, config: &OrchestratorConfig) {
    let validation = plan.validate();
    println!(
        "Dry run: {} strategy, {} concurrent processes",
        strategy, config.scheduler.max_concurrent
    );
    for id in &validation.process_order {
        let Some(spec) = plan.processes.iter().find(|p| &p.id == id) else {
            continue;
        };
        let Some(tasks) = validation.processes.iter().find(|p| &p.id == id) else {
            continue;
        };
        println!("process {} ({} mode)", spec.id, spec.mode);
        for task_id in &tasks.task_order {
            if let Some(task) = spec.tasks.iter().find(|t| &t.id == task_id) {
                let command = json!(task.command);
                let line = shell
                    .describe(&command)
                    .unwrap_or_else(|_| task.command.clone());
                println!("  {} -> {}", task.id, line);
            }
        }
        for (task_id, reason) in &tasks.unresolvable_tasks {
            println!("  {} -> skipped ({})", task_id, reason);
        }
    }
    for (id, reason) in &validation.unresolvable_processes {
        println!("process {} -> skipped ({})", id, reason);
    }
}

fn print_summary(report: &ScheduleReport, recovery: Option<&RecoveryReport>) {
    println!(
        "{} schedule finished in {}ms (peak concurrency {})",
        report.strategy,
        report
            .finished_at
            .signed_duration_since(report.started_at)
            .num_milliseconds(),
        report.peak_concurrency
    );
    for outcome in &report.outcomes {
        let state = match &outcome.state {
            ProcessRunState::Completed => "completed".to_string(),
            ProcessRunState::Failed { error: Some(e) } => format!("failed: {e}"),
            ProcessRunState::Failed { error: None } => {
                let failed = outcome
                    .report
                    .as_ref()
                    .map(|r| r.metrics.failed)
                    .unwrap_or_default();
                format!("failed ({failed} tasks)")
            }
            ProcessRunState::Skipped { reason } => format!("skipped: {reason}"),
            ProcessRunState::AlreadyRunning => "already running".to_string(),
            ProcessRunState::NotIdle { status } => format!("not idle ({status})"),
            ProcessRunState::Unknown => "unknown process".to_string(),
        };
        let queued = if outcome.queued { " [queued]" } else { "" };
        println!("  {}: {}{}", outcome.process_id, state, queued);
    }

    if let Some(recovery) = recovery {
        println!(
            "Recovery: {} recovered, {} still failed",
            recovery.recovered().len(),
            recovery.still_failed().len()
        );
    }
}

fn validate_plan(path: &Path) -> Result<bool> {
    let plan = PlanFile::load(path).with_context(|| format!("failed to load plan {:?}", path))?;
    let validation = plan.validate();

    println!("Process order: {}", validation.process_order.join(" -> "));
    for (id, reason) in &validation.unresolvable_processes {
        println!("  process {} can not run: {}", id, reason);
    }
    for process in &validation.processes {
        println!("{}: {}", process.id, process.task_order.join(" -> "));
        for (id, reason) in &process.unresolvable_tasks {
            println!("  task {} can not run: {}", id, reason);
        }
        if !process.cycles.is_empty() {
            println!("  cycle: {}", process.cycles.join(", "));
        }
        for id in &process.duplicate_ids {
            println!("  duplicate task id: {}", id);
        }
    }

    let clean = validation.is_clean();
    println!("{}", if clean { "Plan is valid" } else { "Plan has problems" });
    Ok(clean)
}

fn show_config(explicit: Option<&Path>) -> Result<()> {
    ConfigDiscovery::show_discovery_info();
    let (config, _) = ConfigDiscovery::discover_config(explicit)?;
    println!();
    println!("Effective configuration:");
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
