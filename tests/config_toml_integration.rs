//! Configuration file loading and discovery

use procweave::cli::config::CONFIG_ENV_VAR;
use procweave::cli::{ConfigDiscovery, OrchestratorConfig};
use procweave::task::ExecutionMode;
use procweave::{OrchestratorError, Resources};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[scheduler]
max_concurrent = 6
allocation_slice = 0.5

[scheduler.resources]
cpu = 16.0
memory = 32768.0

[tasks]
scope = "ci"
max_concurrent_tasks = 2
task_timeout_secs = 30

[process]
max_workers = 8

[run]
strategy = "parallel"
retries = 2
"#;

#[test]
fn test_full_config_from_toml() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("procweave.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = OrchestratorConfig::from_toml_file(&path).unwrap();
    assert_eq!(config.scheduler.max_concurrent, 6);
    assert_eq!(config.scheduler.resources, Resources::new(16.0, 32768.0));
    assert_eq!(config.scheduler.allocation_slice, 0.5);
    assert_eq!(config.tasks.scope, "ci");
    assert_eq!(config.tasks.max_concurrent_tasks, 2);
    assert_eq!(config.tasks.task_timeout_secs, Some(30));
    assert_eq!(config.process.max_workers, 8);
    assert_eq!(config.process.task_timeout_secs, None);
    assert_eq!(config.run.strategy, ExecutionMode::Parallel);
    assert_eq!(config.run.retries, 2);
}

#[test]
fn test_partial_config_keeps_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("partial.toml");
    fs::write(&path, "[run]\nretries = 1\n").unwrap();

    let config = OrchestratorConfig::from_toml_file(&path).unwrap();
    let defaults = OrchestratorConfig::default();
    assert_eq!(config.run.retries, 1);
    assert_eq!(config.run.strategy, ExecutionMode::Hybrid);
    assert_eq!(config.scheduler, defaults.scheduler);
    assert_eq!(config.tasks, defaults.tasks);
}

#[test]
fn test_invalid_values_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");

    fs::write(&path, "[scheduler]\nmax_concurrent = 0\n").unwrap();
    assert!(matches!(
        OrchestratorConfig::from_toml_file(&path),
        Err(OrchestratorError::Config(_))
    ));

    fs::write(&path, "[run]\nstrategy = \"random\"\n").unwrap();
    assert!(matches!(
        OrchestratorConfig::from_toml_file(&path),
        Err(OrchestratorError::TomlDe(_))
    ));

    assert!(matches!(
        OrchestratorConfig::from_toml_file(temp_dir.path().join("absent.toml")),
        Err(OrchestratorError::Io { .. })
    ));
}

#[test]
fn test_save_and_reload() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("saved.toml");

    let mut config = OrchestratorConfig::default();
    config.scheduler.max_concurrent = 9;
    config.run.strategy = ExecutionMode::Sequential;
    config.to_toml_file(&path).unwrap();

    let reloaded = OrchestratorConfig::from_toml_file(&path).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
#[serial]
fn test_discovery_from_environment() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("custom.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    unsafe {
        std::env::set_var(CONFIG_ENV_VAR, &path);
    }
    let candidates = ConfigDiscovery::get_config_candidates();
    let discovered = ConfigDiscovery::discover_config(None);
    unsafe {
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    assert_eq!(candidates[0], path);
    let (config, source) = discovered.unwrap();
    assert_eq!(source, Some(path));
    assert_eq!(config.scheduler.max_concurrent, 6);
}

#[test]
#[serial]
fn test_explicit_path_wins_over_environment() {
    let temp_dir = TempDir::new().unwrap();
    let from_env = temp_dir.path().join("env.toml");
    let explicit = temp_dir.path().join("explicit.toml");
    fs::write(&from_env, FULL_CONFIG).unwrap();
    fs::write(&explicit, "[scheduler]\nmax_concurrent = 1\n").unwrap();

    unsafe {
        std::env::set_var(CONFIG_ENV_VAR, &from_env);
    }
    let discovered = ConfigDiscovery::discover_config(Some(&explicit));
    unsafe {
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    let (config, source) = discovered.unwrap();
    assert_eq!(source, Some(explicit));
    assert_eq!(config.scheduler.max_concurrent, 1);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("missing.toml");
    assert!(ConfigDiscovery::discover_config(Some(&missing)).is_err());
}
