//! Plan files
//!
//! A plan is a TOML document listing processes and their tasks:
//!
//! ```toml
//! [[process]]
//! id = "build"
//! mode = "parallel"
//!
//! [[process.task]]
//! id = "compile"
//! command = "make"
//!
//! [[process]]
//! id = "ship"
//! depends_on = ["build"]
//! ```

use crate::cli::config::ProcessDefaults;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::Resources;
use crate::task::{DependencyResolver, ExecutionMode, Executor, Process, ProcessNode, TaskEntry};
use crate::task::NodeState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanFile {
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub max_workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub resources: Option<Resources>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub id: String,
    /// Shell command run with `sh -c`
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Dependency analysis of a plan
#[derive(Debug, Clone, Serialize, Default)]
pub struct PlanValidation {
    /// Process ids in scheduling order
    pub process_order: Vec<String>,
    /// Processes that can never run, with the reason
    pub unresolvable_processes: Vec<(String, String)>,
    pub processes: Vec<ProcessValidation>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ProcessValidation {
    pub id: String,
    pub task_order: Vec<String>,
    pub unresolvable_tasks: Vec<(String, String)>,
    pub cycles: Vec<String>,
    pub duplicate_ids: Vec<String>,
}

impl PlanValidation {
    pub fn is_clean(&self) -> bool {
        self.unresolvable_processes.is_empty()
            && self.processes.iter().all(|p| {
                p.unresolvable_tasks.is_empty() && p.cycles.is_empty() && p.duplicate_ids.is_empty()
            })
    }
}

impl PlanFile {
    /// Load a plan from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let plan = Self::parse(&content)?;
        debug!("Loaded {} processes from {:?}", plan.processes.len(), path);
        Ok(plan)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: PlanFile = toml::from_str(content)?;
        let mut seen = HashSet::new();
        for process in &plan.processes {
            if !seen.insert(process.id.as_str()) {
                return Err(OrchestratorError::DuplicateId(process.id.clone()));
            }
        }
        Ok(plan)
    }

    pub fn task_count(&self) -> usize {
        self.processes.iter().map(|p| p.tasks.len()).sum()
    }

    /// Resolve process and task graphs without running anything
    pub fn validate(&self) -> PlanValidation {
        let nodes: Vec<ProcessNode> = self
            .processes
            .iter()
            .map(|p| ProcessNode {
                id: p.id.clone(),
                dependencies: p.depends_on.clone(),
                priority: p.priority,
                state: NodeState::Pending,
            })
            .collect();
        let resolution = DependencyResolver::resolve(&nodes);

        PlanValidation {
            process_order: resolution
                .order
                .iter()
                .map(|&i| nodes[i].id.clone())
                .collect(),
            unresolvable_processes: resolution
                .unresolvable
                .iter()
                .map(|(i, reason)| (nodes[*i].id.clone(), reason.to_string()))
                .collect(),
            processes: self.processes.iter().map(ProcessSpec::validate).collect(),
        }
    }

    /// Build runnable processes sharing one executor
    pub async fn build(
        &self,
        defaults: &ProcessDefaults,
        executor: Arc<dyn Executor>,
    ) -> Result<Vec<Process>> {
        let mut processes = Vec::with_capacity(self.processes.len());
        for spec in &self.processes {
            processes.push(spec.build(defaults, executor.clone()).await?);
        }
        Ok(processes)
    }
}

impl ProcessSpec {
    fn entries(&self) -> Vec<TaskEntry> {
        self.tasks
            .iter()
            .map(|task| {
                TaskEntry::new(task.id.clone(), serde_json::Value::String(task.command.clone()))
                    .depends_on(task.depends_on.iter().cloned())
                    .with_priority(task.priority)
            })
            .collect()
    }

    fn validate(&self) -> ProcessValidation {
        let entries = self.entries();
        let resolution = DependencyResolver::resolve(&entries);

        let mut seen = HashSet::new();
        let duplicate_ids = entries
            .iter()
            .filter(|e| !seen.insert(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();

        ProcessValidation {
            id: self.id.clone(),
            task_order: resolution
                .order
                .iter()
                .map(|&i| entries[i].id.clone())
                .collect(),
            unresolvable_tasks: resolution
                .unresolvable
                .iter()
                .map(|(i, reason)| (entries[*i].id.clone(), reason.to_string()))
                .collect(),
            cycles: DependencyResolver::cycle_members(&entries),
            duplicate_ids,
        }
    }

    async fn build(&self, defaults: &ProcessDefaults, executor: Arc<dyn Executor>) -> Result<Process> {
        let mut process = Process::new(self.id.clone(), self.mode, executor)
            .with_priority(self.priority)
            .depends_on(self.depends_on.iter().cloned())
            .with_max_workers(self.max_workers.unwrap_or(defaults.max_workers));

        if let Some(name) = &self.name {
            process = process.with_name(name.clone());
        }
        if let Some(secs) = self.task_timeout_secs.or(defaults.task_timeout_secs) {
            process = process.with_task_timeout(Duration::from_secs(secs));
        }
        if let Some(resources) = self.resources {
            process = process.with_resource_request(resources);
        }

        for entry in self.entries() {
            process.add_task(entry).await?;
        }
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EchoExecutor;

    const PLAN: &str = r#"
[[process]]
id = "build"
mode = "parallel"
priority = 2

[[process.task]]
id = "fetch"
command = "echo fetch"

[[process.task]]
id = "compile"
command = "echo compile"
depends_on = ["fetch"]

[[process]]
id = "ship"
depends_on = ["build"]

[[process.task]]
id = "upload"
command = "echo upload"
depends_on = ["missing"]
"#;

    #[test]
    fn test_parse_plan() {
        let plan = PlanFile::parse(PLAN).unwrap();
        assert_eq!(plan.processes.len(), 2);
        assert_eq!(plan.processes[0].mode, ExecutionMode::Parallel);
        assert_eq!(plan.processes[1].mode, ExecutionMode::Sequential);
        assert_eq!(plan.task_count(), 3);
    }

    #[test]
    fn test_duplicate_process_rejected() {
        let plan = "[[process]]\nid = \"a\"\n[[process]]\nid = \"a\"\n";
        assert!(matches!(
            PlanFile::parse(plan),
            Err(OrchestratorError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_validate_reports_unresolvable() {
        let validation = PlanFile::parse(PLAN).unwrap().validate();
        assert_eq!(validation.process_order, vec!["build", "ship"]);
        assert_eq!(validation.processes[0].task_order, vec!["fetch", "compile"]);
        assert_eq!(
            validation.processes[1].unresolvable_tasks,
            vec![("upload".to_string(), "missing dependency: missing".to_string())]
        );
        assert!(!validation.is_clean());
    }

    #[tokio::test]
    async fn test_build_processes() {
        let plan = PlanFile::parse(PLAN).unwrap();
        let defaults = ProcessDefaults {
            max_workers: 3,
            task_timeout_secs: Some(5),
        };
        let processes = plan
            .build(&defaults, Arc::new(EchoExecutor::new()))
            .await
            .unwrap();

        assert_eq!(processes[0].max_workers(), 3);
        assert_eq!(processes[0].priority(), 2);
        assert_eq!(processes[1].dependencies(), ["build".to_string()]);
        assert_eq!(processes[0].entries().await.len(), 2);
    }
}
