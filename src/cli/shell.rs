//! Shell command executor.
//!
//! Runs a payload as `sh -c <command>` on the host using
//! `tokio::process::Command`. The payload is either a string or an object
//! with a `command` field.

use crate::task::{ExecutionContext, Executor, Payload};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// Executes task payloads through the system shell
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    /// Locate `sh` on the `PATH`
    pub fn new() -> Result<Self> {
        let shell = which::which("sh").context("no `sh` found on PATH")?;
        Ok(Self {
            shell,
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Command string carried by a payload
    pub fn command_of(payload: &Payload) -> Result<&str> {
        match payload {
            Payload::String(command) => Ok(command),
            Payload::Object(fields) => fields
                .get("command")
                .and_then(Payload::as_str)
                .ok_or_else(|| anyhow!("payload object has no string `command` field")),
            other => bail!("unsupported shell payload: {other}"),
        }
    }

    /// Printable form of the invocation, quoted for a shell
    pub fn describe(&self, payload: &Payload) -> Result<String> {
        let command = Self::command_of(payload)?;
        Ok(format!(
            "{} -c {}",
            self.shell.display(),
            shell_escape::escape(command.into())
        ))
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn run(&self, payload: &Payload, context: &ExecutionContext) -> Result<Payload> {
        let command_line = Self::command_of(payload)?;
        debug!(
            "[{}] {} running {}",
            context.scope,
            context.entry_id,
            self.describe(payload)?
        );

        let start = Instant::now();
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(command_line)
            .env("PROCWEAVE_SCOPE", &context.scope)
            .env("PROCWEAVE_TASK_ID", &context.entry_id)
            .env("PROCWEAVE_ATTEMPT", context.attempt.to_string())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.shell.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            bail!("command exited with status {exit_code}: {stderr}");
        }

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
            "duration_ms": start.elapsed().as_millis() as u64,
        }))
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ResourceGrant;
    use chrono::Utc;

    fn context() -> ExecutionContext {
        ExecutionContext {
            entry_id: "t".to_string(),
            scope: "shell-test".to_string(),
            attempt: 1,
            grant: ResourceGrant::none(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_command_of_payload_shapes() {
        assert_eq!(ShellExecutor::command_of(&json!("ls")).unwrap(), "ls");
        assert_eq!(
            ShellExecutor::command_of(&json!({"command": "pwd"})).unwrap(),
            "pwd"
        );
        assert!(ShellExecutor::command_of(&json!(3)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_captures_output() {
        let executor = ShellExecutor::new().unwrap();
        let output = executor
            .run(&json!("echo $PROCWEAVE_TASK_ID-ok"), &context())
            .await
            .unwrap();
        assert_eq!(output["stdout"], "t-ok");
        assert_eq!(output["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_nonzero_exit_fails() {
        let executor = ShellExecutor::new().unwrap();
        let error = executor
            .run(&json!("echo broken >&2; exit 3"), &context())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("status 3"));
        assert!(error.to_string().contains("broken"));
    }
}
