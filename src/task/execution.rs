use crate::scheduler::resources::ResourceGrant;
use crate::task::types::*;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Context handed to an executor alongside the payload
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub entry_id: EntryId,
    /// Process id, or the task manager's scope name
    pub scope: String,
    /// 1 on the first run, incremented by every retry
    pub attempt: u32,
    pub grant: ResourceGrant,
    pub started_at: DateTime<Utc>,
}

/// External unit that performs the work described by a payload.
///
/// Implementations are shared across workers and must tolerate concurrent
/// calls.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, payload: &Payload, context: &ExecutionContext) -> Result<Payload>;

    fn name(&self) -> &str {
        "executor"
    }
}

/// Picks an executor per entry during orchestration
pub trait ExecutorSelector: Send + Sync {
    fn select(&self, entry: &TaskEntry) -> Option<Arc<dyn Executor>>;
}

impl<F> ExecutorSelector for F
where
    F: Fn(&TaskEntry) -> Option<Arc<dyn Executor>> + Send + Sync,
{
    fn select(&self, entry: &TaskEntry) -> Option<Arc<dyn Executor>> {
        self(entry)
    }
}

/// Executor backed by a synchronous closure
pub struct FnExecutor<F> {
    name: String,
    func: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Payload, &ExecutionContext) -> Result<Payload> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait::async_trait]
impl<F> Executor for FnExecutor<F>
where
    F: Fn(&Payload, &ExecutionContext) -> Result<Payload> + Send + Sync,
{
    async fn run(&self, payload: &Payload, context: &ExecutionContext) -> Result<Payload> {
        (self.func)(payload, context)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Returns the payload unchanged, optionally after a delay
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    delay: Option<Duration>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait::async_trait]
impl Executor for EchoExecutor {
    async fn run(&self, payload: &Payload, _context: &ExecutionContext) -> Result<Payload> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(payload.clone())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Where an engine gets the executor for an entry
#[derive(Clone)]
pub(crate) enum ExecutorChoice {
    Single(Arc<dyn Executor>),
    Selected {
        selector: Arc<dyn ExecutorSelector>,
        fallback: Option<Arc<dyn Executor>>,
    },
    Fallback(Option<Arc<dyn Executor>>),
}

impl ExecutorChoice {
    pub(crate) fn resolve(&self, entry: &TaskEntry) -> Option<Arc<dyn Executor>> {
        match self {
            ExecutorChoice::Single(executor) => Some(executor.clone()),
            ExecutorChoice::Selected { selector, fallback } => {
                selector.select(entry).or_else(|| fallback.clone())
            }
            ExecutorChoice::Fallback(fallback) => fallback.clone(),
        }
    }
}

/// Run one payload on its own tokio task so a panic or hang in the executor
/// is contained to that entry.
pub(crate) async fn invoke(
    executor: Arc<dyn Executor>,
    payload: Payload,
    context: ExecutionContext,
    timeout: Option<Duration>,
) -> std::result::Result<Payload, TaskError> {
    let entry_id = context.entry_id.clone();
    debug!(
        "Invoking executor '{}' for entry {} (attempt {})",
        executor.name(),
        entry_id,
        context.attempt
    );

    let mut handle = tokio::spawn(async move { executor.run(&payload, &context).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                warn!("Entry {} timed out after {:?}", entry_id, limit);
                return Err(TaskError::Timeout {
                    after_ms: limit.as_millis() as u64,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(TaskError::Execution {
            message: format!("{error:#}"),
        }),
        Err(join_error) if join_error.is_panic() => Err(TaskError::Panicked {
            message: panic_message(join_error.into_panic()),
        }),
        Err(join_error) => Err(TaskError::Execution {
            message: join_error.to_string(),
        }),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext {
            entry_id: "entry".to_string(),
            scope: "test".to_string(),
            attempt: 1,
            grant: ResourceGrant::none(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::new());
        let output = invoke(executor, json!({"k": 1}), context(), None)
            .await
            .unwrap();
        assert_eq!(output, json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_invoke_error_is_recorded() {
        let executor: Arc<dyn Executor> =
            Arc::new(FnExecutor::new("failing", |_: &Payload, _: &ExecutionContext| -> Result<Payload> {
                Err(anyhow::anyhow!("disk full"))
            }));
        let error = invoke(executor, json!(null), context(), None)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            TaskError::Execution {
                message: "disk full".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_invoke_contains_panics() {
        let executor: Arc<dyn Executor> =
            Arc::new(FnExecutor::new("panicking", |_: &Payload, _: &ExecutionContext| -> Result<Payload> {
                panic!("executor exploded")
            }));
        let error = invoke(executor, json!(null), context(), None)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            TaskError::Panicked {
                message: "executor exploded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let executor: Arc<dyn Executor> =
            Arc::new(EchoExecutor::with_delay(Duration::from_secs(5)));
        let error = invoke(
            executor,
            json!(null),
            context(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(error, TaskError::Timeout { after_ms: 20 });
    }

    #[test]
    fn test_selector_falls_back() {
        let echo: Arc<dyn Executor> = Arc::new(EchoExecutor::new());
        let selector = |entry: &TaskEntry| -> Option<Arc<dyn Executor>> {
            (entry.priority > 0).then(|| Arc::new(EchoExecutor::new()) as Arc<dyn Executor>)
        };
        let choice = ExecutorChoice::Selected {
            selector: Arc::new(selector),
            fallback: Some(echo),
        };

        let low = TaskEntry::new("low", json!(null));
        assert!(choice.resolve(&low).is_some());

        let none = ExecutorChoice::Fallback(None);
        assert!(none.resolve(&low).is_none());
    }
}
