use crate::task::types::{SkipReason, TaskError};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Structured events emitted while entries and processes run
#[derive(Debug, Clone, Serialize)]
pub enum OrchestratorEvent {
    EntryStarted {
        scope: String,
        entry_id: String,
        attempt: u32,
    },
    EntryCompleted {
        scope: String,
        entry_id: String,
        duration_ms: u64,
    },
    EntryFailed {
        scope: String,
        entry_id: String,
        error: TaskError,
    },
    EntrySkipped {
        scope: String,
        entry_id: String,
        reason: SkipReason,
    },
    EntryRetried {
        scope: String,
        entry_id: String,
        attempt: u32,
        succeeded: bool,
    },
    ProcessStarted {
        process_id: String,
    },
    ProcessFinished {
        process_id: String,
        status: String,
        elapsed_ms: u64,
    },
    ProcessQueued {
        process_id: String,
    },
}

/// Receiver of orchestration events
pub trait EventSink: Send + Sync {
    fn handle_event(&self, event: &OrchestratorEvent) -> Result<()>;
}

/// Fan-out to every registered sink; sink errors are logged and dropped
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.handle_event(&event) {
                error!("Event sink error: {}", e);
            }
        }
    }
}

/// Sink that writes every event to the tracing subscriber
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn handle_event(&self, event: &OrchestratorEvent) -> Result<()> {
        match event {
            OrchestratorEvent::EntryStarted {
                scope,
                entry_id,
                attempt,
            } => {
                debug!("[{}] entry {} started (attempt {})", scope, entry_id, attempt);
            }
            OrchestratorEvent::EntryCompleted {
                scope,
                entry_id,
                duration_ms,
            } => {
                info!("[{}] entry {} completed in {}ms", scope, entry_id, duration_ms);
            }
            OrchestratorEvent::EntryFailed {
                scope,
                entry_id,
                error,
            } => {
                warn!("[{}] entry {} failed: {}", scope, entry_id, error);
            }
            OrchestratorEvent::EntrySkipped {
                scope,
                entry_id,
                reason,
            } => {
                info!("[{}] entry {} skipped: {}", scope, entry_id, reason);
            }
            OrchestratorEvent::EntryRetried {
                scope,
                entry_id,
                attempt,
                succeeded,
            } => {
                info!(
                    "[{}] retry of {} (attempt {}) {}",
                    scope,
                    entry_id,
                    attempt,
                    if *succeeded { "succeeded" } else { "failed" }
                );
            }
            OrchestratorEvent::ProcessStarted { process_id } => {
                info!("Process {} started", process_id);
            }
            OrchestratorEvent::ProcessFinished {
                process_id,
                status,
                elapsed_ms,
            } => {
                info!("Process {} finished: {} ({}ms)", process_id, status, elapsed_ms);
            }
            OrchestratorEvent::ProcessQueued { process_id } => {
                debug!("Process {} queued for a worker slot", process_id);
            }
        }
        Ok(())
    }
}

/// Sink that keeps every event in memory; handy for inspection and tests
#[derive(Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<OrchestratorEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn handle_event(&self, event: &OrchestratorEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording sink poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn handle_event(&self, _event: &OrchestratorEvent) -> Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    #[test]
    fn test_bus_survives_failing_sink() {
        let recorder = Arc::new(RecordingEventSink::new());
        let mut bus = EventBus::new();
        bus.add_sink(Arc::new(FailingSink));
        bus.add_sink(recorder.clone());
        bus.add_sink(Arc::new(LoggingEventSink));

        bus.emit(OrchestratorEvent::ProcessStarted {
            process_id: "p".to_string(),
        });

        assert_eq!(recorder.events().len(), 1);
    }
}
