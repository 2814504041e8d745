//! Run events - structured observability hook carried by the execution context
//!
//! JSON-serializable so they can be shipped anywhere; the default sink
//! forwards them to the `log` facade.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while a run progresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        execution_date: String,
        tasks: usize,
    },
    TaskStarted {
        task_id: String,
        attempt: u32,
    },
    /// Progress message from inside an operator
    TaskLog {
        task_id: String,
        message: String,
    },
    TaskRetrying {
        task_id: String,
        attempt: u32,
        delay_secs: u64,
        error: String,
    },
    TaskSucceeded {
        task_id: String,
        attempts: u32,
    },
    TaskFailed {
        task_id: String,
        attempts: u32,
        error: String,
    },
    TaskSkipped {
        task_id: String,
        because: String,
    },
    RunCancelled {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        succeeded: bool,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
}

impl RunEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receives run events. Called from concurrently running tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Forwards events to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: RunEvent) {
        log::trace!(target: "starpipe::events", "{}", event.to_json());
        match &event {
            RunEvent::RunStarted {
                run_id,
                pipeline,
                execution_date,
                tasks,
            } => log::info!(
                "Run {} of {} started for {} ({} tasks)",
                run_id,
                pipeline,
                execution_date,
                tasks
            ),
            RunEvent::TaskStarted { task_id, attempt } => {
                log::info!("Task {} started (attempt {})", task_id, attempt)
            }
            RunEvent::TaskLog { task_id, message } => log::info!("[{}] {}", task_id, message),
            RunEvent::TaskRetrying {
                task_id,
                attempt,
                delay_secs,
                error,
            } => log::warn!(
                "Task {} attempt {} failed, retrying in {}s: {}",
                task_id,
                attempt,
                delay_secs,
                error
            ),
            RunEvent::TaskSucceeded { task_id, attempts } => {
                log::info!("Task {} succeeded after {} attempt(s)", task_id, attempts)
            }
            RunEvent::TaskFailed {
                task_id,
                attempts,
                error,
            } => log::error!(
                "Task {} failed after {} attempt(s): {}",
                task_id,
                attempts,
                error
            ),
            RunEvent::TaskSkipped { task_id, because } => {
                log::warn!("Task {} skipped ({})", task_id, because)
            }
            RunEvent::RunCancelled { run_id } => log::warn!("Run {} cancelled", run_id),
            RunEvent::RunFinished {
                run_id,
                succeeded,
                completed,
                failed,
                skipped,
            } => {
                if *succeeded {
                    log::info!("Run {} succeeded ({} tasks)", run_id, completed)
                } else {
                    log::error!(
                        "Run {} failed: {} succeeded, {} failed, {} skipped",
                        run_id,
                        completed,
                        failed,
                        skipped
                    )
                }
            }
        }
    }
}

/// Pushes events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RunEvent) {
        // receiver may be gone, events are best effort
        let _ = self.tx.send(event);
    }
}
