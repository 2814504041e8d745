//! Core engine - task graph, execution context, retries and scheduling

mod context;
mod events;
mod graph;
mod result;
mod retry;
mod scheduler;
pub mod template;

pub use context::{ExecutionContext, TaskContext};
pub use events::{ChannelSink, EventSink, LogSink, RunEvent};
pub use graph::{Completion, Edge, TaskGraph, TaskNode, TaskState};
pub use result::{RunResult, RunStatus, TaskOutcome};
pub use retry::{with_retry, RetryFailure, RetryPolicy};
pub use scheduler::Scheduler;
pub use template::Variables;
pub use tokio_util::sync::CancellationToken;
