//! Run result - structured outcome of one pipeline run

use super::graph::{TaskGraph, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Final state of a single task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub operator: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
    pub skipped_because: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub pipeline: String,
    pub execution_date: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub tasks: Vec<TaskOutcome>,
}

impl RunResult {
    /// Snapshot a finished graph. Succeeded only if every task succeeded.
    pub fn from_graph(
        graph: &TaskGraph,
        run_id: &str,
        pipeline: &str,
        execution_date: DateTime<Utc>,
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> Self {
        let tasks: Vec<TaskOutcome> = graph
            .nodes()
            .iter()
            .map(|node| TaskOutcome {
                task_id: node.id().to_string(),
                operator: node.operator().kind().to_string(),
                state: node.state(),
                attempts: node.attempts(),
                error: node.last_error().map(str::to_string),
                skipped_because: node.skipped_because().map(str::to_string),
                started_at: node.started_at(),
                finished_at: node.finished_at(),
            })
            .collect();

        let all_succeeded = tasks.iter().all(|t| t.state == TaskState::Succeeded);
        let status = if all_succeeded && !cancelled {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        Self {
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            execution_date,
            started_at,
            finished_at: Utc::now(),
            status,
            cancelled,
            tasks,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Process exit code: 0 on success
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    /// Human-readable multi-line summary for the terminal
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {} of {} for {}: {}\n",
            self.run_id,
            self.pipeline,
            self.execution_date.format("%Y-%m-%d"),
            self.status
        );
        for task in &self.tasks {
            let detail = match (task.state, &task.error, &task.skipped_because) {
                (TaskState::Failed, Some(err), _) => format!(" - {}", err),
                (TaskState::Skipped, _, Some(because)) => format!(" (because of {})", because),
                (_, _, _) if task.attempts > 1 => format!(" ({} attempts)", task.attempts),
                _ => String::new(),
            };
            out.push_str(&format!(
                "  {:<10} {}{}\n",
                task.state.to_string(),
                task.task_id,
                detail
            ));
        }
        out
    }
}
