//! Task Scheduler - drives a task graph to completion
//!
//! Ready tasks are dispatched onto a bounded pool of tokio tasks. Each
//! completion is written back into the graph, which turns failures into
//! skips downstream, until nothing is running and nothing is ready.

use super::context::ExecutionContext;
use super::events::RunEvent;
use super::graph::{Completion, TaskGraph, TaskState};
use super::result::RunResult;
use super::retry::{with_retry, RetryPolicy};
use crate::operators::Operator;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

const CANCELLED: &str = "run cancelled";

/// Task scheduler with a concurrency limit
pub struct Scheduler {
    concurrency: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task of `graph` once, honouring dependencies.
    ///
    /// On cancellation nothing new is dispatched, running attempts finish,
    /// and tasks that never started are skipped.
    pub async fn run(&self, graph: &mut TaskGraph, ctx: Arc<ExecutionContext>) -> RunResult {
        let started_at = Utc::now();
        ctx.emit(RunEvent::RunStarted {
            run_id: ctx.run_id().to_string(),
            pipeline: ctx.pipeline().to_string(),
            execution_date: ctx.logical_time().format("%Y-%m-%d").to_string(),
            tasks: graph.len(),
        });

        let mut running: JoinSet<(String, Completion)> = JoinSet::new();
        let mut workers: HashMap<task::Id, String> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                ctx.emit(RunEvent::RunCancelled {
                    run_id: ctx.run_id().to_string(),
                });
            }

            if !cancelled {
                self.dispatch_ready(graph, &ctx, &mut running, &mut workers);
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next_with_id() => match joined {
                    Some(Ok((worker, (id, completion)))) => {
                        workers.remove(&worker);
                        record(graph, &ctx, &id, completion);
                    }
                    Some(Err(e)) => match workers.remove(&e.id()) {
                        // the attempt itself is panic-safe, so this is the
                        // bookkeeping around it going wrong
                        Some(id) => {
                            log::error!("Worker for task {} died: {}", id, e);
                            let completion = Completion::Failed {
                                attempts: 1,
                                error: format!("task worker panicked: {}", e),
                            };
                            record(graph, &ctx, &id, completion);
                        }
                        None => log::error!("Unknown scheduler worker was lost: {}", e),
                    },
                    None => break,
                },
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    ctx.emit(RunEvent::RunCancelled {
                        run_id: ctx.run_id().to_string(),
                    });
                }
            }
        }

        let because = if cancelled {
            CANCELLED
        } else {
            "dependencies never completed"
        };
        for id in graph.skip_pending(because) {
            ctx.emit(RunEvent::TaskSkipped {
                task_id: id,
                because: because.to_string(),
            });
        }

        let result = RunResult::from_graph(
            graph,
            ctx.run_id(),
            ctx.pipeline(),
            ctx.logical_time(),
            started_at,
            cancelled,
        );
        ctx.emit(RunEvent::RunFinished {
            run_id: result.run_id.clone(),
            succeeded: result.succeeded(),
            completed: result.count(TaskState::Succeeded),
            failed: result.count(TaskState::Failed),
            skipped: result.count(TaskState::Skipped),
        });
        result
    }

    fn dispatch_ready(
        &self,
        graph: &mut TaskGraph,
        ctx: &Arc<ExecutionContext>,
        running: &mut JoinSet<(String, Completion)>,
        workers: &mut HashMap<task::Id, String>,
    ) {
        let capacity = self.concurrency.saturating_sub(running.len());
        let ready: Vec<(String, Arc<dyn Operator>, RetryPolicy)> = graph
            .ready_nodes()
            .into_iter()
            .take(capacity)
            .map(|node| (node.id().to_string(), node.operator().clone(), node.retry()))
            .collect();

        for (id, operator, policy) in ready {
            if let Err(e) = graph.mark_running(&id) {
                log::error!("Cannot dispatch {}: {}", id, e);
                continue;
            }

            let handle = running.spawn(run_task(
                id.clone(),
                operator,
                ctx.clone(),
                policy,
                self.cancel.clone(),
            ));
            workers.insert(handle.id(), id);
        }
    }
}

async fn run_task(
    id: String,
    operator: Arc<dyn Operator>,
    ctx: Arc<ExecutionContext>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> (String, Completion) {
    let completion = match with_retry(operator, ctx.clone(), &id, policy, &cancel).await {
        Ok(attempts) => {
            ctx.emit(RunEvent::TaskSucceeded {
                task_id: id.clone(),
                attempts,
            });
            Completion::Succeeded { attempts }
        }
        Err(failure) => {
            let error = failure.error.to_string();
            ctx.emit(RunEvent::TaskFailed {
                task_id: id.clone(),
                attempts: failure.attempts,
                error: error.clone(),
            });
            Completion::Failed {
                attempts: failure.attempts,
                error,
            }
        }
    };
    (id, completion)
}

fn record(graph: &mut TaskGraph, ctx: &ExecutionContext, id: &str, completion: Completion) {
    match graph.mark_result(id, completion) {
        Ok(skipped) => {
            for task_id in skipped {
                ctx.emit(RunEvent::TaskSkipped {
                    task_id,
                    because: id.to_string(),
                });
            }
        }
        Err(e) => log::error!("Cannot record result of {}: {}", id, e),
    }
}
