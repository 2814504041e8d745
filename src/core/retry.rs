//! Retry policy - bounded attempts with a fixed delay
//!
//! Only transient operator errors are retried. Configuration problems,
//! template errors and quality-gate failures surface on the first attempt.

use super::context::ExecutionContext;
use super::events::RunEvent;
use crate::error::OperatorError;
use crate::operators::Operator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        delay: Duration::from_secs(5 * 60),
    };

    pub const NONE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Last error after retries stopped
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: OperatorError,
    pub attempts: u32,
}

/// Execute `operator` for `task_id` under `policy`.
///
/// Each attempt runs on its own spawned task so a panic is reported as a
/// fatal failure of this task alone. Cancellation stops further attempts
/// but never interrupts the one in flight.
pub async fn with_retry(
    operator: Arc<dyn Operator>,
    ctx: Arc<ExecutionContext>,
    task_id: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u32, RetryFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        ctx.emit(RunEvent::TaskStarted {
            task_id: task_id.to_string(),
            attempt,
        });

        let op = operator.clone();
        let run = ctx.clone();
        let id = task_id.to_string();
        let result = tokio::spawn(async move {
            let task = run.for_task(&id);
            op.execute(&task).await
        })
        .await
        .unwrap_or_else(|e| Err(OperatorError::fatal(format!("operator panicked: {}", e))));

        let error = match result {
            Ok(()) => return Ok(attempt),
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
            return Err(RetryFailure {
                error,
                attempts: attempt,
            });
        }

        ctx.emit(RunEvent::TaskRetrying {
            task_id: task_id.to_string(),
            attempt,
            delay_secs: policy.delay.as_secs(),
            error: error.to_string(),
        });

        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = cancel.cancelled() => {
                return Err(RetryFailure { error, attempts: attempt });
            }
        }
    }
}
