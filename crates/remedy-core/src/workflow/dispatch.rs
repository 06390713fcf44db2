//! Single-action dispatch shared by the scheduler and the rollback coordinator.
//!
//! One call runs one action under a hard deadline, retries transient executor
//! errors with backoff inside that deadline, and stops cooperatively when the
//! cancellation token fires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use remedy_types::config::RetryPolicy;
use remedy_types::execution::FailureCause;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::action::{ActionError, ActionExecutor, ActionRequest};
use super::retry::RetryHandler;

/// Terminal result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed {
        output: Value,
        attempts: u32,
    },
    Failed {
        cause: FailureCause,
        message: String,
        attempts: u32,
    },
}

impl DispatchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Completed { attempts, .. } | DispatchOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

/// Run `request` against `executor` under `timeout`.
pub async fn dispatch<E: ActionExecutor>(
    executor: &E,
    request: ActionRequest,
    timeout: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> DispatchOutcome {
    if cancel.is_cancelled() {
        return DispatchOutcome::Failed {
            cause: FailureCause::Cancelled,
            message: "cancelled before dispatch".to_string(),
            attempts: 0,
        };
    }

    let attempts = AtomicU32::new(0);
    let attempt_loop = async {
        loop {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let mut req = request.clone();
            req.attempt = attempt;

            match executor.execute(req).await {
                Ok(output) => return Ok(output),
                Err(err) if RetryHandler::should_retry(policy, attempt, &err) => {
                    let delay = RetryHandler::backoff_delay(policy, attempt);
                    tracing::debug!(
                        stage_id = request.stage_id.as_str(),
                        action = %request.action,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient executor error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        res = tokio::time::timeout(timeout, attempt_loop) => Some(res),
    };
    let attempts = attempts.load(Ordering::Relaxed);

    match result {
        None => DispatchOutcome::Failed {
            cause: FailureCause::Cancelled,
            message: "cancelled while running".to_string(),
            attempts,
        },
        Some(Err(_elapsed)) => DispatchOutcome::Failed {
            cause: FailureCause::Timeout,
            message: format!("timed out after {}s", timeout.as_secs_f64()),
            attempts,
        },
        Some(Ok(Ok(output))) => DispatchOutcome::Completed { output, attempts },
        Some(Ok(Err(err))) => DispatchOutcome::Failed {
            cause: FailureCause::ActionError,
            message: match err {
                ActionError::Transient(msg) => format!("retries exhausted: {msg}"),
                ActionError::Permanent(msg) => msg,
            },
            attempts,
        },
    }
}
