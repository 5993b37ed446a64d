//! The retry loop shared by every execution backend.
//!
//! Both backends drive the same `run_with_retry` and differ only in their
//! `AttemptDriver`: the in-process driver always executes, the durable one
//! serves attempts from history when it has them. Attempt counting, backoff
//! and error classification are therefore identical by construction.
//!
//! Backoff jitter is derived from a SHA-256 of `(run, stage, invocation,
//! attempt)` instead of a random source, so a replayed run computes the same
//! delays as the original.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use stagecraft_types::budget::{add_usage, ResourceKind, Usage};
use stagecraft_types::error::{ErrorKind, TaskError};
use stagecraft_types::event::ProgressEvent;
use stagecraft_types::run::ActivityResult;
use stagecraft_types::task::RetryPolicy;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionError, Outcome, OutcomeStatus};
use crate::context::{RunContext, TaskContext};

use super::registry::TaskDescriptor;

// ---------------------------------------------------------------------------
// Attempt execution
// ---------------------------------------------------------------------------

/// Source of attempt results for one invocation.
pub trait AttemptDriver: Send {
    /// Whether `attempt` will be answered from history without side effects.
    fn is_recorded(&self, attempt: u32) -> bool;

    fn attempt(
        &mut self,
        attempt: u32,
    ) -> impl Future<Output = Result<ActivityResult, ExecutionError>> + Send;
}

/// Execute one live attempt, bounded by `timeout_ms`.
///
/// Wall-clock time is added to the usage under `time_ms` unless the
/// operation reported it itself.
pub async fn execute_attempt(
    task: &TaskDescriptor,
    ctx: TaskContext,
    input: Value,
    timeout_ms: Option<u64>,
) -> ActivityResult {
    let started = Instant::now();
    let invocation = task.operation.invoke(ctx, input);
    let result = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::timeout(format!("attempt exceeded {ms}ms"))),
        },
        None => invocation.await,
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(mut output) => {
            output.usage.entry(ResourceKind::TimeMs).or_insert(elapsed_ms);
            ActivityResult::Completed { output }
        }
        Err(error) => ActivityResult::Failed {
            error,
            usage: Usage::from([(ResourceKind::TimeMs, elapsed_ms)]),
        },
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay after failed attempt `attempt`, with deterministic jitter.
pub fn backoff_delay(
    policy: &RetryPolicy,
    run_id: &Uuid,
    stage: &str,
    invocation: u32,
    attempt: u32,
) -> Duration {
    let base = policy.backoff.base_delay_ms(attempt);
    let jitter = policy.backoff.jitter();
    if base == 0 || jitter == 0.0 {
        return Duration::from_millis(base);
    }

    let digest = Sha256::digest(format!("{run_id}:{stage}:{invocation}:{attempt}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let unit = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
    let factor = 1.0 - jitter + 2.0 * jitter * unit;
    Duration::from_millis((base as f64 * factor).round() as u64)
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Identifies the invocation being retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryScope<'a> {
    pub run: &'a RunContext,
    pub stage: &'a str,
    pub invocation: u32,
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
}

/// Run attempts until success, a non-retryable error, exhaustion, or
/// cancellation.
///
/// Cancellation is honored between attempts, during backoff, and at the
/// next suspension point of a live attempt (the attempt future is dropped
/// there). Replayed attempts are never interrupted and their backoff is not
/// slept again when the following attempt is replayed too.
pub async fn run_with_retry<D: AttemptDriver>(
    driver: &mut D,
    scope: RetryScope<'_>,
) -> Result<Outcome, ExecutionError> {
    let max_attempts = scope.policy.max_attempts.max(1);
    let mut usage = Usage::new();

    for attempt in 1..=max_attempts {
        if scope.cancel.is_cancelled() {
            return Ok(Outcome::cancelled(attempt - 1, usage));
        }

        let recorded = driver.is_recorded(attempt);
        let result = if recorded {
            driver.attempt(attempt).await?
        } else {
            tokio::select! {
                biased;
                result = driver.attempt(attempt) => result?,
                _ = scope.cancel.cancelled() => return Ok(Outcome::cancelled(attempt, usage)),
            }
        };

        let error = match result {
            ActivityResult::Completed { output } => {
                add_usage(&mut usage, &output.usage);
                return Ok(Outcome {
                    status: OutcomeStatus::Completed(output.value),
                    attempts: attempt,
                    usage,
                });
            }
            ActivityResult::Failed {
                error,
                usage: spent,
            } => {
                add_usage(&mut usage, &spent);
                error
            }
        };

        if error.kind == ErrorKind::Cancelled {
            return Ok(Outcome::cancelled(attempt, usage));
        }
        if attempt >= max_attempts || !scope.policy.is_retryable(&error) {
            tracing::debug!(
                run_id = %scope.run.run_id,
                stage = scope.stage,
                attempt,
                error = %error,
                "invocation failed terminally"
            );
            return Ok(Outcome {
                status: OutcomeStatus::Failed(error),
                attempts: attempt,
                usage,
            });
        }

        let delay = backoff_delay(
            scope.policy,
            &scope.run.run_id,
            scope.stage,
            scope.invocation,
            attempt,
        );
        if recorded && driver.is_recorded(attempt + 1) {
            continue;
        }

        tracing::warn!(
            run_id = %scope.run.run_id,
            stage = scope.stage,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "retrying stage task"
        );
        scope.run.events.publish(ProgressEvent::StageRetrying {
            run_id: scope.run.run_id,
            stage_name: scope.stage.to_string(),
            attempt,
            backoff_ms: delay.as_millis() as u64,
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = scope.cancel.cancelled() => return Ok(Outcome::cancelled(attempt, usage)),
        }
    }

    Ok(Outcome::cancelled(max_attempts, usage))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
