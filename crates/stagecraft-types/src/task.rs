//! Task-level types: retry policy, backoff, and task output.

use serde::{Deserialize, Serialize};

use crate::budget::Usage;
use crate::error::{ErrorKind, TaskError};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry and timeout policy attached to a task at registration time.
///
/// A stage may carry an override that replaces the task's policy wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt deadline in milliseconds. `None` = unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Error kinds that qualify for another attempt.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
    /// When set, an attempt timeout ends the invocation immediately.
    #[serde(default)]
    pub timeout_fatal: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![ErrorKind::Transient, ErrorKind::Timeout]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_ms: None,
            backoff: BackoffPolicy::default(),
            retry_on: default_retry_on(),
            timeout_fatal: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether `error` qualifies for another attempt under this policy.
    ///
    /// Attempt counting is the caller's concern; this only classifies.
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        match error.kind {
            ErrorKind::Timeout if self.timeout_fatal => false,
            ErrorKind::Timeout => self.retry_on.contains(&ErrorKind::Timeout),
            ErrorKind::Cancelled | ErrorKind::BudgetExhausted | ErrorKind::ReplayMismatch => false,
            kind => error.retryable && self.retry_on.contains(&kind),
        }
    }
}

/// Delay schedule between attempts.
///
/// `jitter` is a fraction in `[0, 1)`: the effective delay is drawn from
/// `base * (1 - jitter) ..= base * (1 + jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        jitter: f64,
    },
    Exponential {
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay_ms")]
        max_ms: u64,
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            initial_ms: 500,
            multiplier: default_multiplier(),
            max_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    /// Jitter is not applied here.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        match self {
            BackoffPolicy::Fixed { delay_ms, .. } => *delay_ms,
            BackoffPolicy::Exponential {
                initial_ms,
                multiplier,
                max_ms,
                ..
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let raw = (*initial_ms as f64) * multiplier.powi(exp);
                if raw.is_finite() {
                    (raw as u64).min(*max_ms)
                } else {
                    *max_ms
                }
            }
        }
    }

    pub fn jitter(&self) -> f64 {
        match self {
            BackoffPolicy::Fixed { jitter, .. } | BackoffPolicy::Exponential { jitter, .. } => {
                jitter.clamp(0.0, 0.99)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task output
// ---------------------------------------------------------------------------

/// What a task operation returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    /// Actual resource consumption, reconciled against the stage's estimates.
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
}

impl TaskOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            usage: Usage::new(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}
