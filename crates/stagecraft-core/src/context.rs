//! Explicit per-run and per-attempt context objects.
//!
//! `RunContext` is created by the controller for one run and passed down to
//! the execution backend; the backend derives a `TaskContext` for every
//! attempt it runs.

use std::time::Duration;

use serde_json::Value;
use stagecraft_types::error::TaskError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::signal::{SignalChannel, SignalError};

/// Everything scoped to one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub signals: SignalChannel,
    pub events: EventBus,
    /// Cancelling this token cancels every stage of the run.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: Uuid, signals: SignalChannel, events: EventBus) -> Self {
        Self {
            run_id,
            signals,
            events,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a task operation sees for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub stage: String,
    /// 1-based.
    pub attempt: u32,
    pub agent: Option<String>,
    signals: SignalChannel,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        run: &RunContext,
        stage: impl Into<String>,
        attempt: u32,
        agent: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run.run_id,
            stage: stage.into(),
            attempt,
            agent,
            signals: run.signals.clone(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the stage (or its run) is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Suspend this stage until signal `name` arrives for this run.
    ///
    /// A timeout surfaces as a `Timeout` task error, cancellation as `Cancelled`.
    pub async fn wait_for_signal(&self, name: &str, timeout: Duration) -> Result<Value, TaskError> {
        tokio::select! {
            result = self.signals.wait_for(self.run_id, name, timeout) => match result {
                Ok(payload) => Ok(payload),
                Err(e @ SignalError::Timeout(..)) => Err(TaskError::timeout(e.to_string())),
                Err(SignalError::Closed) => Err(TaskError::cancelled()),
            },
            _ = self.cancel.cancelled() => Err(TaskError::cancelled()),
        }
    }
}
