//! Durable backend: journaled attempts, replay on restart.
//!
//! Before an invocation starts, its journal (`run, stage, invocation`) is
//! loaded and checked against the request. The retry loop then asks the
//! driver for each attempt; attempts present in the journal are answered
//! from it without running the operation, the first missing attempt runs
//! live and is journaled once it finishes.
//!
//! Attempts interrupted by cancellation are never journaled, so a resumed
//! run executes them again.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use stagecraft_types::error::ErrorKind;
use stagecraft_types::run::{ActivityRecord, ActivityResult, BackendKind, WorkflowRunRecord};
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{fingerprint, CheckpointError, CheckpointManager};
use crate::repository::run::RunRepository;
use crate::task::retry::{run_with_retry, AttemptDriver, RetryScope};

use super::in_process::LiveDriver;
use super::{ExecutionBackend, ExecutionError, ExecutionHandle, InFlight, Outcome, TaskRequest};

/// History does not match the invocation being replayed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error(
        "stage '{stage}' attempt {attempt} was recorded for task '{recorded}', now bound to '{requested}'"
    )]
    TaskMismatch {
        stage: String,
        attempt: u32,
        recorded: String,
        requested: String,
    },

    #[error("stage '{stage}' attempt {attempt} was recorded with a different input")]
    InputMismatch {
        stage: String,
        attempt: u32,
        recorded: String,
        current: String,
    },
}

/// Execution backend over a `RunRepository`.
pub struct DurableBackend<R: RunRepository> {
    checkpoints: Arc<CheckpointManager<R>>,
    in_flight: InFlight,
}

impl<R: RunRepository> DurableBackend<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            checkpoints: Arc::new(CheckpointManager::new(repo)),
            in_flight: InFlight::default(),
        }
    }

    /// Runs whose record is not terminal; candidates for resume.
    pub async fn incomplete_runs(&self) -> Result<Vec<WorkflowRunRecord>, ExecutionError> {
        Ok(self.checkpoints.incomplete_runs().await?)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop this worker: every in-flight attempt is cancelled and its task
    /// aborted. Aborted attempts are never journaled, so a resume elsewhere
    /// re-executes them.
    pub fn shutdown(&self) {
        tracing::info!(in_flight = self.in_flight.len(), "durable backend shutting down");
        self.in_flight.stop_all();
    }
}

fn verify_history(
    request: &TaskRequest,
    input_hash: &str,
    history: &BTreeMap<u32, ActivityRecord>,
) -> Result<(), ReplayError> {
    for (attempt, record) in history {
        if record.task != request.task.name {
            return Err(ReplayError::TaskMismatch {
                stage: request.stage.clone(),
                attempt: *attempt,
                recorded: record.task.clone(),
                requested: request.task.name.clone(),
            });
        }
        if record.input_hash != input_hash {
            return Err(ReplayError::InputMismatch {
                stage: request.stage.clone(),
                attempt: *attempt,
                recorded: record.input_hash.clone(),
                current: input_hash.to_string(),
            });
        }
    }
    Ok(())
}

struct DurableDriver<R: RunRepository> {
    live: LiveDriver,
    history: BTreeMap<u32, ActivityRecord>,
    checkpoints: Arc<CheckpointManager<R>>,
    invocation: u32,
    input_hash: String,
}

impl<R: RunRepository> AttemptDriver for DurableDriver<R> {
    fn is_recorded(&self, attempt: u32) -> bool {
        self.history.contains_key(&attempt)
    }

    async fn attempt(&mut self, attempt: u32) -> Result<ActivityResult, ExecutionError> {
        if let Some(record) = self.history.get(&attempt) {
            tracing::debug!(
                run_id = %self.live.run.run_id,
                stage = %self.live.stage,
                invocation = self.invocation,
                attempt,
                "replaying attempt from journal"
            );
            return Ok(record.result.clone());
        }

        let result = self.live.execute(attempt).await;
        let cancelled = matches!(
            &result,
            ActivityResult::Failed { error, .. } if error.kind == ErrorKind::Cancelled
        );
        if !cancelled {
            let record = ActivityRecord {
                run_id: self.live.run.run_id,
                stage: self.live.stage.clone(),
                invocation: self.invocation,
                attempt,
                task: self.live.task.name.clone(),
                input_hash: self.input_hash.clone(),
                result: result.clone(),
                recorded_at: Utc::now(),
            };
            self.checkpoints.record_activity(&record).await?;
        }
        Ok(result)
    }
}

impl<R: RunRepository> ExecutionBackend for DurableBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn start(&self, request: TaskRequest) -> Result<ExecutionHandle, ExecutionError> {
        let input_hash = fingerprint(&request.input);
        let history = self
            .checkpoints
            .history(request.run.run_id, &request.stage, request.invocation)
            .await?;
        verify_history(&request, &input_hash, &history)?;

        tracing::debug!(
            run_id = %request.run.run_id,
            stage = %request.stage,
            task = %request.task.name,
            invocation = request.invocation,
            journaled = history.len(),
            "starting durable invocation"
        );

        let checkpoints = Arc::clone(&self.checkpoints);
        let run_ctx = request.run.clone();
        let stage_name = request.stage.clone();
        let handle = self.in_flight.spawn(&run_ctx, &stage_name, move |cancel| async move {
            let TaskRequest {
                run,
                stage,
                invocation,
                task,
                policy,
                input,
                agent,
            } = request;
            let mut driver = DurableDriver {
                live: LiveDriver {
                    task,
                    run: run.clone(),
                    stage: stage.clone(),
                    agent,
                    input,
                    timeout_ms: policy.timeout_ms,
                    cancel: cancel.clone(),
                },
                history,
                checkpoints,
                invocation,
                input_hash,
            };
            run_with_retry(
                &mut driver,
                RetryScope {
                    run: &run,
                    stage: &stage,
                    invocation,
                    policy: &policy,
                    cancel: &cancel,
                },
            )
            .await
        });
        Ok(handle)
    }

    async fn await_result(&self, handle: &ExecutionHandle) -> Result<Outcome, ExecutionError> {
        self.in_flight.wait(handle).await
    }

    fn cancel(&self, handle: &ExecutionHandle) {
        self.in_flight.cancel(handle);
    }

    async fn checkpoint(&self, record: &WorkflowRunRecord) -> Result<(), ExecutionError> {
        Ok(self.checkpoints.save_run(record).await?)
    }

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowRunRecord>, ExecutionError> {
        match self.checkpoints.load_run(run_id).await {
            Ok(record) => Ok(Some(record)),
            Err(CheckpointError::RunNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: RunRepository> std::fmt::Debug for DurableBackend<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBackend")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
