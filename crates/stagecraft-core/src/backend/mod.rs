//! Execution backends: one contract, two implementations.
//!
//! - `in_process` -- tasks run as tokio tasks on the current runtime; nothing
//!   survives process exit.
//! - `durable` -- every attempt is journaled; on restart, journaled attempts
//!   are replayed from history and only the next unfinished attempt performs
//!   new side effects.
//!
//! The controller is generic over `ExecutionBackend` and never sees
//! backend-internal state, only `ExecutionHandle`s.

pub mod durable;
pub mod in_process;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use stagecraft_types::budget::Usage;
use stagecraft_types::error::TaskError;
use stagecraft_types::run::{BackendKind, WorkflowRunRecord};
use stagecraft_types::task::RetryPolicy;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::CheckpointError;
use crate::context::RunContext;
use crate::task::registry::TaskDescriptor;

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// One task invocation on behalf of a stage.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub run: RunContext,
    pub stage: String,
    /// 0 for the stage's task, 1 for its fallback.
    pub invocation: u32,
    pub task: Arc<TaskDescriptor>,
    /// Effective policy (a stage override or the task's own).
    pub policy: RetryPolicy,
    pub input: Value,
    pub agent: Option<String>,
}

/// Opaque reference to an in-flight invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionHandle {
    id: Uuid,
    pub run_id: Uuid,
    pub stage: String,
}

impl ExecutionHandle {
    fn new(run_id: Uuid, stage: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            stage: stage.to_string(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Completed(Value),
    Failed(TaskError),
    Cancelled,
}

/// Terminal result of an invocation after the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub attempts: u32,
    /// Summed over every attempt, failed ones included.
    pub usage: Usage,
}

impl Outcome {
    pub fn cancelled(attempts: u32, usage: Usage) -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            attempts,
            usage,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unknown execution handle {0}")]
    UnknownHandle(Uuid),

    #[error("task execution aborted: {0}")]
    Join(String),

    #[error(transparent)]
    Replay(#[from] durable::ReplayError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Shared execution contract.
///
/// `checkpoint`/`load_checkpoint` let the controller persist run records
/// without knowing which backend it drives: the in-process backend keeps
/// nothing, the durable backend writes through to its repository.
pub trait ExecutionBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn start(
        &self,
        request: TaskRequest,
    ) -> impl Future<Output = Result<ExecutionHandle, ExecutionError>> + Send;

    /// Wait for the invocation's terminal outcome. Each handle can be
    /// awaited once.
    fn await_result(
        &self,
        handle: &ExecutionHandle,
    ) -> impl Future<Output = Result<Outcome, ExecutionError>> + Send;

    /// Request cooperative cancellation. Unknown handles are ignored.
    fn cancel(&self, handle: &ExecutionHandle);

    fn checkpoint(
        &self,
        record: &WorkflowRunRecord,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send;

    fn load_checkpoint(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRunRecord>, ExecutionError>> + Send;
}

// ---------------------------------------------------------------------------
// In-flight bookkeeping shared by both backends
// ---------------------------------------------------------------------------

struct InFlightEntry {
    /// Taken by the single `wait` call.
    join: Option<JoinHandle<Result<Outcome, ExecutionError>>>,
    abort: AbortHandle,
    cancel: CancellationToken,
}

impl InFlightEntry {
    fn stop(&self) {
        self.cancel.cancel();
        self.abort.abort();
    }
}

/// Spawned invocations keyed by handle id.
///
/// An entry lives until its invocation has been awaited to the end. If the
/// awaiting future is dropped first, the invocation is cancelled and aborted:
/// nobody is left to observe its outcome.
#[derive(Default)]
pub(crate) struct InFlight {
    entries: DashMap<Uuid, InFlightEntry>,
}

/// Removes and stops an entry when `wait` finishes or is dropped.
struct WaitGuard<'a> {
    entries: &'a DashMap<Uuid, InFlightEntry>,
    id: Uuid,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, entry)) = self.entries.remove(&self.id) {
            entry.stop();
        }
    }
}

impl InFlight {
    /// Spawn `work`; it receives a stage token that is a child of the run's.
    pub(crate) fn spawn<F, Fut>(&self, run: &RunContext, stage: &str, work: F) -> ExecutionHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Outcome, ExecutionError>> + Send + 'static,
    {
        let handle = ExecutionHandle::new(run.run_id, stage);
        let cancel = run.cancel.child_token();
        let join = tokio::spawn(work(cancel.clone()));
        let abort = join.abort_handle();
        self.entries.insert(
            handle.id,
            InFlightEntry {
                join: Some(join),
                abort,
                cancel,
            },
        );
        handle
    }

    /// Await the invocation. The entry stays registered, and so cancellable,
    /// until the join completes.
    pub(crate) async fn wait(&self, handle: &ExecutionHandle) -> Result<Outcome, ExecutionError> {
        let join = self
            .entries
            .get_mut(&handle.id)
            .and_then(|mut entry| entry.join.take())
            .ok_or(ExecutionError::UnknownHandle(handle.id))?;
        let _guard = WaitGuard {
            entries: &self.entries,
            id: handle.id,
        };

        match join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Ok(Outcome {
                status: OutcomeStatus::Failed(TaskError::permanent(format!(
                    "task panicked in stage '{}'",
                    handle.stage
                ))),
                attempts: 1,
                usage: Usage::new(),
            }),
            Err(e) => Err(ExecutionError::Join(e.to_string())),
        }
    }

    pub(crate) fn cancel(&self, handle: &ExecutionHandle) {
        if let Some(entry) = self.entries.get(&handle.id) {
            tracing::debug!(run_id = %handle.run_id, stage = %handle.stage, "cancelling invocation");
            entry.cancel.cancel();
        }
    }

    /// Cancel and abort every invocation and forget them.
    pub(crate) fn stop_all(&self) {
        let ids: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.stop();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.stop();
        }
    }
}
