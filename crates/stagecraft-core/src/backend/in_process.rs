//! In-process backend: stage tasks run as tokio tasks, nothing is persisted.

use std::sync::Arc;

use serde_json::Value;
use stagecraft_types::run::{ActivityResult, BackendKind, WorkflowRunRecord};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{RunContext, TaskContext};
use crate::task::registry::TaskDescriptor;
use crate::task::retry::{execute_attempt, run_with_retry, AttemptDriver, RetryScope};

use super::{ExecutionBackend, ExecutionError, ExecutionHandle, InFlight, Outcome, TaskRequest};

/// Executes every attempt live on the current runtime.
#[derive(Default)]
pub struct InProcessBackend {
    in_flight: InFlight,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations started but not yet awaited.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancel and abort everything in flight.
    pub fn shutdown(&self) {
        self.in_flight.stop_all();
    }
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Always executes; never has history.
pub(crate) struct LiveDriver {
    pub(crate) task: Arc<TaskDescriptor>,
    pub(crate) run: RunContext,
    pub(crate) stage: String,
    pub(crate) agent: Option<String>,
    pub(crate) input: Value,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) cancel: CancellationToken,
}

impl LiveDriver {
    pub(crate) async fn execute(&self, attempt: u32) -> ActivityResult {
        let ctx = TaskContext::new(
            &self.run,
            self.stage.clone(),
            attempt,
            self.agent.clone(),
            self.cancel.clone(),
        );
        execute_attempt(&self.task, ctx, self.input.clone(), self.timeout_ms).await
    }
}

impl AttemptDriver for LiveDriver {
    fn is_recorded(&self, _attempt: u32) -> bool {
        false
    }

    async fn attempt(&mut self, attempt: u32) -> Result<ActivityResult, ExecutionError> {
        Ok(self.execute(attempt).await)
    }
}

impl ExecutionBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn start(&self, request: TaskRequest) -> Result<ExecutionHandle, ExecutionError> {
        tracing::debug!(
            run_id = %request.run.run_id,
            stage = %request.stage,
            task = %request.task.name,
            invocation = request.invocation,
            "starting in-process invocation"
        );
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
            let mut driver = LiveDriver {
                task,
                run: run.clone(),
                stage: stage.clone(),
                agent,
                input,
                timeout_ms: policy.timeout_ms,
                cancel: cancel.clone(),
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

    async fn checkpoint(&self, _record: &WorkflowRunRecord) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        _run_id: Uuid,
    ) -> Result<Option<WorkflowRunRecord>, ExecutionError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OutcomeStatus;
    use crate::event::bus::EventBus;
    use crate::signal::SignalChannel;
    use crate::task::operation::{task_fn, BoxTaskOperation};
    use serde_json::json;
    use stagecraft_types::budget::ResourceKind;
    use stagecraft_types::error::{ErrorKind, TaskError};
    use stagecraft_types::task::{BackoffPolicy, RetryPolicy, TaskOutput};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn request(run: &RunContext, operation: BoxTaskOperation, policy: RetryPolicy) -> TaskRequest {
        TaskRequest {
            run: run.clone(),
            stage: "draft".to_string(),
            invocation: 0,
            task: Arc::new(TaskDescriptor {
                name: "op".to_string(),
                operation,
                policy: policy.clone(),
            }),
            policy,
            input: json!({"topic": "rust"}),
            agent: None,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy::Fixed {
                delay_ms: 10,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn run_ctx() -> RunContext {
        RunContext::new(Uuid::now_v7(), SignalChannel::new(), EventBus::new(32))
    }

    #[tokio::test]
    async fn completes_and_reports_usage() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let op = BoxTaskOperation::new(task_fn(|_ctx, input| async move {
            Ok(TaskOutput::new(input).with_usage([(ResourceKind::Tokens, 12)].into()))
        }));

        let handle = backend.start(request(&run, op, fast_retry(1))).await.unwrap();
        let outcome = backend.await_result(&handle).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed(json!({"topic": "rust"})));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.usage.get(&ResourceKind::Tokens), Some(&12));
        assert!(outcome.usage.contains_key(&ResourceKind::TimeMs));
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = BoxTaskOperation::new(task_fn(move |ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(TaskError::transient("flaky upstream"))
                } else {
                    Ok(TaskOutput::new(json!("done")))
                }
            }
        }));

        let handle = backend.start(request(&run, op, fast_retry(3))).await.unwrap();
        let outcome = backend.await_result(&handle).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Completed(json!("done")));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_classified_and_retried() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let op = BoxTaskOperation::new(task_fn(|_ctx, _input| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(TaskOutput::new(json!(null)))
        }));
        let policy = RetryPolicy {
            timeout_ms: Some(100),
            ..fast_retry(2)
        };

        let handle = backend.start(request(&run, op, policy)).await.unwrap();
        let outcome = backend.await_result(&handle).await.unwrap();

        match outcome.status {
            OutcomeStatus::Failed(err) => assert_eq!(err.kind, ErrorKind::Timeout),
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn cancel_interrupts_running_attempt() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let op = BoxTaskOperation::new(task_fn(|_ctx, _input| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(TaskOutput::new(json!(null)))
        }));

        let handle = backend.start(request(&run, op, fast_retry(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.cancel(&handle);
        let outcome = backend.await_result(&handle).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
    }

    fn hanging_op() -> BoxTaskOperation {
        BoxTaskOperation::new(task_fn(|_ctx, _input| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(TaskOutput::new(json!(null)))
        }))
    }

    #[tokio::test]
    async fn cancel_reaches_attempt_being_awaited() {
        let backend = Arc::new(InProcessBackend::new());
        let run = run_ctx();
        let handle = backend.start(request(&run, hanging_op(), fast_retry(1))).await.unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            let handle = handle.clone();
            tokio::spawn(async move { backend.await_result(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.in_flight(), 1);
        backend.cancel(&handle);

        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cancel did not reach the attempt")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_stops_the_invocation() {
        let backend = Arc::new(InProcessBackend::new());
        let run = run_ctx();
        let handle = backend.start(request(&run, hanging_op(), fast_retry(1))).await.unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            let handle = handle.clone();
            tokio::spawn(async move { backend.await_result(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_unawaited_invocations() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let handle = backend.start(request(&run, hanging_op(), fast_retry(1))).await.unwrap();
        assert_eq!(backend.in_flight(), 1);

        backend.shutdown();

        assert_eq!(backend.in_flight(), 0);
        assert!(matches!(
            backend.await_result(&handle).await,
            Err(ExecutionError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn panicking_task_becomes_permanent_failure() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let op = BoxTaskOperation::new(task_fn(|_ctx, _input| async move {
            if true {
                panic!("boom");
            }
            Ok(TaskOutput::new(json!(null)))
        }));

        let handle = backend.start(request(&run, op, fast_retry(1))).await.unwrap();
        let outcome = backend.await_result(&handle).await.unwrap();
        match outcome.status {
            OutcomeStatus::Failed(err) => assert_eq!(err.kind, ErrorKind::Permanent),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn awaiting_twice_is_unknown_handle() {
        let backend = InProcessBackend::new();
        let run = run_ctx();
        let op = BoxTaskOperation::new(task_fn(|_ctx, input| async move { Ok(TaskOutput::new(input)) }));
        let handle = backend.start(request(&run, op, fast_retry(1))).await.unwrap();
        backend.await_result(&handle).await.unwrap();
        assert!(matches!(
            backend.await_result(&handle).await,
            Err(ExecutionError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn no_checkpoint_storage() {
        let backend = InProcessBackend::new();
        assert_eq!(backend.kind(), BackendKind::InProcess);
        assert!(backend.load_checkpoint(Uuid::now_v7()).await.unwrap().is_none());
    }
}
