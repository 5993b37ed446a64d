//! Task operations and the object-safe wrapper used by the registry.
//!
//! Same blanket-impl pattern as the agent invoker:
//! 1. `TaskOperation` uses native async fn in traits (RPITIT)
//! 2. `TaskOperationDyn` is its object-safe twin with boxed futures
//! 3. `BoxTaskOperation` wraps `Box<dyn TaskOperationDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use stagecraft_types::error::TaskError;
use stagecraft_types::task::TaskOutput;

use crate::context::TaskContext;

/// A unit of work a stage can be bound to.
///
/// Operations must be idempotent per attempt from the engine's point of
/// view: a failed attempt may be retried with the same input.
pub trait TaskOperation: Send + Sync + 'static {
    fn invoke(
        &self,
        ctx: TaskContext,
        input: Value,
    ) -> impl Future<Output = Result<TaskOutput, TaskError>> + Send;
}

/// Object-safe version of [`TaskOperation`].
pub trait TaskOperationDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        ctx: TaskContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutput, TaskError>> + Send + 'a>>;
}

impl<T: TaskOperation> TaskOperationDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        ctx: TaskContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutput, TaskError>> + Send + 'a>> {
        Box::pin(self.invoke(ctx, input))
    }
}

/// Type-erased task operation.
pub struct BoxTaskOperation {
    inner: Box<dyn TaskOperationDyn>,
}

impl BoxTaskOperation {
    pub fn new<T: TaskOperation>(operation: T) -> Self {
        Self {
            inner: Box::new(operation),
        }
    }

    pub async fn invoke(&self, ctx: TaskContext, input: Value) -> Result<TaskOutput, TaskError> {
        self.inner.invoke_boxed(ctx, input).await
    }
}

impl std::fmt::Debug for BoxTaskOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxTaskOperation")
    }
}

/// Adapter turning an async closure into a [`TaskOperation`].
pub struct FnTask<F>(F);

/// Build a task operation from `|ctx, input| async move { ... }`.
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
{
    FnTask(f)
}

impl<F, Fut> TaskOperation for FnTask<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
{
    fn invoke(
        &self,
        ctx: TaskContext,
        input: Value,
    ) -> impl Future<Output = Result<TaskOutput, TaskError>> + Send {
        (self.0)(ctx, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::event::bus::EventBus;
    use crate::signal::SignalChannel;
    use serde_json::json;
    use uuid::Uuid;

    struct Upper;

    impl TaskOperation for Upper {
        async fn invoke(&self, _ctx: TaskContext, input: Value) -> Result<TaskOutput, TaskError> {
            let text = input
                .as_str()
                .ok_or_else(|| TaskError::permanent("expected a string"))?;
            Ok(TaskOutput::new(json!(text.to_uppercase())))
        }
    }

    fn ctx() -> TaskContext {
        let run = RunContext::new(Uuid::now_v7(), SignalChannel::new(), EventBus::new(4));
        TaskContext::new(&run, "s", 1, None, run.cancel.child_token())
    }

    #[tokio::test]
    async fn boxed_struct_operation_delegates() {
        let op = BoxTaskOperation::new(Upper);
        let out = op.invoke(ctx(), json!("abc")).await.unwrap();
        assert_eq!(out.value, json!("ABC"));

        let err = op.invoke(ctx(), json!(1)).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn closure_operation_sees_context() {
        let op = BoxTaskOperation::new(task_fn(|ctx: TaskContext, _input| async move {
            Ok(TaskOutput::new(json!({"stage": ctx.stage, "attempt": ctx.attempt})))
        }));
        let out = op.invoke(ctx(), Value::Null).await.unwrap();
        assert_eq!(out.value, json!({"stage": "s", "attempt": 1}));
    }
}
