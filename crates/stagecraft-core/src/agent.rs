//! Agent invocation port and the task adapter built on it.
//!
//! Same blanket-impl pattern as the task operations:
//! 1. `AgentInvoker` uses native async fn in traits (RPITIT)
//! 2. `AgentInvokerDyn` is its object-safe twin with boxed futures
//! 3. `BoxAgentInvoker` wraps `Box<dyn AgentInvokerDyn>` and delegates
//!
//! The engine never looks inside payloads. Only the error kind of a failed
//! call matters, for retry classification.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagecraft_types::budget::Usage;
use stagecraft_types::error::TaskError;
use stagecraft_types::task::TaskOutput;

use crate::context::TaskContext;
use crate::task::operation::TaskOperation;

/// Successful agent call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: Value,
    /// Resources the agent reports having spent.
    #[serde(default)]
    pub usage: Usage,
}

/// `call(agent_ref, operation, input) -> output | error`.
pub trait AgentInvoker: Send + Sync + 'static {
    fn call(
        &self,
        agent: &str,
        operation: &str,
        input: Value,
    ) -> impl Future<Output = Result<AgentResponse, TaskError>> + Send;
}

/// Object-safe version of [`AgentInvoker`].
pub trait AgentInvokerDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        agent: &'a str,
        operation: &'a str,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, TaskError>> + Send + 'a>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn call_boxed<'a>(
        &'a self,
        agent: &'a str,
        operation: &'a str,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, TaskError>> + Send + 'a>> {
        Box::pin(self.call(agent, operation, input))
    }
}

/// Type-erased agent invoker, selected at startup.
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }
}

impl AgentInvoker for BoxAgentInvoker {
    async fn call(
        &self,
        agent: &str,
        operation: &str,
        input: Value,
    ) -> Result<AgentResponse, TaskError> {
        self.inner.call_boxed(agent, operation, input).await
    }
}

impl std::fmt::Debug for BoxAgentInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxAgentInvoker")
    }
}

// ---------------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------------

/// Task operation that forwards the stage input to the stage's agent.
///
/// The operation name defaults to the stage name.
pub struct AgentTask<A: AgentInvoker> {
    invoker: Arc<A>,
    operation: Option<String>,
}

impl<A: AgentInvoker> AgentTask<A> {
    pub fn new(invoker: Arc<A>) -> Self {
        Self {
            invoker,
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

impl<A: AgentInvoker> TaskOperation for AgentTask<A> {
    async fn invoke(&self, ctx: TaskContext, input: Value) -> Result<TaskOutput, TaskError> {
        let Some(agent) = ctx.agent.as_deref() else {
            return Err(TaskError::permanent(format!(
                "stage '{}' has no agent reference",
                ctx.stage
            )));
        };
        let operation = self.operation.as_deref().unwrap_or(&ctx.stage);

        tracing::debug!(
            run_id = %ctx.run_id,
            stage = %ctx.stage,
            attempt = ctx.attempt,
            agent,
            operation,
            "calling agent"
        );
        let response = tokio::select! {
            response = self.invoker.call(agent, operation, input) => response?,
            _ = ctx.cancelled() => return Err(TaskError::cancelled()),
        };
        Ok(TaskOutput::new(response.output).with_usage(response.usage))
    }
}
