//! Built-in tasks registered by the binary.
//!
//! - `echo`: returns its input unchanged.
//! - `agent`: forwards the input to the stage's agent over HTTP.
//! - `wait_signal`: suspends until a named signal arrives for the run. Input
//!   is `{"signal": "<name>", "timeout_secs": <n>}`; the payload of the
//!   signal becomes the output.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use stagecraft_core::agent::AgentTask;
use stagecraft_core::context::TaskContext;
use stagecraft_core::task::operation::{TaskOperation, task_fn};
use stagecraft_core::task::registry::TaskRegistry;
use stagecraft_infra::agent::http::HttpAgentInvoker;
use stagecraft_types::config::EngineConfig;
use stagecraft_types::error::TaskError;
use stagecraft_types::task::{RetryPolicy, TaskOutput};

pub const ECHO: &str = "echo";
pub const AGENT: &str = "agent";
pub const WAIT_SIGNAL: &str = "wait_signal";

const DEFAULT_SIGNAL_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Registry holding every built-in task.
///
/// The agent task uses the configured retry policy; `echo` and
/// `wait_signal` are never retried.
pub fn build_registry(config: &EngineConfig) -> anyhow::Result<TaskRegistry> {
    let registry = TaskRegistry::new();

    registry.register(
        ECHO,
        task_fn(|_ctx, input| async move { Ok(TaskOutput::new(input)) }),
        RetryPolicy::no_retry(),
    )?;

    let invoker = HttpAgentInvoker::new(&config.agent)?;
    registry.register(AGENT, AgentTask::new(Arc::new(invoker)), config.retry.clone())?;

    registry.register(WAIT_SIGNAL, WaitSignalTask, RetryPolicy::no_retry())?;

    Ok(registry)
}

#[derive(Debug, Deserialize)]
struct WaitSignalInput {
    signal: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Suspends the stage on a signal.
pub struct WaitSignalTask;

impl TaskOperation for WaitSignalTask {
    async fn invoke(&self, ctx: TaskContext, input: Value) -> Result<TaskOutput, TaskError> {
        let WaitSignalInput {
            signal,
            timeout_secs,
        } = serde_json::from_value(input).map_err(|e| {
            TaskError::permanent(format!("wait_signal expects {{\"signal\": name}}: {e}"))
        })?;
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_SIGNAL_TIMEOUT_SECS));

        tracing::info!(run_id = %ctx.run_id, stage = %ctx.stage, signal = %signal, "waiting for signal");
        let payload = ctx.wait_for_signal(&signal, timeout).await?;
        Ok(TaskOutput::new(payload))
    }
}
