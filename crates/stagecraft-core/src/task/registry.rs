//! Task registry: static mapping from task name to operation and policy.
//!
//! Built at startup and shared read-only (`Arc<TaskRegistry>`) across
//! concurrent stage executions. Descriptors are immutable once registered;
//! registering a name twice is an error rather than a silent replacement.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use stagecraft_types::task::RetryPolicy;
use thiserror::Error;

use crate::backend::{ExecutionBackend, ExecutionError, Outcome, TaskRequest};
use crate::context::RunContext;

use super::operation::{BoxTaskOperation, TaskOperation};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

/// A registered task: name, operation, and its retry/timeout policy.
#[derive(Debug)]
pub struct TaskDescriptor {
    pub name: String,
    pub operation: BoxTaskOperation,
    pub policy: RetryPolicy,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TaskOperation>(
        &self,
        name: impl Into<String>,
        operation: T,
        policy: RetryPolicy,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.tasks.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(name)),
            Entry::Vacant(slot) => {
                tracing::debug!(task = %name, max_attempts = policy.max_attempts, "task registered");
                slot.insert(Arc::new(TaskDescriptor {
                    name,
                    operation: BoxTaskOperation::new(operation),
                    policy,
                }));
                Ok(())
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<TaskDescriptor>, RegistryError> {
        self.tasks
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `name` once, outside any stage graph, through `backend`.
    ///
    /// The invocation is labelled with the task name in place of a stage name.
    pub async fn invoke<B: ExecutionBackend>(
        &self,
        backend: &B,
        run: &RunContext,
        name: &str,
        input: Value,
    ) -> Result<Outcome, InvokeError> {
        let task = self.resolve(name)?;
        let request = TaskRequest {
            run: run.clone(),
            stage: name.to_string(),
            invocation: 0,
            policy: task.policy.clone(),
            task,
            input,
            agent: None,
        };
        let handle = backend.start(request).await?;
        Ok(backend.await_result(&handle).await?)
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::in_process::InProcessBackend;
    use crate::backend::OutcomeStatus;
    use crate::event::bus::EventBus;
    use crate::signal::SignalChannel;
    use crate::task::operation::task_fn;
    use serde_json::json;
    use stagecraft_types::task::TaskOutput;
    use uuid::Uuid;

    fn echo() -> impl TaskOperation {
        task_fn(|_ctx, input| async move { Ok(TaskOutput::new(input)) })
    }

    #[test]
    fn register_and_resolve() {
        let registry = TaskRegistry::new();
        registry.register("echo", echo(), RetryPolicy::default()).unwrap();
        let task = registry.resolve("echo").unwrap();
        assert_eq!(task.name, "echo");
        assert_eq!(task.policy.max_attempts, 3);
        assert!(registry.contains("echo"));
    }

    #[test]
    fn duplicate_registration_rejected_and_original_kept() {
        let registry = TaskRegistry::new();
        registry.register("echo", echo(), RetryPolicy::default()).unwrap();
        let err = registry
            .register("echo", echo(), RetryPolicy::no_retry())
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("echo".to_string()));
        assert_eq!(registry.resolve("echo").unwrap().policy.max_attempts, 3);
    }

    #[test]
    fn unknown_task() {
        let registry = TaskRegistry::new();
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            RegistryError::UnknownTask("nope".to_string())
        );
    }

    #[test]
    fn names_sorted() {
        let registry = TaskRegistry::new();
        registry.register("b", echo(), RetryPolicy::default()).unwrap();
        registry.register("a", echo(), RetryPolicy::default()).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn invoke_runs_through_backend() {
        let registry = TaskRegistry::new();
        registry.register("echo", echo(), RetryPolicy::default()).unwrap();
        let backend = InProcessBackend::new();
        let run = RunContext::new(Uuid::now_v7(), SignalChannel::new(), EventBus::new(8));

        let outcome = registry
            .invoke(&backend, &run, "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status, OutcomeStatus::Completed(json!({"x": 1})));
    }
}
