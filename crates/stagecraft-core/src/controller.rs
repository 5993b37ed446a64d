//! Workflow controller: drives a stage graph through an execution backend.
//!
//! One `drive` call owns one run. The loop admits runnable stages in graph
//! order while the concurrency ceiling and the budget allow, starts them on
//! the backend, and awaits completions through a `JoinSet`. Every
//! transition is written back to the run record and checkpointed through
//! the backend, so a durable run can be resumed from any point.
//!
//! # Run outcome
//!
//! - `Completed`: the graph is terminal and no required stage failed or was
//!   skipped because of a failure.
//! - `Failed`: a required stage failed (retries and fallback exhausted). The
//!   controller stops admitting, lets in-flight stages finish, then skips
//!   whatever is still pending.
//! - `BudgetExhausted`: nothing is in flight and no runnable stage fits the
//!   remaining budget. Those stages stay `pending`.
//! - `Cancelled`: `cancel` was called. In-flight stages end `cancelled`,
//!   pending ones `skipped`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stagecraft_types::budget::{add_usage, BudgetCeilings, Usage};
use stagecraft_types::config::EngineConfig;
use stagecraft_types::error::{ErrorKind, TaskError};
use stagecraft_types::event::ProgressEvent;
use stagecraft_types::run::{RunReport, RunStatus, WorkflowRunRecord};
use stagecraft_types::stage::{StageDescriptor, StageStatus};
use stagecraft_types::workflow::WorkflowDefinition;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionError, ExecutionHandle, Outcome, OutcomeStatus, TaskRequest};
use crate::budget::{BudgetExhausted, BudgetLedger};
use crate::context::RunContext;
use crate::event::bus::EventBus;
use crate::graph::{GraphError, StageGraph, StageOutcome};
use crate::signal::SignalChannel;
use crate::task::registry::{RegistryError, TaskRegistry};

// ---------------------------------------------------------------------------
// Errors and configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {0} is already being driven")]
    AlreadyActive(Uuid),

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {0} stalled: stages pending but none admissible")]
    Stalled(Uuid),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Stages in flight per run, unless the workflow sets its own.
    pub max_concurrency: usize,
    /// Run ceilings, overridden per kind by the workflow.
    pub ceilings: BudgetCeilings,
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ControllerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            ceilings: config.budget.clone(),
            event_capacity: config.event_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The backend is chosen at construction time; stage logic never branches
/// on which one it is.
pub struct WorkflowController<B: ExecutionBackend> {
    backend: Arc<B>,
    registry: Arc<TaskRegistry>,
    events: EventBus,
    signals: SignalChannel,
    config: ControllerConfig,
    /// Cancellation tokens of runs currently being driven.
    active: DashMap<Uuid, CancellationToken>,
}

/// Marks a run active for as long as it is being driven, including when the
/// driving future is dropped part way.
struct Activation<'a> {
    active: &'a DashMap<Uuid, CancellationToken>,
    signals: &'a SignalChannel,
    run_id: Uuid,
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
        self.signals.close_run(self.run_id);
    }
}

/// A stage currently executing on the backend.
struct Dispatch {
    handle: ExecutionHandle,
    invocation: u32,
    input: Value,
    /// Accumulated over primary and fallback invocations.
    usage: Usage,
    attempts: u32,
}

type Completion = (String, Result<Outcome, ExecutionError>);

impl<B: ExecutionBackend> WorkflowController<B> {
    pub fn new(backend: Arc<B>, registry: Arc<TaskRegistry>, config: ControllerConfig) -> Self {
        Self {
            backend,
            registry,
            events: EventBus::new(config.event_capacity),
            signals: SignalChannel::new(),
            config,
            active: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self, run_id: &Uuid) -> bool {
        self.active.contains_key(run_id)
    }

    /// Request cancellation of a run being driven by this controller.
    ///
    /// Returns false when the run is not active here.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Run creation and resume
    // -----------------------------------------------------------------------

    /// Build and checkpoint a new run record. Structurally invalid graphs and
    /// unknown task bindings are rejected here, before anything executes.
    pub async fn create_run(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<WorkflowRunRecord, ControllerError> {
        let graph = StageGraph::from_descriptors(definition.stages.iter().cloned())?;
        graph.validate()?;
        self.check_bindings(graph.stages().iter().map(|s| &s.descriptor))?;

        let ceilings = match &definition.budget {
            Some(overrides) => self.config.ceilings.overridden_by(overrides),
            None => self.config.ceilings.clone(),
        };
        let now = Utc::now();
        let record = WorkflowRunRecord {
            id: Uuid::now_v7(),
            workflow: definition.name.clone(),
            status: RunStatus::Initialized,
            backend: self.backend.kind(),
            input,
            stages: graph.snapshot(),
            budget: BudgetLedger::new(&ceilings).snapshot(),
            ceilings,
            max_concurrency: definition
                .max_concurrency
                .unwrap_or(self.config.max_concurrency)
                .max(1),
            created_at: now,
            updated_at: now,
            error: None,
        };
        self.backend.checkpoint(&record).await?;
        tracing::info!(
            run_id = %record.id,
            workflow = %record.workflow,
            stages = record.stages.len(),
            "run created"
        );
        Ok(record)
    }

    /// Create a run and drive it to a terminal state.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<RunReport, ControllerError> {
        let record = self.create_run(definition, input).await?;
        self.drive(record).await
    }

    /// Continue a persisted run. Terminal runs are reported as they are.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunReport, ControllerError> {
        let record = self
            .backend
            .load_checkpoint(run_id)
            .await?
            .ok_or(ControllerError::RunNotFound(run_id))?;
        if record.status.is_terminal() {
            tracing::info!(run_id = %run_id, status = %record.status, "run already finished");
            return Ok(RunReport::from_record(&record));
        }
        tracing::info!(run_id = %run_id, workflow = %record.workflow, "resuming run");
        self.drive(record).await
    }

    /// Drive `record` until the run is terminal.
    ///
    /// Stages that were admitted or running when the record was written are
    /// rewound to `pending` and their reservations refunded; with the
    /// durable backend their journaled attempts then replay.
    pub async fn drive(&self, record: WorkflowRunRecord) -> Result<RunReport, ControllerError> {
        let run = self.activate(record.id)?;
        self.drive_active(record, run).await
    }

    /// Drive `record` on a background task. The run is active from the
    /// moment this returns, so signals and cancellation reach it at once.
    pub fn spawn_drive(
        self: &Arc<Self>,
        record: WorkflowRunRecord,
    ) -> Result<JoinHandle<Result<RunReport, ControllerError>>, ControllerError> {
        let run_id = record.id;
        let run = self.activate(run_id)?;
        let controller = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let result = controller.drive_active(record, run).await;
            match &result {
                Ok(report) => {
                    tracing::debug!(run_id = %run_id, status = %report.status, "background run finished");
                }
                Err(e) => tracing::error!(run_id = %run_id, error = %e, "background run failed"),
            }
            result
        }))
    }

    fn activate(&self, run_id: Uuid) -> Result<RunContext, ControllerError> {
        let run = RunContext::new(run_id, self.signals.clone(), self.events.clone());
        match self.active.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ControllerError::AlreadyActive(run_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(run.cancel.clone());
                Ok(run)
            }
        }
    }

    async fn drive_active(
        &self,
        record: WorkflowRunRecord,
        run: RunContext,
    ) -> Result<RunReport, ControllerError> {
        let _activation = Activation {
            active: &self.active,
            signals: &self.signals,
            run_id: run.run_id,
        };
        let result = self.drive_run(record, &run).await;
        if result.is_err() {
            run.cancel.cancel();
        }
        result
    }

    fn check_bindings<'a>(
        &self,
        descriptors: impl Iterator<Item = &'a StageDescriptor>,
    ) -> Result<(), RegistryError> {
        for d in descriptors {
            self.registry.resolve(&d.task)?;
            if let Some(fallback) = &d.fallback {
                self.registry.resolve(fallback)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn drive_run(
        &self,
        mut record: WorkflowRunRecord,
        run: &RunContext,
    ) -> Result<RunReport, ControllerError> {
        let run_id = record.id;
        let mut graph = StageGraph::restore(std::mem::take(&mut record.stages))?;
        let ledger = BudgetLedger::from_snapshot(&record.budget);
        for (stage, reserved) in graph.rewind_in_flight() {
            tracing::debug!(run_id = %run_id, stage = %stage, "rewinding in-flight stage");
            ledger.release(&reserved);
        }
        self.check_bindings(
            graph
                .stages()
                .iter()
                .filter(|s| !s.status.is_terminal())
                .map(|s| &s.descriptor),
        )?;

        if record.status == RunStatus::Initialized {
            transition(&mut record, RunStatus::Running)?;
        }
        self.persist(&mut record, &graph, &ledger).await?;
        self.events.publish(ProgressEvent::RunStarted {
            run_id,
            workflow: record.workflow.clone(),
            timestamp: Utc::now(),
        });

        let max_concurrency = record.max_concurrency.max(1);
        let mut in_flight: HashMap<String, Dispatch> = HashMap::new();
        let mut joins: JoinSet<Completion> = JoinSet::new();
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        loop {
            if !cancelled && run.cancel.is_cancelled() {
                cancelled = true;
                for dispatch in in_flight.values() {
                    self.backend.cancel(&dispatch.handle);
                }
            }

            // Admission.
            let mut refused: Option<BudgetExhausted> = None;
            if !cancelled && failure.is_none() {
                for name in graph.runnable_stages() {
                    if in_flight.len() >= max_concurrency {
                        break;
                    }
                    let descriptor = stage_descriptor(&graph, &name)?;
                    if let Err(e) = ledger.try_reserve_all(&descriptor.estimates) {
                        tracing::debug!(run_id = %run_id, stage = %name, error = %e, "stage refused admission");
                        refused = Some(e);
                        continue;
                    }
                    graph.admit(&name, descriptor.estimates.clone())?;
                    self.stage_event(run_id, &name, StageStatus::Runnable, 0);
                    let input = graph.input_for(&name, &record.input)?;

                    match self.start(run, &descriptor, 0, input.clone()).await {
                        Ok(handle) => {
                            graph.mark_running(&name)?;
                            self.stage_event(run_id, &name, StageStatus::Running, 1);
                            self.spawn_await(&mut joins, name.clone(), handle.clone());
                            in_flight.insert(
                                name,
                                Dispatch {
                                    handle,
                                    invocation: 0,
                                    input,
                                    usage: Usage::new(),
                                    attempts: 0,
                                },
                            );
                        }
                        Err(ControllerError::Execution(ExecutionError::Replay(e))) => {
                            let error = TaskError::new(ErrorKind::ReplayMismatch, e.to_string(), false);
                            tracing::error!(run_id = %run_id, stage = %name, error = %e, "replay mismatch");
                            failure = Some(format!("stage '{name}': {e}"));
                            self.finish_stage(&mut graph, &ledger, run_id, &name, StageOutcome::Failed { error, attempts: 0 }, Usage::new())?;
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.persist(&mut record, &graph, &ledger).await?;
            }

            if in_flight.is_empty() {
                if graph.is_terminal() || cancelled || failure.is_some() {
                    break;
                }
                if let Some(e) = refused {
                    tracing::warn!(
                        run_id = %run_id,
                        pending = graph.count(StageStatus::Pending),
                        error = %e,
                        "budget exhausted"
                    );
                    record.error = Some(e.to_string());
                    break;
                }
                return Err(ControllerError::Stalled(run_id));
            }

            // Completion.
            let joined = tokio::select! {
                biased;
                _ = run.cancel.cancelled(), if !cancelled => continue,
                joined = joins.join_next() => joined,
            };
            let Some(joined) = joined else { continue };
            let (name, result) = joined.map_err(|e| ExecutionError::Join(e.to_string()))?;
            let Some(mut dispatch) = in_flight.remove(&name) else {
                continue;
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(ExecutionError::Replay(e)) => {
                    let error = TaskError::new(ErrorKind::ReplayMismatch, e.to_string(), false);
                    failure = Some(format!("stage '{name}': {e}"));
                    let outcome = StageOutcome::Failed { error, attempts: dispatch.attempts };
                    self.finish_stage(&mut graph, &ledger, run_id, &name, outcome, dispatch.usage)?;
                    self.persist(&mut record, &graph, &ledger).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            add_usage(&mut dispatch.usage, &outcome.usage);
            dispatch.attempts += outcome.attempts;
            let descriptor = stage_descriptor(&graph, &name)?;

            let stage_outcome = match outcome.status {
                OutcomeStatus::Completed(output) => StageOutcome::Completed {
                    output,
                    attempts: dispatch.attempts,
                },
                OutcomeStatus::Failed(error) => {
                    if dispatch.invocation == 0 && descriptor.fallback.is_some() && !cancelled {
                        tracing::warn!(
                            run_id = %run_id,
                            stage = %name,
                            error = %error,
                            "primary task failed, running fallback"
                        );
                        match self.start(run, &descriptor, 1, dispatch.input.clone()).await {
                            Ok(handle) => {
                                self.spawn_await(&mut joins, name.clone(), handle.clone());
                                dispatch.handle = handle;
                                dispatch.invocation = 1;
                                in_flight.insert(name, dispatch);
                                continue;
                            }
                            Err(ControllerError::Execution(ExecutionError::Replay(e))) => {
                                failure = Some(format!("stage '{name}': {e}"));
                                StageOutcome::Failed {
                                    error: TaskError::new(ErrorKind::ReplayMismatch, e.to_string(), false),
                                    attempts: dispatch.attempts,
                                }
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        StageOutcome::Failed {
                            error,
                            attempts: dispatch.attempts,
                        }
                    }
                }
                OutcomeStatus::Cancelled => StageOutcome::Cancelled {
                    attempts: dispatch.attempts,
                },
            };

            let blocking = match &stage_outcome {
                StageOutcome::Completed { .. } => None,
                StageOutcome::Failed { error, .. } => Some(error.to_string()),
                StageOutcome::Cancelled { .. } => Some("cancelled".to_string()),
            };
            self.finish_stage(&mut graph, &ledger, run_id, &name, stage_outcome, dispatch.usage)?;
            if let Some(reason) = blocking
                && descriptor.required
                && !cancelled
                && failure.is_none()
            {
                tracing::warn!(run_id = %run_id, stage = %name, error = %reason, "required stage failed");
                failure = Some(format!("required stage '{name}' failed: {reason}"));
            }
            self.persist(&mut record, &graph, &ledger).await?;
        }

        // Terminal status.
        let status = if cancelled {
            self.skip_remaining(&mut graph, run_id, "run cancelled");
            RunStatus::Cancelled
        } else if let Some(reason) = failure {
            self.skip_remaining(&mut graph, run_id, "run failed");
            record.error = Some(reason);
            RunStatus::Failed
        } else if graph.is_terminal() {
            match blocked_required_stage(&graph) {
                Some(stage) => {
                    record.error = Some(format!("required stage '{stage}' was skipped"));
                    RunStatus::Failed
                }
                None => RunStatus::Completed,
            }
        } else {
            RunStatus::BudgetExhausted
        };

        transition(&mut record, status)?;
        self.persist(&mut record, &graph, &ledger).await?;
        self.events.publish(ProgressEvent::RunFinished {
            run_id,
            status,
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = %record.workflow,
            status = %status,
            completed = graph.count(StageStatus::Completed),
            failed = graph.count(StageStatus::Failed),
            skipped = graph.count(StageStatus::Skipped),
            "run finished"
        );
        Ok(RunReport::from_record(&record))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn start(
        &self,
        run: &RunContext,
        descriptor: &StageDescriptor,
        invocation: u32,
        input: Value,
    ) -> Result<ExecutionHandle, ControllerError> {
        let task_name = match (invocation, &descriptor.fallback) {
            (0, _) | (_, None) => &descriptor.task,
            (_, Some(fallback)) => fallback,
        };
        let task = self.registry.resolve(task_name)?;
        let policy = descriptor
            .retry
            .clone()
            .unwrap_or_else(|| task.policy.clone());
        let request = TaskRequest {
            run: run.clone(),
            stage: descriptor.name.clone(),
            invocation,
            task,
            policy,
            input,
            agent: descriptor.agent.clone(),
        };
        Ok(self.backend.start(request).await?)
    }

    fn spawn_await(&self, joins: &mut JoinSet<Completion>, name: String, handle: ExecutionHandle) {
        let backend = Arc::clone(&self.backend);
        joins.spawn(async move {
            let result = backend.await_result(&handle).await;
            (name, result)
        });
    }

    /// Settle the reservation against actual usage, record the outcome and
    /// announce it together with any skipped descendants.
    fn finish_stage(
        &self,
        graph: &mut StageGraph,
        ledger: &BudgetLedger,
        run_id: Uuid,
        name: &str,
        outcome: StageOutcome,
        usage: Usage,
    ) -> Result<(), ControllerError> {
        let reserved = graph.settle(name, usage.clone())?;
        ledger.reconcile(&reserved, &usage);

        let attempts = match &outcome {
            StageOutcome::Completed { attempts, .. }
            | StageOutcome::Failed { attempts, .. }
            | StageOutcome::Cancelled { attempts } => *attempts,
        };
        let skipped = graph.mark(name, outcome)?;
        if let Some(state) = graph.stage(name) {
            tracing::debug!(run_id = %run_id, stage = %name, status = %state.status, attempts, "stage finished");
            self.stage_event(run_id, name, state.status, attempts);
        }
        for stage in skipped {
            self.stage_event(run_id, &stage, StageStatus::Skipped, 0);
        }
        Ok(())
    }

    fn skip_remaining(&self, graph: &mut StageGraph, run_id: Uuid, reason: &str) {
        for stage in graph.skip_pending(reason) {
            self.stage_event(run_id, &stage, StageStatus::Skipped, 0);
        }
    }

    fn stage_event(&self, run_id: Uuid, stage: &str, status: StageStatus, attempt: u32) {
        self.events.publish(ProgressEvent::StageStatusChanged {
            run_id,
            stage_name: stage.to_string(),
            status,
            attempt,
            timestamp: Utc::now(),
        });
    }

    async fn persist(
        &self,
        record: &mut WorkflowRunRecord,
        graph: &StageGraph,
        ledger: &BudgetLedger,
    ) -> Result<(), ControllerError> {
        record.stages = graph.snapshot();
        record.budget = ledger.snapshot();
        record.updated_at = Utc::now();
        self.backend.checkpoint(record).await?;
        Ok(())
    }
}

impl<B: ExecutionBackend> std::fmt::Debug for WorkflowController<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowController")
            .field("backend", &self.backend.kind())
            .field("active_runs", &self.active.len())
            .field("config", &self.config)
            .finish()
    }
}

fn transition(record: &mut WorkflowRunRecord, next: RunStatus) -> Result<(), ControllerError> {
    if !record.status.can_transition_to(next) {
        return Err(ControllerError::InvalidTransition {
            run_id: record.id,
            from: record.status,
            to: next,
        });
    }
    record.status = next;
    Ok(())
}

fn stage_descriptor(graph: &StageGraph, name: &str) -> Result<StageDescriptor, GraphError> {
    graph
        .stage(name)
        .map(|s| s.descriptor.clone())
        .ok_or_else(|| GraphError::UnknownStage(name.to_string()))
}

/// A required stage skipped because an ancestor failed.
fn blocked_required_stage(graph: &StageGraph) -> Option<String> {
    graph
        .stages()
        .iter()
        .find(|s| s.status == StageStatus::Skipped && s.descriptor.required)
        .map(|s| s.descriptor.name.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
