//! Stage descriptors and per-stage execution state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::Usage;
use crate::error::TaskError;
use crate::task::RetryPolicy;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of one stage.
///
/// `pending -> runnable -> running -> {completed | failed | cancelled}`, or
/// `pending -> skipped` when an ancestor failed or the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    /// Admitted (budget reserved) and about to start.
    Runnable,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed
                | StageStatus::Failed
                | StageStatus::Skipped
                | StageStatus::Cancelled
        )
    }

    /// Admitted or executing.
    pub fn is_active(self) -> bool {
        matches!(self, StageStatus::Runnable | StageStatus::Running)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Runnable => "runnable",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// How predecessor outputs become this stage's input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputTransform {
    /// Object keyed by predecessor name. Stages without predecessors get the run input.
    #[default]
    Merge,
    /// Output of a single named predecessor, unchanged.
    Forward { stage: String },
    /// The run input, regardless of predecessors.
    RunInput,
    /// A literal value.
    Constant { value: serde_json::Value },
}

/// Declarative description of one stage, as loaded from a workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique within a workflow.
    pub name: String,
    /// Stage names that must complete first, in declaration order.
    #[serde(default)]
    pub predecessors: Vec<String>,
    /// Registered task name.
    pub task: String,
    /// Agent reference handed to agent-backed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub input: InputTransform,
    /// Task run when the primary task fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// A failed optional stage does not fail the run.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Conservative per-kind estimates reserved before dispatch.
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub estimates: Usage,
    /// Replaces the task's registered policy for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_required() -> bool {
    true
}

impl StageDescriptor {
    /// Minimal descriptor with defaults for everything but name, task and predecessors.
    pub fn new(name: impl Into<String>, task: impl Into<String>, predecessors: &[&str]) -> Self {
        Self {
            name: name.into(),
            predecessors: predecessors.iter().map(|p| p.to_string()).collect(),
            task: task.into(),
            agent: None,
            input: InputTransform::default(),
            fallback: None,
            required: true,
            estimates: Usage::new(),
            retry: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// A descriptor plus everything that happened to it during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub descriptor: StageDescriptor,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// The failed or cancelled stage that caused a skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
    /// Budget held while the stage is in flight.
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub reserved: Usage,
    /// Reconciled consumption once finished.
    #[serde(default, skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
}

impl StageState {
    pub fn new(descriptor: StageDescriptor) -> Self {
        Self {
            descriptor,
            status: StageStatus::Pending,
            queued_at: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            output: None,
            error: None,
            skipped_because: None,
            reserved: Usage::new(),
            usage: Usage::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}
