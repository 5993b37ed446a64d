//! Run-level types: lifecycle, the persisted run record, the activity
//! journal entry, and the final report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::{BudgetCeilings, BudgetSnapshot, Usage};
use crate::error::TaskError;
use crate::stage::{StageState, StageStatus};
use crate::task::TaskOutput;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    Failed,
    BudgetExhausted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Initialized | RunStatus::Running)
    }

    /// The allowed transition table. Terminal states never move again.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Initialized, Running)
                | (Initialized, Failed)
                | (Initialized, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, BudgetExhausted)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::BudgetExhausted => "budget_exhausted",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which execution backend a run was started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InProcess,
    Durable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::InProcess => write!(f, "in_process"),
            BackendKind::Durable => write!(f, "durable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run record
// ---------------------------------------------------------------------------

/// Full graph snapshot plus budget state: the unit reconstructed on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub backend: BackendKind,
    pub input: serde_json::Value,
    /// Stages in registration order.
    pub stages: Vec<StageState>,
    pub ceilings: BudgetCeilings,
    pub budget: BudgetSnapshot,
    pub max_concurrency: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRunRecord {
    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.descriptor.name == name)
    }
}

// ---------------------------------------------------------------------------
// Activity journal
// ---------------------------------------------------------------------------

/// Outcome of one journaled attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityResult {
    Completed { output: TaskOutput },
    Failed { error: TaskError, usage: Usage },
}

/// One completed attempt of one task invocation, as persisted by the durable backend.
///
/// `invocation` is 0 for the stage's primary task and 1 for its fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub run_id: Uuid,
    pub stage: String,
    pub invocation: u32,
    pub attempt: u32,
    pub task: String,
    /// SHA-256 of the canonical input JSON.
    pub input_hash: String,
    pub result: ActivityResult,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Idempotency key: format `{run_id}-{stage}-{invocation}-{attempt}`.
    pub fn key(&self) -> String {
        activity_key(&self.run_id, &self.stage, self.invocation, self.attempt)
    }
}

pub fn activity_key(run_id: &Uuid, stage: &str, invocation: u32, attempt: u32) -> String {
    format!("{run_id}-{stage}-{invocation}-{attempt}")
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
}

impl From<&StageState> for StageReport {
    fn from(s: &StageState) -> Self {
        Self {
            name: s.descriptor.name.clone(),
            status: s.status,
            attempts: s.attempts,
            started_at: s.started_at,
            finished_at: s.finished_at,
            error: s.error.clone(),
            skipped_because: s.skipped_because.clone(),
        }
    }
}

/// Structured result of a run, produced for every terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    pub budget: BudgetSnapshot,
    /// Outputs of completed sink stages keyed by stage name.
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn from_record(record: &WorkflowRunRecord) -> Self {
        let mut output = serde_json::Map::new();
        for stage in &record.stages {
            let is_sink = !record
                .stages
                .iter()
                .any(|s| s.descriptor.predecessors.contains(&stage.descriptor.name));
            if is_sink && stage.status == StageStatus::Completed {
                if let Some(value) = &stage.output {
                    output.insert(stage.descriptor.name.clone(), value.clone());
                }
            }
        }
        Self {
            run_id: record.id,
            workflow: record.workflow.clone(),
            status: record.status,
            stages: record.stages.iter().map(StageReport::from).collect(),
            budget: record.budget.clone(),
            output: serde_json::Value::Object(output),
            error: record.error.clone(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageDescriptor;

    #[test]
    fn transition_table() {
        assert!(RunStatus::Initialized.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::BudgetExhausted));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Initialized.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Initialized.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::BudgetExhausted.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn activity_key_format() {
        let id = Uuid::now_v7();
        assert_eq!(activity_key(&id, "fetch", 0, 2), format!("{id}-fetch-0-2"));
    }

    #[test]
    fn report_collects_sink_outputs() {
        let mut a = StageState::new(StageDescriptor::new("a", "echo", &[]));
        a.status = StageStatus::Completed;
        a.output = Some(serde_json::json!(1));
        let mut b = StageState::new(StageDescriptor::new("b", "echo", &["a"]));
        b.status = StageStatus::Completed;
        b.output = Some(serde_json::json!(2));

        let record = WorkflowRunRecord {
            id: Uuid::now_v7(),
            workflow: "wf".to_string(),
            status: RunStatus::Completed,
            backend: BackendKind::InProcess,
            input: serde_json::Value::Null,
            stages: vec![a, b],
            ceilings: BudgetCeilings::default(),
            budget: BudgetSnapshot::default(),
            max_concurrency: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error: None,
        };
        let report = RunReport::from_record(&record);
        assert_eq!(report.output, serde_json::json!({"b": 2}));
        assert_eq!(report.stages.len(), 2);
    }
}
