//! Progress events published by the workflow controller.
//!
//! Serialized with an internal `type` tag so they can be forwarded verbatim
//! as Server-Sent-Events payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;
use crate::stage::StageStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        timestamp: DateTime<Utc>,
    },
    StageStatusChanged {
        run_id: Uuid,
        stage_name: String,
        status: StageStatus,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StageRetrying {
        run_id: Uuid,
        stage_name: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            ProgressEvent::RunStarted { run_id, .. }
            | ProgressEvent::StageStatusChanged { run_id, .. }
            | ProgressEvent::StageRetrying { run_id, .. }
            | ProgressEvent::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::RunStarted { .. } => "run_started",
            ProgressEvent::StageStatusChanged { .. } => "stage_status_changed",
            ProgressEvent::StageRetrying { .. } => "stage_retrying",
            ProgressEvent::RunFinished { .. } => "run_finished",
        }
    }
}
