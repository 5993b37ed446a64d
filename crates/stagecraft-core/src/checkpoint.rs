//! Durable checkpoint manager: run records and the activity journal.
//!
//! Wraps a `RunRepository` with the operations the durable backend and the
//! controller need: persist the run record after every transition, append
//! a journal entry after every completed attempt, and load an invocation's
//! history for replay.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use stagecraft_types::error::RepositoryError;
use stagecraft_types::run::{ActivityRecord, WorkflowRunRecord};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::run::RunRepository;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

/// SHA-256 (lowercase hex) of the input's JSON encoding.
///
/// `serde_json` maps are ordered by key, so equal values hash equally.
pub fn fingerprint(input: &Value) -> String {
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Generic over `R: RunRepository` so it works with any storage backend.
/// The repository is held in an `Arc` so a fresh worker can be built over
/// the same store.
pub struct CheckpointManager<R: RunRepository> {
    repo: Arc<R>,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run records
    // -----------------------------------------------------------------------

    pub async fn save_run(&self, record: &WorkflowRunRecord) -> Result<(), CheckpointError> {
        self.repo.save_run(record).await?;
        tracing::debug!(run_id = %record.id, status = %record.status, "checkpointed run");
        Ok(())
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRunRecord, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn incomplete_runs(&self) -> Result<Vec<WorkflowRunRecord>, CheckpointError> {
        Ok(self.repo.list_incomplete_runs().await?)
    }

    // -----------------------------------------------------------------------
    // Activity journal
    // -----------------------------------------------------------------------

    /// Persist a completed attempt. A record already present under the same
    /// key is left untouched.
    pub async fn record_activity(&self, activity: &ActivityRecord) -> Result<(), CheckpointError> {
        match self.repo.append_activity(activity).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(key)) => {
                tracing::warn!(key = %key, "activity already journaled, keeping first record");
            }
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(
            run_id = %activity.run_id,
            stage = %activity.stage,
            invocation = activity.invocation,
            attempt = activity.attempt,
            "journaled activity"
        );
        Ok(())
    }

    /// Journaled attempts of one invocation, keyed by attempt number.
    pub async fn history(
        &self,
        run_id: Uuid,
        stage: &str,
        invocation: u32,
    ) -> Result<BTreeMap<u32, ActivityRecord>, CheckpointError> {
        Ok(self
            .repo
            .list_activities(&run_id)
            .await?
            .into_iter()
            .filter(|a| a.stage == stage && a.invocation == invocation)
            .map(|a| (a.attempt, a))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRunRepository;
    use chrono::Utc;
    use serde_json::json;
    use stagecraft_types::run::ActivityResult;
    use stagecraft_types::task::TaskOutput;

    fn activity(run_id: Uuid, stage: &str, invocation: u32, attempt: u32) -> ActivityRecord {
        ActivityRecord {
            run_id,
            stage: stage.to_string(),
            invocation,
            attempt,
            task: "echo".to_string(),
            input_hash: fingerprint(&json!({"a": 1})),
            result: ActivityResult::Completed {
                output: TaskOutput::new(json!(attempt)),
            },
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({"x": 2, "y": [1, 2]})));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[tokio::test]
    async fn history_filters_by_stage_and_invocation() {
        let manager = CheckpointManager::new(Arc::new(InMemoryRunRepository::new()));
        let run_id = Uuid::now_v7();
        manager.record_activity(&activity(run_id, "a", 0, 1)).await.unwrap();
        manager.record_activity(&activity(run_id, "a", 0, 2)).await.unwrap();
        manager.record_activity(&activity(run_id, "a", 1, 1)).await.unwrap();
        manager.record_activity(&activity(run_id, "b", 0, 1)).await.unwrap();

        let history = manager.history(run_id, "a", 0).await.unwrap();
        assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(manager.history(run_id, "a", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_record_is_tolerated() {
        let manager = CheckpointManager::new(Arc::new(InMemoryRunRepository::new()));
        let run_id = Uuid::now_v7();
        manager.record_activity(&activity(run_id, "a", 0, 1)).await.unwrap();
        manager.record_activity(&activity(run_id, "a", 0, 1)).await.unwrap();
        assert_eq!(manager.repo().activity_count(&run_id), 1);
    }

    #[tokio::test]
    async fn load_missing_run() {
        let manager = CheckpointManager::new(Arc::new(InMemoryRunRepository::new()));
        let id = Uuid::now_v7();
        assert!(matches!(
            manager.load_run(id).await,
            Err(CheckpointError::RunNotFound(missing)) if missing == id
        ));
    }
}
