//! In-memory `RunRepository` backed by `DashMap`.
//!
//! Shared through `Arc`, it outlives any single controller, which is what a
//! "worker restart" needs in tests: drop the controller and backend, build
//! fresh ones over the same store, and resume.

use dashmap::DashMap;
use stagecraft_types::error::RepositoryError;
use stagecraft_types::run::{ActivityRecord, WorkflowRunRecord};
use uuid::Uuid;

use super::run::RunRepository;

#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, WorkflowRunRecord>,
    activities: DashMap<Uuid, Vec<ActivityRecord>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity_count(&self, run_id: &Uuid) -> usize {
        self.activities.get(run_id).map(|a| a.len()).unwrap_or(0)
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn save_run(&self, record: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        self.runs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let mut runs: Vec<WorkflowRunRecord> = self.runs.iter().map(|r| r.clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_incomplete_runs(&self) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let mut runs: Vec<WorkflowRunRecord> = self
            .runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn append_activity(&self, activity: &ActivityRecord) -> Result<(), RepositoryError> {
        let mut journal = self.activities.entry(activity.run_id).or_default();
        let key = activity.key();
        if journal.iter().any(|a| a.key() == key) {
            return Err(RepositoryError::Conflict(key));
        }
        journal.push(activity.clone());
        Ok(())
    }

    async fn list_activities(&self, run_id: &Uuid) -> Result<Vec<ActivityRecord>, RepositoryError> {
        let mut journal = self
            .activities
            .get(run_id)
            .map(|a| a.clone())
            .unwrap_or_default();
        journal.sort_by(|a, b| {
            (a.stage.as_str(), a.invocation, a.attempt).cmp(&(b.stage.as_str(), b.invocation, b.attempt))
        });
        Ok(journal)
    }
}
