//! Run repository trait definition.
//!
//! Storage interface for persisted run records and the durable activity
//! journal. The infrastructure layer (stagecraft-infra) implements this
//! trait with SQLite persistence.

use stagecraft_types::error::RepositoryError;
use stagecraft_types::run::{ActivityRecord, WorkflowRunRecord};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Covers two entity families:
/// - **Runs:** upsert/query the latest `WorkflowRunRecord` per run.
/// - **Activities:** append-only journal of completed task attempts.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync + 'static {
    /// Insert or replace the record for `record.id`.
    fn save_run(
        &self,
        record: &WorkflowRunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRunRecord>, RepositoryError>> + Send;

    /// Most recent runs first.
    fn list_runs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRunRecord>, RepositoryError>> + Send;

    /// Runs whose status is not terminal (crash recovery at startup).
    fn list_incomplete_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRunRecord>, RepositoryError>> + Send;

    /// Append a journal entry. Appending the same key twice returns
    /// `RepositoryError::Conflict`.
    fn append_activity(
        &self,
        activity: &ActivityRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Journal entries of one run ordered by stage, invocation, attempt.
    fn list_activities(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActivityRecord>, RepositoryError>> + Send;
}
