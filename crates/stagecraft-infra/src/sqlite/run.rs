//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `stagecraft-core` using sqlx with split
//! read/write pools. The full run record is stored as a JSON blob next to
//! the few columns used for filtering; journal entries get one row each,
//! keyed by `(run_id, stage, invocation, attempt)`.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stagecraft_core::repository::run::RunRepository;
use stagecraft_types::error::RepositoryError;
use stagecraft_types::run::{ActivityRecord, ActivityResult, WorkflowRunRecord};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    record: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            record: row.try_get("record")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRunRecord, RepositoryError> {
        serde_json::from_str(&self.record)
            .map_err(|e| RepositoryError::Query(format!("invalid run record JSON: {e}")))
    }
}

struct ActivityRow {
    run_id: String,
    stage: String,
    invocation: i64,
    attempt: i64,
    task: String,
    input_hash: String,
    result: String,
    recorded_at: String,
}

impl ActivityRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            stage: row.try_get("stage")?,
            invocation: row.try_get("invocation")?,
            attempt: row.try_get("attempt")?,
            task: row.try_get("task")?,
            input_hash: row.try_get("input_hash")?,
            result: row.try_get("result")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_activity(self) -> Result<ActivityRecord, RepositoryError> {
        let result: ActivityResult = serde_json::from_str(&self.result)
            .map_err(|e| RepositoryError::Query(format!("invalid activity result: {e}")))?;
        Ok(ActivityRecord {
            run_id: parse_uuid(&self.run_id)?,
            stage: self.stage,
            invocation: self.invocation as u32,
            attempt: self.attempt as u32,
            task: self.task,
            input_hash: self.input_hash,
            result,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
    rows.iter()
        .map(|row| RunRow::from_row(row).map_err(query_err)?.into_record())
        .collect()
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save_run(&self, record: &WorkflowRunRecord) -> Result<(), RepositoryError> {
        let record_json = to_json(record)?;

        sqlx::query(
            r#"INSERT INTO workflow_runs (id, workflow, status, backend, record, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 record = excluded.record,
                 updated_at = excluded.updated_at"#,
        )
        .bind(record.id.to_string())
        .bind(&record.workflow)
        .bind(record.status.to_string())
        .bind(record.backend.to_string())
        .bind(&record_json)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_err)?.into_record()?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM workflow_runs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        records(&rows)
    }

    async fn list_incomplete_runs(&self) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM workflow_runs WHERE status IN ('initialized', 'running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        records(&rows)
    }

    async fn append_activity(&self, activity: &ActivityRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO activities
               (run_id, stage, invocation, attempt, task, input_hash, result, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(activity.run_id.to_string())
        .bind(&activity.stage)
        .bind(activity.invocation as i64)
        .bind(activity.attempt as i64)
        .bind(&activity.task)
        .bind(&activity.input_hash)
        .bind(to_json(&activity.result)?)
        .bind(format_datetime(&activity.recorded_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RepositoryError::Conflict(activity.key()))
            }
            Err(e) => Err(query_err(e)),
        }
    }

    async fn list_activities(&self, run_id: &Uuid) -> Result<Vec<ActivityRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT run_id, stage, invocation, attempt, task, input_hash, result, recorded_at
               FROM activities WHERE run_id = ?
               ORDER BY stage ASC, invocation ASC, attempt ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| ActivityRow::from_row(row).map_err(query_err)?.into_activity())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagecraft_types::budget::{BudgetCeilings, BudgetSnapshot};
    use stagecraft_types::error::TaskError;
    use stagecraft_types::run::{BackendKind, RunStatus};
    use stagecraft_types::stage::{StageDescriptor, StageState, StageStatus};
    use stagecraft_types::task::TaskOutput;

    async fn test_repo() -> SqliteRunRepository {
        let dir = tempfile::tempdir().unwrap();
        let url = super::super::pool::database_url(dir.path());
        std::mem::forget(dir);
        SqliteRunRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn record(status: RunStatus) -> WorkflowRunRecord {
        let now = Utc::now();
        let mut fetch = StageState::new(StageDescriptor::new("fetch", "echo", &[]));
        fetch.status = StageStatus::Completed;
        fetch.output = Some(json!({"rows": 3}));
        WorkflowRunRecord {
            id: Uuid::now_v7(),
            workflow: "release-notes".to_string(),
            status,
            backend: BackendKind::Durable,
            input: json!({"tag": "v1.2.0"}),
            stages: vec![
                fetch,
                StageState::new(StageDescriptor::new("draft", "agent", &["fetch"])),
            ],
            ceilings: BudgetCeilings {
                tokens: Some(1000),
                ..Default::default()
            },
            budget: BudgetSnapshot::default(),
            max_concurrency: 2,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    fn activity(run_id: Uuid, stage: &str, invocation: u32, attempt: u32) -> ActivityRecord {
        ActivityRecord {
            run_id,
            stage: stage.to_string(),
            invocation,
            attempt,
            task: "agent".to_string(),
            input_hash: "abc123".to_string(),
            result: if attempt == 1 {
                ActivityResult::Failed {
                    error: TaskError::transient("rate limited"),
                    usage: Default::default(),
                }
            } else {
                ActivityResult::Completed {
                    output: TaskOutput::new(json!("ok")),
                }
            },
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_get_and_update_run() {
        let repo = test_repo().await;
        let mut run = record(RunStatus::Running);
        repo.save_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);

        run.status = RunStatus::Completed;
        run.stages[1].status = StageStatus::Completed;
        repo.save_run(&run).await.unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.stage("draft").unwrap().status, StageStatus::Completed);

        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_runs_newest_first_with_limit() {
        let repo = test_repo().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut run = record(RunStatus::Completed);
            run.created_at = Utc::now() + chrono::Duration::seconds(i);
            ids.push(run.id);
            repo.save_run(&run).await.unwrap();
        }

        let runs = repo.list_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
    }

    #[tokio::test]
    async fn incomplete_runs_exclude_terminal() {
        let repo = test_repo().await;
        let running = record(RunStatus::Running);
        let initialized = record(RunStatus::Initialized);
        repo.save_run(&running).await.unwrap();
        repo.save_run(&initialized).await.unwrap();
        repo.save_run(&record(RunStatus::Failed)).await.unwrap();
        repo.save_run(&record(RunStatus::BudgetExhausted)).await.unwrap();

        let ids: Vec<Uuid> = repo
            .list_incomplete_runs()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&running.id));
        assert!(ids.contains(&initialized.id));
    }

    #[tokio::test]
    async fn activities_round_trip_in_order() {
        let repo = test_repo().await;
        let run = record(RunStatus::Running);
        repo.save_run(&run).await.unwrap();

        repo.append_activity(&activity(run.id, "draft", 0, 2)).await.unwrap();
        repo.append_activity(&activity(run.id, "draft", 0, 1)).await.unwrap();
        repo.append_activity(&activity(run.id, "alpha", 1, 1)).await.unwrap();

        let journal = repo.list_activities(&run.id).await.unwrap();
        let keys: Vec<(String, u32, u32)> = journal
            .iter()
            .map(|a| (a.stage.clone(), a.invocation, a.attempt))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("alpha".to_string(), 1, 1),
                ("draft".to_string(), 0, 1),
                ("draft".to_string(), 0, 2),
            ]
        );
        assert!(matches!(journal[1].result, ActivityResult::Failed { .. }));
    }

    #[tokio::test]
    async fn duplicate_activity_is_conflict() {
        let repo = test_repo().await;
        let run = record(RunStatus::Running);
        repo.save_run(&run).await.unwrap();
        let entry = activity(run.id, "draft", 0, 1);
        repo.append_activity(&entry).await.unwrap();

        let err = repo.append_activity(&entry).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(ref key) if *key == entry.key()));
    }

    #[tokio::test]
    async fn activity_for_unknown_run_rejected() {
        let repo = test_repo().await;
        let err = repo
            .append_activity(&activity(Uuid::now_v7(), "draft", 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Query(_)));
    }
}
