//! Run handlers for the REST API.
//!
//! Starting a run checkpoints it synchronously and drives it in the
//! background on the durable controller; everything else reads the
//! persisted record or talks to the live controller.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use stagecraft_core::definition::parse_workflow_yaml;
use stagecraft_core::repository::run::RunRepository;
use stagecraft_core::signal::PendingSignal;
use stagecraft_types::event::ProgressEvent;
use stagecraft_types::run::{BackendKind, RunReport, RunStatus, WorkflowRunRecord};
use stagecraft_types::stage::StageStatus;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub workflow_yaml: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize)]
pub struct StartedRun {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Maximum number of runs to return (default 20).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub backend: BackendKind,
    pub stages: usize,
    pub completed_stages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRunRecord> for RunSummary {
    fn from(record: &WorkflowRunRecord) -> Self {
        Self {
            id: record.id,
            workflow: record.workflow.clone(),
            status: record.status,
            backend: record.backend,
            stages: record.stages.len(),
            completed_stages: record
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Completed)
                .count(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub report: RunReport,
    pub backend: BackendKind,
    /// Whether this server is currently driving the run.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SignalAccepted {
    pub run_id: Uuid,
    pub signal: String,
    /// `true` when a waiting stage received it, `false` when it was buffered.
    pub delivered: bool,
}

fn run_href(run_id: Uuid) -> String {
    format!("/api/v1/runs/{run_id}")
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/runs - Start a durable run in the background.
pub async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<ApiResponse<StartedRun>, AppError> {
    let start = Instant::now();
    let definition = parse_workflow_yaml(&body.workflow_yaml)?;
    let record = state.controller.create_run(&definition, body.input).await?;
    let run_id = record.id;

    // Detached: the run outlives the request.
    drop(state.controller.spawn_drive(record)?);

    let href = run_href(run_id);
    Ok(ApiResponse::timed(
        StartedRun {
            run_id,
            workflow: definition.name,
            status: RunStatus::Initialized,
        },
        start,
    )
    .with_status(StatusCode::ACCEPTED)
    .with_link("self", &href)
    .with_link("events", &format!("{href}/events")))
}

/// GET /api/v1/runs - Most recent runs first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<ApiResponse<Vec<RunSummary>>, AppError> {
    let start = Instant::now();
    let records = state.runs.list_runs(query.limit).await?;
    let summaries = records.iter().map(RunSummary::from).collect();
    Ok(ApiResponse::timed(summaries, start).with_link("self", "/api/v1/runs"))
}

/// GET /api/v1/runs/{id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<ApiResponse<RunDetail>, AppError> {
    let start = Instant::now();
    let record = state
        .runs
        .get_run(&run_id)
        .await?
        .ok_or(AppError::RunNotFound(run_id))?;

    let detail = RunDetail {
        report: RunReport::from_record(&record),
        backend: record.backend,
        active: state.controller.is_active(&run_id),
        created_at: record.created_at,
        updated_at: record.updated_at,
    };
    let href = run_href(run_id);
    Ok(ApiResponse::timed(detail, start)
        .with_link("self", &href)
        .with_link("events", &format!("{href}/events")))
}

/// GET /api/v1/runs/{id}/events - Progress events as Server-Sent Events.
///
/// The first event is a `snapshot` of the run's report. A run this server
/// is driving is then followed live until its `run_finished` event; for a
/// terminal run that event is synthesized from the record. A run nobody
/// here is driving gets the snapshot only.
pub async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe and check liveness before reading the record so no
    // transition slips between.
    let mut rx = state.controller.subscribe();
    let active = state.controller.is_active(&run_id);
    let record = state
        .runs
        .get_run(&run_id)
        .await?
        .ok_or(AppError::RunNotFound(run_id))?;

    let snapshot = snapshot_event(&RunReport::from_record(&record));
    let finished = record.status.is_terminal().then(|| ProgressEvent::RunFinished {
        run_id,
        status: record.status,
        timestamp: record.updated_at,
    });
    let follow = active && finished.is_none();

    let sse_stream = async_stream::stream! {
        yield Ok::<_, Infallible>(snapshot);
        if let Some(event) = finished {
            yield Ok(sse_event(&event));
        } else if follow {
            loop {
                match rx.recv().await {
                    Ok(event) if event.run_id() == run_id => {
                        let done = matches!(event, ProgressEvent::RunFinished { .. });
                        yield Ok(sse_event(&event));
                        if done {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(run_id = %run_id, missed, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn sse_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn snapshot_event(report: &RunReport) -> Event {
    Event::default()
        .event("snapshot")
        .data(serde_json::to_string(report).unwrap_or_default())
}

/// POST /api/v1/runs/{id}/signals/{name} - Deliver a signal to a live run.
pub async fn send_signal(
    State(state): State<AppState>,
    Path((run_id, name)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<ApiResponse<SignalAccepted>, AppError> {
    let start = Instant::now();
    if name.is_empty() {
        return Err(AppError::Validation("signal name must not be empty".to_string()));
    }
    ensure_active(&state, run_id).await?;

    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("signal payload is not JSON: {e}")))?
    };
    let delivered = state.controller.signals().send(run_id, &name, payload);
    tracing::info!(run_id = %run_id, signal = %name, delivered, "signal received");

    Ok(ApiResponse::timed(
        SignalAccepted {
            run_id,
            signal: name,
            delivered,
        },
        start,
    )
    .with_link("run", &run_href(run_id)))
}

/// GET /api/v1/runs/{id}/signals - Stages of a live run waiting on a signal.
pub async fn pending_signals(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<ApiResponse<Vec<PendingSignal>>, AppError> {
    let start = Instant::now();
    ensure_active(&state, run_id).await?;
    let pending = state.controller.signals().pending(Some(run_id));
    Ok(ApiResponse::timed(pending, start).with_link("run", &run_href(run_id)))
}

/// POST /api/v1/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<ApiResponse<Value>, AppError> {
    let start = Instant::now();
    ensure_active(&state, run_id).await?;
    let cancelled = state.controller.cancel(&run_id);
    Ok(
        ApiResponse::timed(serde_json::json!({ "run_id": run_id, "cancelled": cancelled }), start)
            .with_status(StatusCode::ACCEPTED)
            .with_link("run", &run_href(run_id)),
    )
}

/// 404 for unknown runs, 409 for runs this process is not driving.
async fn ensure_active(state: &AppState, run_id: Uuid) -> Result<(), AppError> {
    if state.controller.is_active(&run_id) {
        return Ok(());
    }
    match state.runs.get_run(&run_id).await? {
        Some(_) => Err(AppError::RunNotActive(run_id)),
        None => Err(AppError::RunNotFound(run_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::response::IntoResponse;
    use serde_json::json;
    use tokio::time::timeout;

    const ECHO_YAML: &str = r#"
name: greet
stages:
  - name: hello
    task: echo
  - name: world
    task: echo
    predecessors: [hello]
"#;

    const APPROVAL_YAML: &str = r#"
name: approval
stages:
  - name: approve
    task: wait_signal
    input:
      type: constant
      value:
        signal: approve
        timeout_secs: 30
"#;

    async fn wait_finished(
        rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
        run_id: Uuid,
    ) -> RunStatus {
        timeout(Duration::from_secs(10), async {
            loop {
                if let ProgressEvent::RunFinished { run_id: id, status, .. } = rx.recv().await.unwrap()
                    && id == run_id
                {
                    return status;
                }
            }
        })
        .await
        .expect("run should finish")
    }

    async fn start(state: &AppState, yaml: &str, input: Value) -> Uuid {
        let resp = start_run(
            State(state.clone()),
            Json(StartRunRequest {
                workflow_yaml: yaml.to_string(),
                input,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert!(resp.links.contains_key("events"));
        resp.data.unwrap().run_id
    }

    #[tokio::test]
    async fn started_run_completes_and_is_readable() {
        let state = test_state().await;
        let mut rx = state.controller.subscribe();

        let run_id = start(&state, ECHO_YAML, json!({"name": "ada"})).await;
        assert_eq!(wait_finished(&mut rx, run_id).await, RunStatus::Completed);

        let detail = get_run(State(state.clone()), Path(run_id))
            .await
            .unwrap()
            .data
            .unwrap();
        assert_eq!(detail.report.status, RunStatus::Completed);
        assert_eq!(detail.backend, BackendKind::Durable);
        assert_eq!(detail.report.output["world"]["hello"], json!({"name": "ada"}));

        let listed = list_runs(State(state.clone()), Query(ListRunsQuery { limit: 5 }))
            .await
            .unwrap()
            .data
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].completed_stages, 2);
    }

    async fn event_body(state: &AppState, run_id: Uuid) -> String {
        let sse = run_events(State(state.clone()), Path(run_id)).await.unwrap();
        let body = timeout(
            Duration::from_secs(5),
            axum::body::to_bytes(sse.into_response().into_body(), usize::MAX),
        )
        .await
        .expect("event stream should end")
        .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn events_of_idle_run_end_after_snapshot() {
        let state = test_state().await;
        let definition = parse_workflow_yaml(ECHO_YAML).unwrap();
        let record = state.controller.create_run(&definition, Value::Null).await.unwrap();

        let body = event_body(&state, record.id).await;
        assert!(body.contains("event: snapshot"), "got: {body}");
        assert!(body.contains("\"initialized\""), "got: {body}");
        assert!(!body.contains("event: run_finished"));
    }

    #[tokio::test]
    async fn events_of_finished_run_end_with_run_finished() {
        let state = test_state().await;
        let mut rx = state.controller.subscribe();
        let run_id = start(&state, ECHO_YAML, json!({"name": "ada"})).await;
        assert_eq!(wait_finished(&mut rx, run_id).await, RunStatus::Completed);

        let body = event_body(&state, run_id).await;
        let snapshot_at = body.find("event: snapshot").unwrap();
        let finished_at = body.find("event: run_finished").unwrap();
        assert!(snapshot_at < finished_at);
    }

    #[tokio::test]
    async fn started_run_is_active_immediately() {
        let state = test_state().await;
        let run_id = start(&state, APPROVAL_YAML, Value::Null).await;
        assert!(state.controller.is_active(&run_id));
        state.controller.cancel(&run_id);
    }

    #[tokio::test]
    async fn invalid_workflow_rejected() {
        let state = test_state().await;
        let err = start_run(
            State(state.clone()),
            Json(StartRunRequest {
                workflow_yaml: "name: x\nstages:\n  - name: a\n    task: nope\n".to_string(),
                input: Value::Null,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Controller(_)));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let state = test_state().await;
        let err = get_run(State(state.clone()), Path(Uuid::now_v7())).await.unwrap_err();
        assert!(matches!(err, AppError::RunNotFound(_)));

        let err = cancel_run(State(state), Path(Uuid::now_v7())).await.unwrap_err();
        assert!(matches!(err, AppError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn signal_resumes_waiting_stage() {
        let state = test_state().await;
        let mut rx = state.controller.subscribe();
        let run_id = start(&state, APPROVAL_YAML, Value::Null).await;

        // The signal may arrive before or after the stage starts waiting.
        timeout(Duration::from_secs(5), async {
            while !state.controller.is_active(&run_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let accepted = send_signal(
            State(state.clone()),
            Path((run_id, "approve".to_string())),
            Bytes::from(json!({"by": "reviewer"}).to_string()),
        )
        .await
        .unwrap()
        .data
        .unwrap();
        assert_eq!(accepted.signal, "approve");

        assert_eq!(wait_finished(&mut rx, run_id).await, RunStatus::Completed);
        let report = state.controller.resume(run_id).await.unwrap();
        assert_eq!(report.output["approve"], json!({"by": "reviewer"}));
    }

    #[tokio::test]
    async fn cancel_stops_waiting_run() {
        let state = test_state().await;
        let mut rx = state.controller.subscribe();
        let run_id = start(&state, APPROVAL_YAML, Value::Null).await;

        timeout(Duration::from_secs(5), async {
            while !state.controller.is_active(&run_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel_run(State(state.clone()), Path(run_id)).await.unwrap();
        assert_eq!(wait_finished(&mut rx, run_id).await, RunStatus::Cancelled);
        timeout(Duration::from_secs(5), async {
            while state.controller.is_active(&run_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = send_signal(
            State(state.clone()),
            Path((run_id, "approve".to_string())),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::RunNotActive(_)));
    }
}
