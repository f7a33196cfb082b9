//! HTTP API server and endpoints
//!
//! Thin surface over the intake pipeline: submit, status, stream, cancel,
//! details. Any carrier would do; the engine only sees `SubmitRequest`.

use crate::{
    config::ApiConfig,
    constants::{SNAPSHOT_MESSAGE_LIMIT, STREAM_HEARTBEAT_SECS},
    dispatch::{AgentSlot, LoadAwareDispatcher},
    events::{EventBus, EventKind, TaskEvent},
    intake::{IntakePipeline, SubmitRequest},
    models::{GenerationConfig, SystemMode, TaskRecord, TaskStatus},
    agents::{AgentProfile, AgentRegistry},
    orchestrator::{Orchestrator, WorkflowSnapshot, WorkflowSpec},
    planner::PlannerConfig,
    store::{TaskFilter, TaskStore},
    ForgeError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_STATUS: &str = "/tasks/{task_id}/status";
const ROUTE_TASK_STREAM: &str = "/tasks/{task_id}/stream";
const ROUTE_TASK_CANCEL: &str = "/tasks/{task_id}/cancel";
const ROUTE_TASK_DETAILS: &str = "/tasks/{task_id}/details";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IntakePipeline>,
    pub store: Arc<TaskStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<LoadAwareDispatcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub input: String,
    pub agent: Option<String>,
    pub conversation_id: Option<String>,
    pub generation: Option<GenerationConfig>,
    pub system_mode: Option<SystemMode>,
    pub multi_agent: Option<bool>,
    pub task_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub planner: Option<PlannerConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub status: String,
}

/// Envelope returned by task queries.
#[derive(Debug, Serialize)]
pub struct TaskEnvelopeResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub agent: Option<String>,
    pub task: TaskRecord,
}

/// Live status snapshot; also the SSE payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshotResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub agent: Option<String>,
    pub input: String,
    pub messages: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub generation: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub message: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailsResponse {
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub cancelable: bool,
    pub logs: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<WorkflowSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentProfile>,
    pub slots: Vec<AgentSlot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    pub uptime_secs: u64,
    pub tasks_total: usize,
    pub agents: Vec<AgentSlot>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ForgeError::Internal(e.into()))?;

        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| ForgeError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_STATUS, get(get_task_status))
            .route(ROUTE_TASK_STREAM, get(stream_task))
            .route(ROUTE_TASK_CANCEL, post(cancel_task))
            .route(ROUTE_TASK_DETAILS, get(get_task_details))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer)
            .with_state(self.state.clone())
    }
}

fn error_response(err: &ForgeError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ForgeError::Validation(_) => StatusCode::BAD_REQUEST,
        ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
        ForgeError::Conflict(_) => StatusCode::CONFLICT,
        ForgeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ForgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let details = match err {
        ForgeError::Validation(rules) => Some(rules.clone()),
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            details,
        }),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> std::result::Result<(StatusCode, Json<CreateTaskResponse>), (StatusCode, Json<ErrorResponse>)>
{
    let submit = SubmitRequest {
        input: req.input,
        agent: req.agent,
        conversation_id: req.conversation_id,
        generation: req.generation,
        system_mode: req.system_mode,
        multi_agent: req.multi_agent,
        task_id: req.task_id,
        timeout_ms: req.timeout_ms,
        planner: req.planner,
    };

    match state.pipeline.clone().spawn_execute(submit).await {
        Ok(record) => Ok((
            StatusCode::ACCEPTED,
            Json(CreateTaskResponse {
                task_id: record.id,
                status: "queued".to_string(),
            }),
        )),
        Err(err) => {
            warn!("Task submission rejected: {}", err);
            Err(error_response(&err))
        }
    }
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> Json<Vec<TaskRecord>> {
    let records = state
        .store
        .query(TaskFilter {
            status: params.status,
            agent: params.agent,
            limit: params.limit.or(Some(100)),
            offset: params.offset,
            ..Default::default()
        })
        .await;
    Json(records)
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskEnvelopeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let record = state
        .store
        .get(&task_id)
        .await
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("task {task_id}"))))?;

    let status = match record.status {
        TaskStatus::Completed => "completed",
        TaskStatus::Failed | TaskStatus::Cancelled => "failed",
        _ => "in_progress",
    };
    Ok(Json(TaskEnvelopeResponse {
        status: status.to_string(),
        result: record.output.clone(),
        reason: record.error.as_ref().map(|e| e.message.clone()),
        agent: record.agent_id.clone(),
        task: record,
    }))
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskSnapshotResponse>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = build_snapshot(&state, &task_id)
        .await
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("task {task_id}"))))?;
    Ok(Json(snapshot))
}

/// SSE stream: one `task` event with the full snapshot on every mutation,
/// heartbeat every 15 s.
async fn stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.bus.subscribe_all();

    let stream = futures::stream::unfold(
        (receiver, state, task_id),
        |(mut receiver, state, task_id)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.task_id.as_deref() == Some(task_id.as_str()) => {
                        let Some(snapshot) = build_snapshot(&state, &task_id).await else {
                            continue;
                        };
                        let Ok(sse_event) = Event::default().event("task").json_data(&snapshot)
                        else {
                            continue;
                        };
                        return Some((Ok(sse_event), (receiver, state, task_id)));
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("SSE consumer lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(std::time::Duration::from_secs(STREAM_HEARTBEAT_SECS)),
    )
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<CancelResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.pipeline.cancel(&task_id).await {
        Ok(()) => Ok(Json(CancelResponse {
            ok: true,
            status: "cancelled".to_string(),
        })),
        // A terminal task cannot be cancelled: 400, not 409
        Err(ForgeError::Conflict(message)) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: message,
                details: None,
            }),
        )),
        Err(err) => Err(error_response(&err)),
    }
}

async fn get_task_details(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskDetailsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let record = state
        .store
        .get(&task_id)
        .await
        .ok_or_else(|| error_response(&ForgeError::NotFound(format!("task {task_id}"))))?;

    let logs: Vec<LogLine> = state
        .bus
        .history(&task_id, SNAPSHOT_MESSAGE_LIMIT)
        .await
        .iter()
        .map(log_line)
        .collect();
    let current_step = logs
        .iter()
        .rev()
        .find(|l| l.kind == EventKind::TaskStep.as_str())
        .and_then(|l| l.data.get("step").and_then(|s| s.as_str()).map(String::from));

    Ok(Json(TaskDetailsResponse {
        status: record.status,
        agent_id: record.agent_id.clone(),
        started_at: record.started_at.to_rfc3339(),
        ended_at: record.completed_at.map(|t| t.to_rfc3339()),
        duration_ms: record.duration_ms,
        progress: record.progress,
        current_step,
        cancelable: !record.status.is_terminal(),
        logs,
        workflow: state.pipeline.workflow_of(&task_id).await,
        graph: state.orchestrator.snapshot(&task_id).await,
    }))
}

async fn list_agents(State(state): State<AppState>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.registry.all_profiles().await,
        slots: state.dispatcher.all_slots().await,
    })
}

async fn system_status(State(state): State<AppState>) -> Json<SystemStatusResponse> {
    Json(SystemStatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        tasks_total: state.store.count().await,
        agents: state.dispatcher.all_slots().await,
    })
}

async fn build_snapshot(state: &AppState, task_id: &str) -> Option<TaskSnapshotResponse> {
    let record = state.store.get(task_id).await?;
    let messages: Vec<LogLine> = state
        .bus
        .history(task_id, SNAPSHOT_MESSAGE_LIMIT)
        .await
        .iter()
        .map(log_line)
        .collect();

    Some(TaskSnapshotResponse {
        task_id: record.id.clone(),
        status: record.status,
        progress: record.progress,
        agent: record.agent_id.clone(),
        input: record.input.clone(),
        messages,
        result: record.output.clone(),
        reason: record.error.as_ref().map(|e| e.message.clone()),
        started_at: record.started_at.to_rfc3339(),
        duration_ms: record.duration_ms,
        generation: record.generation,
    })
}

fn log_line(event: &TaskEvent) -> LogLine {
    LogLine {
        ts: event.timestamp.to_rfc3339(),
        kind: event.kind.as_str().to_string(),
        agent_id: event.agent_id.clone(),
        message: event.kind.as_str().to_string(),
        data: event.data.clone(),
    }
}
