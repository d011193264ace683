//! HTTP surface: health, queue and job introspection, chat ingress, and
//! external group registration.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use groupvisor_core::persistence::{format_timestamp, now_timestamp};
use groupvisor_core::{Group, SandboxConfig, ScheduledJob, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lifecycle::LoopState;
use crate::orchestrator::{LoopStates, Orchestrator};
use crate::queue::QueueSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            started_at: Instant::now(),
            orchestrator,
        }
    }
}

/// JSON `{"error": ..}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    orchestrator_enabled: bool,
    channel: &'static str,
    registered_groups: usize,
    loops: LoopStates,
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    group: Option<String>,
}

/// A chat message delivered by the chat adapter.
#[derive(Debug, Deserialize)]
pub struct IngressMessage {
    pub id: Option<String>,
    pub chat_id: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    /// RFC 3339; defaults to the time of receipt.
    pub timestamp: Option<String>,
    pub chat_name: Option<String>,
    pub channel: Option<String>,
    pub is_group: Option<bool>,
    #[serde(default)]
    pub is_from_me: bool,
}

#[derive(Debug, Serialize)]
struct Accepted {
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterGroupBody {
    pub chat_id: String,
    pub name: String,
    pub folder: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub requires_trigger: Option<bool>,
    #[serde(default)]
    pub container_config: Option<SandboxConfig>,
}

pub fn router(state: AppState) -> Router {
    let max_body = state.orchestrator.context().config.server.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/queue", get(queue_snapshot))
        .route("/v1/tasks", get(list_tasks))
        .route("/v1/messages", post(ingest_message))
        .route("/v1/groups", post(register_group))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "groupvisord",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.orchestrator.context().config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let ctx = state.orchestrator.context();
    let enabled = ctx.config.orchestrator.enabled;
    let loops = state.orchestrator.loop_states();
    let ready = !enabled || loops.message_loop == LoopState::Running;
    let response = ReadyResponse {
        status: if ready { "ready" } else { "starting" },
        orchestrator_enabled: enabled,
        channel: ctx.channel.name(),
        registered_groups: ctx.groups.read().await.len(),
        loops,
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

async fn queue_snapshot(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.orchestrator.context().queue.snapshot().await)
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<ScheduledJob>>, ApiError> {
    let store = &state.orchestrator.context().store;
    let jobs = match query.group.as_deref() {
        Some(folder) => store.get_jobs_for_group(folder),
        None => store.get_all_jobs(),
    }
    .map_err(ApiError::internal)?;
    Ok(Json(jobs))
}

async fn ingest_message(
    State(state): State<AppState>,
    Json(body): Json<IngressMessage>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    if body.chat_id.trim().is_empty() {
        return Err(ApiError::bad_request("chat_id is required"));
    }
    if body.content.trim().is_empty() {
        return Err(ApiError::bad_request("content is required"));
    }

    let timestamp = match body.timestamp.as_deref() {
        Some(raw) => normalize_timestamp(raw)
            .ok_or_else(|| ApiError::bad_request(format!("invalid timestamp: {raw:?}")))?,
        None => now_timestamp(),
    };

    let store = &state.orchestrator.context().store;
    store
        .store_chat_metadata(
            &body.chat_id,
            &timestamp,
            body.chat_name.as_deref(),
            body.channel.as_deref(),
            body.is_group,
        )
        .map_err(ApiError::internal)?;

    let id = body
        .id
        .unwrap_or_else(|| format!("msg-{}", uuid::Uuid::new_v4().simple()));
    let message = StoredMessage {
        id: id.clone(),
        chat_id: body.chat_id,
        sender_name: body.sender_name.unwrap_or_else(|| body.sender.clone()),
        sender: body.sender,
        content: body.content,
        timestamp,
        is_from_me: body.is_from_me,
        is_bot_message: false,
    };
    store.store_message(&message).map_err(ApiError::internal)?;
    debug!(chat_id = %message.chat_id, id = %id, "message stored");
    Ok((StatusCode::ACCEPTED, Json(Accepted { id })))
}

/// Stored timestamps must sort lexically in time order, so every client
/// value is rewritten to the store's UTC millisecond form.
fn normalize_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| format_timestamp(dt.with_timezone(&Utc)))
}

async fn register_group(
    State(state): State<AppState>,
    Json(body): Json<RegisterGroupBody>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    if body.chat_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err(ApiError::bad_request("chat_id and name are required"));
    }
    let ctx = state.orchestrator.context();
    let group = Group {
        chat_id: body.chat_id,
        name: body.name.clone(),
        folder: body.folder,
        trigger: body
            .trigger
            .unwrap_or_else(|| format!("@{}", ctx.config.orchestrator.assistant_name)),
        added_at: now_timestamp(),
        container_config: body.container_config,
        requires_trigger: body.requires_trigger,
    };
    if let Err(e) = ctx.register_group(group.clone()).await {
        warn!(name = %body.name, err = %e, "group registration rejected");
        return Err(ApiError::bad_request(e.to_string()));
    }
    Ok((StatusCode::CREATED, Json(group)))
}
