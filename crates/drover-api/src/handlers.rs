//! HTTP handlers — exposes manager state as JSON and forwards ingest
//! onto core operations.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use drover_core::wire::{Envelope, TaskSubmit, Template};
use drover_core::{ManagerError, PeerId};
use drover_services::engine::TaskSummary;
use drover_services::{ControlLoop, MessageRouter, TaskEngine, WorkerRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<WorkerRegistry>,
    pub engine: Arc<TaskEngine>,
    pub control: Arc<ControlLoop>,
    pub router: Arc<MessageRouter>,
    /// Manager's own peer id, as advertised to workers.
    pub peer_id: String,
    /// Manager's compressed signing public key, hex.
    pub public_key: String,
    pub require_access_codes: bool,
    pub announced_addresses: Vec<String>,
    /// Unix ms at daemon start.
    pub start_time: u64,
}

/// `{status, error}` body carried by every failed request.
#[derive(Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
}

/// Ingest failures are a flat 500 per the protocol contract; the body
/// still carries the precise error text.
fn ingest_error(e: &ManagerError) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            status: 500,
            error: e.to_string(),
        }),
    )
}

// ── GET / ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub peer_id: String,
    pub version: String,
    pub is_started: bool,
    pub start_time: u64,
    pub cycle: u64,
    pub require_access_codes: bool,
    pub announced_addresses: Vec<String>,
    pub public_key: String,
    pub connected_peers: Vec<PeerId>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        peer_id: state.peer_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        is_started: state.control.is_running(),
        start_time: state.start_time,
        cycle: state.control.cycle(),
        require_access_codes: state.require_access_codes,
        announced_addresses: state.announced_addresses.clone(),
        public_key: state.public_key.clone(),
        connected_peers: state.registry.connected_peers(),
    })
}

// ── POST /task ────────────────────────────────────────────────────────────────

/// Provider id recorded for tasks ingested over the admin surface.
const ADMIN_PROVIDER: &str = "admin";

pub async fn handle_post_task(
    State(state): State<ApiState>,
    Json(task): Json<TaskSubmit>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let task_id = task.task_id.clone();
    state
        .engine
        .create_task(task, &ADMIN_PROVIDER.to_string())
        .map_err(|e| ingest_error(&e))?;
    Ok(Json(serde_json::json!({ "taskId": task_id })))
}

// ── POST /template/register ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTemplateRequest {
    pub template: Template,
    pub provider_peer_id_str: String,
}

pub async fn handle_register_template(
    State(state): State<ApiState>,
    Json(request): Json<RegisterTemplateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let id = state
        .engine
        .register_template(request.template, &request.provider_peer_id_str)
        .map_err(|e| ingest_error(&e))?;
    Ok(Json(serde_json::json!({ "id": id })))
}

// ── GET /tasks/{template_id} ──────────────────────────────────────────────────

pub async fn handle_tasks_for_template(
    State(state): State<ApiState>,
    Path(template_id): Path<String>,
) -> Json<Vec<TaskSummary>> {
    Json(state.engine.tasks_for_template(&template_id))
}

// ── POST /message — the HTTP transport ────────────────────────────────────────

/// One transport frame: the sender's identity plus an envelope. Peer
/// identity integrity is the transport collaborator's concern; this
/// endpoint carries it explicitly.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpFrame {
    pub peer_id: PeerId,
    pub message: Envelope,
}

pub async fn handle_message(
    State(state): State<ApiState>,
    Json(frame): Json<HttpFrame>,
) -> Json<Envelope> {
    let response = state.router.handle(&frame.peer_id, frame.message).await;
    if response.disconnect {
        tracing::warn!(peer = %frame.peer_id, "router requested disconnect over http transport");
    }
    Json(response.reply)
}
