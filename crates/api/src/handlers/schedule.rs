//! Scheduler CRUD endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use mqmesh_scheduler::{TaskError, TaskMode, TaskSpec, TaskUpdate};

use crate::response::{code, err, ok, Envelope};
use crate::state::ApiState;

fn task_err(e: TaskError) -> Json<Envelope> {
    match e {
        TaskError::NotFound => err(code::UNAUTHORIZED, "task not found"),
        other => err(code::BAD_REQUEST, &other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub auth_key: String,
    pub to_device: Option<String>,
    #[serde(default)]
    pub command: Value,
    pub mode: TaskMode,
    pub execute_at: Option<i64>,
    pub countdown: Option<i64>,
    pub interval: Option<i64>,
}

/// `POST /schedule` — create a delayed command. Without `toDevice` the
/// caller targets itself.
pub async fn create(
    State(state): State<ApiState>,
    Json(request): Json<CreateRequest>,
) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&request.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    let target = match request.to_device.or(device.client_id) {
        Some(target) if !target.is_empty() => target,
        _ => return err(code::BAD_REQUEST, "no target device"),
    };

    let spec = TaskSpec {
        device_id: target,
        command: request.command,
        mode: request.mode,
        execute_at: request.execute_at,
        countdown: request.countdown,
        interval: request.interval,
    };
    match state.tasks.create(spec) {
        Ok(task) => ok(json!({"taskId": task.id, "executeAt": task.execute_at})),
        Err(e) => task_err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthQuery {
    pub auth_key: String,
}

/// `GET /schedule` — tasks targeting the caller's device.
pub async fn list(State(state): State<ApiState>, Query(query): Query<AuthQuery>) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&query.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    let tasks = match device.client_id.as_deref() {
        Some(client_id) => state.tasks.list_for_device(client_id),
        None => Vec::new(),
    };
    ok(json!({"count": tasks.len(), "tasks": tasks}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub auth_key: String,
    #[serde(flatten)]
    pub update: TaskUpdate,
}

/// `PUT /schedule/:id` — update semantics mirror create.
pub async fn update(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&request.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    if !owns_task(&state, &id, device.client_id.as_deref()) {
        return err(code::UNAUTHORIZED, "task not found");
    }
    match state.tasks.update(&id, request.update) {
        Ok(task) => ok(json!({"taskId": task.id, "executeAt": task.execute_at})),
        Err(e) => task_err(e),
    }
}

/// `DELETE /schedule/:id`.
pub async fn remove(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<AuthQuery>,
) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&query.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    if !owns_task(&state, &id, device.client_id.as_deref()) {
        return err(code::UNAUTHORIZED, "task not found");
    }
    state.tasks.remove(&id);
    ok(Value::Null)
}

/// A device may only touch tasks aimed at its own clientId.
fn owns_task(state: &ApiState, task_id: &str, client_id: Option<&str>) -> bool {
    match (state.tasks.get(task_id), client_id) {
        (Some(task), Some(client_id)) => task.device_id == client_id,
        _ => false,
    }
}
