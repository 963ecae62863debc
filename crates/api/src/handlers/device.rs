//! Device-facing endpoints: register, online, publish, receive.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use mqmesh_broker::PublishError;
use mqmesh_core::message::DevicePublish;
use mqmesh_core::{rand_hex, DeviceMode};

use crate::response::{code, err, ok, storage_err, Envelope};
use crate::state::ApiState;

pub async fn health() -> Json<Envelope> {
    ok(json!({"status": "up"}))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub uuid: String,
}

/// `POST /device/auth` — idempotent registration. The first call creates
/// the device, a group named after the uuid, and the membership.
pub async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Json<Envelope> {
    let uuid = request.uuid.trim();
    if uuid.is_empty() {
        return err(code::BAD_REQUEST, "uuid is required");
    }

    match state.db.get_device_by_uuid(uuid).await {
        Ok(Some(device)) => ok(json!({"authKey": device.auth_key})),
        Ok(None) => {
            let auth_key = rand_hex(32);
            let device = match state.db.create_device(uuid, &auth_key).await {
                Ok(device) => device,
                Err(e) => return storage_err(e),
            };
            let group = match state.db.get_or_create_group(uuid).await {
                Ok(group) => group,
                Err(e) => return storage_err(e),
            };
            if let Err(e) = state.db.add_device_to_group(device.id, group.id).await {
                return storage_err(e);
            }
            info!(uuid, "device registered");
            ok(json!({"authKey": device.auth_key}))
        }
        Err(e) => storage_err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineQuery {
    pub auth_key: String,
    pub mode: Option<String>,
}

/// `GET /device/auth` — mint a fresh MQTT credential triple. The previous
/// triple (and any session still using it) is invalidated.
pub async fn online(
    State(state): State<ApiState>,
    Query(query): Query<OnlineQuery>,
) -> Json<Envelope> {
    let mode = match query.mode.as_deref() {
        None => DeviceMode::Mqtt,
        Some(raw) => match DeviceMode::parse(raw) {
            Some(mode) => mode,
            None => return err(code::BAD_REQUEST, "mode must be mqtt or http"),
        },
    };

    let device = match state.db.get_device_by_auth_key(&query.auth_key).await {
        Ok(Some(device)) => device,
        Ok(None) => return err(code::DEVICE_NOT_FOUND, "unknown auth key"),
        Err(e) => return storage_err(e),
    };

    // Close out the previous identity before rotating.
    if let Some(old_client_id) = &device.client_id {
        if let Some(handle) = state.cache.take_online(old_client_id) {
            handle.close();
        }
        state.cache.remove_device(old_client_id, &device.auth_key);
    }

    let client_id = format!("client_{}", rand_hex(16));
    let username = format!("user_{}", device.uuid.chars().take(8).collect::<String>());
    let password = rand_hex(32);

    let updated = match state
        .db
        .update_device_connection(&query.auth_key, &client_id, &username, &password)
        .await
    {
        Ok(updated) => updated,
        Err(e) => return storage_err(e),
    };

    state.cache.set_device_by_auth_key(&query.auth_key, updated.clone());
    state.cache.set_device_by_client_id(&client_id, updated.clone());
    state.cache.set_device_mode(&client_id, mode);
    match state.db.get_device_groups(updated.id).await {
        Ok(groups) => state.cache.set_device_groups(&client_id, &groups),
        Err(e) => return storage_err(e),
    }

    if mode == DeviceMode::Http {
        if let Err(e) = state
            .db
            .update_device_online_status(updated.id, true, DeviceMode::Http)
            .await
        {
            return storage_err(e);
        }
        state.cache.set_http_last_active(&client_id);
    }

    info!(uuid = %updated.uuid, client_id, mode = mode.as_str(), "credentials minted");
    ok(json!({
        "uuid": updated.uuid,
        "clientId": client_id,
        "username": username,
        "password": password,
        "mqttHost": state.config.mqtt_host,
        "mqttPort": state.config.mqtt_port,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub auth_key: String,
    pub to_device: Option<String>,
    pub to_group: Option<String>,
    pub ts: Option<bool>,
    #[serde(default)]
    pub data: Value,
}

/// `POST /device/s` — the publish pipeline over HTTP. Note that delivery
/// toward MQTT-mode devices is not re-injected on the MQTT path.
pub async fn send(State(state): State<ApiState>, Json(request): Json<SendRequest>) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&request.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };

    let publish = DevicePublish {
        to_device: request.to_device,
        to_group: request.to_group,
        ts: request.ts,
        data: request.data,
    };
    if let Err(e) = state.engine.http_publish(&device, publish).await {
        return match e {
            PublishError::TooLarge => err(code::MESSAGE_TOO_LARGE, "message too large"),
            PublishError::RateLimited => err(code::RATE_LIMITED, "rate limited"),
            PublishError::ForbiddenGroup => err(code::FORBIDDEN_GROUP, "not a group member"),
            PublishError::MissingTarget => err(code::BAD_REQUEST, "toDevice or toGroup required"),
        };
    }

    if let Some(client_id) = &device.client_id {
        if state.cache.is_http_mode(client_id) {
            state.cache.set_http_last_active(client_id);
            if let Err(e) = state.db.update_device_last_active(device.id).await {
                tracing::warn!("activity stamp failed: {e}");
            }
        }
    }
    ok(Value::Null)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecvQuery {
    pub auth_key: String,
}

/// `GET /device/r` — drain the HTTP spool. Only meaningful for devices that
/// onlined with `mode=http`.
pub async fn recv(State(state): State<ApiState>, Query(query): Query<RecvQuery>) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&query.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    let Some(client_id) = device.client_id.as_deref() else {
        return err(code::NOT_HTTP_MODE, "device has no active credentials");
    };
    if !state.cache.is_http_mode(client_id) {
        return err(code::NOT_HTTP_MODE, "device is not in http mode");
    }

    state.cache.set_http_last_active(client_id);
    if let Err(e) = state.db.update_device_last_active(device.id).await {
        tracing::warn!("activity stamp failed: {e}");
    }

    let messages = state.cache.take_pending_messages(client_id);
    ok(json!({"count": messages.len(), "messages": messages}))
}
