//! Group membership endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::response::{code, err, ok, storage_err, Envelope};
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub auth_key: String,
    pub group_name: String,
}

/// `POST /group/join` — join a group, creating it when absent.
pub async fn join(State(state): State<ApiState>, Json(request): Json<JoinRequest>) -> Json<Envelope> {
    let name = request.group_name.trim();
    if name.is_empty() || name.contains('/') || name.contains(':') {
        return err(code::BAD_REQUEST, "invalid group name");
    }
    let Some(device) = state.device_by_auth_key(&request.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };

    let group = match state.db.get_or_create_group(name).await {
        Ok(group) => group,
        Err(e) => return storage_err(e),
    };
    if let Err(e) = state.db.add_device_to_group(device.id, group.id).await {
        return storage_err(e);
    }

    // Keep the live session's cached membership in step.
    if let Some(client_id) = device.client_id.as_deref() {
        match state.db.get_device_groups(device.id).await {
            Ok(groups) => state.cache.set_device_groups(client_id, &groups),
            Err(e) => return storage_err(e),
        }
    }
    ok(json!({"group": group.name}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesQuery {
    pub auth_key: String,
    pub group_name: String,
}

/// `GET /group/devices` — member list, restricted to members.
pub async fn devices(
    State(state): State<ApiState>,
    Query(query): Query<DevicesQuery>,
) -> Json<Envelope> {
    let Some(device) = state.device_by_auth_key(&query.auth_key).await else {
        return err(code::DEVICE_NOT_FOUND, "unknown auth key");
    };
    match state.db.is_device_in_group(device.id, &query.group_name).await {
        Ok(true) => {}
        Ok(false) => return err(code::FORBIDDEN_GROUP, "not a group member"),
        Err(e) => return storage_err(e),
    }

    let members = match state.db.get_group_devices(&query.group_name).await {
        Ok(members) => members,
        Err(e) => return storage_err(e),
    };

    let mut detail = Vec::with_capacity(members.len());
    for member in members {
        let status = state.db.get_device_status(member.id).await.ok().flatten();
        detail.push(json!({
            "uuid": member.uuid,
            "clientId": member.client_id,
            "online": status.as_ref().map(|s| s.status == 1).unwrap_or(false),
            "mode": status.map(|s| s.mode),
        }));
    }
    ok(json!({"group": query.group_name, "devices": detail}))
}
