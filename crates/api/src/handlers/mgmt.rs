//! Management endpoints: device administration, peer brokers, shares.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use mqmesh_core::{rand_hex, SharePermission};

use crate::response::{code, err, ok, storage_err, Envelope};
use crate::state::ApiState;

// ── devices ──

/// `GET /mgmt/devices` — every registered device with its status row.
pub async fn list_devices(State(state): State<ApiState>) -> Json<Envelope> {
    let devices = match state.db.get_all_devices().await {
        Ok(devices) => devices,
        Err(e) => return storage_err(e),
    };

    let mut detail = Vec::with_capacity(devices.len());
    for device in devices {
        let status = state.db.get_device_status(device.id).await.ok().flatten();
        detail.push(json!({
            "id": device.id,
            "uuid": device.uuid,
            "authKey": device.auth_key,
            "clientId": device.client_id,
            "online": status.as_ref().map(|s| s.status == 1).unwrap_or(false),
            "mode": status.as_ref().map(|s| s.mode.clone()),
            "lastActiveAt": status.map(|s| s.last_active_at),
        }));
    }
    ok(json!({"count": detail.len(), "devices": detail}))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub uuid: String,
}

/// `POST /mgmt/devices` — provision a device, like `/device/auth` but
/// operator-initiated.
pub async fn create_device(
    State(state): State<ApiState>,
    Json(request): Json<CreateDeviceRequest>,
) -> Json<Envelope> {
    let uuid = request.uuid.trim();
    if uuid.is_empty() {
        return err(code::BAD_REQUEST, "uuid is required");
    }

    let device = match state.db.create_device(uuid, &rand_hex(32)).await {
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
    ok(json!({"uuid": device.uuid, "authKey": device.auth_key}))
}

/// `GET /mgmt/devices/:uuid`.
pub async fn get_device(State(state): State<ApiState>, Path(uuid): Path<String>) -> Json<Envelope> {
    let device = match state.db.get_device_by_uuid(&uuid).await {
        Ok(Some(device)) => device,
        Ok(None) => return err(code::DEVICE_NOT_FOUND, "unknown device"),
        Err(e) => return storage_err(e),
    };
    let status = state.db.get_device_status(device.id).await.ok().flatten();
    let groups = state.db.get_device_groups(device.id).await.unwrap_or_default();
    ok(json!({
        "id": device.id,
        "uuid": device.uuid,
        "authKey": device.auth_key,
        "clientId": device.client_id,
        "groups": groups,
        "online": status.as_ref().map(|s| s.status == 1).unwrap_or(false),
        "mode": status.map(|s| s.mode),
    }))
}

// ── peer brokers ──

/// `GET /mgmt/bridge/remotes` — configured peers and their live state.
pub async fn list_remotes(State(state): State<ApiState>) -> Json<Envelope> {
    let peers = match state.db.list_peers().await {
        Ok(peers) => peers,
        Err(e) => return storage_err(e),
    };
    let live: Vec<(String, bool)> = state
        .bridge
        .as_ref()
        .map(|bridge| bridge.peer_status())
        .unwrap_or_default();

    let detail: Vec<Value> = peers
        .into_iter()
        .map(|peer| {
            let connected = live
                .iter()
                .any(|(id, connected)| *connected && id == &peer.broker_id);
            json!({
                "brokerId": peer.broker_id,
                "url": peer.url,
                "enabled": peer.is_enabled(),
                "connected": connected,
            })
        })
        .collect();
    ok(json!({"count": detail.len(), "remotes": detail}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    pub broker_id: String,
    pub url: String,
    pub token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `POST /mgmt/bridge/remotes` — persist a peer and start its connection.
pub async fn add_remote(
    State(state): State<ApiState>,
    Json(request): Json<RemoteRequest>,
) -> Json<Envelope> {
    if request.broker_id.trim().is_empty() || request.url.trim().is_empty() {
        return err(code::BAD_REQUEST, "brokerId and url are required");
    }

    let peer = match state
        .db
        .create_peer(&request.broker_id, &request.url, &request.token, request.enabled)
        .await
    {
        Ok(peer) => peer,
        Err(e) => return storage_err(e),
    };

    if request.enabled {
        if let Some(bridge) = &state.bridge {
            if let Err(e) = bridge.add_remote(peer.clone()) {
                warn!(peer = %peer.broker_id, "bridge start failed: {e}");
            }
        }
    }
    ok(json!({"brokerId": peer.broker_id}))
}

/// `PUT /mgmt/bridge/remotes/:brokerId` — update and restart the client.
pub async fn update_remote(
    State(state): State<ApiState>,
    Path(broker_id): Path<String>,
    Json(request): Json<RemoteRequest>,
) -> Json<Envelope> {
    let peer = match state
        .db
        .update_peer(&broker_id, &request.url, &request.token, request.enabled)
        .await
    {
        Ok(peer) => peer,
        Err(e) => return storage_err(e),
    };

    if let Some(bridge) = &state.bridge {
        bridge.remove_remote(&broker_id);
        if peer.is_enabled() {
            if let Err(e) = bridge.add_remote(peer.clone()) {
                warn!(peer = %broker_id, "bridge restart failed: {e}");
            }
        }
    }
    ok(json!({"brokerId": peer.broker_id}))
}

/// `DELETE /mgmt/bridge/remotes/:brokerId`.
pub async fn delete_remote(
    State(state): State<ApiState>,
    Path(broker_id): Path<String>,
) -> Json<Envelope> {
    let removed = match state.db.delete_peer(&broker_id).await {
        Ok(removed) => removed,
        Err(e) => return storage_err(e),
    };
    if let Some(bridge) = &state.bridge {
        bridge.remove_remote(&broker_id);
    }
    ok(json!({"removed": removed}))
}

/// `POST /mgmt/bridge/reload` — resync live connections with the store.
pub async fn reload_remotes(State(state): State<ApiState>) -> Json<Envelope> {
    let Some(bridge) = &state.bridge else {
        return err(code::BAD_REQUEST, "federation disabled");
    };
    match bridge.reload_remotes().await {
        Ok(started) => ok(json!({"started": started})),
        Err(e) => {
            warn!("bridge reload failed: {e}");
            err(code::SERVER_ERROR, "reload failed")
        }
    }
}

/// `GET /mgmt/bridge/status`.
pub async fn bridge_status(State(state): State<ApiState>) -> Json<Envelope> {
    match &state.bridge {
        Some(bridge) => {
            let peers: Vec<Value> = bridge
                .peer_status()
                .into_iter()
                .map(|(id, connected)| json!({"brokerId": id, "connected": connected}))
                .collect();
            ok(json!({
                "enabled": true,
                "brokerId": bridge.local_broker_id(),
                "peers": peers,
            }))
        }
        None => ok(json!({"enabled": false, "peers": []})),
    }
}

// ── device shares ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerQuery {
    pub broker_id: String,
}

/// `GET /mgmt/bridge/shares?brokerId=`.
pub async fn list_shares(
    State(state): State<ApiState>,
    Query(query): Query<BrokerQuery>,
) -> Json<Envelope> {
    match state.db.get_shared_devices_for_broker(&query.broker_id).await {
        Ok(shares) => {
            let detail: Vec<Value> = shares
                .into_iter()
                .map(|(device, permission)| {
                    json!({
                        "uuid": device.uuid,
                        "clientId": device.client_id,
                        "permissions": permission.as_str(),
                    })
                })
                .collect();
            ok(json!({"brokerId": query.broker_id, "devices": detail}))
        }
        Err(e) => storage_err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub broker_id: String,
    pub uuid: String,
    pub permissions: Option<String>,
}

/// `POST /mgmt/bridge/shares` — share a device toward a peer. The updated
/// list is pushed to the peer right away.
pub async fn add_share(
    State(state): State<ApiState>,
    Json(request): Json<ShareRequest>,
) -> Json<Envelope> {
    let permission = match request.permissions.as_deref() {
        None => SharePermission::Read,
        Some(raw) => match SharePermission::parse(raw) {
            Some(permission) => permission,
            None => return err(code::BAD_REQUEST, "permissions must be read or readwrite"),
        },
    };
    let device = match state.db.get_device_by_uuid(&request.uuid).await {
        Ok(Some(device)) => device,
        Ok(None) => return err(code::DEVICE_NOT_FOUND, "unknown device"),
        Err(e) => return storage_err(e),
    };

    if let Err(e) = state
        .db
        .add_shared_device(&request.broker_id, device.id, permission)
        .await
    {
        return storage_err(e);
    }
    state.engine.push_share_sync(&request.broker_id).await;
    ok(json!({"brokerId": request.broker_id, "uuid": request.uuid}))
}

/// `DELETE /mgmt/bridge/shares`.
pub async fn remove_share(
    State(state): State<ApiState>,
    Json(request): Json<ShareRequest>,
) -> Json<Envelope> {
    let device = match state.db.get_device_by_uuid(&request.uuid).await {
        Ok(Some(device)) => device,
        Ok(None) => return err(code::DEVICE_NOT_FOUND, "unknown device"),
        Err(e) => return storage_err(e),
    };
    let removed = match state
        .db
        .remove_shared_device(&request.broker_id, device.id)
        .await
    {
        Ok(removed) => removed,
        Err(e) => return storage_err(e),
    };
    state.engine.push_share_sync(&request.broker_id).await;
    ok(json!({"removed": removed}))
}

/// `GET /mgmt/bridge/shared-data?brokerId=` — the share list a peer synced
/// to us, with the latest pushed data.
pub async fn shared_data(
    State(state): State<ApiState>,
    Query(query): Query<BrokerQuery>,
) -> Json<Envelope> {
    let devices = state.cache.remote_shared_devices(&query.broker_id);
    ok(json!({"brokerId": query.broker_id, "devices": devices}))
}
