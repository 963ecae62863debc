//! Classification of publishes received over a peer connection.
//!
//! A peer only ever sends us share traffic: the full share-list sync on
//! `/bridge/share/sync/{ourBrokerId}` and per-device data pushes on
//! `/bridge/share/data/{ourBrokerId}/{clientId}`. Everything else on the
//! subscription set is cross-broker payload the peer's own engine already
//! routed and is ignored here.

use tracing::debug;

use mqmesh_core::message::{BridgeShareDataMessage, BridgeShareSyncMessage};
use mqmesh_core::models::RemoteSharedDevice;
use mqmesh_core::{now_ms, DeviceCache, Topic};

/// What an inbound peer publish means for the local cache.
#[derive(Debug)]
pub enum InboundAction {
    ShareSync(BridgeShareSyncMessage),
    ShareData(BridgeShareDataMessage),
    Ignore,
}

/// Classify one inbound publish by topic and payload.
pub fn classify_inbound(local_broker_id: &str, topic: &str, payload: &[u8]) -> InboundAction {
    match Topic::parse(topic) {
        Some(Topic::BridgeShareSync(broker_id)) if broker_id == local_broker_id => {
            match serde_json::from_slice(payload) {
                Ok(msg) => InboundAction::ShareSync(msg),
                Err(e) => {
                    debug!(topic, "malformed share sync: {e}");
                    InboundAction::Ignore
                }
            }
        }
        Some(Topic::BridgeShareData { broker_id, .. }) if broker_id == local_broker_id => {
            match serde_json::from_slice(payload) {
                Ok(msg) => InboundAction::ShareData(msg),
                Err(e) => {
                    debug!(topic, "malformed share data: {e}");
                    InboundAction::Ignore
                }
            }
        }
        _ => InboundAction::Ignore,
    }
}

/// Apply a classified inbound message to the cache.
pub(crate) fn apply_inbound(cache: &DeviceCache, peer_broker_id: &str, action: InboundAction) {
    match action {
        InboundAction::ShareSync(msg) => {
            let devices: Vec<RemoteSharedDevice> = msg
                .devices
                .into_iter()
                .map(|entry| RemoteSharedDevice {
                    uuid: entry.uuid,
                    client_id: entry.client_id,
                    permissions: entry.permissions,
                    last_data: None,
                    last_data_at: None,
                })
                .collect();
            debug!(peer_broker_id, count = devices.len(), "share list synced");
            cache.set_remote_shared_devices(peer_broker_id, devices);
        }
        InboundAction::ShareData(msg) => {
            cache.update_remote_shared_data(
                peer_broker_id,
                &msg.from_device,
                &msg.device_uuid,
                msg.data,
                now_ms(),
            );
        }
        InboundAction::Ignore => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cache() -> DeviceCache {
        DeviceCache::new(Duration::from_millis(10), Duration::from_secs(60))
    }

    #[test]
    fn classifies_share_sync_for_us_only() {
        let payload = serde_json::to_vec(&json!({
            "fromBroker": "b2",
            "devices": [{"uuid": "u1", "clientId": "c1", "permissions": "read"}]
        }))
        .unwrap();

        assert!(matches!(
            classify_inbound("b1", "/bridge/share/sync/b1", &payload),
            InboundAction::ShareSync(_)
        ));
        // Addressed to some other broker: not ours to apply.
        assert!(matches!(
            classify_inbound("b1", "/bridge/share/sync/b9", &payload),
            InboundAction::Ignore
        ));
        // Cross-broker payload topics are ignored here.
        assert!(matches!(
            classify_inbound("b1", "/bridge/device/c1", &payload),
            InboundAction::Ignore
        ));
    }

    #[test]
    fn sync_replaces_and_data_updates() {
        let cache = cache();
        let sync = serde_json::to_vec(&json!({
            "fromBroker": "b2",
            "devices": [
                {"uuid": "u1", "clientId": "c1", "permissions": "readwrite"},
                {"uuid": "u2", "clientId": null, "permissions": "read"}
            ]
        }))
        .unwrap();
        let action = classify_inbound("b1", "/bridge/share/sync/b1", &sync);
        apply_inbound(&cache, "b2", action);
        assert_eq!(cache.remote_shared_devices("b2").len(), 2);

        let data = serde_json::to_vec(&json!({
            "fromBroker": "b2",
            "fromDevice": "c1",
            "deviceUuid": "u1",
            "data": {"t": 20}
        }))
        .unwrap();
        let action = classify_inbound("b1", "/bridge/share/data/b1/c1", &data);
        apply_inbound(&cache, "b2", action);

        let devices = cache.remote_shared_devices("b2");
        let entry = devices.iter().find(|d| d.uuid == "u1").unwrap();
        assert_eq!(entry.last_data, Some(json!({"t": 20})));
        assert!(entry.last_data_at.is_some());

        // A later sync wipes accumulated data.
        let action = classify_inbound(
            "b1",
            "/bridge/share/sync/b1",
            &serde_json::to_vec(&json!({"fromBroker": "b2", "devices": []})).unwrap(),
        );
        apply_inbound(&cache, "b2", action);
        assert!(cache.remote_shared_devices("b2").is_empty());
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        assert!(matches!(
            classify_inbound("b1", "/bridge/share/sync/b1", b"not json"),
            InboundAction::Ignore
        ));
    }
}
