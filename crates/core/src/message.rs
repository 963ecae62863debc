//! JSON wire envelopes.
//!
//! Field names on the wire are camelCase. `data` is carried opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload a device publishes on `/device/{cid}/s` or `/group/{name}/s`,
/// and the body of `POST /device/s`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevicePublish {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_group: Option<String>,
    /// When true and `data` is an object, numeric entries are recorded as
    /// timeseries points in addition to normal dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<bool>,
    #[serde(default)]
    pub data: Value,
}

/// Envelope delivered to receivers on `/device/{cid}/r` and `/group/{name}/r`.
///
/// `from_device` carries `brokerId:clientId` when the message originated on
/// a remote peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMessage {
    pub from_device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_group: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ForwardMessage {
    pub fn direct(from_device: impl Into<String>, data: Value) -> Self {
        Self {
            from_device: from_device.into(),
            from_group: None,
            data,
        }
    }

    pub fn group(from_device: impl Into<String>, group: impl Into<String>, data: Value) -> Self {
        Self {
            from_device: from_device.into(),
            from_group: Some(group.into()),
            data,
        }
    }
}

/// Cross-broker device message, published on `/bridge/device/{toDevice}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub from_broker: String,
    pub from_device: String,
    pub to_device: String,
    #[serde(default)]
    pub data: Value,
}

/// Cross-broker group message, published on `/bridge/group/{toGroup}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeGroupMessage {
    pub from_broker: String,
    pub from_device: String,
    pub to_group: String,
    #[serde(default)]
    pub data: Value,
}

/// One entry of a share-sync payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDeviceEntry {
    pub uuid: String,
    pub client_id: Option<String>,
    pub permissions: String,
}

/// Full share-list sync, published on `/bridge/share/sync/{peerBrokerId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeShareSyncMessage {
    pub from_broker: String,
    pub devices: Vec<SharedDeviceEntry>,
}

/// Latest-data push for one shared device, published on
/// `/bridge/share/data/{peerBrokerId}/{clientId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeShareDataMessage {
    pub from_broker: String,
    pub from_device: String,
    pub device_uuid: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forward_message_wire_shape() {
        let msg = ForwardMessage::direct("cid-1", json!({"x": 1}));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire, json!({"fromDevice": "cid-1", "data": {"x": 1}}));

        let msg = ForwardMessage::group("cid-1", "g1", json!(7));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            wire,
            json!({"fromDevice": "cid-1", "fromGroup": "g1", "data": 7})
        );
    }

    #[test]
    fn device_publish_accepts_partial_payloads() {
        let msg: DevicePublish =
            serde_json::from_value(json!({"toDevice": "cid-2", "data": {"v": 9}})).unwrap();
        assert_eq!(msg.to_device.as_deref(), Some("cid-2"));
        assert_eq!(msg.to_group, None);
        assert_eq!(msg.ts, None);

        let msg: DevicePublish = serde_json::from_value(json!({"ts": true, "data": {}})).unwrap();
        assert_eq!(msg.ts, Some(true));
    }

    #[test]
    fn bridge_message_camel_case() {
        let msg = BridgeMessage {
            from_broker: "b1".into(),
            from_device: "cid-1".into(),
            to_device: "cid-2".into(),
            data: json!(null),
        };
        let wire = serde_json::to_string(&msg).unwrap();
        assert!(wire.contains("\"fromBroker\""));
        assert!(wire.contains("\"toDevice\""));
    }
}
