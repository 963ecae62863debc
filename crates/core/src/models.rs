//! Durable row models shared across crates.
//!
//! These mirror the SQLite tables owned by the identity store. Timestamps
//! are unix milliseconds throughout.

use serde::{Deserialize, Serialize};

/// A registered device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    /// Stable public handle.
    pub uuid: String,
    /// Long-lived secret used to mint MQTT credentials.
    pub auth_key: String,
    /// Current MQTT client id; rotated on every credential mint.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named device set used for multicast and intra-group ACL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

/// Online status row, one per device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceStatus {
    pub device_id: i64,
    /// 0 = offline, 1 = online.
    pub status: i64,
    /// "mqtt" or "http".
    pub mode: String,
    pub last_active_at: i64,
}

/// A federated peer broker.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PeerBroker {
    pub id: i64,
    pub broker_id: String,
    pub url: String,
    pub token: String,
    pub enabled: i64,
}

impl PeerBroker {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

/// One row of the per-peer device-share ACL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SharedDeviceRow {
    pub id: i64,
    pub broker_id: String,
    pub device_id: i64,
    pub permissions: String,
}

/// How a device reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Mqtt,
    Http,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mqtt" => Some(Self::Mqtt),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Permission attached to a shared device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePermission {
    Read,
    #[serde(rename = "readwrite")]
    ReadWrite,
}

impl SharePermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::ReadWrite => "readwrite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "readwrite" => Some(Self::ReadWrite),
            _ => None,
        }
    }
}

/// Verdict of the bridge device-share ACL for one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAccess {
    /// No share rows exist for the peer: open policy.
    All,
    ReadWrite,
    Read,
    None,
}

impl BridgeAccess {
    /// Whether an inbound write delivery to the target is permitted.
    pub fn allows_write(&self) -> bool {
        matches!(self, Self::All | Self::ReadWrite)
    }
}

/// Cache-side projection of a device another broker shares with us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSharedDevice {
    pub uuid: String,
    pub client_id: Option<String>,
    pub permissions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_permission_round_trip() {
        assert_eq!(SharePermission::parse("read"), Some(SharePermission::Read));
        assert_eq!(
            SharePermission::parse("readwrite"),
            Some(SharePermission::ReadWrite)
        );
        assert_eq!(SharePermission::parse("write"), None);
        assert_eq!(SharePermission::ReadWrite.as_str(), "readwrite");
    }

    #[test]
    fn bridge_access_write_gate() {
        assert!(BridgeAccess::All.allows_write());
        assert!(BridgeAccess::ReadWrite.allows_write());
        assert!(!BridgeAccess::Read.allows_write());
        assert!(!BridgeAccess::None.allows_write());
    }
}
