//! Session authentication and topic ACL.
//!
//! The policy decides; the session loop enforces. Both checks are pure
//! lookups (cache first, store fallback) and never touch the socket.

use std::sync::Arc;

use tracing::{debug, warn};

use mqmesh_core::models::Device;
use mqmesh_core::{DeviceCache, Topic, BRIDGE_CLIENT_PREFIX, BRIDGE_USERNAME};
use mqmesh_storage::Database;

/// An authenticated session identity.
#[derive(Debug, Clone)]
pub enum Principal {
    /// A regular device bound to an identity-store record.
    Device { device: Device },
    /// A peer broker's bridge client. `peer_id` is the remainder of the
    /// client id after the reserved prefix.
    Bridge { peer_id: String },
}

impl Principal {
    pub fn is_bridge(&self) -> bool {
        matches!(self, Principal::Bridge { .. })
    }
}

/// Authentication and authorization policy for MQTT sessions.
pub struct SessionPolicy {
    cache: Arc<DeviceCache>,
    db: Database,
    bridge_enabled: bool,
    bridge_token: String,
}

impl SessionPolicy {
    pub fn new(
        cache: Arc<DeviceCache>,
        db: Database,
        bridge_enabled: bool,
        bridge_token: String,
    ) -> Self {
        Self {
            cache,
            db,
            bridge_enabled,
            bridge_token,
        }
    }

    /// Authenticate a CONNECT. On success the device snapshot and its group
    /// memberships are seeded into the cache.
    pub async fn authenticate(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Option<Principal> {
        if let Some(peer_id) = client_id.strip_prefix(BRIDGE_CLIENT_PREFIX) {
            if !self.bridge_enabled {
                warn!(client_id, "bridge client rejected: federation disabled");
                return None;
            }
            if username != BRIDGE_USERNAME || password != self.bridge_token {
                warn!(client_id, "bridge client rejected: bad credentials");
                return None;
            }
            debug!(peer_id, "bridge client authenticated");
            return Some(Principal::Bridge {
                peer_id: peer_id.to_string(),
            });
        }

        let device = match self.db.get_device_by_client_id(client_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                debug!(client_id, "unknown client id");
                return None;
            }
            Err(e) => {
                warn!(client_id, "device lookup failed: {e}");
                return None;
            }
        };

        let credentials_match = device.username.as_deref() == Some(username)
            && device.password.as_deref() == Some(password);
        if !credentials_match {
            debug!(client_id, "credential mismatch");
            return None;
        }

        self.cache.set_device_by_client_id(client_id, device.clone());
        match self.db.get_device_groups(device.id).await {
            Ok(groups) => self.cache.set_device_groups(client_id, &groups),
            Err(e) => warn!(client_id, "group load failed: {e}"),
        }

        Some(Principal::Device { device })
    }

    /// Whether `principal` may publish to `topic`.
    pub async fn authorize_publish(&self, principal: &Principal, topic: &str) -> bool {
        let Some(parsed) = Topic::parse(topic) else {
            return false;
        };
        match principal {
            Principal::Bridge { .. } => parsed.is_bridge(),
            Principal::Device { device } => {
                let client_id = device.client_id.as_deref().unwrap_or_default();
                match parsed {
                    Topic::DeviceSend(cid) => cid == client_id,
                    Topic::GroupSend(name) | Topic::GroupRecv(name) => {
                        self.is_member(device, &name).await
                    }
                    _ => false,
                }
            }
        }
    }

    /// Whether `principal` may subscribe with `filter`. Wildcard segments
    /// simply fail the identity checks, so devices cannot widen their view.
    pub async fn authorize_subscribe(&self, principal: &Principal, filter: &str) -> bool {
        let Some(parsed) = Topic::parse(filter) else {
            return false;
        };
        match principal {
            Principal::Bridge { .. } => parsed.is_bridge(),
            Principal::Device { device } => {
                let client_id = device.client_id.as_deref().unwrap_or_default();
                match parsed {
                    Topic::DeviceRecv(cid) => cid == client_id,
                    Topic::GroupSend(name) | Topic::GroupRecv(name) => {
                        self.is_member(device, &name).await
                    }
                    _ => false,
                }
            }
        }
    }

    /// Membership check: cache first, identity store on miss.
    async fn is_member(&self, device: &Device, group: &str) -> bool {
        let client_id = device.client_id.as_deref().unwrap_or_default();
        if self.cache.is_in_group(client_id, group) {
            return true;
        }
        match self.db.is_device_in_group(device.id, group).await {
            Ok(found) => found,
            Err(e) => {
                warn!(client_id, group, "membership lookup failed: {e}");
                false
            }
        }
    }
}
