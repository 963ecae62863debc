//! Bridge manager: the set of live peer connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::QoS;
use serde_json::Value;
use tracing::{debug, info, warn};

use mqmesh_core::message::{BridgeGroupMessage, BridgeMessage};
use mqmesh_core::models::PeerBroker;
use mqmesh_core::{topic, BridgeIdentity, DeviceCache, PeerLink};
use mqmesh_storage::Database;

use crate::peer::{spawn_peer, PeerConn};
use crate::{BridgeError, Result};

/// Owns one outbound connection per configured peer and implements the
/// engine-facing `PeerLink` capability.
pub struct BridgeManager {
    identity: BridgeIdentity,
    cache: Arc<DeviceCache>,
    db: Database,
    reconnect: Duration,
    peers: RwLock<HashMap<String, PeerConn>>,
}

impl BridgeManager {
    pub fn new(
        identity: BridgeIdentity,
        cache: Arc<DeviceCache>,
        db: Database,
        reconnect: Duration,
    ) -> Self {
        Self {
            identity,
            cache,
            db,
            reconnect,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_broker_id(&self) -> &str {
        &self.identity.broker_id
    }

    /// Start a connection to a new peer. Fails when one is already running.
    pub fn add_remote(&self, remote: PeerBroker) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(&remote.broker_id) {
            return Err(BridgeError::AlreadyExists(remote.broker_id));
        }
        let broker_id = remote.broker_id.clone();
        let conn = spawn_peer(
            &self.identity.broker_id,
            Arc::clone(&self.cache),
            remote,
            self.reconnect,
        )?;
        info!(peer = %broker_id, "bridge peer added");
        peers.insert(broker_id, conn);
        Ok(())
    }

    /// Stop and forget a peer connection, cancelling any pending reconnect.
    pub fn remove_remote(&self, broker_id: &str) -> bool {
        let conn = self.peers.write().remove(broker_id);
        match conn {
            Some(conn) => {
                conn.shutdown();
                info!(peer = %broker_id, "bridge peer removed");
                true
            }
            None => false,
        }
    }

    /// Replace a peer's configuration: full teardown, then a fresh client.
    pub fn update_remote(&self, remote: PeerBroker) -> Result<()> {
        self.remove_remote(&remote.broker_id);
        self.add_remote(remote)
    }

    /// Resynchronize the live set with the store: everything stops, every
    /// enabled row starts. Returns how many peers are running afterward.
    pub async fn reload_remotes(&self) -> Result<usize> {
        let rows = self.db.list_peers().await?;
        self.stop();

        let mut started = 0;
        for remote in rows {
            if !remote.is_enabled() {
                debug!(peer = %remote.broker_id, "peer disabled, skipping");
                continue;
            }
            let broker_id = remote.broker_id.clone();
            match self.add_remote(remote) {
                Ok(()) => started += 1,
                Err(e) => warn!(peer = %broker_id, "peer start failed: {e}"),
            }
        }
        Ok(started)
    }

    /// Connection state per configured peer.
    pub fn peer_status(&self) -> Vec<(String, bool)> {
        self.peers
            .read()
            .iter()
            .map(|(id, conn)| (id.clone(), conn.is_connected()))
            .collect()
    }

    /// Stop every peer connection.
    pub fn stop(&self) {
        let drained: Vec<PeerConn> = {
            let mut peers = self.peers.write();
            peers.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.shutdown();
        }
    }
}

#[async_trait]
impl PeerLink for BridgeManager {
    async fn send_to_remote_device(
        &self,
        peer_broker_id: &str,
        from_client_id: &str,
        target_client_id: &str,
        data: &Value,
    ) -> bool {
        let message = BridgeMessage {
            from_broker: self.identity.broker_id.clone(),
            from_device: from_client_id.to_string(),
            to_device: target_client_id.to_string(),
            data: data.clone(),
        };
        self.publish_to_peer(
            peer_broker_id,
            &topic::bridge_device(target_client_id),
            &message,
        )
    }

    async fn send_to_remote_group(
        &self,
        peer_broker_id: &str,
        from_client_id: &str,
        target_group: &str,
        data: &Value,
    ) -> bool {
        let message = BridgeGroupMessage {
            from_broker: self.identity.broker_id.clone(),
            from_device: from_client_id.to_string(),
            to_group: target_group.to_string(),
            data: data.clone(),
        };
        self.publish_to_peer(peer_broker_id, &topic::bridge_group(target_group), &message)
    }

    async fn broadcast_to_remote_groups(&self, from_client_id: &str, group: &str, data: &Value) {
        for peer in self.connected_peers() {
            if !self
                .send_to_remote_group(&peer, from_client_id, group, data)
                .await
            {
                debug!(peer = %peer, group, "group broadcast dropped");
            }
        }
    }

    fn connected_peers(&self) -> Vec<String> {
        self.peers
            .read()
            .iter()
            .filter(|(_, conn)| conn.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl BridgeManager {
    /// QoS 0 publish toward one peer; false when the peer has no live
    /// connection or the client queue rejected the message.
    fn publish_to_peer<M: serde::Serialize>(
        &self,
        peer_broker_id: &str,
        topic: &str,
        message: &M,
    ) -> bool {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %peer_broker_id, "bridge encode failed: {e}");
                return false;
            }
        };

        let peers = self.peers.read();
        let Some(conn) = peers.get(peer_broker_id) else {
            debug!(peer = %peer_broker_id, "unknown peer, dropping");
            return false;
        };
        if !conn.is_connected() {
            return false;
        }
        match conn.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %peer_broker_id, topic, "bridge publish failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_manager() -> BridgeManager {
        let db = Database::open_in_memory().await.unwrap();
        let cache = Arc::new(DeviceCache::new(
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        let identity = BridgeIdentity {
            broker_id: "b1".to_string(),
            token: "tok".to_string(),
        };
        BridgeManager::new(identity, cache, db, Duration::from_millis(50))
    }

    fn peer(broker_id: &str) -> PeerBroker {
        PeerBroker {
            id: 0,
            broker_id: broker_id.to_string(),
            // Port 1 refuses immediately; the task just keeps retrying.
            url: "127.0.0.1:1".to_string(),
            token: "remote-token".to_string(),
            enabled: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let manager = make_manager().await;
        manager.add_remote(peer("b2")).unwrap();
        let err = manager.add_remote(peer("b2")).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyExists(_)));
        manager.stop();
    }

    #[tokio::test]
    async fn remove_and_update() {
        let manager = make_manager().await;
        manager.add_remote(peer("b2")).unwrap();
        assert!(manager.remove_remote("b2"));
        assert!(!manager.remove_remote("b2"));

        manager.add_remote(peer("b2")).unwrap();
        // Update replaces the existing client rather than failing.
        manager.update_remote(peer("b2")).unwrap();
        assert_eq!(manager.peer_status().len(), 1);
        manager.stop();
    }

    #[tokio::test]
    async fn sends_to_disconnected_peer_return_false() {
        let manager = make_manager().await;
        manager.add_remote(peer("b2")).unwrap();

        let sent = manager
            .send_to_remote_device("b2", "cid-a", "cid-x", &serde_json::json!(1))
            .await;
        assert!(!sent);
        let sent = manager
            .send_to_remote_device("b9", "cid-a", "cid-x", &serde_json::json!(1))
            .await;
        assert!(!sent);
        assert!(manager.connected_peers().is_empty());
        manager.stop();
    }

    #[tokio::test]
    async fn reload_starts_only_enabled_rows() {
        let manager = make_manager().await;
        manager
            .db
            .create_peer("b2", "127.0.0.1:1", "t", true)
            .await
            .unwrap();
        manager
            .db
            .create_peer("b3", "127.0.0.1:1", "t", false)
            .await
            .unwrap();

        let started = manager.reload_remotes().await.unwrap();
        assert_eq!(started, 1);
        let status = manager.peer_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].0, "b2");
        manager.stop();
    }
}
