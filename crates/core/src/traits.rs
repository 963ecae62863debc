//! Capability traits at the component seams.
//!
//! The routing engine, bridge, and scheduler are wired together through
//! these traits rather than depending on each other's crates directly.

use async_trait::async_trait;
use serde_json::Value;

/// Publish into the local broker's subscription table.
///
/// Implemented by the broker's fan-out; used by the engine, the bridge, and
/// the scheduler to emit downlink messages to locally connected clients.
#[async_trait]
pub trait LocalPublisher: Send + Sync {
    async fn publish_local(&self, topic: &str, payload: Vec<u8>);
}

/// Outbound federation operations toward peer brokers.
///
/// Implemented by the bridge manager. All sends are fire-and-forget QoS 0;
/// a `false` return means the peer had no live connection and the message
/// was dropped.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send_to_remote_device(
        &self,
        peer_broker_id: &str,
        from_client_id: &str,
        target_client_id: &str,
        data: &Value,
    ) -> bool;

    async fn send_to_remote_group(
        &self,
        peer_broker_id: &str,
        from_client_id: &str,
        target_group: &str,
        data: &Value,
    ) -> bool;

    /// Send a group message to every currently connected peer.
    async fn broadcast_to_remote_groups(&self, from_client_id: &str, group: &str, data: &Value);

    /// Broker ids of peers with a live connection.
    fn connected_peers(&self) -> Vec<String>;
}
