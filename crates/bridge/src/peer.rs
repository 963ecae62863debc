//! Per-peer connection task.
//!
//! Each peer owns one rumqttc client. The task polls the event loop
//! forever: CONNACK flips the connected flag and installs the bridge
//! subscriptions, inbound publishes feed the cache, and any error drops
//! the flag and schedules a reconnect after the configured delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mqmesh_core::models::PeerBroker;
use mqmesh_core::{topic, DeviceCache, BRIDGE_CLIENT_PREFIX, BRIDGE_USERNAME};

use crate::inbound::{apply_inbound, classify_inbound};
use crate::{BridgeError, Result};

/// Timeout for establishing one connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Live state for one configured peer.
pub(crate) struct PeerConn {
    pub remote: PeerBroker,
    pub client: AsyncClient,
    pub connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PeerConn {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Tear the connection down: no reconnect will follow.
    pub fn shutdown(self) {
        let _ = self.client.try_disconnect();
        self.task.abort();
    }
}

/// Split a peer url into host and port. Accepts `mqtt://host:port`,
/// `tcp://host:port`, and bare `host[:port]`; the port defaults to 1883.
pub fn parse_peer_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let rest = rest.split('/').next().unwrap_or(rest);
    if rest.is_empty() {
        return Err(BridgeError::InvalidUrl(url.to_string()));
    }

    match rest.split_once(':') {
        None => Ok((rest.to_string(), 1883)),
        Some((host, port)) => {
            if host.is_empty() {
                return Err(BridgeError::InvalidUrl(url.to_string()));
            }
            let port = port
                .parse()
                .map_err(|_| BridgeError::InvalidUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
    }
}

/// Spawn the connection task for one peer.
pub(crate) fn spawn_peer(
    local_broker_id: &str,
    cache: Arc<DeviceCache>,
    remote: PeerBroker,
    reconnect: Duration,
) -> Result<PeerConn> {
    let (host, port) = parse_peer_url(&remote.url)?;

    let mut options = MqttOptions::new(format!("{BRIDGE_CLIENT_PREFIX}{local_broker_id}"), host, port);
    options.set_credentials(BRIDGE_USERNAME, &remote.token);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(options, 16);
    let connected = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(peer_loop(
        remote.broker_id.clone(),
        local_broker_id.to_string(),
        cache,
        client.clone(),
        eventloop,
        Arc::clone(&connected),
        reconnect,
    ));

    Ok(PeerConn {
        remote,
        client,
        connected,
        task,
    })
}

async fn peer_loop(
    peer_broker_id: String,
    local_broker_id: String,
    cache: Arc<DeviceCache>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    reconnect: Duration,
) {
    loop {
        let event = if connected.load(Ordering::SeqCst) {
            eventloop.poll().await
        } else {
            match tokio::time::timeout(CONNECT_TIMEOUT, eventloop.poll()).await {
                Ok(event) => event,
                Err(_) => {
                    debug!(peer = %peer_broker_id, "connect attempt timed out");
                    tokio::time::sleep(reconnect).await;
                    continue;
                }
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!(peer = %peer_broker_id, "bridge connected");
                    connected.store(true, Ordering::SeqCst);
                    subscribe_bridge_topics(&client, &peer_broker_id, &local_broker_id).await;
                } else {
                    warn!(peer = %peer_broker_id, code = ?ack.code, "bridge connection refused");
                    connected.store(false, Ordering::SeqCst);
                    tokio::time::sleep(reconnect).await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let action = classify_inbound(&local_broker_id, &publish.topic, &publish.payload);
                apply_inbound(&cache, &peer_broker_id, action);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(peer = %peer_broker_id, "bridge connection lost: {e}");
                } else {
                    debug!(peer = %peer_broker_id, "bridge connect failed: {e}");
                }
                tokio::time::sleep(reconnect).await;
            }
        }
    }
}

async fn subscribe_bridge_topics(client: &AsyncClient, peer_broker_id: &str, local_broker_id: &str) {
    let filters = [
        "/bridge/device/+".to_string(),
        "/bridge/group/+".to_string(),
        topic::bridge_share_sync(local_broker_id),
        format!("/bridge/share/data/{local_broker_id}/+"),
    ];
    for filter in filters {
        if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
            warn!(peer = %peer_broker_id, filter, "bridge subscribe failed: {e}");
        }
    }
}
