//! The message routing engine.
//!
//! One publish enters, passes size/rate/ACL admission, and fans out to
//! local MQTT subscribers, HTTP spools, federated peers, and the
//! timeseries store. The engine owns every routing decision; sessions and
//! the HTTP adapter only feed it.

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, warn};

use mqmesh_core::message::{
    BridgeGroupMessage, BridgeMessage, BridgeShareDataMessage, BridgeShareSyncMessage,
    DevicePublish, ForwardMessage, SharedDeviceEntry,
};
use mqmesh_core::models::Device;
use mqmesh_core::{
    now_ms, topic, Address, BridgeIdentity, DeviceCache, DeviceMode, PeerLink, SessionHandle,
    Topic,
};
use mqmesh_storage::Database;

use crate::fanout::Fanout;
use crate::policy::{Principal, SessionPolicy};

/// What the session loop should do after a publish was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Continue,
    /// A protocol violation: the publish was rejected and the session must
    /// be closed.
    Close,
}

/// Where a publish entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOrigin {
    Mqtt,
    Http,
}

/// Rejections surfaced to the HTTP publish endpoint.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("message too large")]
    TooLarge,
    #[error("publish rate exceeded")]
    RateLimited,
    #[error("sender is not a member of the group")]
    ForbiddenGroup,
    #[error("no toDevice or toGroup target")]
    MissingTarget,
}

/// The routing engine. Constructed once and shared.
pub struct Engine {
    cache: Arc<DeviceCache>,
    db: Database,
    fanout: Arc<Fanout>,
    policy: SessionPolicy,
    bridge: OnceLock<Arc<dyn PeerLink>>,
    broker_id: String,
    bridge_enabled: bool,
    max_message_bytes: usize,
}

impl Engine {
    pub fn new(
        cache: Arc<DeviceCache>,
        db: Database,
        fanout: Arc<Fanout>,
        identity: &BridgeIdentity,
        bridge_enabled: bool,
        max_message_bytes: usize,
    ) -> Self {
        let policy = SessionPolicy::new(
            Arc::clone(&cache),
            db.clone(),
            bridge_enabled,
            identity.token.clone(),
        );
        Self {
            cache,
            db,
            fanout,
            policy,
            bridge: OnceLock::new(),
            broker_id: identity.broker_id.clone(),
            bridge_enabled,
            max_message_bytes,
        }
    }

    /// Late-bind the bridge once it exists. Without a bridge, remote
    /// targets are dropped.
    pub fn set_bridge(&self, bridge: Arc<dyn PeerLink>) {
        let _ = self.bridge.set(bridge);
    }

    fn bridge(&self) -> Option<&Arc<dyn PeerLink>> {
        self.bridge.get()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    // ── session lifecycle ──

    pub async fn handle_connected(
        &self,
        client_id: &str,
        principal: &Principal,
        handle: SessionHandle,
    ) {
        self.cache.set_client_online(client_id, handle);
        if let Principal::Device { device } = principal {
            if let Err(e) = self
                .db
                .update_device_online_status(device.id, true, DeviceMode::Mqtt)
                .await
            {
                warn!(client_id, "online status update failed: {e}");
            }
        }
    }

    pub async fn handle_disconnected(
        &self,
        client_id: &str,
        principal: &Principal,
        handle: &SessionHandle,
    ) {
        self.cache.set_client_offline(client_id, handle);
        if let Principal::Device { device } = principal {
            if let Err(e) = self.db.mark_device_offline(device.id).await {
                warn!(client_id, "offline status update failed: {e}");
            }
        }
    }

    /// Hook run after a session's subscriptions were accepted. A bridge
    /// client subscribing to its share-sync topic triggers the share-list
    /// push toward that peer.
    pub async fn handle_subscribed(&self, principal: &Principal, filters: &[String]) {
        if !principal.is_bridge() {
            return;
        }
        for filter in filters {
            if let Some(Topic::BridgeShareSync(peer_broker_id)) = Topic::parse(filter) {
                self.push_share_sync(&peer_broker_id).await;
            }
        }
    }

    // ── publish pipeline ──

    /// Handle a PUBLISH arriving over MQTT.
    pub async fn handle_publish(
        &self,
        principal: &Principal,
        topic_str: &str,
        payload: &[u8],
    ) -> PublishOutcome {
        match principal {
            Principal::Device { device } => {
                self.handle_device_publish(principal, device, topic_str, payload)
                    .await
            }
            Principal::Bridge { peer_id } => {
                self.handle_bridge_publish(peer_id, topic_str, payload).await
            }
        }
    }

    async fn handle_device_publish(
        &self,
        principal: &Principal,
        device: &Device,
        topic_str: &str,
        payload: &[u8],
    ) -> PublishOutcome {
        let client_id = device.client_id.clone().unwrap_or_default();

        if payload.len() > self.max_message_bytes {
            warn!(client_id, len = payload.len(), "oversize publish, closing session");
            return PublishOutcome::Close;
        }
        if !self.cache.check_publish_rate(&client_id) {
            warn!(client_id, "publish rate exceeded, closing session");
            return PublishOutcome::Close;
        }
        if !self.policy.authorize_publish(principal, topic_str).await {
            warn!(client_id, topic = topic_str, "publish ACL violation, closing session");
            return PublishOutcome::Close;
        }

        match Topic::parse(topic_str) {
            Some(Topic::DeviceSend(_)) => {
                let Some(message) = parse_publish(&client_id, payload) else {
                    return PublishOutcome::Continue;
                };
                if message.ts == Some(true) {
                    self.record_timeseries(device, &message.data).await;
                }
                if let Some(target) = &message.to_device {
                    self.dispatch_device(device, PublishOrigin::Mqtt, target, message.data)
                        .await;
                } else if let Some(group) = &message.to_group {
                    self.dispatch_group(&client_id, group, message.data).await;
                } else {
                    debug!(client_id, "publish has no target, dropping");
                }
            }
            Some(Topic::GroupSend(_)) => {
                let Some(message) = parse_publish(&client_id, payload) else {
                    return PublishOutcome::Continue;
                };
                // The payload's toGroup is authoritative; the topic segment
                // is informational only.
                match &message.to_group {
                    Some(group) => self.dispatch_group(&client_id, group, message.data).await,
                    None => debug!(client_id, "group publish without toGroup, dropping"),
                }
            }
            Some(Topic::GroupRecv(name)) => {
                // Members may relay directly onto the group downlink.
                self.fanout
                    .route(&topic::group_recv(&name), payload.to_vec().into())
                    .await;
            }
            _ => {
                // ACL admitted it, so this arm is unreachable for devices.
                debug!(client_id, topic = topic_str, "unhandled topic");
            }
        }
        PublishOutcome::Continue
    }

    async fn handle_bridge_publish(
        &self,
        peer_id: &str,
        topic_str: &str,
        payload: &[u8],
    ) -> PublishOutcome {
        match Topic::parse(topic_str) {
            Some(Topic::BridgeDevice(target)) => {
                match serde_json::from_slice::<BridgeMessage>(payload) {
                    Ok(msg) => {
                        self.deliver_from_remote(&msg.from_broker, &msg.from_device, &target, msg.data)
                            .await;
                    }
                    Err(e) => debug!(peer_id, "malformed bridge message: {e}"),
                }
            }
            Some(Topic::BridgeGroup(group)) => {
                match serde_json::from_slice::<BridgeGroupMessage>(payload) {
                    Ok(msg) => {
                        self.deliver_group_from_remote(
                            &msg.from_broker,
                            &msg.from_device,
                            &group,
                            msg.data,
                        )
                        .await;
                    }
                    Err(e) => debug!(peer_id, "malformed bridge group message: {e}"),
                }
            }
            Some(parsed) if parsed.is_bridge() => {
                // Share sync/data published by a peer relay straight to
                // whoever subscribed.
                self.fanout.route(topic_str, payload.to_vec().into()).await;
            }
            _ => {
                warn!(peer_id, topic = topic_str, "bridge publish outside /bridge, dropping");
            }
        }
        PublishOutcome::Continue
    }

    /// The publish pipeline on behalf of an HTTP-authenticated device.
    /// Same admission rules as MQTT; violations surface as errors instead
    /// of closing a session.
    pub async fn http_publish(
        &self,
        device: &Device,
        request: DevicePublish,
    ) -> Result<(), PublishError> {
        let client_id = device.client_id.clone().unwrap_or_default();

        let encoded_len = serde_json::to_vec(&request).map(|v| v.len()).unwrap_or(0);
        if encoded_len > self.max_message_bytes {
            return Err(PublishError::TooLarge);
        }
        if !self.cache.check_publish_rate(&client_id) {
            return Err(PublishError::RateLimited);
        }

        if request.ts == Some(true) {
            self.record_timeseries(device, &request.data).await;
        }

        if let Some(target) = &request.to_device {
            self.dispatch_device(device, PublishOrigin::Http, target, request.data)
                .await;
            return Ok(());
        }
        if let Some(group) = &request.to_group {
            if let Some(Address::Local(name)) = Address::parse(group) {
                let member = self.cache.is_in_group(&client_id, &name)
                    || self
                        .db
                        .is_device_in_group(device.id, &name)
                        .await
                        .unwrap_or(false);
                if !member {
                    return Err(PublishError::ForbiddenGroup);
                }
            }
            self.dispatch_group(&client_id, group, request.data).await;
            return Ok(());
        }
        Err(PublishError::MissingTarget)
    }

    // ── dispatch ──

    /// Route a message from a local sender to one device, local or remote.
    pub async fn dispatch_device(
        &self,
        sender: &Device,
        origin: PublishOrigin,
        target: &str,
        data: serde_json::Value,
    ) {
        let sender_cid = sender.client_id.clone().unwrap_or_default();

        if self.bridge_enabled {
            self.push_share_data_if_needed(sender, &data).await;
        }

        match Address::parse(target) {
            None => {
                warn!(target, "invalid device address, dropping");
            }
            Some(Address::Remote { broker_id, local }) => match self.bridge() {
                Some(bridge) => {
                    let sent = bridge
                        .send_to_remote_device(&broker_id, &sender_cid, &local, &data)
                        .await;
                    if !sent {
                        debug!(peer = %broker_id, target = %local, "peer not connected, dropping");
                    }
                }
                None => debug!(peer = %broker_id, "federation disabled, dropping remote publish"),
            },
            Some(Address::Local(target_cid)) => {
                let message = ForwardMessage::direct(sender_cid, data);
                if self.cache.is_http_mode(&target_cid) {
                    self.cache.add_pending_message(&target_cid, message);
                } else if origin == PublishOrigin::Http {
                    // HTTP-origin messages are not re-injected onto the
                    // MQTT path; see the API docs.
                    debug!(target = %target_cid, "http publish to mqtt-mode target, dropping");
                } else {
                    self.emit_forward(&topic::device_recv(&target_cid), &message)
                        .await;
                }
            }
        }
    }

    /// Route a message from a local sender to a group, local or remote.
    pub async fn dispatch_group(&self, sender_cid: &str, group: &str, data: serde_json::Value) {
        match Address::parse(group) {
            None => {
                warn!(group, "invalid group address, dropping");
            }
            Some(Address::Remote { broker_id, local }) => match self.bridge() {
                Some(bridge) => {
                    let sent = bridge
                        .send_to_remote_group(&broker_id, sender_cid, &local, &data)
                        .await;
                    if !sent {
                        debug!(peer = %broker_id, group = %local, "peer not connected, dropping");
                    }
                }
                None => debug!(peer = %broker_id, "federation disabled, dropping remote publish"),
            },
            Some(Address::Local(name)) => {
                if !self.cache.is_in_group(sender_cid, &name) {
                    warn!(sender_cid, group = %name, "sender not in group, dropping");
                    return;
                }
                let message = ForwardMessage::group(sender_cid, &name, data.clone());
                for member in self.cache.group_members(&name) {
                    if member != sender_cid && self.cache.is_http_mode(&member) {
                        self.cache.add_pending_message(&member, message.clone());
                    }
                }
                self.emit_forward(&topic::group_recv(&name), &message).await;

                if self.bridge_enabled {
                    if let Some(bridge) = self.bridge() {
                        bridge
                            .broadcast_to_remote_groups(sender_cid, &name, &data)
                            .await;
                    }
                }
            }
        }
    }

    /// Deliver a cross-broker device message that arrived on `/bridge/device/+`.
    pub async fn deliver_from_remote(
        &self,
        from_broker: &str,
        from_device: &str,
        target_cid: &str,
        data: serde_json::Value,
    ) {
        let target = match self.cache.device_by_client_id(target_cid) {
            Some(device) => device,
            None => match self.db.get_device_by_client_id(target_cid).await {
                Ok(Some(device)) => device,
                Ok(None) => {
                    debug!(target_cid, "remote delivery to unknown device, dropping");
                    return;
                }
                Err(e) => {
                    warn!(target_cid, "device lookup failed: {e}");
                    return;
                }
            },
        };

        match self.db.check_bridge_device_access(target.id, from_broker).await {
            Ok(access) if access.allows_write() => {}
            Ok(_) => {
                debug!(from_broker, target_cid, "share ACL denied write, dropping");
                return;
            }
            Err(e) => {
                warn!(from_broker, target_cid, "share ACL lookup failed: {e}");
                return;
            }
        }

        let message =
            ForwardMessage::direct(Address::remote_sender(from_broker, from_device), data);
        if self.cache.is_http_mode(target_cid) {
            self.cache.add_pending_message(target_cid, message);
        } else {
            self.emit_forward(&topic::device_recv(target_cid), &message)
                .await;
        }
    }

    /// Deliver a cross-broker group message that arrived on `/bridge/group/+`.
    pub async fn deliver_group_from_remote(
        &self,
        from_broker: &str,
        from_device: &str,
        group: &str,
        data: serde_json::Value,
    ) {
        let message = ForwardMessage::group(
            Address::remote_sender(from_broker, from_device),
            group,
            data,
        );
        for member in self.cache.group_members(group) {
            if self.cache.is_http_mode(&member) {
                self.cache.add_pending_message(&member, message.clone());
            }
        }
        self.emit_forward(&topic::group_recv(group), &message).await;
    }

    // ── federation plumbing ──

    /// Publish the latest data of a shared device toward every peer that
    /// lists it, on that peer's share-data topic.
    async fn push_share_data_if_needed(&self, sender: &Device, data: &serde_json::Value) {
        let peers = match self.db.get_sharing_peers_for_device(sender.id).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(uuid = %sender.uuid, "share lookup failed: {e}");
                return;
            }
        };
        if peers.is_empty() {
            return;
        }

        let client_id = sender.client_id.clone().unwrap_or_default();
        for peer in peers {
            let message = BridgeShareDataMessage {
                from_broker: self.broker_id.clone(),
                from_device: client_id.clone(),
                device_uuid: sender.uuid.clone(),
                data: data.clone(),
            };
            match serde_json::to_vec(&message) {
                Ok(payload) => {
                    self.fanout
                        .route(&topic::bridge_share_data(&peer, &client_id), payload.into())
                        .await;
                }
                Err(e) => warn!("share data encode failed: {e}"),
            }
        }
    }

    /// Publish the full share list for one peer on its sync topic.
    pub async fn push_share_sync(&self, peer_broker_id: &str) {
        let shares = match self.db.get_shared_devices_for_broker(peer_broker_id).await {
            Ok(shares) => shares,
            Err(e) => {
                warn!(peer_broker_id, "share list load failed: {e}");
                return;
            }
        };

        let message = BridgeShareSyncMessage {
            from_broker: self.broker_id.clone(),
            devices: shares
                .into_iter()
                .map(|(device, permission)| SharedDeviceEntry {
                    uuid: device.uuid,
                    client_id: device.client_id,
                    permissions: permission.as_str().to_string(),
                })
                .collect(),
        };
        match serde_json::to_vec(&message) {
            Ok(payload) => {
                debug!(peer_broker_id, count = message.devices.len(), "pushing share sync");
                self.fanout
                    .route(&topic::bridge_share_sync(peer_broker_id), payload.into())
                    .await;
            }
            Err(e) => warn!("share sync encode failed: {e}"),
        }
    }

    // ── helpers ──

    async fn emit_forward(&self, topic: &str, message: &ForwardMessage) {
        match serde_json::to_vec(message) {
            Ok(payload) => self.fanout.route(topic, payload.into()).await,
            Err(e) => warn!(topic, "forward encode failed: {e}"),
        }
    }

    /// Record numeric entries of a `ts` publish into the timeseries store.
    async fn record_timeseries(&self, device: &Device, data: &serde_json::Value) {
        let Some(map) = data.as_object() else {
            debug!(uuid = %device.uuid, "ts payload data is not an object, skipping");
            return;
        };
        let now = now_ms();
        for (key, value) in map {
            let Some(number) = coerce_number(value) else {
                continue;
            };
            if let Err(e) = self
                .db
                .insert_timeseries_point(&device.uuid, key, number, now)
                .await
            {
                warn!(uuid = %device.uuid, key, "timeseries insert failed: {e}");
            }
        }
    }
}

fn parse_publish(client_id: &str, payload: &[u8]) -> Option<DevicePublish> {
    match serde_json::from_slice(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(client_id, "malformed publish payload, dropping: {e}");
            None
        }
    }
}

/// Values that coerce to a finite number: JSON numbers and numeric strings.
fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}
