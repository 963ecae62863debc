//! Routing engine behavior: admission checks, fan-out, federation hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mqmesh_broker::{ClientHandle, Engine, OutboundMessage, Principal, PublishError, PublishOutcome, PublishOrigin};
use mqmesh_core::message::{BridgeShareSyncMessage, DevicePublish, ForwardMessage};
use mqmesh_core::models::Device;
use mqmesh_core::{BridgeIdentity, DeviceCache, DeviceMode, PeerLink, SharePermission};
use mqmesh_storage::Database;

struct Harness {
    engine: Arc<Engine>,
    db: Database,
    cache: Arc<DeviceCache>,
}

const MAX_BYTES: usize = 256;

async fn harness(bridge_enabled: bool) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let cache = Arc::new(DeviceCache::new(
        Duration::from_millis(50),
        Duration::from_secs(60),
    ));
    let fanout = Arc::new(mqmesh_broker::Fanout::new());
    let identity = BridgeIdentity {
        broker_id: "b1".to_string(),
        token: "bridge-token".to_string(),
    };
    let engine = Arc::new(Engine::new(
        Arc::clone(&cache),
        db.clone(),
        fanout,
        &identity,
        bridge_enabled,
        MAX_BYTES,
    ));
    Harness { engine, db, cache }
}

impl Harness {
    /// Register a device with minted credentials and a seeded cache entry.
    async fn device(&self, uuid: &str) -> Device {
        let client_id = format!("cid-{uuid}");
        self.db
            .create_device(uuid, &format!("key-{uuid}"))
            .await
            .unwrap();
        let device = self
            .db
            .update_device_connection(&format!("key-{uuid}"), &client_id, "user", "pw")
            .await
            .unwrap();
        self.cache.set_device_by_client_id(&client_id, device.clone());
        device
    }

    fn subscriber(&self, client_id: &str, filter: &str) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(16);
        self.engine
            .fanout()
            .subscribe(filter, ClientHandle::new(client_id, tx));
        rx
    }

    fn join_cached_group(&self, device: &Device, group: &str) {
        let client_id = device.client_id.clone().unwrap();
        let mut groups: Vec<String> = self
            .cache
            .device_groups(&client_id)
            .into_iter()
            .collect();
        groups.push(group.to_string());
        self.cache.set_device_groups(&client_id, &groups);
    }
}

fn principal(device: &Device) -> Principal {
    Principal::Device {
        device: device.clone(),
    }
}

#[derive(Default)]
struct RecordingBridge {
    connected: AtomicBool,
    device_sends: Mutex<Vec<(String, String, String, Value)>>,
    group_sends: Mutex<Vec<(String, String, String, Value)>>,
}

#[async_trait]
impl PeerLink for RecordingBridge {
    async fn send_to_remote_device(
        &self,
        peer: &str,
        from: &str,
        target: &str,
        data: &Value,
    ) -> bool {
        self.device_sends.lock().push((
            peer.to_string(),
            from.to_string(),
            target.to_string(),
            data.clone(),
        ));
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_to_remote_group(
        &self,
        peer: &str,
        from: &str,
        group: &str,
        data: &Value,
    ) -> bool {
        self.group_sends.lock().push((
            peer.to_string(),
            from.to_string(),
            group.to_string(),
            data.clone(),
        ));
        self.connected.load(Ordering::SeqCst)
    }

    async fn broadcast_to_remote_groups(&self, from: &str, group: &str, data: &Value) {
        self.send_to_remote_group("*", from, group, data).await;
    }

    fn connected_peers(&self) -> Vec<String> {
        if self.connected.load(Ordering::SeqCst) {
            vec!["b2".to_string()]
        } else {
            Vec::new()
        }
    }
}

fn forward(msg: &OutboundMessage) -> ForwardMessage {
    serde_json::from_slice(&msg.payload).unwrap()
}

// ── admission ──

#[tokio::test]
async fn off_grammar_topics_close_the_session() {
    let h = harness(false).await;
    let a = h.device("a").await;
    for topic in ["/weird", "/device/cid-a/x", "/device/cid-a/s/extra", "state"] {
        let outcome = h
            .engine
            .handle_publish(&principal(&a), topic, b"{}")
            .await;
        assert_eq!(outcome, PublishOutcome::Close, "topic {topic}");
    }
}

#[tokio::test]
async fn publishing_for_another_device_closes() {
    let h = harness(false).await;
    let a = h.device("a").await;
    h.device("b").await;
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/device/cid-b/s", b"{}")
        .await;
    assert_eq!(outcome, PublishOutcome::Close);
}

#[tokio::test]
async fn subscribe_acl_is_self_restricted() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let p = principal(&a);
    let policy = h.engine.policy();

    assert!(policy.authorize_subscribe(&p, "/device/cid-a/r").await);
    assert!(!policy.authorize_subscribe(&p, "/device/cid-b/r").await);
    assert!(!policy.authorize_subscribe(&p, "/device/+/r").await);
    assert!(!policy.authorize_subscribe(&p, "/device/cid-a/s").await);
    assert!(!policy.authorize_subscribe(&p, "/bridge/device/cid-a").await);

    h.join_cached_group(&a, "g1");
    assert!(policy.authorize_subscribe(&p, "/group/g1/r").await);
    assert!(!policy.authorize_subscribe(&p, "/group/g2/r").await);
}

#[tokio::test]
async fn group_membership_falls_back_to_the_store() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let group = h.db.create_group("g1").await.unwrap();
    h.db.add_device_to_group(a.id, group.id).await.unwrap();

    // Nothing cached, so the policy has to hit the store.
    let p = principal(&a);
    assert!(h.engine.policy().authorize_publish(&p, "/group/g1/s").await);
    assert!(!h.engine.policy().authorize_publish(&p, "/group/g2/s").await);
}

#[tokio::test]
async fn second_rapid_publish_closes() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let p = principal(&a);
    let payload = br#"{"data":{}}"#;

    let first = h.engine.handle_publish(&p, "/device/cid-a/s", payload).await;
    assert_eq!(first, PublishOutcome::Continue);
    let second = h.engine.handle_publish(&p, "/device/cid-a/s", payload).await;
    assert_eq!(second, PublishOutcome::Close);

    // Past the window the gate opens again.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let third = h.engine.handle_publish(&p, "/device/cid-a/s", payload).await;
    assert_eq!(third, PublishOutcome::Continue);
}

#[tokio::test]
async fn oversize_publish_closes() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let big = vec![b'x'; MAX_BYTES + 1];
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/device/cid-a/s", &big)
        .await;
    assert_eq!(outcome, PublishOutcome::Close);
}

#[tokio::test]
async fn malformed_json_is_dropped_without_closing() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/device/cid-a/s", b"not json")
        .await;
    assert_eq!(outcome, PublishOutcome::Continue);
}

// ── local dispatch ──

#[tokio::test]
async fn device_to_device_over_mqtt() {
    let h = harness(false).await;
    let a = h.device("a").await;
    h.device("b").await;
    let mut rx = h.subscriber("cid-b", "/device/cid-b/r");

    let payload = serde_json::to_vec(&json!({"toDevice": "cid-b", "data": {"x": 1}})).unwrap();
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/device/cid-a/s", &payload)
        .await;
    assert_eq!(outcome, PublishOutcome::Continue);

    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.topic, "/device/cid-b/r");
    let fm = forward(&msg);
    assert_eq!(fm.from_device, "cid-a");
    assert_eq!(fm.data, json!({"x": 1}));
}

#[tokio::test]
async fn http_mode_target_is_spooled_not_pushed() {
    let h = harness(false).await;
    let a = h.device("a").await;
    h.device("b").await;
    h.cache.set_device_mode("cid-b", DeviceMode::Http);
    let mut rx = h.subscriber("cid-b", "/device/cid-b/r");

    h.engine
        .dispatch_device(&a, PublishOrigin::Mqtt, "cid-b", json!({"x": 2}))
        .await;

    assert!(rx.try_recv().is_err());
    let spooled = h.cache.take_pending_messages("cid-b");
    assert_eq!(spooled.len(), 1);
    assert_eq!(spooled[0].from_device, "cid-a");
}

#[tokio::test]
async fn group_fanout_spools_http_members_and_skips_sender() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let b = h.device("b").await;
    let c = h.device("c").await;
    for d in [&a, &b, &c] {
        h.join_cached_group(d, "g1");
    }
    h.cache.set_device_mode("cid-b", DeviceMode::Http);
    h.cache.set_device_mode("cid-a", DeviceMode::Http);
    let mut rx = h.subscriber("cid-c", "/group/g1/r");

    let payload = serde_json::to_vec(&json!({"toGroup": "g1", "data": 5})).unwrap();
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/group/g1/s", &payload)
        .await;
    assert_eq!(outcome, PublishOutcome::Continue);

    // MQTT members get the downlink publish.
    let fm = forward(&rx.recv().await.unwrap());
    assert_eq!(fm.from_group.as_deref(), Some("g1"));
    assert_eq!(fm.from_device, "cid-a");

    // HTTP member b is spooled; the sender is not, despite being http-mode.
    assert_eq!(h.cache.take_pending_messages("cid-b").len(), 1);
    assert!(h.cache.take_pending_messages("cid-a").is_empty());
}

#[tokio::test]
async fn group_dispatch_requires_cached_membership() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let b = h.device("b").await;
    h.join_cached_group(&b, "g1");
    let mut rx = h.subscriber("cid-b", "/group/g1/r");

    // ACL would stop an MQTT publish; the dispatcher itself also drops.
    h.engine
        .dispatch_group(a.client_id.as_deref().unwrap(), "g1", json!(1))
        .await;
    assert!(rx.try_recv().is_err());
}

// ── federation ──

#[tokio::test]
async fn remote_device_target_goes_through_the_bridge() {
    let h = harness(true).await;
    let a = h.device("a").await;
    let bridge = Arc::new(RecordingBridge::default());
    bridge.connected.store(true, Ordering::SeqCst);
    h.engine.set_bridge(bridge.clone());

    h.engine
        .dispatch_device(&a, PublishOrigin::Mqtt, "b2:cid-x", json!({"v": 9}))
        .await;

    let sends = bridge.device_sends.lock();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0], ("b2".into(), "cid-a".into(), "cid-x".into(), json!({"v": 9})));
}

#[tokio::test]
async fn disconnected_peer_drops_silently() {
    let h = harness(true).await;
    let a = h.device("a").await;
    let bridge = Arc::new(RecordingBridge::default());
    h.engine.set_bridge(bridge.clone());

    // No panic, no local delivery, just a drop.
    h.engine
        .dispatch_device(&a, PublishOrigin::Mqtt, "b2:cid-x", json!(1))
        .await;
    assert_eq!(bridge.device_sends.lock().len(), 1);
}

#[tokio::test]
async fn group_dispatch_broadcasts_to_peers() {
    let h = harness(true).await;
    let a = h.device("a").await;
    h.join_cached_group(&a, "g1");
    let bridge = Arc::new(RecordingBridge::default());
    bridge.connected.store(true, Ordering::SeqCst);
    h.engine.set_bridge(bridge.clone());

    h.engine.dispatch_group("cid-a", "g1", json!(3)).await;

    let sends = bridge.group_sends.lock();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, "*");
    assert_eq!(sends[0].2, "g1");
}

#[tokio::test]
async fn share_acl_gates_remote_delivery() {
    let h = harness(true).await;
    let target = h.device("y").await;
    let mut rx = h.subscriber("cid-y", "/device/cid-y/r");

    // Zero rows for the peer: open policy, delivery succeeds.
    h.engine
        .deliver_from_remote("b2", "cid-origin", "cid-y", json!(1))
        .await;
    let fm = forward(&rx.recv().await.unwrap());
    assert_eq!(fm.from_device, "b2:cid-origin");

    // A read-only row forbids writes to the target.
    h.db.add_shared_device("b2", target.id, SharePermission::Read)
        .await
        .unwrap();
    h.engine
        .deliver_from_remote("b2", "cid-origin", "cid-y", json!(2))
        .await;
    assert!(rx.try_recv().is_err());

    // readwrite allows again.
    h.db.add_shared_device("b2", target.id, SharePermission::ReadWrite)
        .await
        .unwrap();
    h.engine
        .deliver_from_remote("b2", "cid-origin", "cid-y", json!(3))
        .await;
    assert_eq!(forward(&rx.recv().await.unwrap()).data, json!(3));

    // Rows present but none for this target: deny.
    let other = h.device("z").await;
    let mut other_rx = h.subscriber("cid-z", "/device/cid-z/r");
    h.engine
        .deliver_from_remote("b2", "cid-origin", "cid-z", json!(4))
        .await;
    assert!(other_rx.try_recv().is_err());
    drop(other);
}

#[tokio::test]
async fn remote_group_delivery_reaches_mqtt_and_http_members() {
    let h = harness(true).await;
    let a = h.device("a").await;
    let b = h.device("b").await;
    h.join_cached_group(&a, "g1");
    h.join_cached_group(&b, "g1");
    h.cache.set_device_mode("cid-b", DeviceMode::Http);
    let mut rx = h.subscriber("cid-a", "/group/g1/r");

    h.engine
        .deliver_group_from_remote("b2", "cid-origin", "g1", json!({"k": 1}))
        .await;

    let fm = forward(&rx.recv().await.unwrap());
    assert_eq!(fm.from_device, "b2:cid-origin");
    assert_eq!(fm.from_group.as_deref(), Some("g1"));

    let spooled = h.cache.take_pending_messages("cid-b");
    assert_eq!(spooled.len(), 1);
    assert_eq!(spooled[0].from_device, "b2:cid-origin");
}

#[tokio::test]
async fn share_data_is_pushed_once_per_sharing_peer() {
    let h = harness(true).await;
    let a = h.device("a").await;
    h.db.add_shared_device("b2", a.id, SharePermission::Read)
        .await
        .unwrap();
    h.db.add_shared_device("b3", a.id, SharePermission::ReadWrite)
        .await
        .unwrap();

    let mut b2_rx = h.subscriber("__bridge_b2", "/bridge/share/data/b2/+");
    let mut b3_rx = h.subscriber("__bridge_b3", "/bridge/share/data/b3/+");

    h.engine
        .dispatch_device(&a, PublishOrigin::Mqtt, "cid-a", json!({"t": 20}))
        .await;

    let msg = b2_rx.recv().await.unwrap();
    assert_eq!(msg.topic, "/bridge/share/data/b2/cid-a");
    let push: mqmesh_core::message::BridgeShareDataMessage =
        serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(push.from_broker, "b1");
    assert_eq!(push.device_uuid, "a");
    assert!(b3_rx.recv().await.is_some());
}

#[tokio::test]
async fn bridge_subscribe_triggers_share_sync() {
    let h = harness(true).await;
    let shared = h.device("y").await;
    h.db.add_shared_device("b2", shared.id, SharePermission::ReadWrite)
        .await
        .unwrap();

    let mut rx = h.subscriber("__bridge_b2", "/bridge/share/sync/b2");
    let peer = Principal::Bridge {
        peer_id: "b2".to_string(),
    };
    h.engine
        .handle_subscribed(&peer, &["/bridge/share/sync/b2".to_string()])
        .await;

    let msg = rx.recv().await.unwrap();
    let sync: BridgeShareSyncMessage = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(sync.from_broker, "b1");
    assert_eq!(sync.devices.len(), 1);
    assert_eq!(sync.devices[0].uuid, "y");
    assert_eq!(sync.devices[0].permissions, "readwrite");
}

#[tokio::test]
async fn bridge_inbound_is_classified_by_topic() {
    let h = harness(true).await;
    h.device("b").await;
    let mut rx = h.subscriber("cid-b", "/device/cid-b/r");

    let peer = Principal::Bridge {
        peer_id: "b2".to_string(),
    };
    let payload = serde_json::to_vec(&json!({
        "fromBroker": "b2",
        "fromDevice": "cid-origin",
        "toDevice": "cid-b",
        "data": {"v": 9}
    }))
    .unwrap();
    let outcome = h
        .engine
        .handle_publish(&peer, "/bridge/device/cid-b", &payload)
        .await;
    assert_eq!(outcome, PublishOutcome::Continue);

    let fm = forward(&rx.recv().await.unwrap());
    assert_eq!(fm.from_device, "b2:cid-origin");
    assert_eq!(fm.data, json!({"v": 9}));
}

// ── timeseries tap ──

#[tokio::test]
async fn ts_publish_records_numeric_entries() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let payload = serde_json::to_vec(&json!({
        "toDevice": "cid-a",
        "ts": true,
        "data": {"temp": 21.5, "hum": "55", "label": "kitchen"}
    }))
    .unwrap();
    let outcome = h
        .engine
        .handle_publish(&principal(&a), "/device/cid-a/s", &payload)
        .await;
    assert_eq!(outcome, PublishOutcome::Continue);

    let page = h
        .db
        .query_timeseries("a", None, None, None, 1, 10)
        .await
        .unwrap();
    // "label" is not numeric and is skipped.
    assert_eq!(page.total, 2);
}

// ── HTTP publish path ──

#[tokio::test]
async fn http_publish_maps_violations_to_errors() {
    let h = harness(false).await;
    let a = h.device("a").await;

    let oversize = DevicePublish {
        to_device: Some("cid-a".into()),
        data: json!("y".repeat(MAX_BYTES)),
        ..Default::default()
    };
    assert_eq!(
        h.engine.http_publish(&a, oversize).await,
        Err(PublishError::TooLarge)
    );

    let ok = DevicePublish {
        to_device: Some("cid-a".into()),
        data: json!(1),
        ..Default::default()
    };
    assert_eq!(h.engine.http_publish(&a, ok.clone()).await, Ok(()));
    assert_eq!(
        h.engine.http_publish(&a, ok).await,
        Err(PublishError::RateLimited)
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    let foreign_group = DevicePublish {
        to_group: Some("not-mine".into()),
        data: json!(1),
        ..Default::default()
    };
    assert_eq!(
        h.engine.http_publish(&a, foreign_group).await,
        Err(PublishError::ForbiddenGroup)
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    let no_target = DevicePublish {
        data: json!(1),
        ..Default::default()
    };
    assert_eq!(
        h.engine.http_publish(&a, no_target).await,
        Err(PublishError::MissingTarget)
    );
}

#[tokio::test]
async fn http_publish_does_not_reinject_mqtt() {
    let h = harness(false).await;
    let a = h.device("a").await;
    h.device("b").await;
    let mut rx = h.subscriber("cid-b", "/device/cid-b/r");

    let request = DevicePublish {
        to_device: Some("cid-b".into()),
        data: json!({"x": 1}),
        ..Default::default()
    };
    assert_eq!(h.engine.http_publish(&a, request).await, Ok(()));

    // The MQTT-mode target gets nothing: HTTP publishes are not re-injected
    // on the MQTT path.
    assert!(rx.try_recv().is_err());

    // An HTTP-mode target is spooled as usual.
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.cache.set_device_mode("cid-b", DeviceMode::Http);
    let request = DevicePublish {
        to_device: Some("cid-b".into()),
        data: json!({"x": 2}),
        ..Default::default()
    };
    assert_eq!(h.engine.http_publish(&a, request).await, Ok(()));
    assert_eq!(h.cache.take_pending_messages("cid-b").len(), 1);
}

// ── authentication ──

#[tokio::test]
async fn device_authentication() {
    let h = harness(false).await;
    h.device("a").await;
    let policy = h.engine.policy();

    assert!(policy.authenticate("cid-a", "user", "pw").await.is_some());
    assert!(policy.authenticate("cid-a", "user", "wrong").await.is_none());
    assert!(policy.authenticate("cid-a", "other", "pw").await.is_none());
    assert!(policy.authenticate("cid-unknown", "user", "pw").await.is_none());
}

#[tokio::test]
async fn auth_seeds_cache_groups() {
    let h = harness(false).await;
    let a = h.device("a").await;
    let group = h.db.create_group("g1").await.unwrap();
    h.db.add_device_to_group(a.id, group.id).await.unwrap();

    h.engine
        .policy()
        .authenticate("cid-a", "user", "pw")
        .await
        .unwrap();
    assert!(h.cache.is_in_group("cid-a", "g1"));
    assert!(h.cache.group_members("g1").contains("cid-a"));
}

#[tokio::test]
async fn bridge_authentication_requires_federation_and_token() {
    let enabled = harness(true).await;
    let policy = enabled.engine.policy();
    let ok = policy
        .authenticate("__bridge_b2", "__bridge_", "bridge-token")
        .await;
    assert!(matches!(ok, Some(Principal::Bridge { peer_id }) if peer_id == "b2"));
    assert!(policy
        .authenticate("__bridge_b2", "__bridge_", "wrong")
        .await
        .is_none());
    assert!(policy
        .authenticate("__bridge_b2", "user", "bridge-token")
        .await
        .is_none());

    let disabled = harness(false).await;
    assert!(disabled
        .engine
        .policy()
        .authenticate("__bridge_b2", "__bridge_", "bridge-token")
        .await
        .is_none());
}
