//! In-memory device cache.
//!
//! The cache is the volatile projection of the identity store plus all the
//! per-connection state the routing engine needs on the hot path: device
//! snapshots by client id and auth key, live session handles, device modes,
//! group membership in both directions, publish rate accounting, HTTP
//! activity, pending message spools for HTTP-mode devices, and the share
//! lists peers have synced to us.
//!
//! Every map takes its own `parking_lot::RwLock`; operations never suspend
//! and bulk mutations (group rebuilds, spool drains) hold the write guard
//! for their full extent so readers never observe a half-applied change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::message::ForwardMessage;
use crate::models::{Device, DeviceMode, RemoteSharedDevice};

/// Default cap on spooled messages per client; oldest entries are dropped
/// beyond it.
pub const DEFAULT_PENDING_CAP: usize = 1000;

/// Control commands deliverable to a live MQTT session task.
#[derive(Debug)]
pub enum SessionControl {
    Close,
}

/// Handle to a live MQTT session, able to force it closed.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    ctl: mpsc::Sender<SessionControl>,
}

impl SessionHandle {
    /// Create a handle plus the receiver its session loop selects on.
    pub fn new() -> (Self, mpsc::Receiver<SessionControl>) {
        let (ctl, rx) = mpsc::channel(1);
        (Self { ctl }, rx)
    }

    /// Request the session to close. Idempotent and non-blocking.
    pub fn close(&self) {
        let _ = self.ctl.try_send(SessionControl::Close);
    }

    /// Whether two handles refer to the same session instance.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.ctl.same_channel(&other.ctl)
    }
}

struct PendingEntry {
    message: ForwardMessage,
    enqueued_at: Instant,
}

/// The process-local device cache. See the module docs.
pub struct DeviceCache {
    by_client_id: RwLock<HashMap<String, Device>>,
    by_auth_key: RwLock<HashMap<String, Device>>,
    online: RwLock<HashMap<String, SessionHandle>>,
    mode: RwLock<HashMap<String, DeviceMode>>,
    device_groups: RwLock<HashMap<String, HashSet<String>>>,
    group_members: RwLock<HashMap<String, HashSet<String>>>,
    last_publish: RwLock<HashMap<String, Instant>>,
    http_last_active: RwLock<HashMap<String, Instant>>,
    pending: RwLock<HashMap<String, VecDeque<PendingEntry>>>,
    remote_shared: RwLock<HashMap<String, Vec<RemoteSharedDevice>>>,
    publish_rate_limit: Duration,
    expire_time: Duration,
    pending_cap: usize,
}

impl DeviceCache {
    pub fn new(publish_rate_limit: Duration, expire_time: Duration) -> Self {
        Self {
            by_client_id: RwLock::new(HashMap::new()),
            by_auth_key: RwLock::new(HashMap::new()),
            online: RwLock::new(HashMap::new()),
            mode: RwLock::new(HashMap::new()),
            device_groups: RwLock::new(HashMap::new()),
            group_members: RwLock::new(HashMap::new()),
            last_publish: RwLock::new(HashMap::new()),
            http_last_active: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            remote_shared: RwLock::new(HashMap::new()),
            publish_rate_limit,
            expire_time,
            pending_cap: DEFAULT_PENDING_CAP,
        }
    }

    /// Override the per-client spool cap.
    pub fn with_pending_cap(mut self, cap: usize) -> Self {
        self.pending_cap = cap;
        self
    }

    // ── device snapshots ──

    pub fn set_device_by_client_id(&self, client_id: &str, device: Device) {
        self.by_client_id
            .write()
            .insert(client_id.to_string(), device);
    }

    pub fn set_device_by_auth_key(&self, auth_key: &str, device: Device) {
        self.by_auth_key.write().insert(auth_key.to_string(), device);
    }

    pub fn device_by_client_id(&self, client_id: &str) -> Option<Device> {
        self.by_client_id.read().get(client_id).cloned()
    }

    pub fn device_by_auth_key(&self, auth_key: &str) -> Option<Device> {
        self.by_auth_key.read().get(auth_key).cloned()
    }

    /// Drop every cache entry belonging to one device identity.
    pub fn remove_device(&self, client_id: &str, auth_key: &str) {
        self.by_client_id.write().remove(client_id);
        self.by_auth_key.write().remove(auth_key);
        self.online.write().remove(client_id);
        self.mode.write().remove(client_id);
        self.last_publish.write().remove(client_id);
        self.http_last_active.write().remove(client_id);
        self.pending.write().remove(client_id);

        let removed = self.device_groups.write().remove(client_id);
        if let Some(groups) = removed {
            let mut members = self.group_members.write();
            for group in groups {
                if let Some(set) = members.get_mut(&group) {
                    set.remove(client_id);
                    if set.is_empty() {
                        members.remove(&group);
                    }
                }
            }
        }
    }

    // ── sessions ──

    pub fn set_client_online(&self, client_id: &str, handle: SessionHandle) {
        self.online.write().insert(client_id.to_string(), handle);
    }

    /// Remove the online entry, but only when it still belongs to the given
    /// session. A newer session that reused the client id stays registered.
    pub fn set_client_offline(&self, client_id: &str, handle: &SessionHandle) {
        let mut online = self.online.write();
        if let Some(current) = online.get(client_id) {
            if current.same_session(handle) {
                online.remove(client_id);
            }
        }
    }

    /// Take the online handle for a client, if any.
    pub fn take_online(&self, client_id: &str) -> Option<SessionHandle> {
        self.online.write().remove(client_id)
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.online.read().contains_key(client_id)
    }

    // ── modes ──

    pub fn set_device_mode(&self, client_id: &str, mode: DeviceMode) {
        self.mode.write().insert(client_id.to_string(), mode);
    }

    /// Unknown clients default to MQTT mode.
    pub fn is_http_mode(&self, client_id: &str) -> bool {
        matches!(self.mode.read().get(client_id), Some(DeviceMode::Http))
    }

    // ── groups ──

    /// Replace a client's group set, keeping the reverse index in lockstep.
    pub fn set_device_groups(&self, client_id: &str, groups: &[String]) {
        let new: HashSet<String> = groups.iter().cloned().collect();

        let mut forward = self.device_groups.write();
        let mut members = self.group_members.write();

        if let Some(old) = forward.get(client_id) {
            for group in old.difference(&new) {
                if let Some(set) = members.get_mut(group) {
                    set.remove(client_id);
                    if set.is_empty() {
                        members.remove(group);
                    }
                }
            }
        }
        for group in &new {
            members
                .entry(group.clone())
                .or_default()
                .insert(client_id.to_string());
        }
        forward.insert(client_id.to_string(), new);
    }

    pub fn device_groups(&self, client_id: &str) -> HashSet<String> {
        self.device_groups
            .read()
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_members(&self, group: &str) -> HashSet<String> {
        self.group_members
            .read()
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_in_group(&self, client_id: &str, group: &str) -> bool {
        self.device_groups
            .read()
            .get(client_id)
            .is_some_and(|set| set.contains(group))
    }

    // ── rate accounting ──

    /// Admit a publish iff the last admitted one is at least the rate-limit
    /// interval in the past; admission stamps the new time.
    pub fn check_publish_rate(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_publish.write();
        match last.get(client_id) {
            Some(prev) if now.duration_since(*prev) < self.publish_rate_limit => false,
            _ => {
                last.insert(client_id.to_string(), now);
                true
            }
        }
    }

    // ── HTTP activity ──

    pub fn set_http_last_active(&self, client_id: &str) {
        self.http_last_active
            .write()
            .insert(client_id.to_string(), Instant::now());
    }

    // ── pending spool ──

    /// Append a message to a client's spool, dropping the oldest entry when
    /// the cap is reached.
    pub fn add_pending_message(&self, client_id: &str, message: ForwardMessage) {
        let mut pending = self.pending.write();
        let queue = pending.entry(client_id.to_string()).or_default();
        if queue.len() >= self.pending_cap {
            queue.pop_front();
            tracing::warn!(client_id, "pending spool full, dropping oldest message");
        }
        queue.push_back(PendingEntry {
            message,
            enqueued_at: Instant::now(),
        });
    }

    /// Drain a client's spool: expired entries are discarded, the rest are
    /// returned in enqueue order, and the queue is left empty.
    pub fn take_pending_messages(&self, client_id: &str) -> Vec<ForwardMessage> {
        let queue = match self.pending.write().remove(client_id) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let now = Instant::now();
        queue
            .into_iter()
            .filter(|entry| now.duration_since(entry.enqueued_at) < self.expire_time)
            .map(|entry| entry.message)
            .collect()
    }

    /// Purge expired spool entries everywhere; clients whose queue becomes
    /// empty lose the key.
    pub fn clean_expired_messages(&self) {
        let now = Instant::now();
        let mut pending = self.pending.write();
        pending.retain(|_, queue| {
            queue.retain(|entry| now.duration_since(entry.enqueued_at) < self.expire_time);
            !queue.is_empty()
        });
    }

    /// Number of spooled messages for a client.
    pub fn pending_len(&self, client_id: &str) -> usize {
        self.pending.read().get(client_id).map_or(0, VecDeque::len)
    }

    // ── remote share lists ──

    /// Replace the share list a peer has synced to us.
    pub fn set_remote_shared_devices(&self, broker_id: &str, devices: Vec<RemoteSharedDevice>) {
        self.remote_shared
            .write()
            .insert(broker_id.to_string(), devices);
    }

    /// Record the latest pushed data for one shared device, matched by
    /// client id or uuid.
    pub fn update_remote_shared_data(
        &self,
        broker_id: &str,
        client_id: &str,
        uuid: &str,
        data: serde_json::Value,
        at_ms: i64,
    ) {
        let mut shared = self.remote_shared.write();
        if let Some(devices) = shared.get_mut(broker_id) {
            if let Some(entry) = devices
                .iter_mut()
                .find(|d| d.client_id.as_deref() == Some(client_id) || d.uuid == uuid)
            {
                entry.last_data = Some(data);
                entry.last_data_at = Some(at_ms);
            }
        }
    }

    pub fn remote_shared_devices(&self, broker_id: &str) -> Vec<RemoteSharedDevice> {
        self.remote_shared
            .read()
            .get(broker_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(id: i64, uuid: &str) -> Device {
        Device {
            id,
            uuid: uuid.to_string(),
            auth_key: format!("key-{uuid}"),
            client_id: Some(format!("cid-{uuid}")),
            username: None,
            password: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn cache() -> DeviceCache {
        DeviceCache::new(Duration::from_millis(50), Duration::from_millis(80))
    }

    #[test]
    fn snapshots_and_removal() {
        let cache = cache();
        cache.set_device_by_client_id("cid-a", device(1, "a"));
        cache.set_device_by_auth_key("key-a", device(1, "a"));
        assert_eq!(cache.device_by_client_id("cid-a").unwrap().id, 1);

        cache.set_device_groups("cid-a", &["g1".to_string()]);
        cache.remove_device("cid-a", "key-a");
        assert!(cache.device_by_client_id("cid-a").is_none());
        assert!(cache.device_by_auth_key("key-a").is_none());
        assert!(cache.group_members("g1").is_empty());
    }

    #[test]
    fn group_indexes_stay_coherent() {
        let cache = cache();
        cache.set_device_groups("c1", &["g1".into(), "g2".into()]);
        cache.set_device_groups("c2", &["g2".into()]);

        assert!(cache.is_in_group("c1", "g1"));
        assert_eq!(cache.group_members("g2").len(), 2);

        // Shrink c1 down to g2 only; g1 must disappear entirely.
        cache.set_device_groups("c1", &["g2".into()]);
        assert!(!cache.is_in_group("c1", "g1"));
        assert!(cache.group_members("g1").is_empty());

        // Invariant: c in members[g] iff g in groups[c].
        for client in ["c1", "c2"] {
            for group in cache.device_groups(client) {
                assert!(cache.group_members(&group).contains(client));
            }
        }
        for group in ["g1", "g2"] {
            for member in cache.group_members(group) {
                assert!(cache.device_groups(&member).contains(group));
            }
        }
    }

    #[test]
    fn publish_rate_gate() {
        let cache = cache();
        assert!(cache.check_publish_rate("c1"));
        assert!(!cache.check_publish_rate("c1"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.check_publish_rate("c1"));
    }

    #[test]
    fn spool_order_drain_and_expiry() {
        let cache = cache();
        cache.add_pending_message("c1", ForwardMessage::direct("a", json!(1)));
        cache.add_pending_message("c1", ForwardMessage::direct("b", json!(2)));

        let messages = cache.take_pending_messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].from_device, "a");
        assert_eq!(messages[1].from_device, "b");

        // Second read is empty.
        assert!(cache.take_pending_messages("c1").is_empty());

        // Expired entries never come back.
        cache.add_pending_message("c1", ForwardMessage::direct("old", json!(0)));
        std::thread::sleep(Duration::from_millis(90));
        cache.add_pending_message("c1", ForwardMessage::direct("new", json!(1)));
        let messages = cache.take_pending_messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_device, "new");
    }

    #[test]
    fn cleanup_removes_empty_queues() {
        let cache = cache();
        cache.add_pending_message("c1", ForwardMessage::direct("a", json!(1)));
        std::thread::sleep(Duration::from_millis(90));
        cache.clean_expired_messages();
        assert_eq!(cache.pending_len("c1"), 0);
        assert!(cache.pending.read().is_empty());
    }

    #[test]
    fn spool_cap_drops_oldest() {
        let cache =
            DeviceCache::new(Duration::from_millis(50), Duration::from_secs(60)).with_pending_cap(2);
        for i in 0..3 {
            cache.add_pending_message("c1", ForwardMessage::direct(format!("m{i}"), json!(i)));
        }
        let messages = cache.take_pending_messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].from_device, "m1");
        assert_eq!(messages[1].from_device, "m2");
    }

    #[test]
    fn mode_defaults_to_mqtt() {
        let cache = cache();
        assert!(!cache.is_http_mode("unknown"));
        cache.set_device_mode("c1", DeviceMode::Http);
        assert!(cache.is_http_mode("c1"));
        cache.set_device_mode("c1", DeviceMode::Mqtt);
        assert!(!cache.is_http_mode("c1"));
    }

    #[test]
    fn offline_guard_keeps_newer_session() {
        let cache = cache();
        let (old, _rx1) = SessionHandle::new();
        let (new, _rx2) = SessionHandle::new();
        cache.set_client_online("c1", old.clone());
        cache.set_client_online("c1", new.clone());

        // The stale session's cleanup must not evict the replacement.
        cache.set_client_offline("c1", &old);
        assert!(cache.is_online("c1"));
        cache.set_client_offline("c1", &new);
        assert!(!cache.is_online("c1"));
    }

    #[test]
    fn remote_share_list_updates() {
        let cache = cache();
        cache.set_remote_shared_devices(
            "b2",
            vec![RemoteSharedDevice {
                uuid: "u1".into(),
                client_id: Some("c1".into()),
                permissions: "readwrite".into(),
                last_data: None,
                last_data_at: None,
            }],
        );
        cache.update_remote_shared_data("b2", "c1", "u1", json!({"t": 20}), 1234);
        let devices = cache.remote_shared_devices("b2");
        assert_eq!(devices[0].last_data, Some(json!({"t": 20})));
        assert_eq!(devices[0].last_data_at, Some(1234));

        // Sync replaces the list wholesale.
        cache.set_remote_shared_devices("b2", Vec::new());
        assert!(cache.remote_shared_devices("b2").is_empty());
    }
}
