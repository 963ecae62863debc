//! Subscription table and local fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mqmesh_core::topic::filter_matches;
use mqmesh_core::LocalPublisher;

/// A message queued toward one connected client.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Handle for delivering messages to one session.
///
/// The sender is Arc'd so cleanup can use pointer identity to tell a stale
/// session apart from a newer one that reused the client id.
#[derive(Clone)]
pub struct ClientHandle {
    pub client_id: Arc<str>,
    pub tx: Arc<mpsc::Sender<OutboundMessage>>,
}

impl ClientHandle {
    pub fn new(client_id: &str, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            client_id: Arc::from(client_id),
            tx: Arc::new(tx),
        }
    }

    fn same_sender(&self, other: &Arc<mpsc::Sender<OutboundMessage>>) -> bool {
        Arc::ptr_eq(&self.tx, other)
    }
}

/// Filter → subscribers table shared by sessions and the routing engine.
///
/// The topic set is small and mostly exact, so this is a flat map scanned
/// with MQTT wildcard matching rather than a trie.
#[derive(Default)]
pub struct Fanout {
    subscriptions: RwLock<HashMap<String, Vec<ClientHandle>>>,
    client_filters: RwLock<HashMap<String, Vec<String>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription for a session.
    pub fn subscribe(&self, filter: &str, handle: ClientHandle) {
        let mut subs = self.subscriptions.write();
        let entry = subs.entry(filter.to_string()).or_default();
        if !entry
            .iter()
            .any(|h| h.client_id == handle.client_id && h.same_sender(&handle.tx))
        {
            entry.push(handle.clone());
        }

        self.client_filters
            .write()
            .entry(handle.client_id.to_string())
            .or_default()
            .push(filter.to_string());
    }

    /// Drop specific subscriptions of one client.
    pub fn unsubscribe(&self, client_id: &str, filters: &[String]) {
        let mut subs = self.subscriptions.write();
        for filter in filters {
            if let Some(entry) = subs.get_mut(filter) {
                entry.retain(|h| h.client_id.as_ref() != client_id);
                if entry.is_empty() {
                    subs.remove(filter);
                }
            }
        }
        if let Some(list) = self.client_filters.write().get_mut(client_id) {
            list.retain(|f| !filters.contains(f));
        }
    }

    /// Remove everything a disconnecting session registered. The sender is
    /// compared by pointer so a newer session under the same client id is
    /// left untouched.
    pub fn cleanup_client(&self, client_id: &str, tx: &Arc<mpsc::Sender<OutboundMessage>>) {
        let filters = self.client_filters.write().remove(client_id);
        let Some(filters) = filters else { return };

        let mut subs = self.subscriptions.write();
        for filter in &filters {
            if let Some(entry) = subs.get_mut(filter) {
                entry.retain(|h| !h.same_sender(tx));
                if entry.is_empty() {
                    subs.remove(filter);
                }
            }
        }
        debug!(client_id, count = filters.len(), "cleaned up subscriptions");
    }

    /// Deliver a payload to every subscriber whose filter matches the topic.
    pub async fn route(&self, topic: &str, payload: Bytes) {
        let matched: Vec<ClientHandle> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|(filter, _)| filter_matches(filter, topic))
                .flat_map(|(_, handles)| handles.iter().cloned())
                .collect()
        };

        for handle in matched {
            let msg = OutboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if let Err(e) = handle.tx.send(msg).await {
                warn!(client_id = %handle.client_id, "failed to queue message: {e}");
            }
        }
    }

    /// Number of live subscriptions for a filter (diagnostics).
    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.subscriptions.read().get(filter).map_or(0, Vec::len)
    }
}

#[async_trait]
impl LocalPublisher for Fanout {
    async fn publish_local(&self, topic: &str, payload: Vec<u8>) {
        self.route(topic, Bytes::from(payload)).await;
    }
}
