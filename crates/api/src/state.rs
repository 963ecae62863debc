//! Shared handler state.

use std::sync::Arc;

use mqmesh_bridge::BridgeManager;
use mqmesh_broker::Engine;
use mqmesh_core::models::Device;
use mqmesh_core::{Config, DeviceCache};
use mqmesh_scheduler::TaskStore;
use mqmesh_storage::Database;

/// Everything the HTTP handlers reach for.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub db: Database,
    pub cache: Arc<DeviceCache>,
    pub engine: Arc<Engine>,
    pub tasks: Arc<TaskStore>,
    /// Absent when federation is disabled.
    pub bridge: Option<Arc<BridgeManager>>,
}

impl ApiState {
    /// Resolve a device from its auth key, cache first. A store hit is
    /// seeded back into the cache.
    pub async fn device_by_auth_key(&self, auth_key: &str) -> Option<Device> {
        if let Some(device) = self.cache.device_by_auth_key(auth_key) {
            return Some(device);
        }
        match self.db.get_device_by_auth_key(auth_key).await {
            Ok(Some(device)) => {
                self.cache.set_device_by_auth_key(auth_key, device.clone());
                Some(device)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("auth key lookup failed: {e}");
                None
            }
        }
    }
}
