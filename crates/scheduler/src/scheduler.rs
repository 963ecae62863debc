//! The tick loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mqmesh_core::message::ForwardMessage;
use mqmesh_core::{now_ms, topic, DeviceCache, LocalPublisher};

use crate::task::TaskStore;

/// Sender identity carried by scheduler-injected messages.
pub const SCHEDULER_SENDER: &str = "__scheduler__";

/// Fires due tasks through the broker fan-out on a fixed tick.
pub struct Scheduler {
    store: Arc<TaskStore>,
    cache: Arc<DeviceCache>,
    publisher: Arc<dyn LocalPublisher>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        cache: Arc<DeviceCache>,
        publisher: Arc<dyn LocalPublisher>,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            tick,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Run until the shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(tick_ms = self.tick.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.fire_due().await,
                    _ = shutdown.changed() => {
                        info!("scheduler stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Fire every enabled task whose time has arrived.
    pub async fn fire_due(&self) {
        let now = now_ms();
        for task in self.store.due_tasks(now) {
            let message = ForwardMessage::direct(SCHEDULER_SENDER, task.command.clone());
            if self.cache.is_http_mode(&task.device_id) {
                self.cache.add_pending_message(&task.device_id, message);
            } else {
                match serde_json::to_vec(&message) {
                    Ok(payload) => {
                        self.publisher
                            .publish_local(&topic::device_recv(&task.device_id), payload)
                            .await;
                    }
                    Err(e) => warn!(task = %task.id, "command encode failed: {e}"),
                }
            }
            debug!(task = %task.id, target = %task.device_id, "task fired");
            self.store.complete_run(&task.id, now);
        }
    }
}
