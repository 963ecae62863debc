//! Peer broker and device-share queries.

use mqmesh_core::models::{Device, PeerBroker, SharedDeviceRow};
use mqmesh_core::{BridgeAccess, SharePermission};

use crate::db::Database;
use crate::{Result, StorageError};

impl Database {
    // ── peer brokers ──

    pub async fn create_peer(
        &self,
        broker_id: &str,
        url: &str,
        token: &str,
        enabled: bool,
    ) -> Result<PeerBroker> {
        sqlx::query("INSERT INTO bridge_remotes (broker_id, url, token, enabled) VALUES (?, ?, ?, ?)")
            .bind(broker_id)
            .bind(url)
            .bind(token)
            .bind(if enabled { 1 } else { 0 })
            .execute(self.pool())
            .await?;

        self.get_peer(broker_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("peer {broker_id}")))
    }

    pub async fn get_peer(&self, broker_id: &str) -> Result<Option<PeerBroker>> {
        Ok(
            sqlx::query_as::<_, PeerBroker>("SELECT * FROM bridge_remotes WHERE broker_id = ?")
                .bind(broker_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerBroker>> {
        Ok(
            sqlx::query_as::<_, PeerBroker>("SELECT * FROM bridge_remotes ORDER BY broker_id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn update_peer(
        &self,
        broker_id: &str,
        url: &str,
        token: &str,
        enabled: bool,
    ) -> Result<PeerBroker> {
        let result = sqlx::query(
            "UPDATE bridge_remotes SET url = ?, token = ?, enabled = ? WHERE broker_id = ?",
        )
        .bind(url)
        .bind(token)
        .bind(if enabled { 1 } else { 0 })
        .bind(broker_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("peer {broker_id}")));
        }
        self.get_peer(broker_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("peer {broker_id}")))
    }

    pub async fn delete_peer(&self, broker_id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM bridge_shared_devices WHERE broker_id = ?")
            .bind(broker_id)
            .execute(self.pool())
            .await?;
        let result = sqlx::query("DELETE FROM bridge_remotes WHERE broker_id = ?")
            .bind(broker_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── device shares ──

    pub async fn add_shared_device(
        &self,
        broker_id: &str,
        device_id: i64,
        permissions: SharePermission,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO bridge_shared_devices (broker_id, device_id, permissions) \
             VALUES (?, ?, ?) \
             ON CONFLICT(broker_id, device_id) DO UPDATE SET permissions = excluded.permissions",
        )
        .bind(broker_id)
        .bind(device_id)
        .bind(permissions.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn remove_shared_device(&self, broker_id: &str, device_id: i64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM bridge_shared_devices WHERE broker_id = ? AND device_id = ?")
                .bind(broker_id)
                .bind(device_id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Devices shared toward one peer, with their permissions.
    pub async fn get_shared_devices_for_broker(
        &self,
        broker_id: &str,
    ) -> Result<Vec<(Device, SharePermission)>> {
        let rows = sqlx::query_as::<_, SharedDeviceRow>(
            "SELECT * FROM bridge_shared_devices WHERE broker_id = ? ORDER BY device_id",
        )
        .bind(broker_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(device) = self.get_device_by_id(row.device_id).await? else {
                continue;
            };
            let permission =
                SharePermission::parse(&row.permissions).unwrap_or(SharePermission::Read);
            out.push((device, permission));
        }
        Ok(out)
    }

    /// Peers a given local device is shared with.
    pub async fn get_sharing_peers_for_device(&self, device_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT broker_id FROM bridge_shared_devices WHERE device_id = ? ORDER BY broker_id",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(broker_id,)| broker_id).collect())
    }

    /// The device-share ACL verdict for an inbound delivery from a peer.
    ///
    /// A peer with zero share rows gets the open policy (`All`). With rows
    /// present, the row for the target decides; no row means `None`.
    pub async fn check_bridge_device_access(
        &self,
        target_device_id: i64,
        from_broker_id: &str,
    ) -> Result<BridgeAccess> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bridge_shared_devices WHERE broker_id = ?")
                .bind(from_broker_id)
                .fetch_one(self.pool())
                .await?;
        if count == 0 {
            return Ok(BridgeAccess::All);
        }

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT permissions FROM bridge_shared_devices WHERE broker_id = ? AND device_id = ?",
        )
        .bind(from_broker_id)
        .bind(target_device_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(match row.as_ref().map(|(p,)| p.as_str()) {
            Some("readwrite") => BridgeAccess::ReadWrite,
            Some("read") => BridgeAccess::Read,
            Some(_) => BridgeAccess::Read,
            None => BridgeAccess::None,
        })
    }
}
