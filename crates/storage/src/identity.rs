//! Device, group, and status queries.

use mqmesh_core::models::{Device, DeviceStatus, Group};
use mqmesh_core::DeviceMode;

use crate::db::{timestamp, Database};
use crate::{Result, StorageError};

/// HTTP-mode devices silent for longer than this are demoted to offline.
const HTTP_INACTIVE_MS: i64 = 10 * 60 * 1000;

impl Database {
    // ── devices ──

    pub async fn create_device(&self, uuid: &str, auth_key: &str) -> Result<Device> {
        let now = timestamp();
        sqlx::query(
            "INSERT INTO devices (uuid, auth_key, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(auth_key)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device_by_uuid(uuid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("device {uuid}")))
    }

    pub async fn get_device_by_uuid(&self, uuid: &str) -> Result<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn get_device_by_auth_key(&self, auth_key: &str) -> Result<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE auth_key = ?")
                .bind(auth_key)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn get_device_by_client_id(&self, client_id: &str) -> Result<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn get_device_by_id(&self, id: i64) -> Result<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn get_all_devices(&self) -> Result<Vec<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Rotate a device's MQTT credential triple. The previous triple stops
    /// authenticating immediately.
    pub async fn update_device_connection(
        &self,
        auth_key: &str,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Device> {
        sqlx::query(
            "UPDATE devices SET client_id = ?, username = ?, password = ?, updated_at = ? \
             WHERE auth_key = ?",
        )
        .bind(client_id)
        .bind(username)
        .bind(password)
        .bind(timestamp())
        .bind(auth_key)
        .execute(self.pool())
        .await?;

        self.get_device_by_auth_key(auth_key)
            .await?
            .ok_or_else(|| StorageError::NotFound("device for auth key".to_string()))
    }

    // ── groups ──

    pub async fn create_group(&self, name: &str) -> Result<Group> {
        sqlx::query("INSERT INTO groups (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(timestamp())
            .execute(self.pool())
            .await?;

        self.get_group_by_name(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("group {name}")))
    }

    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        Ok(
            sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Fetch a group, creating it when absent.
    pub async fn get_or_create_group(&self, name: &str) -> Result<Group> {
        if let Some(group) = self.get_group_by_name(name).await? {
            return Ok(group);
        }
        self.create_group(name).await
    }

    pub async fn add_device_to_group(&self, device_id: i64, group_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO device_groups (device_id, group_id) VALUES (?, ?)")
            .bind(device_id)
            .bind(group_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Names of every group a device belongs to.
    pub async fn get_device_groups(&self, device_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT g.name FROM groups g \
             JOIN device_groups dg ON dg.group_id = g.id \
             WHERE dg.device_id = ? ORDER BY g.name",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    pub async fn get_group_devices(&self, group_name: &str) -> Result<Vec<Device>> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT d.* FROM devices d \
             JOIN device_groups dg ON dg.device_id = d.id \
             JOIN groups g ON g.id = dg.group_id \
             WHERE g.name = ? ORDER BY d.id",
        )
        .bind(group_name)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn is_device_in_group(&self, device_id: i64, group_name: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM device_groups dg \
             JOIN groups g ON g.id = dg.group_id \
             WHERE dg.device_id = ? AND g.name = ?",
        )
        .bind(device_id)
        .bind(group_name)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    // ── status ──

    /// Upsert the status row for a device.
    pub async fn update_device_online_status(
        &self,
        device_id: i64,
        online: bool,
        mode: DeviceMode,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_status (device_id, status, mode, last_active_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(device_id) DO UPDATE SET \
             status = excluded.status, mode = excluded.mode, \
             last_active_at = excluded.last_active_at",
        )
        .bind(device_id)
        .bind(if online { 1 } else { 0 })
        .bind(mode.as_str())
        .bind(timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_device_offline(&self, device_id: i64) -> Result<()> {
        sqlx::query("UPDATE device_status SET status = 0, last_active_at = ? WHERE device_id = ?")
            .bind(timestamp())
            .bind(device_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Stamp HTTP activity without touching status or mode.
    pub async fn update_device_last_active(&self, device_id: i64) -> Result<()> {
        sqlx::query("UPDATE device_status SET last_active_at = ? WHERE device_id = ?")
            .bind(timestamp())
            .bind(device_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Demote HTTP-mode devices that have been silent for over ten minutes.
    /// Returns the number of devices demoted.
    pub async fn mark_inactive_http_devices_offline(&self) -> Result<u64> {
        let cutoff = timestamp() - HTTP_INACTIVE_MS;
        let result = sqlx::query(
            "UPDATE device_status SET status = 0 \
             WHERE mode = 'http' AND status = 1 AND last_active_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_device_status(&self, device_id: i64) -> Result<Option<DeviceStatus>> {
        Ok(
            sqlx::query_as::<_, DeviceStatus>("SELECT * FROM device_status WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }
}
