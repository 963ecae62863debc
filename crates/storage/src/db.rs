//! Database handle and schema.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use tracing::info;

use mqmesh_core::{now_ms, rand_hex};

use crate::{Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    auth_key TEXT NOT NULL UNIQUE,
    client_id TEXT,
    username TEXT,
    password TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_devices_client_id ON devices(client_id);

CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS device_groups (
    device_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    UNIQUE(device_id, group_id)
);

CREATE TABLE IF NOT EXISTS device_status (
    device_id INTEGER NOT NULL UNIQUE,
    status INTEGER NOT NULL DEFAULT 0,
    mode TEXT NOT NULL DEFAULT 'mqtt',
    last_active_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS bridge_remotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_id TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    token TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS bridge_shared_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_id TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    permissions TEXT NOT NULL DEFAULT 'read',
    UNIQUE(broker_id, device_id)
);
"#;

/// Handle to the mqmesh database.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (or create) the database under `data_dir` and initialize the
    /// schema. Journaling is WAL, synchronous is NORMAL, and the page cache
    /// is enlarged; the broker leans on these for publish-path latency.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StorageError::Io(e.to_string()))?;
        let path = data_dir.join("mqmesh.db");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("cache_size", "-16000")
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(path = %path.display(), "database opened");

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same in-memory instance.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// First-start provisioning: with an empty device table, create one
    /// device with a random uuid and auth key and announce it on stdout so
    /// an operator can onboard without touching the database.
    pub async fn bootstrap_default_device(&self) -> Result<()> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }

        let device_uuid = uuid::Uuid::new_v4().to_string();
        let auth_key = rand_hex(32);
        let device = self.create_device(&device_uuid, &auth_key).await?;
        let group = self.create_group(&device_uuid).await?;
        self.add_device_to_group(device.id, group.id).await?;

        println!("first device provisioned:");
        println!("  uuid:    {device_uuid}");
        println!("  authKey: {auth_key}");
        info!(uuid = %device_uuid, "bootstrapped first device");
        Ok(())
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Milliseconds timestamp helper shared by the query modules.
pub(crate) fn timestamp() -> i64 {
    now_ms()
}
