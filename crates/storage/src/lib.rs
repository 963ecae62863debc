//! Durable storage for mqmesh.
//!
//! One SQLite database holds the identity tables (devices, groups,
//! memberships, status, peer brokers, share ACL) and the day-sharded
//! timeseries tables. Queries go through sqlx, whose per-connection
//! statement cache keeps every statement prepared and keyed by its SQL
//! text; the cache is dropped with the connections on re-initialization.

mod bridge_store;
mod db;
mod error;
mod identity;
mod timeseries;

pub use db::Database;
pub use error::StorageError;
pub use timeseries::{TimeseriesPage, TsPoint};

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StorageError>;
