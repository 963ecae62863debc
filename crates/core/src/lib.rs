//! Shared foundation for the mqmesh broker mesh.
//!
//! This crate carries everything more than one component needs: the
//! environment-driven configuration, the persistent bridge identity, the
//! topic grammar, cross-broker addressing, the JSON wire envelopes, the
//! durable row models, and the in-memory device cache that fuses connection
//! state, group membership, rate accounting, and HTTP message spools.

pub mod address;
pub mod cache;
pub mod config;
pub mod error;
pub mod message;
pub mod models;
pub mod topic;
pub mod traits;

pub use address::Address;
pub use cache::{DeviceCache, SessionHandle};
pub use config::{BridgeIdentity, Config};
pub use error::Error;
pub use models::{BridgeAccess, Device, DeviceMode, SharePermission};
pub use topic::Topic;
pub use traits::{LocalPublisher, PeerLink};

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved client-id prefix peer bridge connections must use.
pub const BRIDGE_CLIENT_PREFIX: &str = "__bridge_";

/// Username peer bridge connections must present.
pub const BRIDGE_USERNAME: &str = "__bridge_";

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a lowercase hex string of `len` characters.
pub fn rand_hex(len: usize) -> String {
    use rand::Rng;
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}
