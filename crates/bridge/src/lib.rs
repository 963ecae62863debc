//! Broker federation.
//!
//! Each configured peer gets one outbound MQTT client that authenticates
//! with the reserved bridge identity, keeps itself connected, and feeds
//! inbound share messages into the device cache. Outbound cross-broker
//! messages are fire-and-forget QoS 0 publishes onto the peer's `/bridge/*`
//! topics.

mod error;
mod inbound;
mod manager;
mod peer;

pub use error::BridgeError;
pub use inbound::{classify_inbound, InboundAction};
pub use manager::BridgeManager;
pub use peer::parse_peer_url;

pub type Result<T> = std::result::Result<T, BridgeError>;
