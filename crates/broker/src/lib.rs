//! QoS 0 MQTT broker engine.
//!
//! A lightweight MQTT 3.1.1 broker with full control over authentication,
//! topic ACL, and routing. Sessions are tokio tasks speaking the v4 packet
//! codec from `rumqttc::mqttbytes`; every accepted publish runs through the
//! routing engine, which fans it out to local subscribers, HTTP spools,
//! federated peers, and the timeseries store.

mod engine;
mod error;
mod fanout;
mod policy;
pub mod protocol;
mod session;

pub use engine::{Engine, PublishError, PublishOutcome, PublishOrigin};
pub use error::{Error, Result};
pub use fanout::{ClientHandle, Fanout, OutboundMessage};
pub use policy::{Principal, SessionPolicy};
pub use session::MqttServer;
