//! Runtime configuration.
//!
//! All knobs come from the environment with conservative defaults, so a bare
//! `mqmesh` start brings up a working single-node broker. The bridge identity
//! (broker id + token) must survive restarts; when it is not pinned through
//! the environment it is generated once and persisted in the data directory.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{rand_hex, Error, Result};

/// Broker-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// MQTT listener bind address.
    pub mqtt_host: String,

    /// MQTT listener port.
    pub mqtt_port: u16,

    /// Device-facing HTTP API port.
    pub http_port: u16,

    /// Management HTTP API port.
    pub mgmt_port: u16,

    /// Maximum accepted publish payload in bytes.
    pub max_message_bytes: usize,

    /// Minimum interval between two publishes from one client, in ms.
    pub publish_rate_limit_ms: u64,

    /// Age after which spooled HTTP messages are discarded, in ms.
    pub message_expire_ms: u64,

    /// Period of the spool cleanup timer, in ms.
    pub cache_cleanup_interval_ms: u64,

    /// Days of timeseries data kept before retention drops a day shard.
    pub timeseries_retention_days: u32,

    /// Whether federation with peer brokers is enabled.
    pub bridge_enabled: bool,

    /// Broker id pinned via environment; generated and persisted otherwise.
    pub broker_id: Option<String>,

    /// Bridge token pinned via environment; generated and persisted otherwise.
    pub bridge_token: Option<String>,

    /// Delay before reconnecting a lost peer connection, in ms.
    pub bridge_reconnect_ms: u64,

    /// Bearer secret for the management surface; absent means open.
    pub user_token: Option<String>,

    /// Directory holding the database and the persisted bridge identity.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "0.0.0.0".to_string(),
            mqtt_port: 1883,
            http_port: 3000,
            mgmt_port: 3001,
            max_message_bytes: 1024,
            publish_rate_limit_ms: 1000,
            message_expire_ms: 120_000,
            cache_cleanup_interval_ms: 10_000,
            timeseries_retention_days: 30,
            bridge_enabled: false,
            broker_id: None,
            bridge_token: None,
            bridge_reconnect_ms: 5000,
            user_token: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mqtt_host: env_string("MQTT_HOST", &defaults.mqtt_host),
            mqtt_port: env_parse("MQTT_PORT", defaults.mqtt_port),
            http_port: env_parse("HTTP_PORT", defaults.http_port),
            mgmt_port: env_parse("MGMT_PORT", defaults.mgmt_port),
            max_message_bytes: env_parse("MESSAGE_MAX_LENGTH", defaults.max_message_bytes),
            publish_rate_limit_ms: env_parse("PUBLISH_RATE_LIMIT", defaults.publish_rate_limit_ms),
            message_expire_ms: env_parse("MESSAGE_EXPIRE_TIME", defaults.message_expire_ms),
            cache_cleanup_interval_ms: env_parse(
                "CACHE_CLEANUP_INTERVAL",
                defaults.cache_cleanup_interval_ms,
            ),
            timeseries_retention_days: env_parse(
                "TIMESERIES_RETENTION_DAYS",
                defaults.timeseries_retention_days,
            ),
            bridge_enabled: env_flag("BRIDGE_ENABLED"),
            broker_id: env_opt("BROKER_ID"),
            bridge_token: env_opt("BRIDGE_TOKEN"),
            bridge_reconnect_ms: env_parse(
                "BRIDGE_RECONNECT_INTERVAL",
                defaults.bridge_reconnect_ms,
            ),
            user_token: env_opt("USER_TOKEN"),
            data_dir: PathBuf::from(env_string("DATA_DIR", "./data")),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        env_opt(key).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {key}: {raw:?}, using default");
            default
        }),
        None => default,
    }
}

/// The federation identity of this broker instance.
///
/// Both halves must be stable across restarts: peers store the token to
/// authenticate inbound bridge clients, and the broker id prefixes every
/// cross-broker sender address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeIdentity {
    pub broker_id: String,
    pub token: String,
}

impl BridgeIdentity {
    /// Resolve the identity: environment values win, otherwise the persisted
    /// file in `data_dir` is read, and on first launch a fresh pair is
    /// generated and written back.
    pub fn load_or_generate(config: &Config) -> Result<Self> {
        if let (Some(broker_id), Some(token)) = (&config.broker_id, &config.bridge_token) {
            return Ok(Self {
                broker_id: broker_id.clone(),
                token: token.clone(),
            });
        }

        let path = Self::path(&config.data_dir);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut identity: Self = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("corrupt {}: {e}", path.display())))?;
            // Environment may pin one half while the other stays persisted.
            if let Some(broker_id) = &config.broker_id {
                identity.broker_id = broker_id.clone();
            }
            if let Some(token) = &config.bridge_token {
                identity.token = token.clone();
            }
            return Ok(identity);
        }

        let identity = Self {
            broker_id: config
                .broker_id
                .clone()
                .unwrap_or_else(|| format!("broker-{}", rand_hex(16))),
            token: config.bridge_token.clone().unwrap_or_else(|| rand_hex(64)),
        };
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(&identity)?)?;
        tracing::info!(broker_id = %identity.broker_id, "generated bridge identity");
        Ok(identity)
    }

    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("bridge_identity.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = Config::default();
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.mgmt_port, 3001);
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.publish_rate_limit_ms, 1000);
        assert_eq!(config.message_expire_ms, 120_000);
        assert_eq!(config.cache_cleanup_interval_ms, 10_000);
        assert_eq!(config.bridge_reconnect_ms, 5000);
        assert!(!config.bridge_enabled);
    }

    #[test]
    fn identity_is_generated_and_persisted() {
        let dir = std::env::temp_dir().join(format!("mqmesh-id-{}", crate::rand_hex(8)));
        let config = Config {
            data_dir: dir.clone(),
            ..Config::default()
        };

        let first = BridgeIdentity::load_or_generate(&config).unwrap();
        assert!(first.broker_id.starts_with("broker-"));
        assert_eq!(first.broker_id.len(), "broker-".len() + 16);
        assert_eq!(first.token.len(), 64);

        let second = BridgeIdentity::load_or_generate(&config).unwrap();
        assert_eq!(first, second);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn identity_env_values_win() {
        let dir = std::env::temp_dir().join(format!("mqmesh-id-{}", crate::rand_hex(8)));
        let config = Config {
            data_dir: dir.clone(),
            broker_id: Some("b1".into()),
            bridge_token: Some("secret".into()),
            ..Config::default()
        };
        let identity = BridgeIdentity::load_or_generate(&config).unwrap();
        assert_eq!(identity.broker_id, "b1");
        assert_eq!(identity.token, "secret");
        std::fs::remove_dir_all(dir).ok();
    }
}
