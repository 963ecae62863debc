//! Topic grammar.
//!
//! The broker speaks a closed set of topics; anything outside the grammar is
//! denied by the ACL. Segments never contain `/`.

/// A parsed, well-formed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `/device/{clientId}/s`, a device's uplink.
    DeviceSend(String),
    /// `/device/{clientId}/r`, a device's downlink.
    DeviceRecv(String),
    /// `/group/{name}/s`.
    GroupSend(String),
    /// `/group/{name}/r`.
    GroupRecv(String),
    /// `/bridge/device/{clientId}`, inbound cross-broker device message.
    BridgeDevice(String),
    /// `/bridge/group/{name}`, inbound cross-broker group message.
    BridgeGroup(String),
    /// `/bridge/share/sync/{brokerId}`.
    BridgeShareSync(String),
    /// `/bridge/share/data/{brokerId}/{clientId}`.
    BridgeShareData { broker_id: String, client_id: String },
}

impl Topic {
    /// Parse a topic string against the grammar. Returns `None` for any
    /// topic outside it, including ones with empty segments.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.strip_prefix('/')?.split('/');
        let head = parts.next()?;
        let topic = match head {
            "device" => {
                let cid = non_empty(parts.next()?)?;
                match parts.next()? {
                    "s" => Self::DeviceSend(cid.to_string()),
                    "r" => Self::DeviceRecv(cid.to_string()),
                    _ => return None,
                }
            }
            "group" => {
                let name = non_empty(parts.next()?)?;
                match parts.next()? {
                    "s" => Self::GroupSend(name.to_string()),
                    "r" => Self::GroupRecv(name.to_string()),
                    _ => return None,
                }
            }
            "bridge" => match parts.next()? {
                "device" => Self::BridgeDevice(non_empty(parts.next()?)?.to_string()),
                "group" => Self::BridgeGroup(non_empty(parts.next()?)?.to_string()),
                "share" => match parts.next()? {
                    "sync" => Self::BridgeShareSync(non_empty(parts.next()?)?.to_string()),
                    "data" => Self::BridgeShareData {
                        broker_id: non_empty(parts.next()?)?.to_string(),
                        client_id: non_empty(parts.next()?)?.to_string(),
                    },
                    _ => return None,
                },
                _ => return None,
            },
            _ => return None,
        };
        // Trailing segments make the topic malformed.
        if parts.next().is_some() {
            return None;
        }
        Some(topic)
    }

    /// Whether this topic lives under the reserved `/bridge/` subtree.
    pub fn is_bridge(&self) -> bool {
        matches!(
            self,
            Self::BridgeDevice(_)
                | Self::BridgeGroup(_)
                | Self::BridgeShareSync(_)
                | Self::BridgeShareData { .. }
        )
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Downlink topic for a device.
pub fn device_recv(client_id: &str) -> String {
    format!("/device/{client_id}/r")
}

/// Uplink topic for a device.
pub fn device_send(client_id: &str) -> String {
    format!("/device/{client_id}/s")
}

/// Downlink topic for a group.
pub fn group_recv(name: &str) -> String {
    format!("/group/{name}/r")
}

/// Cross-broker device delivery topic on a peer.
pub fn bridge_device(client_id: &str) -> String {
    format!("/bridge/device/{client_id}")
}

/// Cross-broker group delivery topic on a peer.
pub fn bridge_group(name: &str) -> String {
    format!("/bridge/group/{name}")
}

/// Share-list sync topic for a peer broker.
pub fn bridge_share_sync(broker_id: &str) -> String {
    format!("/bridge/share/sync/{broker_id}")
}

/// Share-data push topic for one shared device toward a peer broker.
pub fn bridge_share_data(broker_id: &str, client_id: &str) -> String {
    format!("/bridge/share/data/{broker_id}/{client_id}")
}

/// Check an MQTT subscription filter against a concrete topic.
/// Supports the `+` single-level and `#` multi-level wildcards.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_and_group_topics() {
        assert_eq!(
            Topic::parse("/device/cid-1/s"),
            Some(Topic::DeviceSend("cid-1".into()))
        );
        assert_eq!(
            Topic::parse("/device/cid-1/r"),
            Some(Topic::DeviceRecv("cid-1".into()))
        );
        assert_eq!(
            Topic::parse("/group/g1/s"),
            Some(Topic::GroupSend("g1".into()))
        );
        assert_eq!(
            Topic::parse("/group/g1/r"),
            Some(Topic::GroupRecv("g1".into()))
        );
    }

    #[test]
    fn parses_bridge_topics() {
        assert_eq!(
            Topic::parse("/bridge/device/cid-9"),
            Some(Topic::BridgeDevice("cid-9".into()))
        );
        assert_eq!(
            Topic::parse("/bridge/group/g2"),
            Some(Topic::BridgeGroup("g2".into()))
        );
        assert_eq!(
            Topic::parse("/bridge/share/sync/b1"),
            Some(Topic::BridgeShareSync("b1".into()))
        );
        assert_eq!(
            Topic::parse("/bridge/share/data/b1/cid-9"),
            Some(Topic::BridgeShareData {
                broker_id: "b1".into(),
                client_id: "cid-9".into()
            })
        );
    }

    #[test]
    fn rejects_off_grammar_topics() {
        for topic in [
            "",
            "/",
            "device/cid/s",
            "/device/cid",
            "/device/cid/x",
            "/device//s",
            "/device/cid/s/extra",
            "/group/g1",
            "/bridge/other/x",
            "/bridge/share/sync",
            "/anything/else",
            "$SYS/broker",
        ] {
            assert_eq!(Topic::parse(topic), None, "{topic:?} should not parse");
        }
    }

    #[test]
    fn filter_matching() {
        assert!(filter_matches("/bridge/device/+", "/bridge/device/cid-1"));
        assert!(filter_matches("/bridge/share/data/b1/+", "/bridge/share/data/b1/c"));
        assert!(!filter_matches("/bridge/device/+", "/bridge/device/a/b"));
        assert!(filter_matches("/device/cid/r", "/device/cid/r"));
        assert!(!filter_matches("/device/cid/r", "/device/other/r"));
        assert!(filter_matches("/bridge/#", "/bridge/share/sync/b1"));
    }
}
