//! Cross-broker addressing.
//!
//! A remote address is `brokerId:localIdentifier`, split on the first colon.
//! No colon means the identifier is local; an empty half means the address
//! is invalid.

/// A parsed device or group address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Identifier on this broker.
    Local(String),
    /// Identifier on a federated peer.
    Remote { broker_id: String, local: String },
}

impl Address {
    /// Parse an address string. Returns `None` when an address with a colon
    /// has an empty half.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.split_once(':') {
            None => {
                if raw.is_empty() {
                    None
                } else {
                    Some(Self::Local(raw.to_string()))
                }
            }
            Some((broker_id, local)) => {
                if broker_id.is_empty() || local.is_empty() {
                    None
                } else {
                    Some(Self::Remote {
                        broker_id: broker_id.to_string(),
                        local: local.to_string(),
                    })
                }
            }
        }
    }

    /// Format a cross-broker sender identity, `brokerId:clientId`.
    pub fn remote_sender(broker_id: &str, client_id: &str) -> String {
        format!("{broker_id}:{client_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote() {
        assert_eq!(
            Address::parse("b2:cid-7"),
            Some(Address::Remote {
                broker_id: "b2".into(),
                local: "cid-7".into()
            })
        );
        // Only the first colon splits.
        assert_eq!(
            Address::parse("b2:a:b"),
            Some(Address::Remote {
                broker_id: "b2".into(),
                local: "a:b".into()
            })
        );
    }

    #[test]
    fn parses_local() {
        assert_eq!(Address::parse("cid-7"), Some(Address::Local("cid-7".into())));
    }

    #[test]
    fn rejects_empty_halves() {
        assert_eq!(Address::parse(":x"), None);
        assert_eq!(Address::parse("x:"), None);
        assert_eq!(Address::parse(":"), None);
        assert_eq!(Address::parse(""), None);
    }
}
