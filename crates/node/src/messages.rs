//! Wire messages: line-delimited JSON, discriminated by `type`.

use std::net::{Ipv4Addr, Ipv6Addr};

use marabud_consensus::constants::{AGENT, DEFAULT_PORT, PROTOCOL_VERSION};
use marabud_consensus::{hash256_to_hex, Hash256, ProtocolError};
use marabud_primitives::Object;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HelloMsg {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorMsg {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GetPeersMsg {}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PeersMsg {
    pub peers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GetObjectMsg {
    pub objectid: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IHaveObjectMsg {
    pub objectid: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectMsg {
    pub object: Object,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GetMempoolMsg {}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MempoolMsg {
    pub txids: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GetChainTipMsg {}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainTipMsg {
    pub blockid: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Hello(HelloMsg),
    Error(ErrorMsg),
    GetPeers(GetPeersMsg),
    Peers(PeersMsg),
    GetObject(GetObjectMsg),
    IHaveObject(IHaveObjectMsg),
    Object(ObjectMsg),
    GetMempool(GetMempoolMsg),
    Mempool(MempoolMsg),
    GetChainTip(GetChainTipMsg),
    ChainTip(ChainTipMsg),
}

impl Message {
    pub fn hello() -> Self {
        Message::Hello(HelloMsg {
            version: PROTOCOL_VERSION.to_string(),
            agent: Some(AGENT.to_string()),
        })
    }

    pub fn error(err: &ProtocolError) -> Self {
        Message::Error(ErrorMsg {
            name: err.code.as_str().to_string(),
            description: Some(err.message.clone()),
        })
    }

    pub fn getobject(id: &Hash256) -> Self {
        Message::GetObject(GetObjectMsg {
            objectid: hash256_to_hex(id),
        })
    }

    pub fn ihaveobject(id: &Hash256) -> Self {
        Message::IHaveObject(IHaveObjectMsg {
            objectid: hash256_to_hex(id),
        })
    }

    pub fn object(object: Object) -> Self {
        Message::Object(ObjectMsg { object })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::internal(err.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line)
            .map_err(|err| ProtocolError::format(format!("malformed message: {err}")))
    }
}

/// Validates and normalizes a "host:port" peer string. IPv6 hosts keep
/// their brackets; a missing port defaults to the network port.
pub fn normalize_peer_addr(raw: &str) -> Option<String> {
    let (host, port) = split_host_port(raw)?;
    if port == 0 {
        return None;
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return Some(format!("[{host}]:{port}"));
    }
    if host.parse::<Ipv4Addr>().is_ok() || is_valid_domain(host) {
        return Some(format!("{host}:{port}"));
    }
    None
}

fn split_host_port(raw: &str) -> Option<(&str, u16)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Some((host, DEFAULT_PORT));
        }
        let port = after.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    match raw.rfind(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some(split) if !raw[..split].contains(':') => {
            let port = raw[split + 1..].parse().ok()?;
            Some((&raw[..split], port))
        }
        Some(_) => Some((raw, DEFAULT_PORT)),
        None => Some((raw, DEFAULT_PORT)),
    }
}

fn is_valid_domain(host: &str) -> bool {
    if host.is_empty() || !host.is_ascii() {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty()
            || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            || label.starts_with('-')
            || label.ends_with('-')
        {
            return false;
        }
    }
    // The TLD must not look like the last octet of an IP address.
    labels
        .last()
        .map(|tld| !tld.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_dispatches_on_type() {
        let message = Message::decode(r#"{"type":"getpeers"}"#).unwrap();
        assert!(matches!(message, Message::GetPeers(_)));
        let message = Message::decode(r#"{"type":"hello","version":"0.9.0"}"#).unwrap();
        assert!(matches!(message, Message::Hello(_)));
    }

    #[test]
    fn decode_rejects_unknown_type_and_members() {
        assert!(Message::decode(r#"{"type":"gossip"}"#).is_err());
        assert!(Message::decode(r#"{"type":"getpeers","x":1}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn encode_tags_messages() {
        let encoded = Message::hello().encode().unwrap();
        assert!(encoded.contains(r#""type":"hello""#));
        assert!(encoded.contains(r#""version":"0.9.0""#));
    }

    #[test]
    fn object_message_roundtrip() {
        let line = r#"{"type":"object","object":{"type":"transaction","height":0,"outputs":[{"pubkey":"aa","value":1}]}}"#;
        let message = Message::decode(line).unwrap();
        let Message::Object(inner) = message else {
            panic!("expected object message");
        };
        assert!(matches!(inner.object, Object::Transaction(_)));
    }

    #[test]
    fn peer_addrs_normalize() {
        assert_eq!(
            normalize_peer_addr("1.2.3.4:18018"),
            Some("1.2.3.4:18018".to_string())
        );
        assert_eq!(
            normalize_peer_addr("node.example.com"),
            Some("node.example.com:18018".to_string())
        );
        assert_eq!(
            normalize_peer_addr("[2001:db8::1]:18018"),
            Some("[2001:db8::1]:18018".to_string())
        );
        assert_eq!(
            normalize_peer_addr("2001:db8::1"),
            Some("[2001:db8::1]:18018".to_string())
        );
    }

    #[test]
    fn peer_addrs_rejected() {
        assert!(normalize_peer_addr("").is_none());
        assert!(normalize_peer_addr("localhost:18018").is_none());
        assert!(normalize_peer_addr("1.2.3.4:0").is_none());
        assert!(normalize_peer_addr("bad_host!:18018").is_none());
        assert!(normalize_peer_addr("1.2.3.4:99999").is_none());
    }
}
