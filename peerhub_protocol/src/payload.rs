// JSON payload schemas for each frame type.
//
// - AUTH  → `AuthRequest`
// - DATA  → `Vec<Envelope>` (several envelopes may share one frame)
// - PEERS → `Vec<PeerEntry>`
// - REQ   → `Request`
// - SYSM  → `SystemMessage`
// - HEART carries no payload.
//
// Envelope content is an opaque `serde_json::Value`; the relay forwards DATA
// frames byte-for-byte and never looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Address;

/// Request to join a group. An empty `name` asks the relay to pick one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub name: String,
    pub group: String,
}

/// One titled message inside a DATA frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub title: String,
    pub content: Value,
    /// `true` appends to the receiver's queue for this title; `false`
    /// replaces whatever is still unread there.
    pub queue: bool,
}

/// One member of a group, as broadcast in PEERS frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    #[serde(alias = "addr")]
    pub address: Address,
}

/// `Request::kind` asking the relay to close the connection.
pub const REQ_TYPE_DISCONNECT: u8 = 0;
/// `Request::kind` asking the relay for the current peer list.
pub const REQ_TYPE_PEERS: u8 = 1;

/// Node → relay request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn disconnect() -> Self {
        Self {
            kind: REQ_TYPE_DISCONNECT,
            data: Value::Null,
        }
    }

    pub fn peers() -> Self {
        Self {
            kind: REQ_TYPE_PEERS,
            data: Value::Null,
        }
    }
}

/// `SystemMessage::kind` carrying a relay-assigned name in `data`.
pub const SYSM_TYPE_NAME: u8 = 0;

/// Relay → node notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl SystemMessage {
    /// Tell a node the name the relay picked for it.
    pub fn assigned_name(name: &str) -> Self {
        Self {
            kind: SYSM_TYPE_NAME,
            msg: None,
            data: Value::String(name.to_owned()),
        }
    }

    /// The assigned name, if this is a name-assignment message.
    pub fn name(&self) -> Option<&str> {
        if self.kind == SYSM_TYPE_NAME {
            self.data.as_str()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope {
            title: "players".into(),
            content: json!({"x": 5}),
            queue: false,
        };
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"title": "players", "content": {"x": 5}, "queue": false})
        );
    }

    #[test]
    fn peer_entry_accepts_legacy_key() {
        let legacy: PeerEntry = serde_json::from_str(r#"{"name":"Ant","addr":4}"#).unwrap();
        assert_eq!(legacy.address, Address(4));

        let current: PeerEntry = serde_json::from_str(r#"{"name":"Ant","address":4}"#).unwrap();
        assert_eq!(current, legacy);
        assert_eq!(
            serde_json::to_value(&current).unwrap(),
            json!({"name": "Ant", "address": 4})
        );
    }

    #[test]
    fn system_message_carries_name() {
        let msg = SystemMessage::assigned_name("Otter");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": 0, "msg": null, "data": "Otter"})
        );
        assert_eq!(msg.name(), Some("Otter"));

        let other = SystemMessage {
            kind: 7,
            msg: Some("maintenance".into()),
            data: json!("Otter"),
        };
        assert_eq!(other.name(), None);
    }

    #[test]
    fn request_without_data_field() {
        let req: Request = serde_json::from_str(r#"{"type":1}"#).unwrap();
        assert_eq!(req, Request::peers());
        assert_eq!(
            serde_json::to_value(Request::disconnect()).unwrap(),
            json!({"type": 0, "data": null})
        );
    }
}
