// Addressing and frame-type primitives shared by the relay and its nodes.
//
// An `Address` is the one-byte routing identifier the relay hands out per
// group. Two values are reserved: `0` names the relay itself and `255` means
// either "every peer in my group" (as a destination) or "I don't know my
// address yet" (as a sender). Peers are always allocated from `1..=254`.
//
// `FrameType` mirrors the type byte at header offset 9. Unknown type bytes
// are preserved as `FrameType::Unknown` rather than rejected so that both
// sides can drop them quietly instead of tearing the connection down.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One-byte peer address, unique within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u8);

impl Address {
    /// The relay server itself.
    pub const SERVER: Self = Self(0);
    /// Destination meaning "all other peers in the group".
    pub const BROADCAST: Self = Self(255);
    /// Sender value used before the relay has assigned an address.
    pub const UNKNOWN: Self = Self(255);
    /// Lowest address the relay allocates to a peer.
    pub const FIRST_PEER: u8 = 1;
    /// Highest address the relay allocates to a peer.
    pub const LAST_PEER: u8 = 254;

    /// Returns true if this address can belong to a peer.
    pub fn is_peer(self) -> bool {
        (Self::FIRST_PEER..=Self::LAST_PEER).contains(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame type carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Node → relay: join a group (`AuthRequest` payload).
    Auth,
    /// Node ↔ node via relay: a batch of `Envelope`s.
    Data,
    /// Node → relay keepalive, no payload.
    Heart,
    /// Relay → node: the full membership of the node's group.
    Peers,
    /// Node → relay: a `Request`.
    Req,
    /// Relay → node: a `SystemMessage`.
    Sysm,
    /// Any type byte this version does not understand.
    Unknown(u8),
}

impl FrameType {
    /// Decode a header type byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Auth,
            2 => Self::Data,
            3 => Self::Heart,
            4 => Self::Peers,
            5 => Self::Req,
            6 => Self::Sysm,
            other => Self::Unknown(other),
        }
    }

    /// Encode as a header type byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Auth => 1,
            Self::Data => 2,
            Self::Heart => 3,
            Self::Peers => 4,
            Self::Req => 5,
            Self::Sysm => 6,
            Self::Unknown(other) => other,
        }
    }
}
