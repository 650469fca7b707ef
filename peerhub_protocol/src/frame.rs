// Length-prefixed binary framing.
//
// Every frame on the wire is an 11-byte header followed by an optional JSON
// payload:
//
//   0..4   length   u32 big-endian, total frame size including the header
//   4..7   version  3-byte tag, must equal `PROTOCOL_VERSION`
//   7      dest     destination address
//   8      sender   sender address
//   9      type     `FrameType` byte
//   10     meta     type-specific, 0 unless specified
//   11..   payload
//
// `Frame::encode`/`Frame::decode` are pure. `extract_frame` peels complete
// frames off the front of a byte buffer that a socket reader keeps appending
// to; callers loop on it until it yields `None`, which handles both partial
// reads and several frames arriving in one read.
//
// A version mismatch is never silently ignored: it is returned as
// `ProtocolError::VersionMismatch` and the connection must be dropped.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ProtocolError;
use crate::types::{Address, FrameType};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Protocol version tag. Peers with a different tag cannot talk to each other.
pub const PROTOCOL_VERSION: [u8; 3] = *b"020";

/// Maximum number of unprocessed inbound bytes either side will hold for one
/// connection. Exceeding it disconnects the peer.
pub const IN_BUFFER_LIMIT: usize = 102_400;

/// Largest frame accepted by `extract_frame`. A frame larger than the inbound
/// buffer limit could never be completed, so its length prefix is rejected
/// as soon as it is seen.
pub const MAX_FRAME_SIZE: usize = IN_BUFFER_LIMIT;

/// TCP port used when none is configured.
pub const DEFAULT_PORT: u16 = 65042;

/// One decoded protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub dest: Address,
    pub sender: Address,
    pub frame_type: FrameType,
    pub meta: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with a raw payload and `meta = 0`.
    pub fn new(dest: Address, sender: Address, frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            dest,
            sender,
            frame_type,
            meta: 0,
            payload,
        }
    }

    /// Build a frame whose payload is `value` serialized as JSON.
    pub fn with_json<T: Serialize + ?Sized>(
        dest: Address,
        sender: Address,
        frame_type: FrameType,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(dest, sender, frame_type, payload))
    }

    /// A payload-less keepalive addressed to the relay.
    pub fn heartbeat(sender: Address) -> Self {
        Self::new(Address::SERVER, sender, FrameType::Heart, Vec::new())
    }

    /// Deserialize the JSON payload.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = HEADER_SIZE + self.payload.len();
        let len_prefix = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge { len })?;

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&len_prefix.to_be_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION);
        out.push(self.dest.0);
        out.push(self.sender.0);
        out.push(self.frame_type.to_byte());
        out.push(self.meta);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse one complete frame, as returned by `extract_frame`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated { len: bytes.len() });
        }
        let declared = declared_len(bytes);
        if declared != bytes.len() {
            return Err(ProtocolError::InvalidLength { declared });
        }

        let version = [bytes[4], bytes[5], bytes[6]];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch { found: version });
        }

        Ok(Self {
            dest: Address(bytes[7]),
            sender: Address(bytes[8]),
            frame_type: FrameType::from_byte(bytes[9]),
            meta: bytes[10],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Remove and return the first complete frame from `buffer`.
///
/// Returns `Ok(None)` while the buffer holds less than a header or less than
/// the declared frame length; the bytes stay in place for the next read.
/// A length prefix smaller than the header or larger than `MAX_FRAME_SIZE`
/// can never become a valid frame and is reported as an error.
pub fn extract_frame(buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }
    let declared = declared_len(buffer);
    if declared < HEADER_SIZE {
        return Err(ProtocolError::InvalidLength { declared });
    }
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { len: declared });
    }
    if buffer.len() < declared {
        return Ok(None);
    }
    let remainder = buffer.split_off(declared);
    Ok(Some(std::mem::replace(buffer, remainder)))
}

fn declared_len(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}
