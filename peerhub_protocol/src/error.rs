// Codec errors.
//
// Every variant except `Json` means the byte stream can no longer be trusted
// and the connection has to be dropped. `Json` is raised for a well-framed
// frame whose payload does not match the schema for its type; whether that is
// fatal depends on the frame type and is decided by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer speaks a different protocol version.
    #[error("incompatible protocol version {:?}", String::from_utf8_lossy(.found))]
    VersionMismatch { found: [u8; 3] },

    /// Fewer bytes than a frame header.
    #[error("truncated frame: {len} bytes")]
    Truncated { len: usize },

    /// The length prefix is smaller than the header or disagrees with the
    /// bytes handed to `Frame::decode`.
    #[error("invalid frame length {declared}")]
    InvalidLength { declared: usize },

    /// The frame would exceed the largest size either side accepts.
    #[error("frame too large: {len} bytes")]
    FrameTooLarge { len: usize },

    /// Payload is not valid JSON for the expected schema.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}
