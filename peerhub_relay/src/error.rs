// Error types for the relay server and the client node.
//
// `AuthError` and `Disconnect` never propagate out of the event loop: they
// describe why the relay dropped one client and end up in a log line.
// `RelayError` is what `RelayServer` returns to its caller (bind and poll
// failures). `NodeError` is what the client node returns to the embedding
// application.

use std::io;

use peerhub_protocol::ProtocolError;
use thiserror::Error;

/// Why the relay refused an AUTH request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("group {0:?} is not allowed")]
    UnknownGroup(String),
    #[error("name {0:?} is already used in the group")]
    DuplicateName(String),
    #[error("no unused name left in the pool")]
    NoNameAvailable,
    #[error("no free address left in the group")]
    AddressExhausted,
}

/// Why the relay dropped a client.
#[derive(Debug, Error)]
pub enum Disconnect {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("inbound buffer limit exceeded ({size} bytes)")]
    BufferOverflow { size: usize },
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("client requested disconnect")]
    Requested,
}

impl Disconnect {
    /// Orderly departures are logged at info; everything else is a warning.
    pub fn is_orderly(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

/// Errors surfaced by `RelayServer`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the client node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed by the relay")]
    Closed,
    #[error("timed out waiting for the peer list")]
    Timeout,
    #[error("inbound buffer limit exceeded ({size} bytes)")]
    BufferOverflow { size: usize },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("value is not a JSON object with named fields")]
    NotAnObject,
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
