// peerhub_protocol — wire format for the peerhub message relay.
//
// Shared by the relay server and the client node (both in `peerhub_relay`).
// Pure encode/decode only: no sockets, no state.
//
// Module overview:
// - `types.rs`:   `Address` (one-byte routing id) and `FrameType`.
// - `frame.rs`:   11-byte header framing, `Frame::encode`/`decode`, and
//                 `extract_frame` for peeling frames off a stream buffer.
// - `payload.rs`: JSON payload schemas per frame type (`AuthRequest`,
//                 `Envelope`, `PeerEntry`, `Request`, `SystemMessage`).
// - `error.rs`:   `ProtocolError`.
//
// Design decisions:
// - **JSON payloads.** Message content is schema-less as far as the relay is
//   concerned, so it is carried as `serde_json::Value`.
// - **Raw forwarding.** DATA frames are relayed as the exact bytes received;
//   only the header is inspected in transit.

pub mod error;
pub mod frame;
pub mod payload;
pub mod types;

pub use error::ProtocolError;
pub use frame::{
    DEFAULT_PORT, Frame, HEADER_SIZE, IN_BUFFER_LIMIT, MAX_FRAME_SIZE, PROTOCOL_VERSION,
    extract_frame,
};
pub use payload::{AuthRequest, Envelope, PeerEntry, Request, SystemMessage};
pub use types::{Address, FrameType};
