// peerhub_relay — group message relay server and client node.
//
// The relay is a thin forwarder: peers connect over TCP, join a named group,
// and exchange small titled JSON messages addressed to one peer or to the
// whole group. The relay allocates names and addresses, keeps every group's
// peer list current, and drops silent clients. It never interprets message
// contents.
//
// Module overview:
// - `config.rs`: `RelayConfig` and group/name list files.
// - `error.rs`:  `AuthError`, `Disconnect`, `RelayError`, `NodeError`.
// - `roster.rs`: Per-client records and every relay decision (admission,
//                routing, peer lists, idle detection). Socket-free; the core
//                that `server.rs` drives.
// - `poller.rs`: Level-triggered readiness wait over the listener and client
//                sockets (`poll(2)` on Unix).
// - `server.rs`: `RelayServer`, the single-threaded event loop, and
//                `start_relay` for running it on a background thread.
// - `node.rs`:   `Node`, the client side: connection, outbound batching and
//                the per-sender/per-title inbox.
//
// Dependencies: `peerhub_protocol` (framing and payloads), `peerhub_prng`
// (name pool shuffle).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_relay`).

pub mod config;
pub mod error;
pub mod node;
pub mod poller;
pub mod roster;
pub mod server;

pub use config::RelayConfig;
pub use error::{AuthError, Disconnect, NodeError, RelayError};
pub use node::{ALL, ConnectOptions, Node};
pub use server::{RelayHandle, RelayServer, start_relay};
