// Client side of the relay: one peer's identity and mailbox.
//
// A `Node` owns a single non-blocking TCP connection to a relay and never
// spawns a thread or blocks, except for the bounded wait inside
// `connect(wait = true)`. The embedding application drives it once per tick:
//
// - `send_msg` only queues an `Envelope` under its destination address.
//   `process_send` turns the queue into one DATA frame per destination,
//   writes as much as the socket takes (the rest stays buffered), and sends
//   a HEART when the connection has been quiet for a second.
// - `process_recv` reads until the socket would block, peels complete frames
//   off the inbound buffer and dispatches them: PEERS replaces the peer list
//   (and re-derives our own address from our name), SYSM applies a
//   relay-assigned name, DATA is filed into the inbox.
//
// Inbox layout: sender name -> title -> FIFO of contents. An envelope sent
// with `queue = false` replaces whatever is unread for its (sender, title)
// pair; `queue = true` appends. Empty titles and senders are pruned as soon
// as they are drained, so `available` is a plain lookup.
//
// Errors are returned to the caller. A fatal one (EOF, socket error,
// protocol violation, inbound overflow) also closes the connection, after
// which every I/O call returns `NodeError::NotConnected`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use peerhub_protocol::{
    Address, AuthRequest, DEFAULT_PORT, Envelope, Frame, FrameType, IN_BUFFER_LIMIT, PeerEntry,
    Request, SystemMessage, extract_frame,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// Destination name that addresses every other peer in the group.
pub const ALL: &str = "ALL";

/// A quiet connection sends a heartbeat this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How often `connect` checks for the first peer list while waiting.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;

/// Options for `Node::connect`.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub port: u16,
    /// Block until the relay sends the first peer list.
    pub wait: bool,
    /// Upper bound on the wait.
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            wait: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// One peer's connection to a relay.
pub struct Node {
    stream: Option<TcpStream>,
    name: String,
    address: Address,
    peers: Vec<PeerEntry>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    pending: BTreeMap<Address, Vec<Envelope>>,
    inbox: HashMap<String, HashMap<String, VecDeque<Value>>>,
    last_send: Instant,
    in_buffer_limit: usize,
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Node {
    /// A disconnected node.
    pub fn new() -> Self {
        Self {
            stream: None,
            name: String::new(),
            address: Address::UNKNOWN,
            peers: Vec::new(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            pending: BTreeMap::new(),
            inbox: HashMap::new(),
            last_send: Instant::now(),
            in_buffer_limit: IN_BUFFER_LIMIT,
        }
    }

    /// Connect to the relay at `host` and ask to join `group` as `name`. A
    /// blank name asks the relay to pick one.
    ///
    /// With `options.wait` this blocks until the relay's first peer list
    /// arrives (which means the join succeeded), a fatal error occurs (a
    /// refused join shows up as `Closed`), or `options.timeout` passes. Any
    /// previous connection and inbox are discarded.
    pub fn connect(
        &mut self,
        host: &str,
        name: &str,
        group: &str,
        options: &ConnectOptions,
    ) -> Result<(), NodeError> {
        self.close();
        self.inbox.clear();

        let stream = TcpStream::connect((host, options.port))?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.name = name.to_owned();
        self.last_send = Instant::now();

        let auth = AuthRequest {
            name: name.to_owned(),
            group: group.to_owned(),
        };
        self.queue_frame(&Frame::with_json(
            Address::SERVER,
            Address::UNKNOWN,
            FrameType::Auth,
            &auth,
        )?)?;
        self.flush()?;
        info!(%host, port = options.port, %name, %group, "connecting to relay");

        if !options.wait {
            return Ok(());
        }
        let deadline = Instant::now() + options.timeout;
        loop {
            self.process_recv()?;
            if !self.peers.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.close();
                return Err(NodeError::Timeout);
            }
            thread::sleep(CONNECT_POLL_INTERVAL);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Our name: the one we asked for, or the one the relay assigned.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our address in the group, `Address::UNKNOWN` until the first peer
    /// list that contains us.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Group members (ourselves included) in the relay's order.
    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    fn peer_address(&self, name: &str) -> Option<Address> {
        self.peers.iter().find(|p| p.name == name).map(|p| p.address)
    }

    fn peer_name(&self, address: Address) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.name.as_str())
    }

    /// Queue `content` for peer `to` (or `ALL`). Returns false, queueing
    /// nothing, when `to` is not a current peer.
    pub fn send_msg(&mut self, to: &str, title: &str, content: Value, queue: bool) -> bool {
        let dest = if to == ALL {
            Address::BROADCAST
        } else {
            match self.peer_address(to) {
                Some(address) => address,
                None => return false,
            }
        };
        self.pending.entry(dest).or_default().push(Envelope {
            title: title.to_owned(),
            content,
            queue,
        });
        true
    }

    /// Send everything queued by `send_msg`, one DATA frame per destination,
    /// plus a heartbeat if the connection has been quiet too long.
    pub fn process_send(&mut self) -> Result<(), NodeError> {
        if self.stream.is_none() {
            return Err(NodeError::NotConnected);
        }

        let pending = mem::take(&mut self.pending);
        let now = Instant::now();
        if pending.is_empty() {
            if now.duration_since(self.last_send) > HEARTBEAT_INTERVAL {
                self.queue_frame(&Frame::heartbeat(self.address))?;
                self.last_send = now;
            }
        } else {
            for (dest, batch) in &pending {
                let frame = Frame::with_json(*dest, self.address, FrameType::Data, batch)?;
                self.queue_frame(&frame)?;
            }
            self.last_send = now;
        }
        self.flush()
    }

    /// Read whatever the relay has sent and dispatch every complete frame.
    pub fn process_recv(&mut self) -> Result<(), NodeError> {
        if self.stream.is_none() {
            return Err(NodeError::NotConnected);
        }

        let mut buf = [0u8; READ_CHUNK];
        let ended = loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(NodeError::NotConnected);
            };
            match stream.read(&mut buf) {
                Ok(0) => break Some(NodeError::Closed),
                Ok(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    if let Err(e) = self.dispatch_buffered() {
                        warn!(error = %e, "protocol error from relay, disconnecting");
                        self.close();
                        return Err(e.into());
                    }
                    let size = self.inbound.len();
                    if size > self.in_buffer_limit {
                        warn!(size, "inbound buffer limit exceeded, disconnecting");
                        self.close();
                        return Err(NodeError::BufferOverflow { size });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(NodeError::Io(e)),
            }
        };

        match ended {
            Some(e) => {
                info!(reason = %e, "relay connection ended");
                self.close();
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn dispatch_buffered(&mut self) -> Result<(), peerhub_protocol::ProtocolError> {
        while let Some(bytes) = extract_frame(&mut self.inbound)? {
            let frame = Frame::decode(&bytes)?;
            self.dispatch(frame);
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.frame_type {
            FrameType::Data => {
                let Some(sender) = self.peer_name(frame.sender).map(str::to_owned) else {
                    debug!(sender = %frame.sender, "DATA from unknown address dropped");
                    return;
                };
                match frame.payload_json::<Vec<Envelope>>() {
                    Ok(batch) => {
                        for envelope in batch {
                            self.file(&sender, envelope);
                        }
                    }
                    Err(e) => warn!(%sender, error = %e, "malformed DATA payload dropped"),
                }
            }
            FrameType::Peers => match frame.payload_json::<Vec<PeerEntry>>() {
                Ok(peers) => {
                    self.peers = peers;
                    if let Some(address) = self.peer_address(&self.name) {
                        self.address = address;
                    }
                    debug!(peers = self.peers.len(), address = %self.address, "peer list updated");
                }
                Err(e) => warn!(error = %e, "malformed PEERS payload dropped"),
            },
            FrameType::Sysm => match frame.payload_json::<SystemMessage>() {
                Ok(message) => {
                    if let Some(name) = message.name() {
                        info!(%name, "relay assigned our name");
                        self.name = name.to_owned();
                    } else if let Some(msg) = &message.msg {
                        info!(kind = message.kind, %msg, "system message");
                    }
                }
                Err(e) => warn!(error = %e, "malformed SYSM payload dropped"),
            },
            other => debug!(frame_type = ?other, "ignoring frame"),
        }
    }

    /// Store one received envelope under the overwrite/queue rule.
    fn file(&mut self, sender: &str, envelope: Envelope) {
        let values = self
            .inbox
            .entry(sender.to_owned())
            .or_default()
            .entry(envelope.title)
            .or_default();
        if !envelope.queue {
            values.clear();
        }
        values.push_back(envelope.content);
    }

    /// Number of unread values stored for `sender`/`title`.
    pub fn available(&self, sender: &str, title: &str) -> usize {
        self.inbox
            .get(sender)
            .and_then(|titles| titles.get(title))
            .map_or(0, VecDeque::len)
    }

    /// Oldest unread value for `sender`/`title`. With `clear` it is removed.
    pub fn get_msg(&mut self, sender: &str, title: &str, clear: bool) -> Option<Value> {
        let values = self.inbox.get_mut(sender)?.get_mut(title)?;
        let value = if clear {
            values.pop_front()
        } else {
            values.front().cloned()
        };
        self.prune(sender, title);
        value
    }

    /// Every unread value for `sender`/`title`, oldest first. With `clear`
    /// they are removed. An empty vector means nothing was stored.
    pub fn get_all_msgs(&mut self, sender: &str, title: &str, clear: bool) -> Vec<Value> {
        let Some(values) = self.inbox.get_mut(sender).and_then(|t| t.get_mut(title)) else {
            return Vec::new();
        };
        let all = if clear {
            values.drain(..).collect()
        } else {
            values.iter().cloned().collect()
        };
        self.prune(sender, title);
        all
    }

    fn prune(&mut self, sender: &str, title: &str) {
        let Some(titles) = self.inbox.get_mut(sender) else {
            return;
        };
        if titles.get(title).is_some_and(VecDeque::is_empty) {
            titles.remove(title);
        }
        if titles.is_empty() {
            self.inbox.remove(sender);
        }
    }

    /// Ask the relay to resend the peer list to us alone.
    pub fn request_peers(&mut self) -> Result<(), NodeError> {
        let frame = Frame::with_json(Address::SERVER, self.address, FrameType::Req, &Request::peers())?;
        self.queue_frame(&frame)?;
        self.flush()
    }

    /// Tell the relay we are leaving, then close the connection. Never
    /// blocks: the request goes out with whatever else is buffered if the
    /// socket accepts it. Unsent queued messages are discarded.
    pub fn disconnect(&mut self) {
        if self.stream.is_none() {
            return;
        }
        let farewell = Frame::with_json(Address::SERVER, self.address, FrameType::Req, &Request::disconnect())
            .map_err(NodeError::from)
            .and_then(|frame| self.queue_frame(&frame));
        // One non-blocking attempt; whatever the socket does not take is lost.
        if let Err(e) = farewell.and_then(|()| self.flush()) {
            debug!(error = %e, "disconnect request not delivered");
        }
        info!(name = %self.name, "disconnected from relay");
        self.close();
    }

    /// Send each top-level field of `state` to `to` as its own overwrite
    /// message titled with the field name. Returns false when `to` is not a
    /// current peer.
    pub fn share<T: Serialize>(&mut self, to: &str, state: &T) -> Result<bool, NodeError> {
        let Value::Object(fields) = serde_json::to_value(state)? else {
            return Err(NodeError::NotAnObject);
        };
        if to != ALL && self.peer_address(to).is_none() {
            return Ok(false);
        }
        for (field, value) in fields {
            self.send_msg(to, &field, value, false);
        }
        Ok(true)
    }

    /// Apply the newest unread value of every field `from` shared onto
    /// `state`. Returns whether anything changed.
    pub fn update<T>(&mut self, from: &str, state: &mut T) -> Result<bool, NodeError>
    where
        T: Serialize + DeserializeOwned,
    {
        let Value::Object(mut fields) = serde_json::to_value(&*state)? else {
            return Err(NodeError::NotAnObject);
        };
        let mut changed = false;
        let names: Vec<String> = fields.keys().cloned().collect();
        for field in names {
            if let Some(latest) = self.get_all_msgs(from, &field, true).pop() {
                fields.insert(field, latest);
                changed = true;
            }
        }
        if changed {
            *state = serde_json::from_value(Value::Object(fields))?;
        }
        Ok(changed)
    }

    fn queue_frame(&mut self, frame: &Frame) -> Result<(), NodeError> {
        self.outbound.extend(frame.encode()?);
        Ok(())
    }

    /// Write as much buffered output as the socket accepts.
    fn flush(&mut self) -> Result<(), NodeError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(NodeError::NotConnected);
        };
        let mut written = 0;
        let result = loop {
            if written == self.outbound.len() {
                break Ok(());
            }
            match stream.write(&self.outbound[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.outbound.drain(..written);
        if let Err(e) = result {
            warn!(error = %e, "write to relay failed, disconnecting");
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the connection and all per-connection state. The inbox is kept
    /// so unread messages stay readable.
    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.address = Address::UNKNOWN;
        self.peers.clear();
        self.inbound.clear();
        self.outbound.clear();
        self.pending.clear();
    }
}
