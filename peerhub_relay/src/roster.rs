// Client records and group membership for the relay.
//
// `Roster` is the state `server.rs` drives. It owns one `ClientRecord` per
// accepted connection (endpoint, membership, inbound/outbound byte buffers,
// watchdog) and implements everything the relay decides: admission into a
// group, address and name allocation, DATA forwarding, peer-list broadcasts
// and idle detection. It never touches a socket. The server feeds it the bytes
// it read, then drains `pending_output` into each socket and reports how much
// was written with `consume_output`. All mutation happens on the server's
// single event-loop thread, so there is no locking.
//
// Client lifecycle: `accept` creates an unauthenticated record. A valid AUTH
// frame moves it into a group with a name and an address. Any other frame
// from an unauthenticated record is dropped. `remove` destroys the record and
// re-broadcasts the group's peer list. When `receive` returns a `Disconnect`
// the caller must `remove` the client.
//
// Clients are kept in a `BTreeMap` keyed by a monotonically increasing id,
// so iteration (and therefore the order of names in PEERS frames) follows
// accept order.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use peerhub_prng::ShuffleRng;
use peerhub_protocol::payload::{REQ_TYPE_DISCONNECT, REQ_TYPE_PEERS};
use peerhub_protocol::{
    Address, AuthRequest, Frame, FrameType, PeerEntry, Request, SystemMessage, extract_frame,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{AuthError, Disconnect};

/// Highest numeric suffix tried once every pool name is taken.
const MAX_NAME_SUFFIX: u32 = 254;

/// Relay-local connection id. Also used as the poll token for the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// Group membership of an authenticated client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub name: String,
    pub group: String,
    pub address: Address,
}

/// One live connection.
#[derive(Debug)]
pub struct ClientRecord {
    pub endpoint: SocketAddr,
    membership: Option<Membership>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    watchdog: Instant,
}

impl ClientRecord {
    fn new(endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            endpoint,
            membership: None,
            inbound: Vec::new(),
            outbound: Vec::new(),
            watchdog: now,
        }
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.membership.is_some()
    }

    /// Time of the last frame that counted as activity.
    pub fn last_activity(&self) -> Instant {
        self.watchdog
    }

    fn in_group(&self, group: &str) -> bool {
        self.membership.as_ref().is_some_and(|m| m.group == group)
    }

    fn address(&self) -> Option<Address> {
        self.membership.as_ref().map(|m| m.address)
    }
}

/// Buffer usage of one group member, for periodic status logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberStats {
    pub name: String,
    pub address: Address,
    pub inbound: usize,
    pub outbound: usize,
}

/// Members of one group, in accept order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStats {
    pub group: String,
    pub members: Vec<MemberStats>,
}

/// All client records of one relay.
pub struct Roster {
    groups: Vec<String>,
    names: Vec<String>,
    clients: BTreeMap<ClientId, ClientRecord>,
    next_id: u64,
    watchdog_timeout: Duration,
    in_buffer_limit: usize,
}

impl Roster {
    /// Build an empty roster. The candidate name pool is shuffled here, once,
    /// with a generator private to this roster.
    pub fn new(config: &RelayConfig) -> Self {
        let mut names = config.names.clone();
        let mut rng = match config.name_seed {
            Some(seed) => ShuffleRng::new(seed),
            None => ShuffleRng::from_clock(),
        };
        rng.shuffle(&mut names);

        Self {
            groups: config.groups.clone(),
            names,
            clients: BTreeMap::new(),
            next_id: 0,
            watchdog_timeout: config.watchdog_timeout,
            in_buffer_limit: config.in_buffer_limit,
        }
    }

    /// Register a freshly accepted connection.
    pub fn accept(&mut self, endpoint: SocketAddr, now: Instant) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(id, ClientRecord::new(endpoint, now));
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Ids of all live clients, in accept order.
    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// The shuffled candidate name pool.
    pub fn name_pool(&self) -> &[String] {
        &self.names
    }

    /// Append bytes read from a client's socket and process every complete
    /// frame they finish.
    ///
    /// An `Err` means the client has to be disconnected; the caller is
    /// responsible for calling `remove`.
    pub fn receive(&mut self, id: ClientId, data: &[u8], now: Instant) -> Result<(), Disconnect> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Ok(());
        };
        client.inbound.extend_from_slice(data);
        let size = client.inbound.len();
        if size > self.in_buffer_limit {
            return Err(Disconnect::BufferOverflow { size });
        }

        loop {
            let Some(client) = self.clients.get_mut(&id) else {
                return Ok(());
            };
            let Some(bytes) = extract_frame(&mut client.inbound)? else {
                return Ok(());
            };
            self.process_frame(id, &bytes, now)?;
        }
    }

    /// Destroy a client record. If it was a group member, the rest of the
    /// group is sent the updated peer list.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        let record = self.clients.remove(&id)?;
        if let Some(membership) = &record.membership {
            info!(
                group = %membership.group,
                name = %membership.name,
                address = %membership.address,
                "peer left"
            );
            self.broadcast_peers(&membership.group);
        }
        Some(record)
    }

    /// Clients whose watchdog is older than the configured timeout at `now`.
    pub fn expired(&self, now: Instant) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.watchdog) > self.watchdog_timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Bytes queued for a client and not yet written to its socket.
    pub fn pending_output(&self, id: ClientId) -> &[u8] {
        self.clients
            .get(&id)
            .map(|c| c.outbound.as_slice())
            .unwrap_or_default()
    }

    /// Drop the first `written` bytes of a client's outbound buffer.
    pub fn consume_output(&mut self, id: ClientId, written: usize) {
        if let Some(client) = self.clients.get_mut(&id) {
            let written = written.min(client.outbound.len());
            client.outbound.drain(..written);
        }
    }

    /// Current membership of `group`, in accept order.
    pub fn peers(&self, group: &str) -> Vec<PeerEntry> {
        self.clients
            .values()
            .filter_map(|c| c.membership.as_ref())
            .filter(|m| m.group == group)
            .map(|m| PeerEntry {
                name: m.name.clone(),
                address: m.address,
            })
            .collect()
    }

    /// Per-group buffer usage for every non-empty allowed group.
    pub fn stats(&self) -> Vec<GroupStats> {
        self.groups
            .iter()
            .map(|group| GroupStats {
                group: group.clone(),
                members: self
                    .clients
                    .values()
                    .filter_map(|c| {
                        let m = c.membership.as_ref().filter(|m| &m.group == group)?;
                        Some(MemberStats {
                            name: m.name.clone(),
                            address: m.address,
                            inbound: c.inbound.len(),
                            outbound: c.outbound.len(),
                        })
                    })
                    .collect(),
            })
            .filter(|g| !g.members.is_empty())
            .collect()
    }

    fn process_frame(&mut self, id: ClientId, bytes: &[u8], now: Instant) -> Result<(), Disconnect> {
        let frame = Frame::decode(bytes)?;
        let Some(client) = self.clients.get_mut(&id) else {
            return Ok(());
        };

        if frame.frame_type == FrameType::Auth {
            if let Some(m) = &client.membership {
                warn!(peer = %client.endpoint, name = %m.name, "repeated AUTH ignored");
                return Ok(());
            }
            let auth: AuthRequest = frame.payload_json()?;
            self.authenticate(id, auth, now)?;
            return Ok(());
        }

        let Some(membership) = &client.membership else {
            debug!(peer = %client.endpoint, frame_type = ?frame.frame_type, "ignoring frame before AUTH");
            return Ok(());
        };
        if frame.sender != membership.address {
            warn!(
                peer = %client.endpoint,
                declared = %frame.sender,
                allocated = %membership.address,
                "forged sender address, frame dropped"
            );
            return Ok(());
        }
        let group = membership.group.clone();
        client.watchdog = now;

        match frame.frame_type {
            FrameType::Data => self.relay_data(id, &group, frame.dest, bytes),
            FrameType::Req => {
                let request: Request = frame.payload_json()?;
                match request.kind {
                    REQ_TYPE_DISCONNECT => return Err(Disconnect::Requested),
                    REQ_TYPE_PEERS => {
                        let peers = self.peers(&group);
                        let dest = frame.sender;
                        self.queue_json(id, dest, FrameType::Peers, &peers);
                    }
                    other => debug!(kind = other, "ignoring unknown request"),
                }
            }
            FrameType::Heart => {}
            FrameType::Auth | FrameType::Peers | FrameType::Sysm | FrameType::Unknown(_) => {
                debug!(frame_type = ?frame.frame_type, "ignoring frame not meant for the relay");
            }
        }
        Ok(())
    }

    fn authenticate(&mut self, id: ClientId, auth: AuthRequest, now: Instant) -> Result<(), AuthError> {
        let AuthRequest { name, group } = auth;
        if !self.groups.contains(&group) {
            return Err(AuthError::UnknownGroup(group));
        }

        let assigned = name.is_empty();
        let name = if assigned {
            self.pick_name(&group).ok_or(AuthError::NoNameAvailable)?
        } else if self.member_names(&group).contains(name.as_str()) {
            return Err(AuthError::DuplicateName(name));
        } else {
            name
        };

        let address = self.free_address(&group).ok_or(AuthError::AddressExhausted)?;

        let Some(client) = self.clients.get_mut(&id) else {
            return Ok(());
        };
        info!(peer = %client.endpoint, %group, %name, %address, assigned, "peer joined");
        client.membership = Some(Membership {
            name: name.clone(),
            group: group.clone(),
            address,
        });
        client.watchdog = now;

        if assigned {
            self.queue_json(id, address, FrameType::Sysm, &SystemMessage::assigned_name(&name));
        }
        self.broadcast_peers(&group);
        Ok(())
    }

    fn member_names(&self, group: &str) -> HashSet<&str> {
        self.clients
            .values()
            .filter_map(|c| c.membership.as_ref())
            .filter(|m| m.group == group)
            .map(|m| m.name.as_str())
            .collect()
    }

    /// First unused pool name, then the first unused `<name><n>` for
    /// `n` in `1..=254`.
    fn pick_name(&self, group: &str) -> Option<String> {
        let used = self.member_names(group);
        if let Some(name) = self.names.iter().find(|n| !used.contains(n.as_str())) {
            return Some(name.clone());
        }
        (1..=MAX_NAME_SUFFIX)
            .flat_map(|n| self.names.iter().map(move |name| format!("{name}{n}")))
            .find(|candidate| !used.contains(candidate.as_str()))
    }

    /// Lowest peer address not held by anyone in `group`.
    fn free_address(&self, group: &str) -> Option<Address> {
        let used: HashSet<Address> = self
            .clients
            .values()
            .filter(|c| c.in_group(group))
            .filter_map(ClientRecord::address)
            .collect();
        (Address::FIRST_PEER..=Address::LAST_PEER)
            .map(Address)
            .find(|a| !used.contains(a))
    }

    /// Forward a DATA frame's raw bytes. Broadcast goes to every other group
    /// member; a directed frame goes to the holder of `dest`, or nowhere.
    fn relay_data(&mut self, from: ClientId, group: &str, dest: Address, bytes: &[u8]) {
        if dest == Address::BROADCAST {
            for (id, client) in &mut self.clients {
                if *id != from && client.in_group(group) {
                    client.outbound.extend_from_slice(bytes);
                }
            }
            return;
        }

        match self
            .clients
            .values_mut()
            .find(|c| c.in_group(group) && c.address() == Some(dest))
        {
            Some(client) => client.outbound.extend_from_slice(bytes),
            None => debug!(%group, %dest, "no peer at destination, frame dropped"),
        }
    }

    fn broadcast_peers(&mut self, group: &str) {
        let peers = self.peers(group);
        let bytes = match encode_json(Address::BROADCAST, FrameType::Peers, &peers) {
            Some(bytes) => bytes,
            None => return,
        };
        for client in self.clients.values_mut().filter(|c| c.in_group(group)) {
            client.outbound.extend_from_slice(&bytes);
        }
    }

    fn queue_json<T: Serialize + ?Sized>(
        &mut self,
        id: ClientId,
        dest: Address,
        frame_type: FrameType,
        value: &T,
    ) {
        if let (Some(bytes), Some(client)) = (
            encode_json(dest, frame_type, value),
            self.clients.get_mut(&id),
        ) {
            client.outbound.extend_from_slice(&bytes);
        }
    }
}

/// Encode a relay-originated frame. Failure here means a bug in a payload
/// type rather than bad input, so it is logged and the frame skipped.
fn encode_json<T: Serialize + ?Sized>(dest: Address, frame_type: FrameType, value: &T) -> Option<Vec<u8>> {
    let encoded = Frame::with_json(dest, Address::SERVER, frame_type, value).and_then(|f| f.encode());
    match encoded {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(?frame_type, error = %e, "failed to encode relay frame");
            None
        }
    }
}
