// TCP front end and event loop for the relay.
//
// Architecture: one thread, one readiness wait per iteration.
//
// - `poll(timeout)` waits (via `Poller`) until the listener or any client
//   socket is readable, or the timeout passes. A ready listener is drained
//   with `accept` until it would block; every new socket is switched to
//   non-blocking and registered with the `Roster`. A ready client socket is
//   read until it would block and each chunk is handed to
//   `Roster::receive`, which parses frames and queues output. After each
//   serviced client, every outbound buffer is flushed as far as the sockets
//   accept; the rest waits for the next iteration.
// - `disconnect_if_timeout()` is the liveness sweep. It is driven by the
//   caller, not by socket readiness, and evicts every client whose watchdog
//   has lapsed.
//
// The server owns the sockets; the roster owns every decision. Dropping a
// client means removing both its `TcpStream` and its `ClientRecord`.
//
// `start_relay` runs the same loop on a background thread with a stop flag,
// for embedding a relay in another process and for tests.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Disconnect, RelayError};
use crate::poller::{Pollable, Poller, Source};
use crate::roster::{ClientId, GroupStats, Roster};

/// Bytes read from a socket per `read` call.
const READ_CHUNK: usize = 4096;

/// How often `run` logs group membership.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// A bound relay server.
pub struct RelayServer {
    listener: TcpListener,
    streams: HashMap<ClientId, TcpStream>,
    roster: Roster,
    poller: Poller,
}

impl RelayServer {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let addr = format!("{}:{}", config.interface, config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        info!(%addr, groups = ?config.groups, names = config.names.len(), "relay bound");

        Ok(Self {
            listener,
            streams: HashMap::new(),
            roster: Roster::new(config),
            poller: Poller::new(),
        })
    }

    /// The bound address (useful when port 0 was requested).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Per-group membership and buffer usage.
    pub fn stats(&self) -> Vec<GroupStats> {
        self.roster.stats()
    }

    /// Run one event-loop iteration, waiting at most `timeout` for activity.
    /// Returns the endpoints of connections accepted during this iteration.
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<SocketAddr>, RelayError> {
        let mut sources = Vec::with_capacity(self.streams.len() + 1);
        sources.push((Source::Listener, self.listener.raw_handle()));
        sources.extend(
            self.streams
                .iter()
                .map(|(id, stream)| (Source::Client(*id), stream.raw_handle())),
        );

        let ready = self.poller.wait(&sources, timeout)?;
        let now = Instant::now();
        let mut accepted = Vec::new();
        for source in ready {
            match source {
                Source::Listener => self.accept_pending(now, &mut accepted),
                Source::Client(id) => {
                    self.service_read(id, now);
                    self.write_all();
                }
            }
        }
        Ok(accepted)
    }

    /// Disconnect every client whose watchdog has lapsed. Returns their
    /// endpoints.
    pub fn disconnect_if_timeout(&mut self) -> Vec<SocketAddr> {
        let expired = self.roster.expired(Instant::now());
        let endpoints = expired
            .into_iter()
            .filter_map(|id| {
                let endpoint = self.disconnect(id)?;
                debug!(peer = %endpoint, "watchdog expired, client dropped");
                Some(endpoint)
            })
            .collect();
        self.write_all();
        endpoints
    }

    /// Loop until `keep_running` is cleared: poll with `tick` as the wait
    /// bound, sweep timeouts, and log membership every few seconds. This is
    /// the loop the `relay` binary runs.
    pub fn run(&mut self, tick: Duration, keep_running: &AtomicBool) -> Result<(), RelayError> {
        let mut next_stats = Instant::now() + STATS_INTERVAL;
        while keep_running.load(Ordering::SeqCst) {
            for endpoint in self.poll(tick)? {
                info!(peer = %endpoint, "client connected");
            }
            for endpoint in self.disconnect_if_timeout() {
                info!(peer = %endpoint, "watchdog expired, client dropped");
            }

            let now = Instant::now();
            if now >= next_stats {
                self.log_stats();
                next_stats = now + STATS_INTERVAL;
            }
        }
        Ok(())
    }

    /// Log membership and buffer sizes of every non-empty group.
    pub fn log_stats(&self) {
        for group in self.roster.stats() {
            info!(group = %group.group, members = group.members.len(), "group status");
            for member in &group.members {
                info!(
                    group = %group.group,
                    name = %member.name,
                    address = %member.address,
                    inbound = member.inbound,
                    outbound = member.outbound,
                    "member buffers"
                );
            }
        }
    }

    fn accept_pending(&mut self, now: Instant, accepted: &mut Vec<SocketAddr>) {
        loop {
            match self.listener.accept() {
                Ok((stream, endpoint)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(peer = %endpoint, error = %e, "could not make socket non-blocking, closing");
                        continue;
                    }
                    let id = self.roster.accept(endpoint, now);
                    self.streams.insert(id, stream);
                    debug!(peer = %endpoint, "client connected");
                    accepted.push(endpoint);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service_read(&mut self, id: ClientId, now: Instant) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(stream) = self.streams.get_mut(&id) else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    if let Some(endpoint) = self.disconnect(id) {
                        info!(peer = %endpoint, "client closed the connection");
                    }
                    return;
                }
                Ok(n) => {
                    if let Err(reason) = self.roster.receive(id, &buf[..n], now) {
                        self.drop_client(id, &reason);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if let Some(endpoint) = self.disconnect(id) {
                        warn!(peer = %endpoint, error = %e, "read error, client dropped");
                    }
                    return;
                }
            }
        }
    }

    /// Push as much queued output as every socket accepts right now.
    fn write_all(&mut self) {
        let mut failed = Vec::new();
        for id in self.roster.ids() {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            loop {
                let pending = self.roster.pending_output(id);
                if pending.is_empty() {
                    break;
                }
                match stream.write(pending) {
                    Ok(0) => {
                        failed.push((id, io::Error::from(io::ErrorKind::WriteZero)));
                        break;
                    }
                    Ok(n) => self.roster.consume_output(id, n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failed.push((id, e));
                        break;
                    }
                }
            }
        }

        for (id, e) in failed {
            if let Some(endpoint) = self.disconnect(id) {
                warn!(peer = %endpoint, error = %e, "write error, client dropped");
            }
        }
    }

    fn drop_client(&mut self, id: ClientId, reason: &Disconnect) {
        let Some(endpoint) = self.disconnect(id) else {
            return;
        };
        if reason.is_orderly() {
            info!(peer = %endpoint, %reason, "client dropped");
        } else {
            warn!(peer = %endpoint, %reason, "client dropped");
        }
    }

    /// Close a client's socket and destroy its record. Returns its endpoint
    /// if it was still connected.
    fn disconnect(&mut self, id: ClientId) -> Option<SocketAddr> {
        if let Some(stream) = self.streams.remove(&id) {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "shutdown on close failed");
            }
        }
        self.roster.remove(id).map(|record| record.endpoint)
    }
}

/// Handle returned by `start_relay` to stop the background relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for its thread to finish.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }
}

/// Bind a relay and run its event loop on a background thread. Returns a
/// handle for stopping it and the bound address (useful with port 0).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let mut server = RelayServer::bind(&config)?;
    let addr = server.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&keep_running);

    let thread = thread::spawn(move || {
        if let Err(e) = server.run(Duration::from_millis(20), &flag) {
            warn!(error = %e, "relay loop stopped");
        }
    });

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

#[cfg(test)]
mod tests {
    use peerhub_protocol::{Address, AuthRequest, Frame, FrameType};

    use super::*;

    fn local_config() -> RelayConfig {
        RelayConfig {
            interface: "127.0.0.1".into(),
            port: 0,
            name_seed: Some(3),
            ..RelayConfig::with_groups(["g"])
        }
    }

    /// Poll until `done` holds or a second passes.
    fn poll_until(server: &mut RelayServer, done: impl Fn(&RelayServer) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !done(server) && Instant::now() < deadline {
            server.poll(Duration::from_millis(10)).unwrap();
        }
        assert!(done(server), "condition not reached");
    }

    #[test]
    fn accepts_and_reports_endpoints() {
        let mut server = RelayServer::bind(&local_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut accepted = Vec::new();
        while accepted.is_empty() && Instant::now() < deadline {
            accepted = server.poll(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(accepted, vec![client.local_addr().unwrap()]);
        assert_eq!(server.roster().len(), 1);
    }

    #[test]
    fn closed_connection_is_removed() {
        let mut server = RelayServer::bind(&local_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        poll_until(&mut server, |s| s.roster().len() == 1);

        drop(client);
        poll_until(&mut server, |s| s.roster().is_empty());
    }

    #[test]
    fn silent_client_times_out() {
        let mut server = RelayServer::bind(&RelayConfig {
            watchdog_timeout: Duration::from_millis(50),
            ..local_config()
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let auth = AuthRequest {
            name: "quiet".into(),
            group: "g".into(),
        };
        let bytes = Frame::with_json(Address::SERVER, Address::UNKNOWN, FrameType::Auth, &auth)
            .unwrap()
            .encode()
            .unwrap();
        client.write_all(&bytes).unwrap();
        poll_until(&mut server, |s| {
            s.roster()
                .ids()
                .first()
                .and_then(|id| s.roster().get(*id))
                .is_some_and(|c| c.is_authenticated())
        });

        assert!(server.disconnect_if_timeout().is_empty());
        thread::sleep(Duration::from_millis(80));
        let dropped = server.disconnect_if_timeout();
        assert_eq!(dropped, vec![client.local_addr().unwrap()]);
        assert!(server.roster().is_empty());
    }
}
