// Test-only peer for relay integration tests.
//
// Wraps the real `Node` (from `peerhub_relay::node`) to provide a
// synchronous, test-friendly API for exercising the full path:
// node -> relay -> node -> inbox.
//
// The only test-specific code here is the blocking polling wrappers
// (loops around `process_send`/`process_recv` with a deadline). All
// networking uses the same code paths as a real embedding application.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use peerhub_relay::error::NodeError;
use peerhub_relay::node::{ConnectOptions, Node};
use serde_json::Value;

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test peer wrapping a real `Node`.
pub struct TestPeer {
    pub node: Node,
}

impl TestPeer {
    /// Connect to a relay and wait for the first peer list.
    pub fn connect(addr: SocketAddr, name: &str, group: &str) -> Self {
        Self::try_connect(addr, name, group).expect("TestPeer::connect failed")
    }

    /// Like `connect`, but returns the node's error instead of panicking.
    pub fn try_connect(addr: SocketAddr, name: &str, group: &str) -> Result<Self, NodeError> {
        let mut node = Node::new();
        let options = ConnectOptions {
            port: addr.port(),
            wait: true,
            timeout: Duration::from_secs(2),
        };
        node.connect(&addr.ip().to_string(), name, group, &options)?;
        Ok(Self { node })
    }

    /// Queue a message and push it out immediately.
    pub fn send(&mut self, to: &str, title: &str, content: Value, queue: bool) {
        assert!(
            self.node.send_msg(to, title, content, queue),
            "unknown destination {to:?}"
        );
        self.node.process_send().expect("process_send failed");
    }

    /// One send/receive cycle, the way an application tick would run it.
    pub fn tick(&mut self) {
        self.node.process_send().expect("process_send failed");
        self.node.process_recv().expect("process_recv failed");
    }

    /// Tick until `done` holds. Panics after `POLL_TIMEOUT`.
    pub fn poll_until(&mut self, what: &str, mut done: impl FnMut(&mut Node) -> bool) {
        let start = Instant::now();
        loop {
            self.tick();
            if done(&mut self.node) {
                return;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Tick until the peer list has exactly these names, in order.
    pub fn poll_until_peers(&mut self, names: &[&str]) {
        self.poll_until("peer list", |node| {
            node.peers().iter().map(|p| p.name.as_str()).eq(names.iter().copied())
        });
    }

    /// Tick until something is readable from `sender` under `title`.
    pub fn poll_until_available(&mut self, sender: &str, title: &str) {
        self.poll_until(title, |node| node.available(sender, title) > 0);
    }

    /// Tick for `duration`, asserting the connection stays up.
    pub fn idle(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.tick();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Tick until the relay closes the connection. Returns the error that
    /// reported it.
    pub fn poll_until_closed(&mut self) -> NodeError {
        let start = Instant::now();
        loop {
            if let Err(e) = self.node.process_recv() {
                return e;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for close");
            thread::sleep(POLL_INTERVAL);
        }
    }
}
