// End-to-end integration tests for the relay pipeline.
//
// Each test starts a real relay server, connects real `Node` instances (via
// `TestPeer`), and verifies the full path: connect -> join -> send_msg ->
// process_send -> relay -> process_recv -> inbox.
//
// These tests exercise the same code paths as a live application; the only
// test-specific code is the synchronous polling wrappers in `TestPeer`.

use std::net::SocketAddr;
use std::time::Duration;

use peerhub_protocol::Address;
use peerhub_relay::error::NodeError;
use peerhub_relay::{ALL, RelayConfig, RelayHandle, start_relay};
use relay_tests::TestPeer;
use serde::{Deserialize, Serialize};
use serde_json::json;

const GROUP: &str = "net_demo";

fn start_test_relay(config: RelayConfig) -> (RelayHandle, SocketAddr) {
    start_relay(RelayConfig {
        interface: "127.0.0.1".into(),
        port: 0,
        ..config
    })
    .unwrap()
}

/// Start a relay and connect "host" and "bob" to the test group, with both
/// peer lists settled.
fn start_pair() -> (RelayHandle, SocketAddr, TestPeer, TestPeer) {
    let (handle, addr) = start_test_relay(RelayConfig::with_groups([GROUP]));
    let mut host = TestPeer::connect(addr, "host", GROUP);
    let mut bob = TestPeer::connect(addr, "bob", GROUP);
    host.poll_until_peers(&["host", "bob"]);
    bob.poll_until_peers(&["host", "bob"]);
    (handle, addr, host, bob)
}

#[test]
fn message_is_delivered_exactly_once() {
    let (handle, _addr, mut host, mut bob) = start_pair();
    assert_eq!(host.node.address(), Address(1));
    assert_eq!(bob.node.address(), Address(2));

    host.send("bob", "players", json!({"x": 5}), false);
    bob.poll_until_available("host", "players");

    assert_eq!(bob.node.get_msg("host", "players", true), Some(json!({"x": 5})));
    assert_eq!(bob.node.get_msg("host", "players", true), None);
    assert!(bob.node.get_all_msgs("host", "players", true).is_empty());

    handle.stop();
}

#[test]
fn broadcast_reaches_everyone_but_the_sender() {
    let (handle, addr, mut host, mut bob) = start_pair();
    let mut carol = TestPeer::connect(addr, "carol", GROUP);
    host.poll_until_peers(&["host", "bob", "carol"]);
    bob.poll_until_peers(&["host", "bob", "carol"]);

    host.send(ALL, "round", json!(3), false);
    bob.poll_until_available("host", "round");
    carol.poll_until_available("host", "round");

    host.idle(Duration::from_millis(200));
    assert_eq!(host.node.available("host", "round"), 0);

    handle.stop();
}

#[test]
fn overwrite_and_queue_modes() {
    let (handle, _addr, mut host, mut bob) = start_pair();

    host.node.send_msg("bob", "pos", json!(1), false);
    host.node.send_msg("bob", "pos", json!(2), false);
    for shot in 1..=3 {
        host.node.send_msg("bob", "shots", json!(shot), true);
    }
    host.node.process_send().unwrap();

    bob.poll_until("all shots", |node| {
        node.available("host", "pos") == 1 && node.available("host", "shots") == 3
    });
    assert_eq!(bob.node.get_all_msgs("host", "pos", true), vec![json!(2)]);
    assert_eq!(
        bob.node.get_all_msgs("host", "shots", true),
        vec![json!(1), json!(2), json!(3)]
    );

    handle.stop();
}

#[test]
fn relay_assigns_a_name_when_asked() {
    let (handle, addr) = start_test_relay(RelayConfig {
        names: vec!["Otter".into(), "Lynx".into()],
        name_seed: Some(7),
        ..RelayConfig::with_groups([GROUP])
    });

    let first = TestPeer::connect(addr, "", GROUP);
    let second = TestPeer::connect(addr, "", GROUP);
    let mut names = vec![first.node.name().to_owned(), second.node.name().to_owned()];
    names.sort();
    assert_eq!(names, vec!["Lynx", "Otter"]);
    assert_eq!(first.node.address(), Address(1));

    handle.stop();
}

#[test]
fn leaving_updates_the_peer_list() {
    let (handle, _addr, mut host, mut bob) = start_pair();

    bob.node.disconnect();
    assert!(!bob.node.is_connected());
    host.poll_until_peers(&["host"]);
    assert!(!host.node.send_msg("bob", "x", json!(1), false));

    handle.stop();
}

#[test]
fn duplicate_name_is_refused() {
    let (handle, addr, _host, _bob) = start_pair();
    let err = TestPeer::try_connect(addr, "bob", GROUP).err().expect("duplicate join succeeded");
    assert!(matches!(err, NodeError::Closed | NodeError::Io(_)), "got {err:?}");
    handle.stop();
}

#[test]
fn unknown_group_is_refused() {
    let (handle, addr) = start_test_relay(RelayConfig::with_groups([GROUP]));
    let err = TestPeer::try_connect(addr, "host", "elsewhere").err().expect("join succeeded");
    assert!(matches!(err, NodeError::Closed | NodeError::Io(_)), "got {err:?}");
    handle.stop();
}

#[test]
fn silent_peer_is_evicted() {
    let (handle, addr) = start_test_relay(RelayConfig {
        watchdog_timeout: Duration::from_millis(1500),
        ..RelayConfig::with_groups([GROUP])
    });
    let mut host = TestPeer::connect(addr, "host", GROUP);
    let mut quiet = TestPeer::connect(addr, "quiet", GROUP);
    host.poll_until_peers(&["host", "quiet"]);

    // The host ticks (and so heartbeats); "quiet" never does.
    host.poll_until_peers(&["host"]);
    let err = quiet.poll_until_closed();
    assert!(matches!(err, NodeError::Closed | NodeError::Io(_)), "got {err:?}");

    handle.stop();
}

#[test]
fn ticking_peer_survives_the_watchdog() {
    let (handle, addr) = start_test_relay(RelayConfig {
        watchdog_timeout: Duration::from_millis(1500),
        ..RelayConfig::with_groups([GROUP])
    });
    let mut host = TestPeer::connect(addr, "host", GROUP);
    host.idle(Duration::from_millis(2500));
    assert!(host.node.is_connected());
    handle.stop();
}

#[test]
fn request_peers_refreshes_the_list() {
    let (handle, _addr, mut host, _bob) = start_pair();
    host.node.request_peers().unwrap();
    host.idle(Duration::from_millis(100));
    assert_eq!(host.node.peers().len(), 2);
    handle.stop();
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct Player {
    x: i32,
    y: i32,
    alive: bool,
}

#[test]
fn shared_state_is_applied_on_update() {
    let (handle, _addr, mut host, mut bob) = start_pair();

    let state = Player {
        x: 4,
        y: -2,
        alive: true,
    };
    assert!(host.node.share("bob", &state).unwrap());
    host.node.process_send().unwrap();
    bob.poll_until_available("host", "alive");

    let mut mirror = Player::default();
    assert!(bob.node.update("host", &mut mirror).unwrap());
    assert_eq!(mirror, state);
    assert!(!bob.node.update("host", &mut mirror).unwrap());

    handle.stop();
}
