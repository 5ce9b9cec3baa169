//! Integration tests for the Node public API: lifecycle, connection
//! establishment, peer metadata, and events.

use std::time::{Duration, Instant};

use paddock::{Event, Node, NodeConfig};

async fn start_node(name: &str) -> Node {
    Node::start(NodeConfig {
        name: name.into(),
        ..Default::default()
    })
    .await
    .expect("node start failed")
}

async fn wait_peers(node: &Node, want: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if node.peer_count() >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for peers: node={} have={} want={}",
        node.name(),
        node.peer_count(),
        want
    );
}

#[tokio::test]
async fn node_identifiers_are_distinct_hex64() {
    let node = start_node("ids").await;

    assert_eq!(node.network_id().len(), 64);
    assert_eq!(node.user_id().len(), 64);
    assert_ne!(node.network_id(), node.user_id());
    assert_eq!(node.node_id().to_hex().len(), 64);
    assert!(node.listen_addr().contains(':'));

    node.shutdown().await;
}

#[tokio::test]
async fn two_nodes_connect_and_exchange_metadata() {
    let a = start_node("alice").await;
    let b = start_node("bob").await;

    a.connect_to(b.listen_addr()).await.expect("dial failed");
    wait_peers(&a, 1, Duration::from_secs(3)).await;
    wait_peers(&b, 1, Duration::from_secs(3)).await;

    let peers_of_a = a.snapshot_peers();
    assert_eq!(peers_of_a.len(), 1);
    assert_eq!(peers_of_a[0].network_id, b.network_id());
    assert_eq!(peers_of_a[0].user_id, b.user_id());
    assert_eq!(peers_of_a[0].name, "bob");
    assert_eq!(peers_of_a[0].addr, b.listen_addr());

    let peers_of_b = b.snapshot_peers();
    assert_eq!(peers_of_b[0].network_id, a.network_id());
    assert_eq!(peers_of_b[0].name, "alice");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn connect_events_are_emitted() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    let mut events = a.events().expect("event stream");

    a.connect_to(b.listen_addr()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("no event")
        .expect("event stream closed");
    match event {
        Event::PeerConnected {
            network_id, name, ..
        } => {
            assert_eq!(network_id, b.network_id());
            assert_eq!(name, "b");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Shutting down b tears the session; a notices and emits a disconnect.
    b.shutdown().await;
    let event = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(Event::PeerDisconnected { network_id, .. }) => break network_id,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("no disconnect event");
    assert_eq!(event, b.network_id());

    a.shutdown().await;
}

#[tokio::test]
async fn double_dial_yields_single_peer() {
    let a = start_node("a").await;
    let b = start_node("b").await;

    a.connect_to(b.listen_addr()).await.unwrap();
    a.connect_to(b.listen_addr()).await.unwrap();
    wait_peers(&a, 1, Duration::from_secs(3)).await;

    // The duplicate session loses silently; counts stay at one.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn mismatched_protocol_is_rejected() {
    let a = start_node("a").await;
    let b = Node::start(NodeConfig {
        name: "other".into(),
        protocol: "other-proto/9".into(),
        ..Default::default()
    })
    .await
    .unwrap();

    let _ = a.connect_to(b.listen_addr()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.peer_count(), 0, "protocol mismatch must not install a peer");
    assert_eq!(b.peer_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_peers() {
    let a = start_node("a").await;
    let b = start_node("b").await;

    a.connect_to(b.listen_addr()).await.unwrap();
    wait_peers(&b, 1, Duration::from_secs(3)).await;

    a.shutdown().await;

    // B notices the closed stream and removes the peer.
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && b.peer_count() > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(b.peer_count(), 0);
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_config_dials_on_start() {
    let b = start_node("bootstrap-target").await;

    let a = Node::start(NodeConfig {
        name: "a".into(),
        bootstraps: vec![b.listen_addr().to_string()],
        ..Default::default()
    })
    .await
    .unwrap();

    wait_peers(&a, 1, Duration::from_secs(3)).await;
    assert_eq!(a.snapshot_peers()[0].network_id, b.network_id());

    a.shutdown().await;
    b.shutdown().await;
}
