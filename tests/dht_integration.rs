//! DHT integration: RPC round trips, iterative lookups, record publish
//! and retrieval, and mesh expansion.

use std::time::{Duration, Instant};

use paddock::{Node, NodeConfig, NodeId};

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

async fn connect_pair(from: &Node, to: &Node) {
    from.connect_to(to.listen_addr()).await.unwrap();
    wait_peers(from, 1, Duration::from_secs(3)).await;
    wait_peers(to, 1, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn ping_round_trip() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    connect_pair(&a, &b).await;

    a.dht_ping(b.user_id()).await.expect("ping should succeed");
    b.dht_ping(a.user_id()).await.expect("reverse ping should succeed");

    // Pinging someone we are not connected to fails fast.
    assert!(a.dht_ping(&"ff".repeat(32)).await.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn find_node_triangle_returns_target() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    let c = start_node("c").await;

    // b knows both a and c; a asks b for nodes close to c.
    connect_pair(&b, &a).await;
    connect_pair(&c, &b).await;

    let target = c.node_id().to_hex();
    let nodes = a.dht_find_node(&target).await.expect("lookup failed");

    assert!(
        nodes.iter().any(|nd| nd.node_id == target),
        "expected lookup to surface the target peer; got {nodes:?}"
    );
    // The self-certifying check held for everything returned.
    for nd in &nodes {
        assert_eq!(nd.node_id.len(), 64);
        assert!(!nd.addr.is_empty());
    }

    for n in [a, b, c] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn publish_and_fetch_immutable_record() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    connect_pair(&a, &b).await;

    let value = b"the quick brown fox".to_vec();
    let key = a
        .dht_put_immutable(value.clone(), Some(Duration::from_secs(3600)))
        .await
        .expect("publish failed");

    // A late joiner that only knows b can still resolve the value.
    let d = start_node("d").await;
    connect_pair(&d, &b).await;

    let rec = d
        .dht_get(key)
        .await
        .expect("lookup failed")
        .expect("record not found");
    assert_eq!(rec.value, value);

    for n in [a, b, d] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn mutable_records_are_seq_monotonic() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    connect_pair(&a, &b).await;

    a.dht_put_mutable("x", b"v1".to_vec(), 5, None)
        .await
        .expect("first publish");

    // Same seq with different content: rejected locally before any
    // network traffic.
    let err = a
        .dht_put_mutable("x", b"v2".to_vec(), 5, None)
        .await
        .expect_err("same seq must be rejected");
    assert!(
        err.to_string().contains("seq-too-low"),
        "unexpected error: {err}"
    );

    // seq+1 is accepted and replaces the value.
    let key = a
        .dht_put_mutable("x", b"v2".to_vec(), 6, None)
        .await
        .expect("seq+1 publish");

    let rec = b.dht_get(key).await.unwrap().expect("record resolvable");
    assert_eq!(rec.value, b"v2");
    assert_eq!(rec.seq, 6);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn star_lookup_converges_on_target() {
    // 25 nodes; node 0 is the hub everyone connects to first. Peer-list
    // discovery will thicken the graph, which only helps convergence.
    let mut nodes = Vec::new();
    for i in 0..25 {
        nodes.push(start_node(&format!("n{i}")).await);
    }
    let hub_addr = nodes[0].listen_addr().to_string();
    for node in &nodes[1..] {
        node.connect_to(&hub_addr).await.unwrap();
    }
    wait_peers(&nodes[0], 24, Duration::from_secs(10)).await;
    // Let hellos and peer lists settle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let target = nodes[24].node_id().to_hex();
    let result = nodes[1]
        .dht_find_node(&target)
        .await
        .expect("star lookup failed");

    assert!(
        result.iter().any(|nd| nd.node_id == target),
        "target must be in the result"
    );
    assert!(result.len() <= 20, "no more than k results");

    // Every result is a fleet member, and the list is distance-sorted
    // with the target (distance zero) first.
    let fleet: Vec<String> = nodes.iter().map(|n| n.node_id().to_hex()).collect();
    for nd in &result {
        assert!(fleet.contains(&nd.node_id), "stranger in result: {}", nd.node_id);
    }
    assert_eq!(result[0].node_id, target);
    let target_id = NodeId::from_hex(&target).unwrap();
    for pair in result.windows(2) {
        let d0 = NodeId::from_hex(&pair[0].node_id).unwrap().xor_distance(&target_id);
        let d1 = NodeId::from_hex(&pair[1].node_id).unwrap().xor_distance(&target_id);
        assert!(d0 <= d1, "result must be sorted by distance to the target");
    }

    for n in nodes {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn mesh_expands_from_a_single_bootstrap() {
    // a knows only b; b knows c. Within a few seconds a learns about c
    // (peer list push or DHT expansion) and dials it.
    let b = start_node("b").await;
    let c = start_node("c").await;
    connect_pair(&b, &c).await;

    let a = Node::start(NodeConfig {
        name: "a".into(),
        bootstraps: vec![b.listen_addr().to_string()],
        ..Default::default()
    })
    .await
    .unwrap();

    wait_peers(&a, 2, Duration::from_secs(3)).await;
    let peer_ids: Vec<String> = a.snapshot_peers().iter().map(|p| p.network_id.clone()).collect();
    assert!(peer_ids.contains(&b.network_id().to_string()));
    assert!(peer_ids.contains(&c.network_id().to_string()));

    for n in [a, b, c] {
        n.shutdown().await;
    }
}
