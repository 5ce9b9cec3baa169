//! Flood-gossip integration: relay reach and triangle deduplication.

use std::time::{Duration, Instant};

use paddock::{Envelope, Gossip, MessageType, Node, NodeConfig};
use tokio::sync::mpsc;

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

/// b→a, c→b, a→c; waits until each node sees two peers.
async fn connect_triangle(a: &Node, b: &Node, c: &Node) {
    b.connect_to(a.listen_addr()).await.unwrap();
    c.connect_to(b.listen_addr()).await.unwrap();
    a.connect_to(c.listen_addr()).await.unwrap();
    for n in [a, b, c] {
        wait_peers(n, 2, Duration::from_secs(5)).await;
    }
}

fn count_matching(rx: &mut mpsc::Receiver<Envelope>, gossip_id: &str) -> usize {
    let mut count = 0;
    while let Ok(env) = rx.try_recv() {
        if env.msg_type != MessageType::Gossip {
            continue;
        }
        if let Ok(g) = env.parse_payload::<Gossip>() {
            if g.id == gossip_id {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn triangle_dedup_delivers_exactly_once() {
    let a = start_node("a").await;
    let b = start_node("b").await;
    let c = start_node("c").await;

    let mut b_in = b.incoming().unwrap();
    let mut c_in = c.incoming().unwrap();

    connect_triangle(&a, &b, &c).await;

    let id = "fixed-triangle-id";
    a.broadcast(&Gossip {
        id: id.into(),
        channel: "enc:test".into(),
        body: serde_json::json!({}),
    })
    .unwrap();

    // Wait until both B and C have seen it at least once.
    let mut count_b = 0;
    let mut count_c = 0;
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        count_b += count_matching(&mut b_in, id);
        count_c += count_matching(&mut c_in, id);
        if count_b >= 1 && count_c >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        count_b >= 1 && count_c >= 1,
        "expected gossip to arrive: b={count_b} c={count_c}"
    );

    // Quiescent window: no further deliveries may show up.
    tokio::time::sleep(Duration::from_millis(250)).await;
    count_b += count_matching(&mut b_in, id);
    count_c += count_matching(&mut c_in, id);
    assert_eq!(count_b, 1, "duplicate delivery at b");
    assert_eq!(count_c, 1, "duplicate delivery at c");

    for n in [a, b, c] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn gossip_reaches_indirect_peers_through_relay() {
    // A - B - C line; discovery is quick to close the triangle, so assert
    // delivery rather than topology.
    let a = start_node("a").await;
    let b = start_node("b").await;
    let c = start_node("c").await;

    let mut c_in = c.incoming().unwrap();

    b.connect_to(a.listen_addr()).await.unwrap();
    wait_peers(&a, 1, Duration::from_secs(3)).await;
    c.connect_to(b.listen_addr()).await.unwrap();
    wait_peers(&c, 1, Duration::from_secs(3)).await;

    let id = paddock::new_msg_id();
    a.broadcast(&Gossip {
        id: id.clone(),
        channel: "global".into(),
        body: serde_json::json!({"text": "hello mesh"}),
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = 0;
    while Instant::now() < deadline && seen == 0 {
        seen += count_matching(&mut c_in, &id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, 1, "gossip must reach c through b");

    for n in [a, b, c] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn distinct_ids_are_all_delivered() {
    let a = start_node("a").await;
    let b = start_node("b").await;

    let mut b_in = b.incoming().unwrap();
    a.connect_to(b.listen_addr()).await.unwrap();
    wait_peers(&a, 1, Duration::from_secs(3)).await;

    let ids: Vec<String> = (0..10).map(|_| paddock::new_msg_id()).collect();
    for id in &ids {
        a.broadcast(&Gossip {
            id: id.clone(),
            channel: "global".into(),
            body: serde_json::json!({}),
        })
        .unwrap();
    }

    let mut delivered = std::collections::HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && delivered.len() < ids.len() {
        while let Ok(env) = b_in.try_recv() {
            if env.msg_type != MessageType::Gossip {
                continue;
            }
            if let Ok(g) = env.parse_payload::<Gossip>() {
                delivered.insert(g.id);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered.len(), ids.len());

    a.shutdown().await;
    b.shutdown().await;
}
