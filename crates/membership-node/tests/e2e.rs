//! End-to-end tests for membership-node.
//!
//! Runs real nodes over loopback TCP with short gossip intervals: cluster
//! formation, failure of a member, malformed traffic and attachments.
//! Partitions and healing are driven deterministically in the simulated
//! network of `membership-core`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use membership_core::{Identity, ViewChange};
use membership_node::{encode_frame, Attachments, MembershipNode, NodeConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Config for a fast loopback node.
fn test_config(node_id: i32, seeds: Vec<SocketAddr>) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_id = node_id;
    config.gossip.interval_ms = 100;
    config.gossip.heartbeat_timeout_ms = Some(1000);
    config.gossip.quiescence_ms = Some(300);
    config.gossip.quarantine_delay_ms = 200;
    config.transport.bind = "127.0.0.1:0".parse().unwrap();
    config.transport.seeds = seeds;
    config.transport.select_timeout_ms = 50;
    config.transport.connect_timeout_ms = 500;
    config
}

async fn start(node_id: i32, seeds: Vec<SocketAddr>) -> MembershipNode {
    MembershipNode::start(test_config(node_id, seeds))
        .await
        .expect("node failed to start")
}

async fn start_cluster(size: i32) -> Vec<MembershipNode> {
    let first = start(0, Vec::new()).await;
    let seed = first.local_addr();
    let mut nodes = vec![first];
    for id in 1..size {
        nodes.push(start(id, vec![seed]).await);
    }
    nodes
}

fn members(change: &ViewChange) -> Vec<i32> {
    change.view.members.iter().collect()
}

/// Poll until every node reports the same stable view of `expected`.
async fn wait_for_agreement(nodes: &[&MembershipNode], expected: &[i32]) -> ViewChange {
    timeout(Duration::from_secs(20), async {
        loop {
            let views: Vec<ViewChange> = nodes.iter().map(|n| n.view()).collect();
            let agreed = views.iter().all(|v| {
                v.view.stable
                    && members(v) == expected
                    && v.view_number == views[0].view_number
            });
            if agreed {
                return views[0];
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        let views: Vec<_> = nodes.iter().map(|n| n.view()).collect();
        panic!("no agreement on {:?}, views: {:?}", expected, views)
    })
}

async fn shutdown_all(nodes: &[MembershipNode]) {
    for node in nodes {
        node.shutdown().await;
    }
}

// ==================== Cluster formation ====================

#[tokio::test]
async fn test_three_nodes_converge() {
    let nodes = start_cluster(3).await;
    let refs: Vec<_> = nodes.iter().collect();

    let view = wait_for_agreement(&refs, &[0, 1, 2]).await;
    assert_eq!(view.leader, 0);
    assert!(view.view_number > 0);

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn test_listener_notified_of_joins() {
    let first = start(0, Vec::new()).await;
    let seen = Arc::new(Mutex::new(Vec::<ViewChange>::new()));
    let recorder = seen.clone();
    let _subscription = first.subscribe(Arc::new(move |change: &ViewChange| {
        recorder.lock().unwrap().push(*change);
    }));

    let second = start(1, vec![first.local_addr()]).await;
    wait_for_agreement(&[&first, &second], &[0, 1]).await;

    timeout(Duration::from_secs(5), async {
        loop {
            let done = seen
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.view.stable && members(c) == [0, 1]);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener never saw the joined view");

    let changes = seen.lock().unwrap().clone();
    assert!(changes.windows(2).all(|w| w[0].view_number <= w[1].view_number));

    first.shutdown().await;
    second.shutdown().await;
}

// ==================== Failures ====================

#[tokio::test]
async fn test_stopped_node_is_dropped() {
    let nodes = start_cluster(3).await;
    let refs: Vec<_> = nodes.iter().collect();
    let before = wait_for_agreement(&refs, &[0, 1, 2]).await;

    nodes[2].shutdown().await;

    let after = wait_for_agreement(&[&nodes[0], &nodes[1]], &[0, 1]).await;
    assert!(after.view_number > before.view_number);
    assert_eq!(after.leader, 0);

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn test_leader_failure_moves_leadership() {
    let nodes = start_cluster(3).await;
    let refs: Vec<_> = nodes.iter().collect();
    wait_for_agreement(&refs, &[0, 1, 2]).await;

    nodes[0].shutdown().await;

    let after = wait_for_agreement(&[&nodes[1], &nodes[2]], &[1, 2]).await;
    assert_eq!(after.leader, 1);

    shutdown_all(&nodes).await;
}

// ==================== Robustness ====================

#[tokio::test]
async fn test_malformed_payload_closes_connection() {
    let node = start(0, Vec::new()).await;

    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();
    stream.write_all(&encode_frame(&[0x7f, 1, 2, 3])).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The node keeps working for well-behaved peers
    let peer = start(1, vec![node.local_addr()]).await;
    wait_for_agreement(&[&node, &peer], &[0, 1]).await;

    node.shutdown().await;
    peer.shutdown().await;
}

#[tokio::test]
async fn test_foreign_cluster_ignored() {
    let node = start(0, Vec::new()).await;

    let mut foreign_config = test_config(1, vec![node.local_addr()]);
    foreign_config.magic = 999;
    let foreign = MembershipNode::start(foreign_config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(members(&node.view()), vec![0]);
    assert_eq!(members(&foreign.view()), vec![1]);

    node.shutdown().await;
    foreign.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let node = start(0, Vec::new()).await;
    let addr = node.local_addr();
    node.shutdown().await;
    node.shutdown().await;

    // Listener is gone
    let connect = timeout(Duration::from_secs(2), TcpStream::connect(addr)).await;
    assert!(matches!(connect, Ok(Err(_)) | Err(_)));
}

#[tokio::test]
async fn test_dropped_node_releases_listener() {
    let node = start(0, Vec::new()).await;
    let addr = node.local_addr();
    drop(node);

    timeout(Duration::from_secs(5), async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("listener still accepting after drop");
}

// ==================== Attachments ====================

#[tokio::test]
async fn test_attachments_reach_peers() {
    let received = Arc::new(Mutex::new(Vec::<(Identity, Bytes)>::new()));
    let recorder = received.clone();

    let first = MembershipNode::start_with(
        test_config(0, Vec::new()),
        Attachments {
            source: None,
            handler: Some(Box::new(move |from: Identity, payload: Bytes| {
                recorder.lock().unwrap().push((from, payload));
            })),
        },
    )
    .await
    .unwrap();

    let second = MembershipNode::start_with(
        test_config(1, vec![first.local_addr()]),
        Attachments {
            source: Some(Box::new(|| Bytes::from_static(b"locator:v1"))),
            handler: None,
        },
    )
    .await
    .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("attachment never arrived");

    let (from, payload) = received.lock().unwrap()[0].clone();
    assert_eq!(from.node_id, 1);
    assert_eq!(payload, Bytes::from_static(b"locator:v1"));

    first.shutdown().await;
    second.shutdown().await;
}
