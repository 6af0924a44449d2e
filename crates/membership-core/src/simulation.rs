//! Multi-node scenarios over a simulated network with an explicit clock.
//!
//! Every message goes through the wire encoding, so these also exercise the
//! codec end to end. Messages are delivered instantly; a partition drops
//! messages crossing it and reports the send as failed.

use crate::engine::{EngineConfig, GossipEngine, Outbound};
use crate::identity::Identity;
use crate::message::GossipMessage;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;

const MAGIC: i32 = 12345;
const INTERVAL_MS: i64 = 1000;

fn addr(node_id: i32) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, node_id as u8 + 1], 7000))
}

struct SimCluster {
    nodes: BTreeMap<SocketAddr, GossipEngine>,
    isolated: BTreeSet<SocketAddr>,
    now: i64,
}

impl SimCluster {
    /// `size` nodes; everyone but node 0 seeds node 0.
    fn new(size: i32) -> Self {
        let mut cluster = Self {
            nodes: BTreeMap::new(),
            isolated: BTreeSet::new(),
            now: 0,
        };
        for node_id in 0..size {
            cluster.start(node_id, 100);
        }
        cluster
    }

    fn start(&mut self, node_id: i32, epoch: i64) {
        let mut config = EngineConfig::new(Identity::new(MAGIC, node_id, epoch), addr(node_id));
        if node_id != 0 {
            config.system_view.seeds = vec![addr(0)];
        }
        config.rng_seed = Some(node_id as u64 * 31 + epoch as u64);
        self.nodes
            .insert(addr(node_id), GossipEngine::new(config, self.now));
    }

    fn node(&self, node_id: i32) -> &GossipEngine {
        &self.nodes[&addr(node_id)]
    }

    fn isolate(&mut self, node_id: i32) {
        self.isolated.insert(addr(node_id));
    }

    fn blocked(&self, from: &SocketAddr, to: &SocketAddr) -> bool {
        self.isolated.contains(from) != self.isolated.contains(to)
    }

    fn deliver(&mut self, from: SocketAddr, outbound: Vec<Outbound>) {
        let mut queue: VecDeque<(SocketAddr, Outbound)> =
            outbound.into_iter().map(|out| (from, out)).collect();

        while let Some((sender, out)) = queue.pop_front() {
            let now = self.now;
            if self.blocked(&sender, &out.to) || !self.nodes.contains_key(&out.to) {
                if let Some(engine) = self.nodes.get_mut(&sender) {
                    engine.send_failed(out.to, now);
                }
                continue;
            }
            let decoded = GossipMessage::decode(out.message.encode()).expect("valid encoding");
            let receiver = out.to;
            if let Some(engine) = self.nodes.get_mut(&receiver) {
                let replies = engine.handle_message(decoded, now);
                queue.extend(replies.into_iter().map(|reply| (receiver, reply)));
            }
        }
    }

    fn round(&mut self) {
        self.now += INTERVAL_MS;
        let addrs: Vec<SocketAddr> = self.nodes.keys().copied().collect();
        for from in addrs {
            let now = self.now;
            let outbound = match self.nodes.get_mut(&from) {
                Some(engine) => engine.tick(now),
                None => continue,
            };
            self.deliver(from, outbound);
        }
    }

    fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.round();
        }
    }

    fn members(&self, node_id: i32) -> Vec<i32> {
        self.node(node_id).view().members.iter().collect()
    }

    fn is_stable(&self, node_id: i32) -> bool {
        self.node(node_id).view().stable
    }

    fn view_number(&self, node_id: i32) -> i64 {
        self.node(node_id).view_number()
    }

    /// Discard pending view changes everywhere; returns how many there were.
    fn drain_view_changes(&mut self) -> usize {
        self.nodes
            .values_mut()
            .map(|engine| engine.take_view_changes().len())
            .sum()
    }

    /// Every node holds the same stable view of the whole cluster.
    fn assert_agreed(&self, size: i32) {
        let expected: Vec<i32> = (0..size).collect();
        let number = self.view_number(0);
        for node_id in 0..size {
            assert_eq!(self.members(node_id), expected, "size {size}, node {node_id}");
            assert!(self.is_stable(node_id), "size {size}, node {node_id} not stable");
            assert_eq!(self.view_number(node_id), number, "size {size}, node {node_id}");
        }
    }
}

/// Rounds for a fresh cluster of `size` to discover and contact everyone.
fn warm_up_rounds(size: i32) -> usize {
    60 + 4 * size as usize
}

// ==================== Convergence ====================

#[test]
fn test_three_nodes_converge() {
    let mut cluster = SimCluster::new(3);
    cluster.run(30);

    for node_id in 0..3 {
        assert_eq!(cluster.members(node_id), vec![0, 1, 2], "node {node_id}");
        assert!(cluster.is_stable(node_id), "node {node_id} not stable");
    }
    let number = cluster.view_number(0);
    assert_eq!(cluster.view_number(1), number);
    assert_eq!(cluster.view_number(2), number);
    assert_eq!(cluster.node(2).current_view().leader, 0);
}

#[test]
fn test_converged_cluster_stays_quiet() {
    let mut cluster = SimCluster::new(3);
    cluster.run(30);
    let number = cluster.view_number(0);
    for node_id in 0..3 {
        cluster.nodes.get_mut(&addr(node_id)).unwrap().take_view_changes();
    }

    cluster.run(30);
    for node_id in 0..3 {
        assert_eq!(cluster.view_number(node_id), number);
        let changes = cluster
            .nodes
            .get_mut(&addr(node_id))
            .unwrap()
            .take_view_changes();
        assert!(changes.is_empty(), "node {node_id} changed: {changes:?}");
    }
}

#[test]
fn test_five_nodes_converge_through_relays() {
    let mut cluster = SimCluster::new(5);
    cluster.run(40);
    for node_id in 0..5 {
        assert_eq!(cluster.members(node_id), vec![0, 1, 2, 3, 4], "node {node_id}");
        assert!(cluster.is_stable(node_id));
    }
}

#[test]
fn test_larger_clusters_stay_stable_after_quiescence() {
    for size in [8, 16, 32] {
        let mut cluster = SimCluster::new(size);
        cluster.run(warm_up_rounds(size));
        cluster.assert_agreed(size);
        let number = cluster.view_number(0);
        cluster.drain_view_changes();

        cluster.run(120);
        assert_eq!(cluster.drain_view_changes(), 0, "size {size} changed view");
        cluster.assert_agreed(size);
        assert_eq!(cluster.view_number(0), number, "size {size}");
    }
}

// ==================== Partition ====================

#[test]
fn test_partitioned_node_is_dropped() {
    let mut cluster = SimCluster::new(3);
    cluster.run(30);
    let before = cluster.view_number(0);

    cluster.isolate(2);
    cluster.run(20);

    for node_id in [0, 1] {
        assert_eq!(cluster.members(node_id), vec![0, 1], "node {node_id}");
        assert!(cluster.is_stable(node_id));
        assert!(cluster.view_number(node_id) > before);
    }
    assert_eq!(cluster.view_number(0), cluster.view_number(1));

    assert_eq!(cluster.members(2), vec![2]);
    assert!(cluster.is_stable(2));
}

#[test]
fn test_partition_heals() {
    let mut cluster = SimCluster::new(3);
    cluster.run(30);
    cluster.isolate(2);
    cluster.run(20);
    let during = cluster.view_number(0);

    cluster.isolated.clear();
    cluster.run(30);
    for node_id in 0..3 {
        assert_eq!(cluster.members(node_id), vec![0, 1, 2], "node {node_id}");
        assert!(cluster.is_stable(node_id));
    }
    assert!(cluster.view_number(0) > during);
}

#[test]
fn test_isolated_member_of_larger_cluster_rejoins() {
    let size = 16;
    let mut cluster = SimCluster::new(size);
    cluster.run(warm_up_rounds(size));
    cluster.assert_agreed(size);

    cluster.isolate(15);
    cluster.run(60);
    let expected: Vec<i32> = (0..15).collect();
    for node_id in 0..15 {
        assert_eq!(cluster.members(node_id), expected, "node {node_id}");
        assert!(cluster.is_stable(node_id));
    }
    assert_eq!(cluster.members(15), vec![15]);

    cluster.isolated.clear();
    cluster.run(60);
    cluster.assert_agreed(size);
    cluster.drain_view_changes();
    cluster.run(30);
    assert_eq!(cluster.drain_view_changes(), 0);
}

// ==================== Restart ====================

#[test]
fn test_restarted_node_rejoins_with_new_epoch() {
    let mut cluster = SimCluster::new(3);
    cluster.run(30);
    let before = cluster.view_number(0);

    cluster.start(1, 200);
    assert_eq!(cluster.view_number(1), 0);
    cluster.run(20);

    for node_id in 0..3 {
        assert_eq!(cluster.members(node_id), vec![0, 1, 2], "node {node_id}");
        assert!(cluster.is_stable(node_id));
    }
    for observer in [0, 2] {
        let record = cluster.node(observer).peer(1).unwrap();
        assert_eq!(record.latest_state().epoch(), 200);
    }
    let number = cluster.view_number(0);
    assert!(number > before);
    assert_eq!(cluster.view_number(1), number);
    assert_eq!(cluster.view_number(2), number);
}
