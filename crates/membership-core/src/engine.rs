//! The gossip engine: dissemination, merge and failure detection.
//!
//! Sans-IO: the caller drives the engine with explicit timestamps and performs
//! the I/O it asks for. Each call returns the messages to send.
//!
//! - [`GossipEngine::tick`]: one gossip round, called on a fixed interval
//! - [`GossipEngine::handle_message`]: a decoded message from a peer
//! - [`GossipEngine::send_failed`]: a send to a peer could not be completed
//!
//! View changes produced along the way are collected and handed out by
//! [`GossipEngine::take_view_changes`].

use crate::aggregator::{PeerView, ViewAggregator};
use crate::detector::{DetectorConfig, FailureDetector};
use crate::heartbeat::HeartbeatState;
use crate::identity::Identity;
use crate::message::{Digest, GossipMessage};
use crate::node_set::NodeIdSet;
use crate::system_view::{SystemView, SystemViewConfig};
use crate::view::{View, ViewChange};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Who we are
    pub identity: Identity,
    /// Address peers reach us at
    pub address: SocketAddr,
    /// Time between rounds
    pub interval_ms: i64,
    /// Live members gossiped to per round
    pub fanout: usize,
    /// Silence after which a peer is dead regardless of the detector. The
    /// effective ceiling grows with the peer table, see
    /// [`EngineConfig::heartbeat_ceiling_ms`].
    pub heartbeat_timeout_ms: i64,
    /// Unchanged time before a view is marked stable
    pub quiescence_ms: i64,
    /// Advertised preference for leadership
    pub preferred: bool,
    /// Optional secondary interface advertised in heartbeats
    pub test_interface: Option<SocketAddr>,
    pub detector: DetectorConfig,
    pub system_view: SystemViewConfig,
    /// Seed for target selection; `None` seeds from the OS
    pub rng_seed: Option<u64>,
}

impl EngineConfig {
    pub fn new(identity: Identity, address: SocketAddr) -> Self {
        Self {
            identity,
            address,
            interval_ms: 1000,
            fanout: 1,
            heartbeat_timeout_ms: 6000,
            quiescence_ms: 2000,
            preferred: false,
            test_interface: None,
            detector: DetectorConfig::default(),
            system_view: SystemViewConfig::default(),
            rng_seed: None,
        }
    }

    /// Silence tolerated from any one of `peers` before it is declared dead.
    ///
    /// Two members exchange heartbeats directly about once every
    /// `peers / fanout` rounds, so the ceiling never drops below
    /// [`CONTACT_PERIODS`] of those.
    pub fn heartbeat_ceiling_ms(&self, peers: usize) -> i64 {
        let rounds = peers.div_ceil(self.fanout.max(1)) as i64;
        self.heartbeat_timeout_ms.max(CONTACT_PERIODS * rounds * self.interval_ms)
    }
}

/// Direct contact periods covered by the liveness ceiling.
pub const CONTACT_PERIODS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Alive,
    /// Suspicion above half the conviction threshold
    Suspect,
    Dead,
}

/// Everything the engine knows about one peer.
pub struct PeerRecord {
    latest_state: HeartbeatState,
    detector: Box<dyn FailureDetector>,
    suspicion: f64,
    classification: Classification,
    last_arrival_ms: Option<i64>,
    first_seen_ms: i64,
}

impl PeerRecord {
    fn new(state: HeartbeatState, detector: Box<dyn FailureDetector>, now_ms: i64) -> Self {
        Self {
            latest_state: state,
            detector,
            suspicion: 0.0,
            classification: Classification::Alive,
            last_arrival_ms: None,
            first_seen_ms: now_ms,
        }
    }

    pub fn latest_state(&self) -> &HeartbeatState {
        &self.latest_state
    }

    pub fn suspicion(&self) -> f64 {
        self.suspicion
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn last_arrival_ms(&self) -> Option<i64> {
        self.last_arrival_ms
    }

    pub fn first_seen_ms(&self) -> i64 {
        self.first_seen_ms
    }

    fn address(&self) -> SocketAddr {
        self.latest_state.sender_address()
    }

    fn record_arrival(&mut self, now_ms: i64) {
        self.detector.record_arrival(now_ms);
        self.last_arrival_ms = Some(now_ms);
    }

    /// Recompute suspicion and classification. Returns the new classification.
    fn classify(&mut self, now_ms: i64, threshold: f64, ceiling_ms: i64) -> Classification {
        self.suspicion = self.detector.suspicion(now_ms);
        let silent_since = self.last_arrival_ms.unwrap_or(self.first_seen_ms);
        self.classification = if now_ms - silent_since > ceiling_ms
            || !self.detector.is_available(now_ms)
        {
            Classification::Dead
        } else if self.suspicion > threshold / 2.0 {
            Classification::Suspect
        } else {
            Classification::Alive
        };
        self.classification
    }

    /// Counted in the view: heard from directly and not convicted.
    fn is_member(&self) -> bool {
        self.last_arrival_ms.is_some() && self.classification != Classification::Dead
    }
}

/// A message the caller should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub message: GossipMessage,
}

/// Supplies the opaque application payload attached to each outgoing round.
pub trait AttachmentSource: Send {
    fn attachment(&mut self) -> Bytes;
}

impl<F> AttachmentSource for F
where
    F: FnMut() -> Bytes + Send,
{
    fn attachment(&mut self) -> Bytes {
        self()
    }
}

/// Receives the opaque application payload attached by a peer.
pub trait AttachmentHandler: Send {
    fn on_attachment(&mut self, from: Identity, attachment: Bytes);
}

impl<F> AttachmentHandler for F
where
    F: FnMut(Identity, Bytes) + Send,
{
    fn on_attachment(&mut self, from: Identity, attachment: Bytes) {
        self(from, attachment)
    }
}

pub struct GossipEngine {
    config: EngineConfig,
    local_state: HeartbeatState,
    peers: BTreeMap<i32, PeerRecord>,
    system_view: SystemView,
    aggregator: ViewAggregator,
    attachment_source: Option<Box<dyn AttachmentSource>>,
    attachment_handler: Option<Box<dyn AttachmentHandler>>,
    view_changes: Vec<ViewChange>,
}

impl GossipEngine {
    pub fn new(config: EngineConfig, now_ms: i64) -> Self {
        let system_view = match config.rng_seed {
            Some(seed) => SystemView::with_seed(config.address, config.system_view.clone(), seed),
            None => SystemView::new(config.address, config.system_view.clone()),
        };
        let aggregator =
            ViewAggregator::new(config.identity.node_id, config.quiescence_ms, now_ms);
        let local_state = HeartbeatState::builder(config.identity, config.address)
            .preferred(config.preferred)
            .test_interface(config.test_interface)
            .view(aggregator.view())
            .view_number(aggregator.view_number())
            .build();

        info!(
            "Gossip engine for {} at {} ({} seeds)",
            config.identity,
            config.address,
            config.system_view.seeds.len()
        );

        Self {
            config,
            local_state,
            peers: BTreeMap::new(),
            system_view,
            aggregator,
            attachment_source: None,
            attachment_handler: None,
            view_changes: Vec::new(),
        }
    }

    pub fn set_attachment_source(&mut self, source: Box<dyn AttachmentSource>) {
        self.attachment_source = Some(source);
    }

    pub fn set_attachment_handler(&mut self, handler: Box<dyn AttachmentHandler>) {
        self.attachment_handler = Some(handler);
    }

    pub fn identity(&self) -> Identity {
        self.config.identity
    }

    pub fn local_state(&self) -> &HeartbeatState {
        &self.local_state
    }

    pub fn view(&self) -> &View {
        self.aggregator.view()
    }

    pub fn view_number(&self) -> i64 {
        self.aggregator.view_number()
    }

    pub fn current_view(&self) -> ViewChange {
        self.aggregator.current()
    }

    pub fn peer(&self, node_id: i32) -> Option<&PeerRecord> {
        self.peers.get(&node_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (i32, &PeerRecord)> {
        self.peers.iter().map(|(id, record)| (*id, record))
    }

    pub fn system_view(&self) -> &SystemView {
        &self.system_view
    }

    /// View changes produced since the last call, oldest first.
    pub fn take_view_changes(&mut self) -> Vec<ViewChange> {
        std::mem::take(&mut self.view_changes)
    }

    /// Run one gossip round.
    pub fn tick(&mut self, now_ms: i64) -> Vec<Outbound> {
        self.reclassify(now_ms);
        self.cull(now_ms);
        self.evaluate_view(now_ms);
        self.refresh_local_state();

        let targets = self
            .system_view
            .next_gossip_targets(now_ms, self.config.fanout);
        if targets.is_empty() {
            return Vec::new();
        }

        let digests: Vec<Digest> = self
            .peers
            .values()
            .map(|record| Digest::of(&record.latest_state))
            .collect();
        let attachment = self.next_attachment();

        debug!(
            "Gossip round: {} targets, {} digests",
            targets.len(),
            digests.len()
        );
        targets
            .into_iter()
            .map(|to| Outbound {
                to,
                message: GossipMessage::Gossip {
                    state: self.local_state.clone(),
                    digests: digests.clone(),
                    attachment: attachment.clone(),
                },
            })
            .collect()
    }

    /// Merge a message from a peer and produce the replies it calls for.
    pub fn handle_message(&mut self, message: GossipMessage, now_ms: i64) -> Vec<Outbound> {
        match message {
            GossipMessage::Gossip {
                state,
                digests,
                attachment,
            } => {
                let reply_to = state.sender_address();
                let initiator = state.sender();
                if !self.accept_direct(state, attachment, now_ms) {
                    return Vec::new();
                }
                let (states, requests) = self.reconcile(initiator.node_id, &digests);
                self.refresh_local_state();
                vec![Outbound {
                    to: reply_to,
                    message: GossipMessage::Reply {
                        state: self.local_state.clone(),
                        states,
                        requests,
                        attachment: self.next_attachment(),
                    },
                }]
            }
            GossipMessage::Reply {
                state,
                states,
                requests,
                attachment,
            } => {
                let reply_to = state.sender_address();
                if !self.accept_direct(state, attachment, now_ms) {
                    return Vec::new();
                }
                for relayed in states {
                    self.accept_relayed(relayed, now_ms);
                }
                self.evaluate_view(now_ms);

                let states = self.lookup(&requests);
                if states.is_empty() {
                    return Vec::new();
                }
                vec![Outbound {
                    to: reply_to,
                    message: GossipMessage::Update { states },
                }]
            }
            GossipMessage::Update { states } => {
                for relayed in states {
                    self.accept_relayed(relayed, now_ms);
                }
                self.evaluate_view(now_ms);
                Vec::new()
            }
        }
    }

    /// A send to `addr` failed; it is retried on a later round.
    pub fn send_failed(&mut self, addr: SocketAddr, now_ms: i64) {
        debug!("Send to {} failed", addr);
        self.system_view.mark_unreachable(addr, now_ms);
    }

    fn is_foreign(&self, state: &HeartbeatState) -> bool {
        let sender = state.sender();
        if sender.magic != self.config.identity.magic {
            debug!("Ignoring state from foreign cluster {}", sender);
            return true;
        }
        if sender.node_id == self.config.identity.node_id {
            if sender.epoch > self.config.identity.epoch {
                warn!(
                    "Another incarnation of this node is gossiping: {} (we are {})",
                    sender, self.config.identity
                );
            }
            return true;
        }
        false
    }

    /// A peer's own heartbeat, received from that peer.
    ///
    /// Accepted unless the stored state is strictly newer. Returns false if
    /// the state was ignored.
    fn accept_direct(&mut self, state: HeartbeatState, attachment: Bytes, now_ms: i64) -> bool {
        if self.is_foreign(&state) {
            return false;
        }
        let node_id = state.sender().node_id;
        let addr = state.sender_address();
        let sender = state.sender();
        let ceiling = self.config.heartbeat_ceiling_ms(self.peers.len());

        match self.peers.get_mut(&node_id) {
            Some(record) => {
                if HeartbeatState::merge_decision(&state, &record.latest_state) {
                    debug!("Ignoring stale heartbeat from {}", sender);
                    return false;
                }
                let restarted = state.epoch() > record.latest_state.epoch();
                if restarted || record.classification == Classification::Dead {
                    // History from a previous incarnation or before the
                    // outage says nothing about current scheduling.
                    if restarted {
                        info!("Peer {} restarted", sender);
                    } else {
                        info!("Peer {} is back", sender);
                    }
                    record.detector = self.config.detector.create();
                    record.last_arrival_ms = None;
                }
                if record.address() != addr {
                    debug!("Peer {} moved to {}", sender, addr);
                }
                record.latest_state = state;
                record.record_arrival(now_ms);
                record.classify(now_ms, self.config.detector.conviction_threshold, ceiling);
            }
            None => {
                info!("New peer {} at {}", sender, addr);
                let mut record = PeerRecord::new(state, self.config.detector.create(), now_ms);
                record.record_arrival(now_ms);
                self.peers.insert(node_id, record);
            }
        }

        self.system_view.mark_contacted(addr, now_ms);
        if !attachment.is_empty() {
            if let Some(handler) = self.attachment_handler.as_mut() {
                handler.on_attachment(sender, attachment);
            }
        }
        self.evaluate_view(now_ms);
        true
    }

    /// A state relayed by a third party. Never counts as an arrival.
    fn accept_relayed(&mut self, state: HeartbeatState, now_ms: i64) {
        if self.is_foreign(&state) {
            return;
        }
        let node_id = state.sender().node_id;
        let addr = state.sender_address();

        match self.peers.get_mut(&node_id) {
            Some(record) => {
                if HeartbeatState::merge_decision(&record.latest_state, &state) {
                    record.latest_state = state;
                }
            }
            None => {
                debug!("Learned about {} at {} by relay", state.sender(), addr);
                let record = PeerRecord::new(state, self.config.detector.create(), now_ms);
                self.peers.insert(node_id, record);
            }
        }
        self.system_view.discover(addr);
    }

    /// Compare an initiator's digests with what we hold.
    ///
    /// Returns the states the initiator is missing or has older versions of,
    /// and digests of the states we want from it.
    fn reconcile(&self, initiator: i32, digests: &[Digest]) -> (Vec<HeartbeatState>, Vec<Digest>) {
        let local_id = self.config.identity.node_id;
        let mut states = Vec::new();
        for (node_id, record) in &self.peers {
            if *node_id == initiator {
                continue;
            }
            let theirs = digests.iter().find(|d| {
                d.identity.node_id == *node_id && d.identity.magic == self.config.identity.magic
            });
            let newer_here = match theirs {
                None => true,
                Some(digest) => Digest::of(&record.latest_state).supersedes(digest),
            };
            if newer_here {
                states.push(record.latest_state.clone());
            }
        }

        let requests = digests
            .iter()
            .filter(|d| {
                d.identity.magic == self.config.identity.magic
                    && d.identity.node_id != local_id
                    && d.identity.node_id != initiator
            })
            .filter(|d| match self.peers.get(&d.identity.node_id) {
                None => true,
                Some(record) => d.is_newer_than(&record.latest_state),
            })
            .copied()
            .collect();

        (states, requests)
    }

    /// States we hold for the requested digests.
    fn lookup(&self, requests: &[Digest]) -> Vec<HeartbeatState> {
        requests
            .iter()
            .filter_map(|d| {
                if d.identity.equal_id(&self.config.identity) {
                    Some(self.local_state.clone())
                } else {
                    self.peers
                        .get(&d.identity.node_id)
                        .map(|r| r.latest_state.clone())
                }
            })
            .collect()
    }

    fn reclassify(&mut self, now_ms: i64) {
        let threshold = self.config.detector.conviction_threshold;
        let ceiling = self.config.heartbeat_ceiling_ms(self.peers.len());
        for record in self.peers.values_mut() {
            let before = record.classification;
            let after = record.classify(now_ms, threshold, ceiling);
            if before == after {
                continue;
            }
            let sender = record.latest_state.sender();
            match after {
                Classification::Dead => {
                    info!(
                        "Peer {} convicted (suspicion {:.2})",
                        sender, record.suspicion
                    );
                    self.system_view.mark_quarantined(record.address(), now_ms);
                    self.system_view.mark_unreachable(record.address(), now_ms);
                }
                Classification::Suspect => {
                    debug!("Peer {} suspect (suspicion {:.2})", sender, record.suspicion)
                }
                Classification::Alive => debug!("Peer {} alive", sender),
            }
        }
    }

    fn cull(&mut self, now_ms: i64) {
        let evicted = self.system_view.cull(now_ms);
        if evicted.is_empty() {
            return;
        }
        self.peers.retain(|_, record| {
            let evict = record.classification == Classification::Dead
                && evicted.contains(&record.address());
            if evict {
                info!("Evicting peer {}", record.latest_state.sender());
            }
            !evict
        });
    }

    fn evaluate_view(&mut self, now_ms: i64) {
        let live: Vec<PeerView> = self
            .peers
            .iter()
            .filter(|(_, record)| record.is_member())
            .map(|(node_id, record)| PeerView {
                node_id: *node_id,
                members: *record.latest_state.view(),
                view_number: record.latest_state.view_number(),
            })
            .collect();
        if let Some(change) = self.aggregator.evaluate(now_ms, &live) {
            self.view_changes.push(change);
            self.refresh_local_state();
        }
    }

    /// Rebuild the local heartbeat from the current view and links.
    fn refresh_local_state(&mut self) {
        let msg_links: NodeIdSet = self
            .peers
            .iter()
            .filter(|(_, record)| record.is_member())
            .map(|(node_id, _)| *node_id)
            .collect();
        let candidate = match self.aggregator.leader() {
            Some(leader) if leader == self.config.identity.node_id => self.config.identity,
            Some(leader) => self
                .peers
                .get(&leader)
                .map(|record| record.latest_state.sender())
                .unwrap_or(Identity::UNDEFINED),
            None => Identity::UNDEFINED,
        };
        self.local_state = self
            .local_state
            .to_builder()
            .candidate(candidate)
            .msg_links(msg_links)
            .view(self.aggregator.view())
            .view_number(self.aggregator.view_number())
            .build();
    }

    fn next_attachment(&mut self) -> Bytes {
        self.attachment_source
            .as_mut()
            .map(|source| source.attachment())
            .unwrap_or_default()
    }
}
