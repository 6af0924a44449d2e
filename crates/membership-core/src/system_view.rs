//! Gossip target selection policy.
//!
//! Tracks every known member address as live or unreachable, plus a short
//! quarantine window for members that were just declared dead. Each round asks
//! for targets with [`SystemView::next_gossip_targets`]:
//!
//! - live members least recently contacted come first
//! - quarantined members are never chosen, whatever their status
//! - a seed that is not (yet) live is added every round
//! - one unreachable member is probed with probability `unreachable / (live + 1)`

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemViewConfig {
    /// Bootstrap addresses contacted until they become live
    pub seeds: Vec<SocketAddr>,
    /// How long a freshly dead member is excluded from targeting
    pub quarantine_delay_ms: i64,
    /// How long an unreachable member is remembered before eviction
    pub unreachable_node_delay_ms: i64,
}

impl Default for SystemViewConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            quarantine_delay_ms: 1000,
            unreachable_node_delay_ms: 500_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Live,
    Unreachable { since_ms: i64 },
}

#[derive(Debug, Clone)]
struct MemberEntry {
    status: MemberStatus,
    last_contacted_ms: Option<i64>,
    quarantined_until_ms: Option<i64>,
}

impl MemberEntry {
    fn live() -> Self {
        Self {
            status: MemberStatus::Live,
            last_contacted_ms: None,
            quarantined_until_ms: None,
        }
    }

    fn is_quarantined(&self, now_ms: i64) -> bool {
        self.quarantined_until_ms.is_some_and(|until| now_ms < until)
    }
}

pub struct SystemView {
    local: SocketAddr,
    config: SystemViewConfig,
    members: BTreeMap<SocketAddr, MemberEntry>,
    rng: StdRng,
}

impl SystemView {
    pub fn new(local: SocketAddr, config: SystemViewConfig) -> Self {
        Self::with_rng(local, config, StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic target selection for tests and simulations.
    pub fn with_seed(local: SocketAddr, config: SystemViewConfig, seed: u64) -> Self {
        Self::with_rng(local, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(local: SocketAddr, config: SystemViewConfig, rng: StdRng) -> Self {
        Self {
            local,
            config,
            members: BTreeMap::new(),
            rng,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Learn about a member. Unknown members start live; known ones are untouched.
    ///
    /// Returns true if the address was not known before.
    pub fn discover(&mut self, addr: SocketAddr) -> bool {
        if addr == self.local || self.members.contains_key(&addr) {
            return false;
        }
        debug!("Discovered member {}", addr);
        self.members.insert(addr, MemberEntry::live());
        true
    }

    /// Direct evidence that `addr` is up: it becomes live again.
    pub fn mark_contacted(&mut self, addr: SocketAddr, now_ms: i64) {
        if addr == self.local {
            return;
        }
        let entry = self.members.entry(addr).or_insert_with(MemberEntry::live);
        if let MemberStatus::Unreachable { .. } = entry.status {
            debug!("Member {} reachable again", addr);
        }
        entry.status = MemberStatus::Live;
        entry.last_contacted_ms = Some(now_ms);
    }

    /// Record a failed send or a conviction. Keeps the original timestamp
    /// if the member is already unreachable.
    pub fn mark_unreachable(&mut self, addr: SocketAddr, now_ms: i64) {
        if addr == self.local {
            return;
        }
        let entry = self.members.entry(addr).or_insert_with(MemberEntry::live);
        if entry.status == MemberStatus::Live {
            debug!("Member {} unreachable", addr);
            entry.status = MemberStatus::Unreachable { since_ms: now_ms };
        }
    }

    /// Exclude `addr` from targeting for the quarantine delay.
    pub fn mark_quarantined(&mut self, addr: SocketAddr, now_ms: i64) {
        if addr == self.local {
            return;
        }
        let until = now_ms + self.config.quarantine_delay_ms;
        let entry = self.members.entry(addr).or_insert_with(MemberEntry::live);
        entry.quarantined_until_ms = Some(until);
    }

    pub fn is_quarantined(&self, addr: &SocketAddr, now_ms: i64) -> bool {
        self.members
            .get(addr)
            .is_some_and(|entry| entry.is_quarantined(now_ms))
    }

    pub fn status(&self, addr: &SocketAddr) -> Option<MemberStatus> {
        self.members.get(addr).map(|entry| entry.status)
    }

    pub fn is_live(&self, addr: &SocketAddr) -> bool {
        self.status(addr) == Some(MemberStatus::Live)
    }

    pub fn live_members(&self) -> Vec<SocketAddr> {
        self.members_with(|status| status == MemberStatus::Live)
    }

    pub fn unreachable_members(&self) -> Vec<SocketAddr> {
        self.members_with(|status| matches!(status, MemberStatus::Unreachable { .. }))
    }

    fn members_with(&self, pred: impl Fn(MemberStatus) -> bool) -> Vec<SocketAddr> {
        self.members
            .iter()
            .filter(|(_, entry)| pred(entry.status))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Pick this round's gossip targets and record them as contacted.
    pub fn next_gossip_targets(&mut self, now_ms: i64, fanout: usize) -> Vec<SocketAddr> {
        // Quarantine is checked before anything else.
        let mut live: Vec<(Option<i64>, SocketAddr)> = self
            .members
            .iter()
            .filter(|(_, e)| !e.is_quarantined(now_ms) && e.status == MemberStatus::Live)
            .map(|(addr, e)| (e.last_contacted_ms, *addr))
            .collect();
        let live_count = live.len();
        // None sorts first: never-contacted members go before everyone else.
        live.sort();

        let mut targets: Vec<SocketAddr> =
            live.into_iter().take(fanout).map(|(_, addr)| addr).collect();

        let pending_seeds: Vec<SocketAddr> = self
            .config
            .seeds
            .iter()
            .copied()
            .filter(|seed| {
                *seed != self.local
                    && !self.is_live(seed)
                    && !self.is_quarantined(seed, now_ms)
                    && !targets.contains(seed)
            })
            .collect();
        if let Some(seed) = pending_seeds.choose(&mut self.rng) {
            targets.push(*seed);
        }

        let unreachable: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|(addr, e)| {
                !e.is_quarantined(now_ms)
                    && matches!(e.status, MemberStatus::Unreachable { .. })
                    && !targets.contains(addr)
            })
            .map(|(addr, _)| *addr)
            .collect();
        if !unreachable.is_empty() {
            let probability = (unreachable.len() as f64 / (live_count + 1) as f64).min(1.0);
            if self.rng.random_bool(probability) {
                if let Some(addr) = unreachable.choose(&mut self.rng) {
                    debug!("Probing unreachable member {}", addr);
                    targets.push(*addr);
                }
            }
        }

        for addr in &targets {
            if let Some(entry) = self.members.get_mut(addr) {
                entry.last_contacted_ms = Some(now_ms);
            }
        }
        targets
    }

    /// Evict members unreachable for longer than the unreachable-node delay.
    ///
    /// Returns the evicted addresses.
    pub fn cull(&mut self, now_ms: i64) -> Vec<SocketAddr> {
        let delay = self.config.unreachable_node_delay_ms;
        let evicted: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|(_, e)| match e.status {
                MemberStatus::Unreachable { since_ms } => now_ms - since_ms >= delay,
                MemberStatus::Live => false,
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &evicted {
            debug!("Evicting member {}", addr);
            self.members.remove(addr);
        }
        for entry in self.members.values_mut() {
            if !entry.is_quarantined(now_ms) {
                entry.quarantined_until_ms = None;
            }
        }
        evicted
    }
}
