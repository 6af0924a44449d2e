//! Derives the local view from per-peer liveness.

use crate::node_set::NodeIdSet;
use crate::view::{View, ViewChange};
use tracing::{debug, info};

/// What a live peer currently advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub node_id: i32,
    pub members: NodeIdSet,
    pub view_number: i64,
}

/// Converging, versioned view of reachable members.
///
/// The member set is `{self}` plus every live peer. On a set change the view
/// number moves past everything seen so far (own and live peers'), so nodes
/// that converge to the same set end up on the same number. A peer
/// advertising the same set with a higher number is adopted. Once nothing has
/// changed for the quiescence period the view is marked stable.
#[derive(Debug, Clone)]
pub struct ViewAggregator {
    local_id: i32,
    quiescence_ms: i64,
    view: View,
    view_number: i64,
    last_change_ms: i64,
}

impl ViewAggregator {
    pub fn new(local_id: i32, quiescence_ms: i64, now_ms: i64) -> Self {
        Self {
            local_id,
            quiescence_ms,
            view: View::singleton(local_id, now_ms),
            view_number: 0,
            last_change_ms: now_ms,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn view_number(&self) -> i64 {
        self.view_number
    }

    pub fn leader(&self) -> Option<i32> {
        self.view.leader()
    }

    pub fn current(&self) -> ViewChange {
        ViewChange::new(self.view, self.view_number)
    }

    /// Recompute the view from the currently live peers.
    ///
    /// Returns the change to notify, if any.
    pub fn evaluate(&mut self, now_ms: i64, live_peers: &[PeerView]) -> Option<ViewChange> {
        let mut members = NodeIdSet::new();
        members.insert(self.local_id);
        for peer in live_peers {
            members.insert(peer.node_id);
        }

        if members != self.view.members {
            let highest_seen = live_peers
                .iter()
                .map(|p| p.view_number)
                .fold(self.view_number, i64::max);
            self.view_number = highest_seen + 1;
            self.view = View::new(false, members, now_ms);
            self.last_change_ms = now_ms;
            info!(
                "View changed to {:?} (number {})",
                self.view.members, self.view_number
            );
            return Some(self.current());
        }

        let agreed = live_peers
            .iter()
            .filter(|p| p.members == members)
            .map(|p| p.view_number)
            .max();
        if let Some(agreed) = agreed.filter(|n| *n > self.view_number) {
            debug!(
                "Adopting view number {} for {:?} (was {})",
                agreed, members, self.view_number
            );
            self.view_number = agreed;
            self.view.stable = false;
            self.last_change_ms = now_ms;
            return Some(self.current());
        }

        if !self.view.stable && now_ms - self.last_change_ms >= self.quiescence_ms {
            self.view.stable = true;
            info!(
                "View {:?} stable (number {})",
                self.view.members, self.view_number
            );
            return Some(self.current());
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: i32, members: &[i32], view_number: i64) -> PeerView {
        PeerView {
            node_id,
            members: members.iter().copied().collect(),
            view_number,
        }
    }

    #[test]
    fn test_starts_as_singleton() {
        let agg = ViewAggregator::new(3, 2000, 0);
        assert_eq!(agg.view().members.iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(agg.view_number(), 0);
        assert!(!agg.view().stable);
        assert_eq!(agg.leader(), Some(3));
    }

    #[test]
    fn test_membership_change_bumps_past_peers() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        let change = agg.evaluate(100, &[peer(1, &[1], 7)]).unwrap();
        assert_eq!(change.view_number, 8);
        assert_eq!(change.view.members.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!change.view.stable);
        assert_eq!(change.leader, 0);
    }

    #[test]
    fn test_no_change_no_notification() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        agg.evaluate(100, &[peer(1, &[0, 1], 1)]);
        assert!(agg.evaluate(200, &[peer(1, &[0, 1], 1)]).is_none());
    }

    #[test]
    fn test_adopts_higher_number_for_same_set() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        agg.evaluate(100, &[peer(1, &[1], 0)]);
        assert_eq!(agg.view_number(), 1);

        let change = agg.evaluate(200, &[peer(1, &[0, 1], 5)]).unwrap();
        assert_eq!(change.view_number, 5);
        assert!(!change.view.stable);
    }

    #[test]
    fn test_ignores_higher_number_for_different_set() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        agg.evaluate(100, &[peer(1, &[1], 0)]);
        assert!(agg.evaluate(200, &[peer(1, &[0, 1, 2], 9)]).is_none());
        assert_eq!(agg.view_number(), 1);
    }

    #[test]
    fn test_becomes_stable_after_quiescence() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        let peers = [peer(1, &[0, 1], 1)];
        agg.evaluate(1000, &peers);
        assert!(agg.evaluate(2999, &peers).is_none());
        let change = agg.evaluate(3000, &peers).unwrap();
        assert!(change.view.stable);
        assert_eq!(change.view_number, 1);
        // Only notified once
        assert!(agg.evaluate(4000, &peers).is_none());
    }

    #[test]
    fn test_losing_a_peer_increases_number() {
        let mut agg = ViewAggregator::new(0, 2000, 0);
        agg.evaluate(0, &[peer(1, &[0, 1, 2], 4), peer(2, &[0, 1, 2], 4)]);
        let before = agg.view_number();
        let change = agg.evaluate(5000, &[peer(1, &[0, 1, 2], 4)]).unwrap();
        assert!(change.view_number > before);
        assert_eq!(change.view.members.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_view_number_never_decreases() {
        let mut agg = ViewAggregator::new(0, 100, 0);
        let mut last = agg.view_number();
        let scenarios: [&[PeerView]; 5] = [
            &[peer(1, &[1], 10)],
            &[],
            &[peer(1, &[0, 1], 3)],
            &[peer(2, &[2], 0), peer(1, &[0, 1], 1)],
            &[],
        ];
        for (i, live) in scenarios.iter().enumerate() {
            agg.evaluate(i as i64 * 1000, live);
            assert!(agg.view_number() >= last);
            last = agg.view_number();
        }
    }
}
