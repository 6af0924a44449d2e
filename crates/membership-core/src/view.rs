//! Views and view-change notifications.

use crate::node_set::NodeIdSet;
use serde::{Deserialize, Serialize};

/// The agreed set of reachable members.
///
/// `stable == false` marks a view that is still converging. The version of a
/// view (`view_number`) is tracked alongside it, see [`ViewChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct View {
    pub stable: bool,
    pub members: NodeIdSet,
    pub timestamp: i64,
}

/// Timestamp of a view that has never been formed.
pub const UNDEFINED_TIMESTAMP: i64 = -1;

impl View {
    pub fn new(stable: bool, members: NodeIdSet, timestamp: i64) -> Self {
        Self {
            stable,
            members,
            timestamp,
        }
    }

    /// A one-member view containing only `node_id`.
    pub fn singleton(node_id: i32, timestamp: i64) -> Self {
        Self::new(false, std::iter::once(node_id).collect(), timestamp)
    }

    /// Leader by convention: the lowest surviving node id.
    pub fn leader(&self) -> Option<i32> {
        self.members.lowest()
    }

    pub fn cardinality(&self) -> usize {
        self.members.len()
    }
}

/// One notification handed to [`ViewListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewChange {
    pub view: View,
    pub view_number: i64,
    /// Lowest member id, or -1 for an empty view.
    pub leader: i32,
}

impl ViewChange {
    pub fn new(view: View, view_number: i64) -> Self {
        Self {
            view,
            view_number,
            leader: view.leader().unwrap_or(-1),
        }
    }
}

/// Application-level consumer of view changes.
///
/// Invoked from the notification thread, never from the gossip round, so a
/// slow listener delays only later notifications.
pub trait ViewListener: Send + Sync {
    fn on_view_change(&self, change: &ViewChange);
}

impl<F> ViewListener for F
where
    F: Fn(&ViewChange) + Send + Sync,
{
    fn on_view_change(&self, change: &ViewChange) {
        self(change)
    }
}
