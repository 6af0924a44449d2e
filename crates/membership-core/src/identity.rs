//! Identity: who a heartbeat speaks for.
//!
//! `magic` partitions unrelated clusters sharing a network, `node_id` names a
//! member inside the cluster, and `epoch` grows every time the process
//! restarts so state from an older incarnation is recognizably stale.

use crate::wire::{self, WireError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub magic: i32,
    pub node_id: i32,
    pub epoch: i64,
}

impl Identity {
    /// Encoded size: magic (4) + node id (4) + epoch (8).
    pub const BYTE_SIZE: usize = 4 + 4 + 8;

    /// Placeholder used where no identity is known (e.g. no candidate).
    pub const UNDEFINED: Identity = Identity {
        magic: -1,
        node_id: -1,
        epoch: -1,
    };

    pub fn new(magic: i32, node_id: i32, epoch: i64) -> Self {
        Self {
            magic,
            node_id,
            epoch,
        }
    }

    /// Create an identity whose epoch is the current wall-clock time.
    ///
    /// A restarted process always gets a larger epoch than its previous
    /// incarnation, without persisting anything.
    pub fn with_fresh_epoch(magic: i32, node_id: i32) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self::new(magic, node_id, epoch)
    }

    /// Same member of the same cluster, ignoring the epoch.
    pub fn equal_id(&self, other: &Identity) -> bool {
        self.magic == other.magic && self.node_id == other.node_id
    }

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_i32(self.node_id);
        buf.put_i64(self.epoch);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        wire::ensure_remaining(&*buf, Self::BYTE_SIZE, "identity")?;
        Ok(Self {
            magic: buf.get_i32(),
            node_id: buf.get_i32(),
            epoch: buf.get_i64(),
        })
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.magic, self.node_id, self.epoch)
    }
}
