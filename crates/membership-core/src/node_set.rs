//! Fixed-capacity bitset over node ids.
//!
//! Used both for view membership and for message links. The capacity is a
//! cluster-wide constant so the encoded length never varies:
//!
//! ```text
//! [byte length: u32 = 32][32 bitmap bytes, bit i of byte j = id 8*j + i]
//! ```

use crate::wire::{self, WireError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};

const MAX_NODES: usize = 256;
const BITMAP_BYTES: usize = MAX_NODES / 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeIdSet {
    bits: [u64; MAX_NODES / 64],
}

impl NodeIdSet {
    /// Highest node id + 1 that a set can hold.
    pub const CAPACITY: usize = MAX_NODES;

    /// Encoded size: length prefix + bitmap.
    pub const BYTE_SIZE: usize = 4 + BITMAP_BYTES;

    pub fn new() -> Self {
        Self::default()
    }

    fn slot(id: i32) -> Option<(usize, u64)> {
        let id = usize::try_from(id).ok()?;
        if id >= Self::CAPACITY {
            return None;
        }
        Some((id / 64, 1u64 << (id % 64)))
    }

    /// Add an id. Returns false if the id is outside the capacity.
    pub fn insert(&mut self, id: i32) -> bool {
        match Self::slot(id) {
            Some((word, mask)) => {
                self.bits[word] |= mask;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: i32) {
        if let Some((word, mask)) = Self::slot(id) {
            self.bits[word] &= !mask;
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        Self::slot(id)
            .map(|(word, mask)| self.bits[word] & mask != 0)
            .unwrap_or(false)
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (0..Self::CAPACITY as i32).filter(move |id| self.contains(*id))
    }

    /// Lowest id in the set, the conventional leader.
    pub fn lowest(&self) -> Option<i32> {
        self.bits
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| (i * 64) as i32 + w.trailing_zeros() as i32)
    }

    pub fn union(&self, other: &NodeIdSet) -> NodeIdSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        out
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32(BITMAP_BYTES as u32);
        for word in &self.bits {
            // Little-endian inside each word keeps byte j covering ids 8j..8j+7.
            buf.put_slice(&word.to_le_bytes());
        }
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        wire::ensure_remaining(&*buf, Self::BYTE_SIZE, "node id set")?;
        let len = buf.get_u32();
        if len as usize != BITMAP_BYTES {
            return Err(WireError::NodeSetLength(len));
        }
        let mut set = Self::new();
        for word in set.bits.iter_mut() {
            *word = buf.get_u64_le();
        }
        Ok(set)
    }
}

impl FromIterator<i32> for NodeIdSet {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Debug for NodeIdSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
