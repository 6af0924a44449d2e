//! Gossip messages carried as frame payloads.
//!
//! Three-step anti-entropy exchange:
//!
//! 1. `Gossip`: initiator's own heartbeat plus a digest of every other state it holds
//! 2. `Reply`: responder's own heartbeat, the states the initiator is missing,
//!    and requests for states the responder is missing
//! 3. `Update`: initiator's answer to those requests
//!
//! ```text
//! Gossip: [0][heartbeat][n: u16][n digests][attachment len: u32][attachment]
//! Reply:  [1][heartbeat][n: u16][n heartbeats][m: u16][m digests][len: u32][attachment]
//! Update: [2][n: u16][n heartbeats]
//! ```

use crate::heartbeat::{HeartbeatState, HEARTBEAT_STATE_BYTE_SIZE};
use crate::identity::Identity;
use crate::wire::{self, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const KIND_GOSSIP: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_UPDATE: u8 = 2;

/// Compact "which version of this member do you have".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    pub identity: Identity,
    pub view_number: i64,
}

impl Digest {
    pub const BYTE_SIZE: usize = Identity::BYTE_SIZE + 8;

    pub fn of(state: &HeartbeatState) -> Self {
        Self {
            identity: state.sender(),
            view_number: state.view_number(),
        }
    }

    /// Is the state described by this digest newer than `state`?
    ///
    /// Same ordering as [`HeartbeatState::merge_decision`].
    pub fn is_newer_than(&self, state: &HeartbeatState) -> bool {
        self.supersedes(&Digest::of(state))
    }

    /// Does this digest describe a newer version than `other`?
    pub fn supersedes(&self, other: &Digest) -> bool {
        self.identity.epoch > other.identity.epoch
            || (self.identity.epoch == other.identity.epoch && self.view_number > other.view_number)
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        self.identity.write_to(buf);
        buf.put_i64(self.view_number);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        let identity = Identity::read_from(buf)?;
        let view_number = wire::get_i64(buf, "digest view number")?;
        Ok(Self {
            identity,
            view_number,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    Gossip {
        state: HeartbeatState,
        digests: Vec<Digest>,
        attachment: Bytes,
    },
    Reply {
        state: HeartbeatState,
        states: Vec<HeartbeatState>,
        requests: Vec<Digest>,
        attachment: Bytes,
    },
    Update {
        states: Vec<HeartbeatState>,
    },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Gossip { .. } => "gossip",
            GossipMessage::Reply { .. } => "reply",
            GossipMessage::Update { .. } => "update",
        }
    }

    /// The sender's own heartbeat, if the message carries one.
    pub fn direct_state(&self) -> Option<&HeartbeatState> {
        match self {
            GossipMessage::Gossip { state, .. } | GossipMessage::Reply { state, .. } => {
                Some(state)
            }
            GossipMessage::Update { .. } => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            GossipMessage::Gossip {
                digests,
                attachment,
                ..
            } => {
                1 + HEARTBEAT_STATE_BYTE_SIZE
                    + 2
                    + digests.len() * Digest::BYTE_SIZE
                    + 4
                    + attachment.len()
            }
            GossipMessage::Reply {
                states,
                requests,
                attachment,
                ..
            } => {
                1 + HEARTBEAT_STATE_BYTE_SIZE
                    + 2
                    + states.len() * HEARTBEAT_STATE_BYTE_SIZE
                    + 2
                    + requests.len() * Digest::BYTE_SIZE
                    + 4
                    + attachment.len()
            }
            GossipMessage::Update { states } => 1 + 2 + states.len() * HEARTBEAT_STATE_BYTE_SIZE,
        }
    }

    /// Encode into a single buffer.
    ///
    /// Lists longer than `u16::MAX` entries are truncated; a cluster is capped
    /// at `NodeIdSet::CAPACITY` members so this never happens in practice.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            GossipMessage::Gossip {
                state,
                digests,
                attachment,
            } => {
                buf.put_u8(KIND_GOSSIP);
                state.write_to(&mut buf);
                put_digests(&mut buf, digests);
                put_attachment(&mut buf, attachment);
            }
            GossipMessage::Reply {
                state,
                states,
                requests,
                attachment,
            } => {
                buf.put_u8(KIND_REPLY);
                state.write_to(&mut buf);
                put_states(&mut buf, states);
                put_digests(&mut buf, requests);
                put_attachment(&mut buf, attachment);
            }
            GossipMessage::Update { states } => {
                buf.put_u8(KIND_UPDATE);
                put_states(&mut buf, states);
            }
        }
        buf.freeze()
    }

    /// Decode a complete frame payload. Trailing bytes are an error.
    pub fn decode(payload: Bytes) -> Result<Self, WireError> {
        let mut buf = payload;
        wire::ensure_remaining(&buf, 1, "message kind")?;
        let message = match buf.get_u8() {
            KIND_GOSSIP => GossipMessage::Gossip {
                state: HeartbeatState::read_from(&mut buf)?,
                digests: get_digests(&mut buf)?,
                attachment: get_attachment(&mut buf)?,
            },
            KIND_REPLY => GossipMessage::Reply {
                state: HeartbeatState::read_from(&mut buf)?,
                states: get_states(&mut buf)?,
                requests: get_digests(&mut buf)?,
                attachment: get_attachment(&mut buf)?,
            },
            KIND_UPDATE => GossipMessage::Update {
                states: get_states(&mut buf)?,
            },
            other => return Err(WireError::UnknownMessageKind(other)),
        };
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}

fn count(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn put_digests(buf: &mut BytesMut, digests: &[Digest]) {
    let n = count(digests.len());
    buf.put_u16(n);
    for digest in digests.iter().take(n as usize) {
        digest.write_to(buf);
    }
}

fn put_states(buf: &mut BytesMut, states: &[HeartbeatState]) {
    let n = count(states.len());
    buf.put_u16(n);
    for state in states.iter().take(n as usize) {
        state.write_to(buf);
    }
}

fn put_attachment(buf: &mut BytesMut, attachment: &Bytes) {
    buf.put_u32(attachment.len() as u32);
    buf.put_slice(attachment);
}

fn get_count(buf: &mut Bytes, field: &'static str, item_size: usize) -> Result<usize, WireError> {
    wire::ensure_remaining(&*buf, 2, field)?;
    let n = buf.get_u16() as usize;
    // Reject impossible counts before allocating.
    wire::ensure_remaining(&*buf, n * item_size, field)?;
    Ok(n)
}

fn get_digests(buf: &mut Bytes) -> Result<Vec<Digest>, WireError> {
    let n = get_count(buf, "digests", Digest::BYTE_SIZE)?;
    (0..n).map(|_| Digest::read_from(buf)).collect()
}

fn get_states(buf: &mut Bytes) -> Result<Vec<HeartbeatState>, WireError> {
    let n = get_count(buf, "states", HEARTBEAT_STATE_BYTE_SIZE)?;
    (0..n).map(|_| HeartbeatState::read_from(buf)).collect()
}

fn get_attachment(buf: &mut Bytes) -> Result<Bytes, WireError> {
    wire::ensure_remaining(&*buf, 4, "attachment length")?;
    let len = buf.get_u32() as usize;
    wire::ensure_remaining(&*buf, len, "attachment")?;
    Ok(buf.split_to(len))
}
