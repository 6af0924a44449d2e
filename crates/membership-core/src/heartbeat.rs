//! The heartbeat state replicated by gossip.
//!
//! A `HeartbeatState` is immutable once built. Its encoded form is computed
//! exactly once, when the value is constructed or decoded, and kept next to the
//! fields; every `with_*` method returns a new value with a fresh encoding.
//! Sending a heartbeat is therefore a copy of already-encoded bytes.

use crate::identity::Identity;
use crate::node_set::NodeIdSet;
use crate::view::{View, UNDEFINED_TIMESTAMP};
use crate::wire::{self, WireError, ADDRESS_BYTE_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;

/// Exact encoded size of a heartbeat, derived from the field layout.
///
/// Changing the shape of any field changes this value and breaks wire
/// compatibility with older nodes.
pub const HEARTBEAT_STATE_BYTE_SIZE: usize = Identity::BYTE_SIZE // candidate
    + NodeIdSet::BYTE_SIZE // msg links
    + 1 // preferred
    + Identity::BYTE_SIZE // sender
    + ADDRESS_BYTE_SIZE // sender address
    + 1 // stable
    + ADDRESS_BYTE_SIZE // test interface
    + NodeIdSet::BYTE_SIZE // view
    + 8 // view number
    + 8; // view timestamp

#[derive(Clone)]
pub struct HeartbeatState {
    candidate: Identity,
    msg_links: NodeIdSet,
    preferred: bool,
    sender: Identity,
    sender_address: SocketAddr,
    stable: bool,
    test_interface: Option<SocketAddr>,
    view: NodeIdSet,
    view_number: i64,
    view_timestamp: i64,
    encoded: Bytes,
}

impl HeartbeatState {
    /// Start building a heartbeat for `sender` reachable at `sender_address`.
    pub fn builder(sender: Identity, sender_address: SocketAddr) -> HeartbeatStateBuilder {
        HeartbeatStateBuilder::new(sender, sender_address)
    }

    /// Decode a heartbeat from exactly `HEARTBEAT_STATE_BYTE_SIZE` leading bytes of `buf`.
    ///
    /// On success `buf` is advanced past the heartbeat. The cached encoding is
    /// rebuilt from the decoded fields, so lenient input (a bool byte above 1,
    /// padding in an address slot) is never relayed as received.
    pub fn read_from(buf: &mut Bytes) -> Result<Self, WireError> {
        wire::ensure_remaining(&*buf, HEARTBEAT_STATE_BYTE_SIZE, "heartbeat")?;
        let received = buf.split_to(HEARTBEAT_STATE_BYTE_SIZE);
        let mut msg = &received[..];

        let candidate = Identity::read_from(&mut msg)?;
        let msg_links = NodeIdSet::read_from(&mut msg)?;
        let preferred = wire::get_bool(&mut msg, "preferred")?;
        let sender = Identity::read_from(&mut msg)?;
        let sender_address =
            wire::get_address(&mut msg, "sender address")?.ok_or(WireError::MissingSenderAddress)?;
        let stable = wire::get_bool(&mut msg, "stable")?;
        let test_interface = wire::get_address(&mut msg, "test interface")?;
        let view = NodeIdSet::read_from(&mut msg)?;
        let view_number = wire::get_i64(&mut msg, "view number")?;
        let view_timestamp = wire::get_i64(&mut msg, "view timestamp")?;

        let builder = HeartbeatStateBuilder {
            candidate,
            msg_links,
            preferred,
            sender,
            sender_address,
            stable,
            test_interface,
            view,
            view_number,
            view_timestamp,
        };
        Ok(builder.build())
    }

    /// Decode a heartbeat from a standalone byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let state = Self::read_from(&mut buf)?;
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes(buf.len()));
        }
        Ok(state)
    }

    /// Copy the cached encoding into `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.encoded);
    }

    /// The cached encoding (always `HEARTBEAT_STATE_BYTE_SIZE` bytes).
    pub fn as_bytes(&self) -> &Bytes {
        &self.encoded
    }

    /// Should `remote` replace `local`?
    ///
    /// A newer incarnation always wins, even with a lower view number; within
    /// the same incarnation the higher view number wins.
    ///
    /// # Panics
    ///
    /// If the two states speak for different members. Callers look states up
    /// by node id, so a mismatch is a local bug.
    pub fn merge_decision(local: &HeartbeatState, remote: &HeartbeatState) -> bool {
        assert!(
            local.sender.equal_id(&remote.sender),
            "merge_decision across different members: {} vs {}",
            local.sender,
            remote.sender
        );
        remote.sender.epoch > local.sender.epoch
            || (remote.sender.epoch == local.sender.epoch && remote.view_number > local.view_number)
    }

    /// Instance form of [`HeartbeatState::merge_decision`] with `self` as the local state.
    pub fn is_superseded_by(&self, remote: &HeartbeatState) -> bool {
        Self::merge_decision(self, remote)
    }

    pub fn to_view(&self) -> View {
        View::new(self.stable, self.view, self.view_timestamp)
    }

    pub fn to_builder(&self) -> HeartbeatStateBuilder {
        HeartbeatStateBuilder {
            candidate: self.candidate,
            msg_links: self.msg_links,
            preferred: self.preferred,
            sender: self.sender,
            sender_address: self.sender_address,
            stable: self.stable,
            test_interface: self.test_interface,
            view: self.view,
            view_number: self.view_number,
            view_timestamp: self.view_timestamp,
        }
    }

    /// Replace view, stability and view timestamp together.
    pub fn with_view(&self, view: &View) -> HeartbeatState {
        self.to_builder().view(view).build()
    }

    pub fn with_view_number(&self, view_number: i64) -> HeartbeatState {
        self.to_builder().view_number(view_number).build()
    }

    pub fn with_msg_links(&self, msg_links: NodeIdSet) -> HeartbeatState {
        self.to_builder().msg_links(msg_links).build()
    }

    pub fn with_candidate(&self, candidate: Identity) -> HeartbeatState {
        self.to_builder().candidate(candidate).build()
    }

    pub fn with_preferred(&self, preferred: bool) -> HeartbeatState {
        self.to_builder().preferred(preferred).build()
    }

    pub fn with_test_interface(&self, test_interface: Option<SocketAddr>) -> HeartbeatState {
        self.to_builder().test_interface(test_interface).build()
    }

    pub fn candidate(&self) -> Identity {
        self.candidate
    }

    pub fn msg_links(&self) -> &NodeIdSet {
        &self.msg_links
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    pub fn sender(&self) -> Identity {
        self.sender
    }

    pub fn sender_address(&self) -> SocketAddr {
        self.sender_address
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn test_interface(&self) -> Option<SocketAddr> {
        self.test_interface
    }

    pub fn view(&self) -> &NodeIdSet {
        &self.view
    }

    pub fn view_number(&self) -> i64 {
        self.view_number
    }

    pub fn view_timestamp(&self) -> i64 {
        self.view_timestamp
    }

    pub fn epoch(&self) -> i64 {
        self.sender.epoch
    }
}

impl PartialEq for HeartbeatState {
    fn eq(&self, other: &Self) -> bool {
        // Encodings are canonical and cover every field.
        self.encoded == other.encoded
    }
}

impl Eq for HeartbeatState {}

impl Debug for HeartbeatState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatState")
            .field("sender", &self.sender)
            .field("sender_address", &self.sender_address)
            .field("stable", &self.stable)
            .field("view", &self.view)
            .field("view_number", &self.view_number)
            .finish_non_exhaustive()
    }
}

/// Builder producing an immutable [`HeartbeatState`] together with its encoding.
#[derive(Debug, Clone)]
pub struct HeartbeatStateBuilder {
    candidate: Identity,
    msg_links: NodeIdSet,
    preferred: bool,
    sender: Identity,
    sender_address: SocketAddr,
    stable: bool,
    test_interface: Option<SocketAddr>,
    view: NodeIdSet,
    view_number: i64,
    view_timestamp: i64,
}

impl HeartbeatStateBuilder {
    pub fn new(sender: Identity, sender_address: SocketAddr) -> Self {
        Self {
            candidate: Identity::UNDEFINED,
            msg_links: NodeIdSet::new(),
            preferred: false,
            sender,
            sender_address,
            stable: false,
            test_interface: None,
            view: NodeIdSet::new(),
            view_number: -1,
            view_timestamp: UNDEFINED_TIMESTAMP,
        }
    }

    pub fn candidate(mut self, candidate: Identity) -> Self {
        self.candidate = candidate;
        self
    }

    pub fn msg_links(mut self, msg_links: NodeIdSet) -> Self {
        self.msg_links = msg_links;
        self
    }

    pub fn preferred(mut self, preferred: bool) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn sender_address(mut self, sender_address: SocketAddr) -> Self {
        self.sender_address = sender_address;
        self
    }

    pub fn test_interface(mut self, test_interface: Option<SocketAddr>) -> Self {
        self.test_interface = test_interface;
        self
    }

    /// Set membership, stability and timestamp from a view.
    pub fn view(mut self, view: &View) -> Self {
        self.view = view.members;
        self.stable = view.stable;
        self.view_timestamp = view.timestamp;
        self
    }

    pub fn view_number(mut self, view_number: i64) -> Self {
        self.view_number = view_number;
        self
    }

    pub fn build(self) -> HeartbeatState {
        let mut buf = BytesMut::with_capacity(HEARTBEAT_STATE_BYTE_SIZE);
        self.candidate.write_to(&mut buf);
        self.msg_links.write_to(&mut buf);
        wire::put_bool(&mut buf, self.preferred);
        self.sender.write_to(&mut buf);
        wire::put_address(&mut buf, Some(&self.sender_address));
        wire::put_bool(&mut buf, self.stable);
        wire::put_address(&mut buf, self.test_interface.as_ref());
        self.view.write_to(&mut buf);
        buf.put_i64(self.view_number);
        buf.put_i64(self.view_timestamp);
        debug_assert_eq!(buf.len(), HEARTBEAT_STATE_BYTE_SIZE);

        HeartbeatState {
            candidate: self.candidate,
            msg_links: self.msg_links,
            preferred: self.preferred,
            sender: self.sender,
            sender_address: self.sender_address,
            stable: self.stable,
            test_interface: self.test_interface,
            view: self.view,
            view_number: self.view_number,
            view_timestamp: self.view_timestamp,
            encoded: buf.freeze(),
        }
    }
}
