//! membership-core: runtime-independent group membership and failure detection.
//!
//! This crate provides:
//! - The replicated heartbeat state and its fixed-layout binary encoding
//! - Gossip messages for digest-based anti-entropy
//! - Accrual failure detectors (phi and adaptive)
//! - The sans-IO gossip engine, driven by explicit timestamps
//! - View aggregation and asynchronous view-change delivery
//!
//! Networking lives in `membership-node`; nothing here performs I/O.

pub mod aggregator;
pub mod detector;
pub mod engine;
pub mod heartbeat;
pub mod identity;
pub mod message;
pub mod node_set;
pub mod stability;
pub mod system_view;
pub mod view;
pub mod wire;

#[cfg(test)]
mod simulation;

pub use aggregator::{PeerView, ViewAggregator};
pub use detector::{
    AdaptiveDetector, DetectorConfig, DetectorKind, FailureDetector, PhiAccrualDetector,
};
pub use engine::{
    AttachmentHandler, AttachmentSource, Classification, EngineConfig, GossipEngine, Outbound,
    PeerRecord,
};
pub use heartbeat::{HeartbeatState, HeartbeatStateBuilder, HEARTBEAT_STATE_BYTE_SIZE};
pub use identity::Identity;
pub use message::{Digest, GossipMessage};
pub use node_set::NodeIdSet;
pub use stability::{StabilityQueue, Subscription};
pub use system_view::{MemberStatus, SystemView, SystemViewConfig};
pub use view::{View, ViewChange, ViewListener};
pub use wire::WireError;
