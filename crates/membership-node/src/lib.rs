//! membership-node: networked group membership on tokio.
//!
//! Wraps the sans-IO engine from `membership-core` with a framed TCP
//! transport, a gossip task and configuration, and exposes the pieces for the
//! binary and for integration tests.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod multiplexer;
pub mod node;
pub mod pool;
pub mod security;

// Re-export key types for convenience
pub use config::{GossipConfig, NodeConfig, TransportConfig};
pub use connection::Role;
pub use error::{ConfigError, TransportError};
pub use frame::{encode_frame, FRAME_MAGIC, HEADER_LEN};
pub use multiplexer::{MessageHandler, Multiplexer};
pub use node::{Attachments, MembershipNode};
pub use security::{NoSecurity, WireSecurity};
