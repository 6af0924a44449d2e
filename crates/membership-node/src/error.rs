//! Transport and configuration errors.

use membership_core::WireError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the transport.
///
/// All of them are local to one connection or one send; none stops the
/// selector loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Wire(#[from] WireError),

    #[error("Peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: SocketAddr, reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("Transport is shut down")]
    ShutDown,
}

impl TransportError {
    /// Malformed data or a protocol violation, as opposed to an environmental failure.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TransportError::BadMagic(_) | TransportError::FrameTooLarge { .. } | TransportError::Wire(_)
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Node id {0} outside 0..{max}", max = membership_core::NodeIdSet::CAPACITY)]
    NodeIdOutOfRange(i32),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("Invalid address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },
}
