//! Wire security hook.
//!
//! Payloads pass through `wrap` after encoding and before framing, and through
//! `unwrap` after de-framing and before decoding. Only the pass-through
//! implementation ships; authentication and encryption are left to whoever
//! plugs in their own implementation.

use crate::error::TransportError;
use bytes::Bytes;

pub trait WireSecurity: Send + Sync {
    fn wrap(&self, payload: Bytes) -> Result<Bytes, TransportError>;
    fn unwrap(&self, payload: Bytes) -> Result<Bytes, TransportError>;
}

/// Pass-through security.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecurity;

impl WireSecurity for NoSecurity {
    fn wrap(&self, payload: Bytes) -> Result<Bytes, TransportError> {
        Ok(payload)
    }

    fn unwrap(&self, payload: Bytes) -> Result<Bytes, TransportError> {
        Ok(payload)
    }
}
