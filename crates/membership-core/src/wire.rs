//! Fixed-layout binary codec primitives.
//!
//! Every value exchanged between nodes has an encoded size known before
//! encoding, so a heartbeat buffer can be sized once and reused. All integers
//! are big-endian.
//!
//! Socket addresses use a fixed 20-byte slot:
//!
//! ```text
//! [family: u8][addr len: u8][16 address bytes, zero padded][port: u16]
//! ```
//!
//! Family `0` is the "no address" sentinel, `4` is IPv4 and `6` is IPv6.

use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Encoded size of an optional socket address.
pub const ADDRESS_BYTE_SIZE: usize = 1 + 1 + 16 + 2;

const FAMILY_NONE: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Malformed wire data.
///
/// Always local to the connection that produced it: the frame is dropped and
/// the connection closed, nothing else is affected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("Unrecognized address family tag: {0}")]
    UnknownAddressFamily(u8),

    #[error("Address length {len} does not match family {family}")]
    AddressLength { family: u8, len: u8 },

    #[error("Node id set length {0} does not match the cluster capacity")]
    NodeSetLength(u32),

    #[error("Heartbeat is missing its sender address")]
    MissingSenderAddress,

    #[error("Unknown gossip message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Fail with `Truncated` unless `buf` holds at least `needed` bytes.
pub fn ensure_remaining(buf: &impl Buf, needed: usize, field: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool(buf: &mut impl Buf, field: &'static str) -> Result<bool> {
    ensure_remaining(&*buf, 1, field)?;
    Ok(buf.get_u8() > 0)
}

pub fn get_i64(buf: &mut impl Buf, field: &'static str) -> Result<i64> {
    ensure_remaining(&*buf, 8, field)?;
    Ok(buf.get_i64())
}

/// Write an optional address into its fixed 20-byte slot.
pub fn put_address(buf: &mut impl BufMut, address: Option<&SocketAddr>) {
    let mut raw = [0u8; 16];
    let (family, len, port) = match address {
        None => (FAMILY_NONE, 0u8, 0u16),
        Some(SocketAddr::V4(v4)) => {
            raw[..4].copy_from_slice(&v4.ip().octets());
            (FAMILY_V4, 4, v4.port())
        }
        Some(SocketAddr::V6(v6)) => {
            raw.copy_from_slice(&v6.ip().octets());
            (FAMILY_V6, 16, v6.port())
        }
    };
    buf.put_u8(family);
    buf.put_u8(len);
    buf.put_slice(&raw);
    buf.put_u16(port);
}

/// Read an optional address from its fixed 20-byte slot.
pub fn get_address(buf: &mut impl Buf, field: &'static str) -> Result<Option<SocketAddr>> {
    ensure_remaining(&*buf, ADDRESS_BYTE_SIZE, field)?;
    let family = buf.get_u8();
    let len = buf.get_u8();
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    let port = buf.get_u16();

    let ip = match (family, len) {
        (FAMILY_NONE, 0) => return Ok(None),
        (FAMILY_V4, 4) => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
        (FAMILY_V6, 16) => IpAddr::V6(Ipv6Addr::from(raw)),
        (FAMILY_NONE | FAMILY_V4 | FAMILY_V6, len) => {
            return Err(WireError::AddressLength { family, len });
        }
        (other, _) => return Err(WireError::UnknownAddressFamily(other)),
    };
    Ok(Some(SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(address: Option<&SocketAddr>) -> Vec<u8> {
        let mut buf = Vec::new();
        put_address(&mut buf, address);
        buf
    }

    #[test]
    fn test_ipv4_address_roundtrip() {
        let addr: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        let bytes = encode(Some(&addr));
        assert_eq!(bytes.len(), ADDRESS_BYTE_SIZE);
        assert_eq!(get_address(&mut &bytes[..], "addr").unwrap(), Some(addr));
    }

    #[test]
    fn test_ipv6_address_roundtrip() {
        let addr: SocketAddr = "[fe80::1:2]:65535".parse().unwrap();
        let bytes = encode(Some(&addr));
        assert_eq!(bytes.len(), ADDRESS_BYTE_SIZE);
        assert_eq!(get_address(&mut &bytes[..], "addr").unwrap(), Some(addr));
    }

    #[test]
    fn test_absent_address_sentinel() {
        let bytes = encode(None);
        assert_eq!(bytes.len(), ADDRESS_BYTE_SIZE);
        assert_eq!(bytes[0], 0);
        assert_eq!(get_address(&mut &bytes[..], "addr").unwrap(), None);
    }

    #[test]
    fn test_unknown_family_rejected() {
        let mut bytes = encode(None);
        bytes[0] = 9;
        assert_eq!(
            get_address(&mut &bytes[..], "addr"),
            Err(WireError::UnknownAddressFamily(9))
        );
    }

    #[test]
    fn test_family_length_mismatch_rejected() {
        let addr: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        let mut bytes = encode(Some(&addr));
        bytes[1] = 16;
        assert_eq!(
            get_address(&mut &bytes[..], "addr"),
            Err(WireError::AddressLength { family: 4, len: 16 })
        );
    }

    #[test]
    fn test_truncated_address() {
        let addr: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        let bytes = encode(Some(&addr));
        let err = get_address(&mut &bytes[..10], "sender_address").unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                field: "sender_address",
                needed: ADDRESS_BYTE_SIZE,
                remaining: 10
            }
        );
    }

    #[test]
    fn test_bool_encoding() {
        let mut buf = Vec::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);
        assert_eq!(buf, vec![1, 0]);
        let mut cursor = &buf[..];
        assert!(get_bool(&mut cursor, "a").unwrap());
        assert!(!get_bool(&mut cursor, "b").unwrap());
        assert!(get_bool(&mut cursor, "c").is_err());
    }
}
