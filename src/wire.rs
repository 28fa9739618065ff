//! Versioned binary codec shared by the gossip messages. Endpoint
//! identities use the compact size-prefixed layout; everything else is
//! built from the length-prefixed helpers below. All integers travel in
//! network byte order.

use crate::endpoint::{EndpointId, NodeAddr};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use uuid::Uuid;

/// Protocol versions understood by this node. Peers older than
/// [`VERSION_40`] serialize endpoints as a bare address.
pub const VERSION_30: u32 = 30;
pub const VERSION_40: u32 = 40;
pub const CURRENT_VERSION: u32 = VERSION_40;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected endpoint size prefix {0}")]
    UnexpectedSize(u8),
    #[error("unexpected end of frame")]
    Truncated,
    #[error("invalid UTF-8 in frame payload")]
    InvalidUtf8,
    #[error("unknown application state ordinal {0}")]
    UnknownStateKey(u32),
    #[error("unknown message wire id {0:#x}")]
    UnknownMessage(u8),
}

pub(crate) fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn read_u8(bytes: &mut &[u8]) -> Result<u8, ProtocolError> {
    let (&first, rest) = bytes.split_first().ok_or(ProtocolError::Truncated)?;
    *bytes = rest;
    Ok(first)
}

pub(crate) fn read_exact<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProtocolError> {
    if bytes.len() < n {
        return Err(ProtocolError::Truncated);
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

pub(crate) fn read_u16(bytes: &mut &[u8]) -> Result<u16, ProtocolError> {
    let raw = read_exact(bytes, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

pub(crate) fn read_i32(bytes: &mut &[u8]) -> Result<i32, ProtocolError> {
    let raw = read_exact(bytes, 4)?;
    Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_u32(bytes: &mut &[u8]) -> Result<u32, ProtocolError> {
    let raw = read_exact(bytes, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_u64(bytes: &mut &[u8]) -> Result<u64, ProtocolError> {
    let raw = read_exact(bytes, 8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(raw);
    Ok(u64::from_be_bytes(out))
}

pub(crate) fn read_string(bytes: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = read_u32(bytes)? as usize;
    let raw = read_exact(bytes, len)?;
    let value = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(value.to_string())
}

/// Serializes the broadcast identity of an endpoint. Peers at
/// [`VERSION_40`] and later receive the address, the port and, once it has
/// been learned, the host UUID; an identity still carrying the nil
/// sentinel goes out in the shorter address-and-port layout rather than
/// announcing sixteen zero bytes as a real id. Older peers receive only
/// the raw address bytes.
pub fn write_endpoint(buf: &mut Vec<u8>, endpoint: &EndpointId, version: u32) {
    let addr = endpoint.broadcast.ip_bytes();
    if version < VERSION_40 {
        write_u8(buf, addr.len() as u8);
        buf.extend_from_slice(&addr);
    } else if endpoint.has_nil_host_id() {
        write_endpoint_without_host_id(buf, endpoint);
    } else {
        write_u8(buf, (addr.len() + 2 + 16) as u8);
        buf.extend_from_slice(&addr);
        write_u16(buf, endpoint.broadcast.port);
        let (most, least) = split_uuid(endpoint.host_id);
        write_u64(buf, most);
        write_u64(buf, least);
    }
}

fn write_endpoint_without_host_id(buf: &mut Vec<u8>, endpoint: &EndpointId) {
    let addr = endpoint.broadcast.ip_bytes();
    write_u8(buf, (addr.len() + 2) as u8);
    buf.extend_from_slice(&addr);
    write_u16(buf, endpoint.broadcast.port);
}

/// Decodes any of the three accepted layouts, keyed by the size prefix:
/// 4/16 (bare address), 6/18 (address and port), 22/34 (address, port and
/// host UUID). Any other prefix is a protocol violation.
pub fn read_endpoint(bytes: &mut &[u8], default_port: u16) -> Result<EndpointId, ProtocolError> {
    let size = read_u8(bytes)?;
    match size {
        4 | 16 => {
            let ip = read_ip(bytes, size as usize)?;
            Ok(EndpointId::from_broadcast(
                NodeAddr::new(ip, default_port),
                None,
            ))
        }
        6 | 18 => {
            let ip = read_ip(bytes, size as usize - 2)?;
            let port = read_u16(bytes)?;
            Ok(EndpointId::from_broadcast(NodeAddr::new(ip, port), None))
        }
        22 | 34 => {
            let ip = read_ip(bytes, size as usize - 18)?;
            let port = read_u16(bytes)?;
            let most = read_u64(bytes)?;
            let least = read_u64(bytes)?;
            let host_id = join_uuid(most, least);
            Ok(EndpointId::from_broadcast(
                NodeAddr::new(ip, port),
                Some(host_id),
            ))
        }
        other => Err(ProtocolError::UnexpectedSize(other)),
    }
}

fn read_ip(bytes: &mut &[u8], len: usize) -> Result<IpAddr, ProtocolError> {
    let raw = read_exact(bytes, len)?;
    match len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(raw);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(ProtocolError::UnexpectedSize(other as u8)),
    }
}

fn split_uuid(id: Uuid) -> (u64, u64) {
    let value = id.as_u128();
    ((value >> 64) as u64, value as u64)
}

fn join_uuid(most: u64, least: u64) -> Uuid {
    Uuid::from_u128(((most as u128) << 64) | least as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, host: u128) -> EndpointId {
        EndpointId::from_broadcast(addr.parse().unwrap(), Some(Uuid::from_u128(host)))
    }

    #[test]
    fn current_version_round_trips_address_port_and_host_id() {
        let original = ep("10.1.2.3:7012", 0xfeed_beef);
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &original, CURRENT_VERSION);
        assert_eq!(buf[0], 22);
        let mut slice = buf.as_slice();
        let decoded = read_endpoint(&mut slice, 0).unwrap();
        assert_eq!(decoded.broadcast, original.broadcast);
        assert_eq!(decoded.host_id, original.host_id);
        assert!(slice.is_empty());
    }

    #[test]
    fn v6_round_trips_with_host_id() {
        let original = ep("[2001:db8::7]:9999", 42);
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &original, CURRENT_VERSION);
        assert_eq!(buf[0], 34);
        let decoded = read_endpoint(&mut buf.as_slice(), 0).unwrap();
        assert_eq!(decoded.broadcast, original.broadcast);
        assert_eq!(decoded.host_id, original.host_id);
    }

    #[test]
    fn legacy_version_round_trips_bare_address() {
        let original = ep("10.1.2.3:7012", 7);
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &original, VERSION_30);
        assert_eq!(buf, vec![4, 10, 1, 2, 3]);
        let decoded = read_endpoint(&mut buf.as_slice(), 7012).unwrap();
        assert_eq!(decoded.broadcast, original.broadcast);
        assert!(decoded.has_nil_host_id());
    }

    #[test]
    fn unknown_identity_serializes_as_address_and_port() {
        let original = EndpointId::from_broadcast("10.1.2.3:7012".parse().unwrap(), None);
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &original, CURRENT_VERSION);
        assert_eq!(buf[0], 6);
        let decoded = read_endpoint(&mut buf.as_slice(), 0).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.has_nil_host_id());
    }

    #[test]
    fn v6_unknown_identity_round_trips_port_only() {
        let original = EndpointId::from_broadcast("[2001:db8::7]:9999".parse().unwrap(), None);
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &original, CURRENT_VERSION);
        assert_eq!(buf[0], 18);
        let decoded = read_endpoint(&mut buf.as_slice(), 0).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_size_prefix_is_a_protocol_violation() {
        let frame = [9u8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = read_endpoint(&mut frame.as_slice(), 0).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedSize(9)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = [22u8, 10, 1];
        let err = read_endpoint(&mut frame.as_slice(), 0).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }
}
