//! Canonical node identity: a host UUID plus the set of addresses a node
//! announces. Replaces bare socket addresses as the key for every
//! membership structure.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AddrParseError {
    #[error("malformed address `{0}`, expected ip:port")]
    Malformed(String),
    #[error("invalid ip in `{0}`")]
    InvalidIp(String),
    #[error("port {0} out of range")]
    PortOutOfRange(u32),
}

/// An IP address plus port. Ports are validated on the parse path so a
/// config typo like `:70000` fails loudly instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Raw address bytes, 4 for v4 and 16 for v6.
    pub fn ip_bytes(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn unspecified(port: u16) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }
}

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_part, port_part) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::Malformed(s.to_string()))?;
        let ip_part = ip_part.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = ip_part
            .parse()
            .map_err(|_| AddrParseError::InvalidIp(s.to_string()))?;
        let port: u32 = port_part
            .parse()
            .map_err(|_| AddrParseError::Malformed(s.to_string()))?;
        if port > u16::MAX as u32 {
            return Err(AddrParseError::PortOutOfRange(port));
        }
        Ok(Self {
            ip,
            port: port as u16,
        })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

/// Identity of a cluster member. A node is known by its host UUID and up to
/// four addresses: the listen address, the broadcast address peers dial, the
/// native client address and its broadcast variant. Equality covers the host
/// id and every address; two records disagreeing on any of them are distinct
/// identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    pub listen: NodeAddr,
    pub broadcast: NodeAddr,
    pub native: NodeAddr,
    pub broadcast_native: NodeAddr,
    pub host_id: Uuid,
}

impl EndpointId {
    /// Builds an identity from a full address set. Absent addresses default
    /// the way a node announces itself: broadcast falls back to listen, the
    /// native address to the unspecified address on the listen port, and the
    /// broadcast-native address to the native one (or broadcast when the
    /// native address was defaulted).
    pub fn new(
        listen: NodeAddr,
        broadcast: Option<NodeAddr>,
        native: Option<NodeAddr>,
        broadcast_native: Option<NodeAddr>,
        host_id: Option<Uuid>,
    ) -> Self {
        let broadcast = broadcast.unwrap_or(listen);
        let defaulted_native = native.is_none();
        let native = native.unwrap_or_else(|| NodeAddr::unspecified(listen.port));
        let broadcast_native = broadcast_native.unwrap_or(if defaulted_native {
            broadcast
        } else {
            native
        });
        Self {
            listen,
            broadcast,
            native,
            broadcast_native,
            host_id: host_id.unwrap_or_else(Uuid::nil),
        }
    }

    /// Identity known only by the address peers dial, before any richer
    /// announcement arrives.
    pub fn from_broadcast(broadcast: NodeAddr, host_id: Option<Uuid>) -> Self {
        Self::new(broadcast, Some(broadcast), None, None, host_id)
    }

    /// True until the host UUID has been learned from gossip or peer storage.
    pub fn has_nil_host_id(&self) -> bool {
        self.host_id.is_nil()
    }

    pub fn with_host_id(mut self, host_id: Uuid) -> Self {
        self.host_id = host_id;
        self
    }

    pub fn has_address(&self, addr: &NodeAddr) -> bool {
        self.listen == *addr
            || self.broadcast == *addr
            || self.native == *addr
            || self.broadcast_native == *addr
    }

    /// Refreshes every mutable field from a newer announcement of the same
    /// node. The caller is responsible for re-keying any map this identity
    /// lives in.
    pub fn update_values_from(&mut self, other: &EndpointId) {
        self.listen = other.listen;
        self.broadcast = other.broadcast;
        self.native = other.native;
        self.broadcast_native = other.broadcast_native;
        self.host_id = other.host_id;
    }
}

/// Broadcast address bytes, then host UUID, then port. The secondary
/// addresses only break ties so that the order stays consistent with
/// equality.
impl Ord for EndpointId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.broadcast
            .ip_bytes()
            .cmp(&other.broadcast.ip_bytes())
            .then_with(|| self.host_id.cmp(&other.host_id))
            .then_with(|| self.broadcast.port.cmp(&other.broadcast.port))
            .then_with(|| self.listen.cmp(&other.listen))
            .then_with(|| self.native.cmp(&other.native))
            .then_with(|| self.broadcast_native.cmp(&other.broadcast_native))
    }
}

impl PartialOrd for EndpointId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (host id {})", self.broadcast, self.host_id)
    }
}
