//! Collaborator storage interfaces: the persisted peers table read at
//! startup, and the state store that remembers which ranges have already
//! been streamed in durably. In-memory implementations back the tests and
//! single-process tooling.

use crate::endpoint::{EndpointId, NodeAddr};
use crate::ring::range::Range;
use crate::ring::token::Token;
use crate::ring::topology::Location;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One row of the peers table.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub endpoint: EndpointId,
    pub tokens: Vec<Token>,
    pub location: Option<Location>,
    pub preferred_address: Option<NodeAddr>,
}

/// Read-side of the local peers table. The core only reads it at startup
/// to seed gossip; persisting updates is a subscriber's business.
pub trait PeerStore: Send + Sync {
    fn local_host_id(&self) -> Option<Uuid>;
    fn peers(&self) -> Vec<PeerRecord>;
    fn preferred_address(&self, endpoint: &EndpointId) -> Option<NodeAddr>;
}

#[derive(Default)]
pub struct InMemoryPeerStore {
    local_host_id: Option<Uuid>,
    records: Vec<PeerRecord>,
}

impl InMemoryPeerStore {
    pub fn new(local_host_id: Option<Uuid>, records: Vec<PeerRecord>) -> Self {
        Self {
            local_host_id,
            records,
        }
    }
}

impl PeerStore for InMemoryPeerStore {
    fn local_host_id(&self) -> Option<Uuid> {
        self.local_host_id
    }

    fn peers(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }

    fn preferred_address(&self, endpoint: &EndpointId) -> Option<NodeAddr> {
        self.records
            .iter()
            .find(|record| record.endpoint == *endpoint)
            .and_then(|record| record.preferred_address)
    }
}

/// Durable record of streamed-in ranges, per keyspace. The planner
/// subtracts these before dispatching so restarts do not re-stream.
pub trait StreamStateStore: Send + Sync {
    fn available_ranges(&self, keyspace: &str) -> HashSet<Range>;
    /// Sink invoked when a range finishes streaming.
    fn record_received(&self, keyspace: &str, range: Range);
}

#[derive(Default)]
pub struct InMemoryStreamStateStore {
    received: Mutex<HashMap<String, HashSet<Range>>>,
}

impl InMemoryStreamStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStateStore for InMemoryStreamStateStore {
    fn available_ranges(&self, keyspace: &str) -> HashSet<Range> {
        self.received
            .lock()
            .get(keyspace)
            .cloned()
            .unwrap_or_default()
    }

    fn record_received(&self, keyspace: &str, range: Range) {
        self.received
            .lock()
            .entry(keyspace.to_string())
            .or_default()
            .insert(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_state_store_accumulates_per_keyspace() {
        let store = InMemoryStreamStateStore::new();
        store.record_received("ks1", Range::new(Token(0), Token(10)));
        store.record_received("ks2", Range::new(Token(10), Token(20)));
        assert_eq!(store.available_ranges("ks1").len(), 1);
        assert_eq!(store.available_ranges("ks2").len(), 1);
        assert!(store.available_ranges("ks3").is_empty());
    }

    #[test]
    fn peer_store_returns_preferred_addresses() {
        let endpoint = EndpointId::from_broadcast(
            "10.0.0.2:7000".parse().unwrap(),
            Some(Uuid::from_u128(2)),
        );
        let preferred: NodeAddr = "192.168.0.2:7000".parse().unwrap();
        let store = InMemoryPeerStore::new(
            Some(Uuid::from_u128(1)),
            vec![PeerRecord {
                endpoint: endpoint.clone(),
                tokens: vec![Token(5)],
                location: None,
                preferred_address: Some(preferred),
            }],
        );
        assert_eq!(store.preferred_address(&endpoint), Some(preferred));
        assert_eq!(store.local_host_id(), Some(Uuid::from_u128(1)));
    }
}
