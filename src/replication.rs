//! Replica placement. The ring core depends on two operations: natural
//! endpoints for a token, and the full endpoint-to-ranges view derived
//! from them. Two canonical strategies are provided so planning and
//! pending-range code can be exercised against realistic placements.

use crate::endpoint::EndpointId;
use crate::ring::metadata::RingSnapshot;
use crate::ring::range::Range;
use crate::ring::token::Token;
use std::collections::{BTreeMap, HashMap, HashSet};

pub trait ReplicationStrategy: Send + Sync {
    /// Total number of replicas this strategy places per range.
    fn replication_factor(&self) -> usize;

    /// Replicas for the ring range owning `token`, primary first. At most
    /// `replication_factor` entries, fewer when the ring is small.
    fn natural_endpoints(&self, token: Token, ring: &RingSnapshot) -> Vec<EndpointId>;

    /// Every range each endpoint is a natural replica for.
    fn address_ranges(&self, ring: &RingSnapshot) -> HashMap<EndpointId, Vec<Range>> {
        let mut ranges: HashMap<EndpointId, Vec<Range>> = HashMap::new();
        for token in ring.sorted_tokens() {
            let Some(range) = ring.primary_range_for(token) else {
                continue;
            };
            for endpoint in self.natural_endpoints(token, ring) {
                ranges.entry(endpoint).or_default().push(range);
            }
        }
        ranges
    }

    /// The inverse view: every candidate replica per ring range.
    fn range_addresses(&self, ring: &RingSnapshot) -> BTreeMap<Range, Vec<EndpointId>> {
        let mut addresses = BTreeMap::new();
        for token in ring.sorted_tokens() {
            let Some(range) = ring.primary_range_for(token) else {
                continue;
            };
            addresses.insert(range, self.natural_endpoints(token, ring));
        }
        addresses
    }
}

/// Rack-oblivious placement: the owner of the matching ring range plus the
/// next distinct endpoints walking clockwise.
#[derive(Debug, Clone)]
pub struct SimpleStrategy {
    replication_factor: usize,
}

impl SimpleStrategy {
    pub fn new(replication_factor: usize) -> Self {
        Self { replication_factor }
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    fn natural_endpoints(&self, token: Token, ring: &RingSnapshot) -> Vec<EndpointId> {
        let mut replicas = Vec::new();
        for (_, endpoint) in ring.ring_order(token) {
            if replicas.len() == self.replication_factor {
                break;
            }
            if !replicas.contains(endpoint) {
                replicas.push(endpoint.clone());
            }
        }
        replicas
    }
}

/// Per-datacenter replica counts, preferring one replica per rack and
/// falling back to already-used racks only once every rack in that
/// datacenter holds one.
#[derive(Debug, Clone)]
pub struct NetworkTopologyStrategy {
    datacenter_factors: BTreeMap<String, usize>,
}

impl NetworkTopologyStrategy {
    pub fn new(datacenter_factors: BTreeMap<String, usize>) -> Self {
        Self { datacenter_factors }
    }

    pub fn with_factor(datacenter: impl Into<String>, factor: usize) -> Self {
        let mut factors = BTreeMap::new();
        factors.insert(datacenter.into(), factor);
        Self::new(factors)
    }
}

impl ReplicationStrategy for NetworkTopologyStrategy {
    fn replication_factor(&self) -> usize {
        self.datacenter_factors.values().sum()
    }

    fn natural_endpoints(&self, token: Token, ring: &RingSnapshot) -> Vec<EndpointId> {
        let topology = ring.topology();
        let mut replicas: Vec<EndpointId> = Vec::new();
        let mut per_dc: HashMap<&str, usize> = HashMap::new();
        let mut racks_used: HashMap<&str, HashSet<String>> = HashMap::new();
        let mut skipped: HashMap<&str, Vec<EndpointId>> = HashMap::new();

        for (_, endpoint) in ring.ring_order(token) {
            if replicas.len() == self.replication_factor() {
                break;
            }
            let Some(location) = topology.location(endpoint) else {
                continue;
            };
            let Some((dc, &wanted)) =
                self.datacenter_factors.get_key_value(&location.datacenter)
            else {
                continue;
            };
            let dc = dc.as_str();
            let placed = per_dc.entry(dc).or_default();
            if *placed >= wanted {
                continue;
            }
            if replicas.contains(endpoint) {
                continue;
            }

            let rack_count = topology
                .datacenter_racks(&location.datacenter)
                .map(|racks| racks.len())
                .unwrap_or(0);
            let used = racks_used.entry(dc).or_default();
            if used.contains(&location.rack) && used.len() < rack_count {
                // Same rack as an existing replica while unused racks
                // remain; keep it as a fallback.
                skipped.entry(dc).or_default().push(endpoint.clone());
                continue;
            }
            used.insert(location.rack.clone());
            *placed += 1;
            replicas.push(endpoint.clone());
        }

        // Fill any remaining per-datacenter quota from the skipped
        // same-rack candidates, in ring order.
        for (dc, wanted) in &self.datacenter_factors {
            let placed = per_dc.entry(dc.as_str()).or_default();
            if let Some(candidates) = skipped.get(dc.as_str()) {
                for endpoint in candidates {
                    if *placed >= *wanted {
                        break;
                    }
                    if !replicas.contains(endpoint) {
                        replicas.push(endpoint.clone());
                        *placed += 1;
                    }
                }
            }
        }
        replicas
    }
}
