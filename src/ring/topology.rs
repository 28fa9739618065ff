//! Datacenter and rack placement for ring members, maintained alongside the
//! token map and consumed by topology-aware replication.

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where an endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub datacenter: String,
    pub rack: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            datacenter: "datacenter1".to_string(),
            rack: "rack1".to_string(),
        }
    }
}

impl Location {
    pub fn new(datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            rack: rack.into(),
        }
    }
}

/// Tracks datacenter membership, per-datacenter rack membership and the
/// current location of every endpoint ever added. An endpoint has a location
/// entry exactly as long as it is part of the topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    dc_endpoints: BTreeMap<String, BTreeSet<EndpointId>>,
    dc_racks: BTreeMap<String, BTreeMap<String, BTreeSet<EndpointId>>>,
    current_locations: BTreeMap<EndpointId, Location>,
}

impl Topology {
    /// Adds or relocates an endpoint. Relocation removes the stale placement
    /// first so the per-datacenter views never hold a node twice.
    pub fn add_endpoint(&mut self, endpoint: &EndpointId, location: Location) {
        if let Some(current) = self.current_locations.get(endpoint) {
            if *current == location {
                return;
            }
            self.remove_endpoint(endpoint);
        }
        self.dc_endpoints
            .entry(location.datacenter.clone())
            .or_default()
            .insert(endpoint.clone());
        self.dc_racks
            .entry(location.datacenter.clone())
            .or_default()
            .entry(location.rack.clone())
            .or_default()
            .insert(endpoint.clone());
        self.current_locations.insert(endpoint.clone(), location);
    }

    pub fn remove_endpoint(&mut self, endpoint: &EndpointId) {
        let Some(location) = self.current_locations.remove(endpoint) else {
            return;
        };
        if let Some(members) = self.dc_endpoints.get_mut(&location.datacenter) {
            members.remove(endpoint);
            if members.is_empty() {
                self.dc_endpoints.remove(&location.datacenter);
            }
        }
        if let Some(racks) = self.dc_racks.get_mut(&location.datacenter) {
            if let Some(members) = racks.get_mut(&location.rack) {
                members.remove(endpoint);
                if members.is_empty() {
                    racks.remove(&location.rack);
                }
            }
            if racks.is_empty() {
                self.dc_racks.remove(&location.datacenter);
            }
        }
    }

    pub fn location(&self, endpoint: &EndpointId) -> Option<&Location> {
        self.current_locations.get(endpoint)
    }

    pub fn datacenter_endpoints(&self, datacenter: &str) -> Option<&BTreeSet<EndpointId>> {
        self.dc_endpoints.get(datacenter)
    }

    pub fn datacenter_racks(
        &self,
        datacenter: &str,
    ) -> Option<&BTreeMap<String, BTreeSet<EndpointId>>> {
        self.dc_racks.get(datacenter)
    }

    pub fn datacenters(&self) -> impl Iterator<Item = &String> {
        self.dc_endpoints.keys()
    }

    pub fn contains(&self, endpoint: &EndpointId) -> bool {
        self.current_locations.contains_key(endpoint)
    }
}
