//! The remote-management contract: a serializable snapshot of cluster
//! health plus the operator entry points that are too dangerous for
//! anything but an explicit human decision.

use crate::endpoint::EndpointId;
use crate::gossip::engine::{GossipError, Gossiper};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Point-in-time cluster summary for the management surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub seeds: Vec<String>,
    pub live_endpoints: Vec<String>,
    pub unreachable_endpoints: Vec<EndpointDowntime>,
    pub release_versions: Vec<EndpointRelease>,
    pub local_generation: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDowntime {
    pub endpoint: String,
    pub downtime_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRelease {
    pub endpoint: String,
    pub release_version: String,
}

impl ClusterSummary {
    pub fn capture(gossiper: &Gossiper, now: Instant) -> Self {
        let local = gossiper.local_endpoint().clone();
        Self {
            seeds: gossiper
                .seeds()
                .iter()
                .map(|seed| seed.broadcast.to_string())
                .collect(),
            live_endpoints: gossiper
                .live_members()
                .iter()
                .map(|endpoint| endpoint.to_string())
                .collect(),
            unreachable_endpoints: gossiper
                .unreachable_members()
                .iter()
                .map(|endpoint| EndpointDowntime {
                    endpoint: endpoint.to_string(),
                    downtime_millis: gossiper.endpoint_downtime(endpoint, now).as_millis() as u64,
                })
                .collect(),
            release_versions: gossiper
                .release_versions()
                .into_iter()
                .map(|(endpoint, release_version)| EndpointRelease {
                    endpoint: endpoint.to_string(),
                    release_version,
                })
                .collect(),
            local_generation: gossiper.current_generation(&local),
        }
    }
}

/// Forcibly declares an endpoint LEFT. The caller confirms the target's
/// generation has not moved between the two calls; the runtime wrapper
/// sleeps one ring delay between them and at least four gossip intervals
/// afterwards so the broadcast propagates.
pub fn assassinate_endpoint(
    gossiper: &mut Gossiper,
    endpoint: &EndpointId,
    observed_generation: i32,
    now: Instant,
    wall_millis: u64,
) -> Result<(), GossipError> {
    gossiper.finish_assassinate(endpoint, observed_generation, now, wall_millis)
}

/// Deprecated alias kept for operators with old tooling.
#[deprecated(note = "use assassinate_endpoint")]
pub fn unsafe_assassinate_endpoint(
    gossiper: &mut Gossiper,
    endpoint: &EndpointId,
    observed_generation: i32,
    now: Instant,
    wall_millis: u64,
) -> Result<(), GossipError> {
    assassinate_endpoint(gossiper, endpoint, observed_generation, now, wall_millis)
}

/// Replaces the seed list and reports the resulting set.
pub fn reload_seeds(gossiper: &mut Gossiper, seeds: Vec<EndpointId>) -> Vec<String> {
    gossiper
        .reload_seeds(seeds)
        .iter()
        .map(|seed| seed.broadcast.to_string())
        .collect()
}
