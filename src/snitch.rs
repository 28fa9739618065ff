//! Proximity and placement lookups. The planner and the topology-aware
//! strategy consume only this narrow surface; where the answers come from
//! (config files, gossip, cloud metadata) is the implementation's business.

use crate::endpoint::EndpointId;
use crate::ring::metadata::RingMetadata;
use crate::ring::topology::Location;
use std::cmp::Ordering;
use std::sync::Arc;

pub trait Snitch: Send + Sync {
    fn datacenter(&self, endpoint: &EndpointId) -> String;

    fn rack(&self, endpoint: &EndpointId) -> String;

    /// Relative proximity of `a` and `b` to `target`. `Less` means `a` is
    /// closer.
    fn compare_endpoints(&self, target: &EndpointId, a: &EndpointId, b: &EndpointId) -> Ordering;

    /// The endpoints ordered by proximity to `target`. The default is a
    /// stable sort over [`Snitch::compare_endpoints`], so equal-proximity
    /// candidates keep their input order.
    fn sorted_by_proximity(
        &self,
        target: &EndpointId,
        mut endpoints: Vec<EndpointId>,
    ) -> Vec<EndpointId> {
        endpoints.sort_by(|a, b| self.compare_endpoints(target, a, b));
        endpoints
    }

    /// Hook invoked right before gossip starts, for snitches that warm
    /// caches or announce themselves.
    fn gossiper_starting(&self) {}

    /// Whether merging single-range reads across these replica sets is
    /// worth it for a range query.
    fn is_worth_merging_for_range_query(
        &self,
        merged: &[EndpointId],
        left: &[EndpointId],
        right: &[EndpointId],
    ) -> bool {
        let _ = (merged, left, right);
        true
    }
}

/// Everything in one datacenter and rack, every peer equally close. The
/// stable proximity sort makes this the determinism anchor for planner
/// tests.
#[derive(Debug, Clone, Default)]
pub struct SimpleSnitch;

impl Snitch for SimpleSnitch {
    fn datacenter(&self, _endpoint: &EndpointId) -> String {
        Location::default().datacenter
    }

    fn rack(&self, _endpoint: &EndpointId) -> String {
        Location::default().rack
    }

    fn compare_endpoints(
        &self,
        _target: &EndpointId,
        _a: &EndpointId,
        _b: &EndpointId,
    ) -> Ordering {
        Ordering::Equal
    }
}

/// Answers from the locations gossip has projected into ring metadata.
/// Same rack beats same datacenter beats everything else.
pub struct GossipSnitch {
    ring: Arc<RingMetadata>,
    fallback: Location,
}

impl GossipSnitch {
    pub fn new(ring: Arc<RingMetadata>) -> Self {
        Self {
            ring,
            fallback: Location::default(),
        }
    }

    fn location(&self, endpoint: &EndpointId) -> Location {
        self.ring
            .clone_only_token_map()
            .topology()
            .location(endpoint)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn proximity_class(&self, target: &Location, other: &Location) -> u8 {
        if target.datacenter == other.datacenter && target.rack == other.rack {
            0
        } else if target.datacenter == other.datacenter {
            1
        } else {
            2
        }
    }
}

impl Snitch for GossipSnitch {
    fn datacenter(&self, endpoint: &EndpointId) -> String {
        self.location(endpoint).datacenter
    }

    fn rack(&self, endpoint: &EndpointId) -> String {
        self.location(endpoint).rack
    }

    fn compare_endpoints(&self, target: &EndpointId, a: &EndpointId, b: &EndpointId) -> Ordering {
        let home = self.location(target);
        let class_a = self.proximity_class(&home, &self.location(a));
        let class_b = self.proximity_class(&home, &self.location(b));
        class_a.cmp(&class_b)
    }
}
