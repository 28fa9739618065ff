//! Centralized gossip timing and identity knobs. The quarantine and
//! fat-client windows are derived from the ring delay so the relationships
//! between them live in one place.

use crate::endpoint::EndpointId;
use std::time::Duration;

/// The basic settling time for ring transitions. Everything that waits for
/// "the cluster to notice" waits some multiple of this.
pub const DEFAULT_RING_DELAY: Duration = Duration::from_secs(30);

/// How far in the future a remote generation may claim to be before it is
/// rejected as corrupt.
pub const MAX_GENERATION_SKEW: Duration = Duration::from_secs(365 * 24 * 3600);

/// Default retention for dead state nobody asked to expire sooner.
pub const A_VERY_LONG_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub cluster_name: String,
    pub partitioner_name: String,
    /// One gossip round per tick.
    pub interval: Duration,
    pub ring_delay: Duration,
    /// Convergence anchors dialed during startup and partition healing.
    pub seeds: Vec<EndpointId>,
    /// Grace between announcing shutdown and silencing the tick.
    pub shutdown_grace: Duration,
}

impl GossipConfig {
    pub fn new(cluster_name: impl Into<String>, seeds: Vec<EndpointId>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            partitioner_name: "Murmur3Partitioner".to_string(),
            interval: Duration::from_millis(1000),
            ring_delay: DEFAULT_RING_DELAY,
            seeds,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Removed endpoints are ignored for this long to prevent reincarnation.
    pub fn quarantine_delay(&self) -> Duration {
        self.ring_delay * 2
    }

    /// Non-members silent this long are dropped from the state map.
    pub fn fat_client_timeout(&self) -> Duration {
        self.quarantine_delay() / 2
    }

    /// How long a shadow round may wait: seeds may conclude after one ring
    /// delay, everyone else gets two before failing startup.
    pub fn shadow_round_deadline(&self, is_seed: bool) -> Duration {
        if is_seed {
            self.ring_delay
        } else {
            self.ring_delay * 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_windows_follow_ring_delay() {
        let mut config = GossipConfig::new("test", Vec::new());
        config.ring_delay = Duration::from_secs(10);
        assert_eq!(config.quarantine_delay(), Duration::from_secs(20));
        assert_eq!(config.fat_client_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.shadow_round_deadline(false),
            Duration::from_secs(20)
        );
        assert_eq!(config.shadow_round_deadline(true), Duration::from_secs(10));
    }
}
