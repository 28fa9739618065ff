//! Metrics published by the membership core. The registry carries the
//! fixed vocabulary the gossip engine and failure detector report into:
//! membership gauges, round and conviction counters, and a histogram of
//! heartbeat silence. A snapshot is a plain value an exporter or test can
//! pick apart.

use std::collections::BTreeMap;

const NAMESPACE: &str = "ringmesh";

/// Upper bucket bounds for heartbeat-silence observations, in
/// milliseconds. A silence beyond the last bound lands in the last bucket.
pub const SILENCE_BUCKETS_MS: [u64; 12] = [
    10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 15_000, 30_000, 60_000,
];

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    live_endpoints: u64,
    unreachable_endpoints: u64,
    quarantined_endpoints: u64,
    known_endpoints: u64,
    monitored_endpoints: u64,
    gossip_rounds: u64,
    convictions: u64,
    silence_counts: [u64; SILENCE_BUCKETS_MS.len()],
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers the gossip engine currently believes are up.
    pub fn set_live_endpoints(&mut self, count: usize) {
        self.live_endpoints = count as u64;
    }

    pub fn set_unreachable_endpoints(&mut self, count: usize) {
        self.unreachable_endpoints = count as u64;
    }

    /// Removed endpoints still inside their gossip quarantine window.
    pub fn set_quarantined_endpoints(&mut self, count: usize) {
        self.quarantined_endpoints = count as u64;
    }

    /// Every endpoint with state in the gossip map, dead or alive.
    pub fn set_known_endpoints(&mut self, count: usize) {
        self.known_endpoints = count as u64;
    }

    /// Endpoints the failure detector holds an arrival window for.
    pub fn set_monitored_endpoints(&mut self, count: usize) {
        self.monitored_endpoints = count as u64;
    }

    /// Lifetime count of completed gossip rounds.
    pub fn set_gossip_rounds_total(&mut self, rounds: u64) {
        self.gossip_rounds = rounds;
    }

    /// Lifetime count of failure-detector convictions acted on.
    pub fn set_convictions_total(&mut self, convictions: u64) {
        self.convictions = convictions;
    }

    /// Buckets one observation of how long an endpoint has gone without a
    /// heartbeat.
    pub fn observe_silence_millis(&mut self, silence_ms: u64) {
        let slot = SILENCE_BUCKETS_MS
            .iter()
            .position(|bound| silence_ms <= *bound)
            .unwrap_or(SILENCE_BUCKETS_MS.len() - 1);
        self.silence_counts[slot] = self.silence_counts[slot].saturating_add(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut gauges = BTreeMap::new();
        gauges.insert(qualify("gossip.live_endpoints"), self.live_endpoints);
        gauges.insert(
            qualify("gossip.unreachable_endpoints"),
            self.unreachable_endpoints,
        );
        gauges.insert(
            qualify("gossip.quarantined_endpoints"),
            self.quarantined_endpoints,
        );
        gauges.insert(qualify("gossip.known_endpoints"), self.known_endpoints);
        gauges.insert(
            qualify("detector.monitored_endpoints"),
            self.monitored_endpoints,
        );

        let mut counters = BTreeMap::new();
        counters.insert(qualify("gossip.rounds"), self.gossip_rounds);
        counters.insert(qualify("detector.convictions"), self.convictions);

        MetricsSnapshot {
            gauges,
            counters,
            silence_histogram_ms: SILENCE_BUCKETS_MS
                .iter()
                .copied()
                .zip(self.silence_counts.iter().copied())
                .collect(),
        }
    }
}

fn qualify(name: &str) -> String {
    format!("{NAMESPACE}.{name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub gauges: BTreeMap<String, u64>,
    pub counters: BTreeMap<String, u64>,
    /// Pairs of (bucket upper bound in millis, observation count).
    pub silence_histogram_ms: Vec<(u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_qualifies_every_name() {
        let mut metrics = MetricsRegistry::new();
        metrics.set_live_endpoints(3);
        metrics.set_gossip_rounds_total(41);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gauges.get("ringmesh.gossip.live_endpoints"), Some(&3));
        assert_eq!(snapshot.counters.get("ringmesh.gossip.rounds"), Some(&41));
        assert!(snapshot.gauges.keys().all(|name| name.starts_with("ringmesh.")));
    }

    #[test]
    fn silence_observations_land_in_the_right_buckets() {
        let mut metrics = MetricsRegistry::new();
        metrics.observe_silence_millis(10);
        metrics.observe_silence_millis(11);
        metrics.observe_silence_millis(70_000);
        let histogram = metrics.snapshot().silence_histogram_ms;
        assert_eq!(histogram[0], (10, 1));
        assert_eq!(histogram[1], (25, 1));
        assert_eq!(histogram.last(), Some(&(60_000, 1)));
        let total: u64 = histogram.iter().map(|(_, count)| count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn gauges_overwrite_previous_values() {
        let mut metrics = MetricsRegistry::new();
        metrics.set_unreachable_endpoints(2);
        metrics.set_unreachable_endpoints(5);
        assert_eq!(
            metrics
                .snapshot()
                .gauges
                .get("ringmesh.gossip.unreachable_endpoints"),
            Some(&5)
        );
    }
}
