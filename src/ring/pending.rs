//! Pending ranges: for every in-flight topology change, which endpoints
//! must start receiving writes for which ranges. The calculation
//! deliberately over-approximates; extra pending writes are compacted
//! away, lost ones are gone.

use crate::endpoint::EndpointId;
use crate::replication::ReplicationStrategy;
use crate::ring::metadata::RingSnapshot;
use crate::ring::range::Range;
use crate::ring::token::Token;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Range -> pending destination endpoints for one keyspace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingRangeMap {
    by_range: BTreeMap<Range, BTreeSet<EndpointId>>,
}

impl PendingRangeMap {
    pub fn insert(&mut self, range: Range, endpoint: EndpointId) {
        self.by_range.entry(range).or_default().insert(endpoint);
    }

    pub fn is_empty(&self) -> bool {
        self.by_range.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_range.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Range, &BTreeSet<EndpointId>)> {
        self.by_range.iter()
    }

    /// Every endpoint pending for a range that covers `token`.
    pub fn endpoints_for_token(&self, token: Token) -> BTreeSet<EndpointId> {
        self.by_range
            .iter()
            .filter(|(range, _)| range.contains_token(token))
            .flat_map(|(_, endpoints)| endpoints.iter().cloned())
            .collect()
    }

    pub fn ranges_for(&self, endpoint: &EndpointId) -> Vec<Range> {
        self.by_range
            .iter()
            .filter(|(_, endpoints)| endpoints.contains(endpoint))
            .map(|(range, _)| *range)
            .collect()
    }

    pub fn endpoints_for_range(&self, range: &Range) -> Option<&BTreeSet<EndpointId>> {
        self.by_range.get(range)
    }
}

/// Computes the pending destinations for every leave, bootstrap and move in
/// flight.
///
/// Rather than untangle how simultaneous operations overlap, each
/// bootstrapping or moving endpoint is added to (and removed from) a ring
/// that already reflects all leaves, and credited with the widest ranges it
/// could end up owning.
pub fn calculate_pending_ranges(
    strategy: &dyn ReplicationStrategy,
    metadata: &RingSnapshot,
    bootstrap_tokens: &BTreeMap<Token, EndpointId>,
    leaving: &BTreeSet<EndpointId>,
    moving: &BTreeSet<(Token, EndpointId)>,
) -> PendingRangeMap {
    let mut pending = PendingRangeMap::default();
    let endpoint_ranges = strategy.address_ranges(metadata);

    // The ring as it looks after every leave completes.
    let mut all_left = metadata.clone();
    for endpoint in leaving {
        all_left.remove_endpoint(endpoint);
    }

    // Ranges owned by a leaving endpoint change replicas; whoever is new in
    // the post-leave replica set is pending.
    let mut affected: BTreeSet<Range> = BTreeSet::new();
    for endpoint in leaving {
        if let Some(ranges) = endpoint_ranges.get(endpoint) {
            affected.extend(ranges.iter().copied());
        }
    }
    for range in &affected {
        let current: HashSet<EndpointId> = strategy
            .natural_endpoints(range.right, metadata)
            .into_iter()
            .collect();
        for endpoint in strategy.natural_endpoints(range.right, &all_left) {
            if !current.contains(&endpoint) {
                pending.insert(*range, endpoint);
            }
        }
    }

    // Each bootstrapper is dropped into the post-leave ring alone and takes
    // the widest ranges it could own there.
    let mut by_bootstrapper: BTreeMap<&EndpointId, Vec<Token>> = BTreeMap::new();
    for (token, endpoint) in bootstrap_tokens {
        by_bootstrapper.entry(endpoint).or_default().push(*token);
    }
    for (endpoint, tokens) in by_bootstrapper {
        all_left.update_normal_tokens(endpoint, &tokens);
        if let Some(ranges) = strategy.address_ranges(&all_left).get(endpoint) {
            for range in ranges {
                pending.insert(*range, endpoint.clone());
            }
        }
        all_left.remove_endpoint(endpoint);
    }

    // Moves are handled like bootstraps, except only the genuinely new
    // slices of ownership count: anything an endpoint already replicates is
    // subtracted out.
    for (token, endpoint) in moving {
        let mut move_affected: BTreeSet<Range> = BTreeSet::new();
        if let Some(ranges) = strategy.address_ranges(&all_left).get(endpoint) {
            move_affected.extend(ranges.iter().copied());
        }
        all_left.update_normal_tokens(endpoint, &[*token]);
        if let Some(ranges) = strategy.address_ranges(&all_left).get(endpoint) {
            move_affected.extend(ranges.iter().copied());
        }

        for range in &move_affected {
            let current: HashSet<EndpointId> = strategy
                .natural_endpoints(range.right, metadata)
                .into_iter()
                .collect();
            let after: Vec<EndpointId> = strategy
                .natural_endpoints(range.right, &all_left)
                .into_iter()
                .filter(|candidate| !current.contains(candidate))
                .collect();
            for address in after {
                let new_ranges = strategy
                    .address_ranges(&all_left)
                    .remove(&address)
                    .unwrap_or_default();
                let old_ranges = strategy
                    .address_ranges(metadata)
                    .remove(&address)
                    .unwrap_or_default();
                for new_range in new_ranges {
                    if old_ranges.contains(&new_range) {
                        continue;
                    }
                    for piece in new_range.subtract_all(&old_ranges) {
                        pending.insert(piece, address.clone());
                    }
                }
            }
        }

        all_left.remove_endpoint(endpoint);
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::SimpleStrategy;
    use uuid::Uuid;

    fn ep(n: u8) -> EndpointId {
        EndpointId::from_broadcast(
            format!("10.0.0.{n}:7000").parse().unwrap(),
            Some(Uuid::from_u128(n as u128)),
        )
    }

    fn ring(owners: &[(i64, u8)]) -> RingSnapshot {
        let mut snapshot = RingSnapshot::default();
        for (token, node) in owners {
            snapshot.update_normal_tokens(&ep(*node), &[Token(*token)]);
        }
        snapshot
    }

    #[test]
    fn no_transitions_mean_no_pending_ranges() {
        let metadata = ring(&[(10, 1), (20, 2), (30, 3)]);
        let pending = calculate_pending_ranges(
            &SimpleStrategy::new(2),
            &metadata,
            &BTreeMap::new(),
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn leaving_endpoint_promotes_the_next_replica() {
        // RF 1, ring 10->1, 20->2, 30->3; node 2 leaves. Its range (10,20]
        // flows to node 3, the next owner once 2 is gone.
        let metadata = ring(&[(10, 1), (20, 2), (30, 3)]);
        let mut leaving = BTreeSet::new();
        leaving.insert(ep(2));
        let pending = calculate_pending_ranges(
            &SimpleStrategy::new(1),
            &metadata,
            &BTreeMap::new(),
            &leaving,
            &BTreeSet::new(),
        );
        let destinations = pending
            .endpoints_for_range(&Range::new(Token(10), Token(20)))
            .unwrap();
        assert!(destinations.contains(&ep(3)));
        assert_eq!(pending.ranges_for(&ep(3)).len(), 1);
    }

    #[test]
    fn bootstrapper_is_pending_for_its_future_ranges() {
        // RF 1; node 4 bootstraps at 15, splitting (10,20].
        let metadata = ring(&[(10, 1), (20, 2), (30, 3)]);
        let mut bootstrap = BTreeMap::new();
        bootstrap.insert(Token(15), ep(4));
        let pending = calculate_pending_ranges(
            &SimpleStrategy::new(1),
            &metadata,
            &bootstrap,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        let ranges = pending.ranges_for(&ep(4));
        assert_eq!(ranges, vec![Range::new(Token(10), Token(15))]);
    }

    #[test]
    fn moving_endpoint_is_pending_only_for_new_slices() {
        // RF 1; node 3 moves from 30 to 25. Its new primary range becomes
        // (20,25]; the slice it gives up, (25,30], goes to node 1 (the
        // wrap-around owner after the move).
        let metadata = ring(&[(10, 1), (20, 2), (30, 3)]);
        let mut moving = BTreeSet::new();
        moving.insert((Token(25), ep(3)));
        let pending = calculate_pending_ranges(
            &SimpleStrategy::new(1),
            &metadata,
            &BTreeMap::new(),
            &BTreeSet::new(),
            &moving,
        );

        // Node 3 already replicates (20,30] which contains (20,25]; nothing
        // new for it. Node 1 picks up (25,30] as a genuinely new slice.
        assert!(pending.ranges_for(&ep(3)).is_empty());
        let node1 = pending.ranges_for(&ep(1));
        assert_eq!(node1, vec![Range::new(Token(25), Token(30))]);
    }

    #[test]
    fn simultaneous_bootstraps_are_independent_and_deterministic() {
        // Ring A(10), C(30), E(50) with RF 3: everyone replicates
        // everything. D bootstraps at 40, B at 20.
        let metadata = ring(&[(10, 1), (30, 3), (50, 5)]);
        let mut bootstrap = BTreeMap::new();
        bootstrap.insert(Token(40), ep(4));
        bootstrap.insert(Token(20), ep(2));
        let strategy = SimpleStrategy::new(3);
        let pending = calculate_pending_ranges(
            &strategy,
            &metadata,
            &bootstrap,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );

        // With RF 3 on a 3-node ring plus one newcomer, each bootstrapper
        // replicates every range of the 4-node simulation, so each is
        // pending wherever it could end up owning data.
        assert!(!pending.ranges_for(&ep(2)).is_empty());
        assert!(!pending.ranges_for(&ep(4)).is_empty());

        let again = calculate_pending_ranges(
            &strategy,
            &metadata,
            &bootstrap,
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert_eq!(pending, again);
    }

    #[test]
    fn endpoints_for_token_unions_covering_ranges() {
        let mut pending = PendingRangeMap::default();
        pending.insert(Range::new(Token(0), Token(20)), ep(1));
        pending.insert(Range::new(Token(10), Token(30)), ep(2));
        pending.insert(Range::new(Token(40), Token(50)), ep(3));
        let at_15 = pending.endpoints_for_token(Token(15));
        assert!(at_15.contains(&ep(1)));
        assert!(at_15.contains(&ep(2)));
        assert!(!at_15.contains(&ep(3)));
    }
}
