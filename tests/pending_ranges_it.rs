use ringmesh::{
    EndpointId, PendingRangeMap, Range, RingMetadata, SimpleStrategy, Token,
};
use std::sync::Arc;
use uuid::Uuid;

fn ep(n: u8) -> EndpointId {
    EndpointId::from_broadcast(
        format!("10.0.0.{n}:7000").parse().unwrap(),
        Some(Uuid::from_u128(n as u128)),
    )
}

fn t(value: i64) -> Token {
    Token(value)
}

/// Ring A(10), C(30), E(50) with RF 3.
fn base_ring() -> Arc<RingMetadata> {
    let ring = Arc::new(RingMetadata::new());
    ring.update_normal_tokens(&ep(1), &[t(10)]);
    ring.update_normal_tokens(&ep(3), &[t(30)]);
    ring.update_normal_tokens(&ep(5), &[t(50)]);
    ring
}

fn pending(ring: &RingMetadata, rf: usize) -> Arc<PendingRangeMap> {
    ring.calculate_pending_ranges(&SimpleStrategy::new(rf), "ks");
    ring.pending_ranges("ks")
}

#[test]
fn simultaneous_bootstraps_cover_both_newcomers() {
    let ring = base_ring();
    // D bootstraps between C and E, B between A and C.
    ring.add_bootstrap_tokens(&[t(40)], &ep(4)).unwrap();
    ring.add_bootstrap_tokens(&[t(20)], &ep(2)).unwrap();

    let pending = pending(&ring, 3);
    assert!(!pending.is_empty());

    // Each bootstrapper is computed against the ring as if it joined
    // alone, so each is pending everywhere it could end up owning data.
    // With RF 3 over three members plus one newcomer, that is every range
    // the simulation of its join produces.
    let for_b = pending.ranges_for(&ep(2));
    let for_d = pending.ranges_for(&ep(4));
    assert!(!for_b.is_empty());
    assert!(!for_d.is_empty());

    // Both newcomers are pending for writes landing at their own tokens.
    assert!(pending.endpoints_for_token(t(20)).contains(&ep(2)));
    assert!(pending.endpoints_for_token(t(40)).contains(&ep(4)));

    // Wherever either newcomer could eventually own a range, it is listed;
    // tokens in the arcs they bisect see both.
    let at_15 = pending.endpoints_for_token(t(15));
    assert!(at_15.contains(&ep(2)));
    assert!(at_15.contains(&ep(4)));
}

#[test]
fn calculation_is_deterministic_for_fixed_inputs() {
    let ring = base_ring();
    ring.add_bootstrap_tokens(&[t(40)], &ep(4)).unwrap();
    ring.add_bootstrap_tokens(&[t(20)], &ep(2)).unwrap();

    let first = pending(&ring, 3);
    let second = pending(&ring, 3);
    assert_eq!(*first, *second);
}

#[test]
fn pending_destinations_over_approximate_the_final_replicas() {
    // Node C leaves while B bootstraps at 20. For every affected range the
    // final natural replicas (after both transitions) must be a subset of
    // the old replicas plus the pending destinations.
    let ring = base_ring();
    ring.add_leaving_endpoint(&ep(3));
    ring.add_bootstrap_tokens(&[t(20)], &ep(2)).unwrap();

    let rf = 2;
    let strategy = SimpleStrategy::new(rf);
    ring.calculate_pending_ranges(&strategy, "ks");
    let pending = ring.pending_ranges("ks");

    // The eventual ring: C gone, B joined.
    let final_ring = Arc::new(RingMetadata::new());
    final_ring.update_normal_tokens(&ep(1), &[t(10)]);
    final_ring.update_normal_tokens(&ep(2), &[t(20)]);
    final_ring.update_normal_tokens(&ep(5), &[t(50)]);
    let final_snapshot = final_ring.clone_only_token_map();
    let before_snapshot = ring.clone_only_token_map();

    use ringmesh::ReplicationStrategy;
    for probe in [t(5), t(15), t(25), t(35), t(45), t(55)] {
        let eventual = strategy.natural_endpoints(probe, &final_snapshot);
        let before: Vec<EndpointId> = strategy.natural_endpoints(probe, &before_snapshot);
        let pending_at = pending.endpoints_for_token(probe);
        for replica in eventual {
            assert!(
                before.contains(&replica) || pending_at.contains(&replica),
                "replica {replica} for probe {probe} is neither current nor pending"
            );
        }
    }
}

#[test]
fn leave_plus_move_compose() {
    let ring = base_ring();
    ring.add_leaving_endpoint(&ep(5));
    ring.add_moving_endpoint(t(44), &ep(3));

    let pending = pending(&ring, 1);
    assert!(!pending.is_empty());

    // E's primary range (30,50] needs a new home once it leaves; with the
    // move of C to 44 in flight, destinations were computed against the
    // post-leave ring and replace C's old coverage piecewise.
    let covered: Vec<(Range, Vec<EndpointId>)> = pending
        .iter()
        .map(|(range, endpoints)| (*range, endpoints.iter().cloned().collect()))
        .collect();
    assert!(
        covered
            .iter()
            .any(|(range, _)| range.contains_token(t(45))),
        "no pending coverage for E's abandoned arc: {covered:?}"
    );
}

#[test]
fn finished_transitions_clear_pending_state() {
    let ring = base_ring();
    ring.add_bootstrap_tokens(&[t(20)], &ep(2)).unwrap();
    assert!(!pending(&ring, 3).is_empty());

    // The bootstrap completes: B becomes a normal member.
    ring.update_normal_tokens(&ep(2), &[t(20)]);
    assert!(pending(&ring, 3).is_empty());
}
