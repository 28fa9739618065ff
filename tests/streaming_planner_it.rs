use ringmesh::{
    EndpointId, FixedLiveness, InMemoryStreamStateStore, PlanError, Range, RangePlanner,
    ReplicationStrategy, RingMetadata, SimpleSnitch, SimpleStrategy, SourceFilter, Token,
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

fn r(left: i64, right: i64) -> Range {
    Range::new(t(left), t(right))
}

/// Cluster A(10), B(20), C(30).
fn cluster() -> Arc<RingMetadata> {
    let ring = Arc::new(RingMetadata::new());
    ring.update_normal_tokens(&ep(1), &[t(10)]);
    ring.update_normal_tokens(&ep(2), &[t(20)]);
    ring.update_normal_tokens(&ep(3), &[t(30)]);
    ring
}

#[test]
fn bootstrap_streams_each_range_from_one_existing_replica() {
    // D joins with token 15 into an RF 3 keyspace; everything it needs is
    // on all of A, B, C, and exactly one of them is picked per range.
    let ring = cluster();
    let local = ep(4);
    let alive = Arc::new(FixedLiveness::of(vec![ep(1), ep(2), ep(3)]));
    let mut planner = RangePlanner::new(
        ring.clone_only_token_map(),
        Some(vec![t(15)]),
        local.clone(),
        "Bootstrap",
        false,
        Arc::new(SimpleSnitch),
        Arc::new(InMemoryStreamStateStore::new()),
        alive.clone(),
    );
    planner.add_source_filter(SourceFilter::Alive(alive));
    planner.add_source_filter(SourceFilter::ExcludeLocalNode);

    planner
        .add_ranges("ks", &[r(10, 15)], &SimpleStrategy::new(3))
        .unwrap();
    let plan = planner.build_plan();

    assert_eq!(plan.tasks.len(), 1);
    let task = &plan.tasks[0];
    assert_eq!(task.keyspace, "ks");
    assert_eq!(task.ranges, vec![r(10, 15)]);
    assert!([ep(1), ep(2), ep(3)].contains(&task.source));
    assert_ne!(task.source, local);
}

#[test]
fn strict_replacement_streams_from_the_surviving_handoff_replica() {
    // D replaces B, taking over B's exact tokens, with strict consistency
    // on an RF 2 keyspace. For each of B's ranges the planner must find
    // exactly one source, and it is neither the dead B nor D itself.
    let ring = cluster();
    let strategy = SimpleStrategy::new(2);
    let snapshot = ring.clone_only_token_map();
    let b_ranges: Vec<Range> = strategy
        .address_ranges(&snapshot)
        .remove(&ep(2))
        .expect("B replicates something");

    let local = ep(4);
    let alive = Arc::new(FixedLiveness::of(vec![ep(1), ep(3)]));
    let mut planner = RangePlanner::new(
        snapshot,
        Some(vec![t(20)]),
        local.clone(),
        "Replace",
        true,
        Arc::new(SimpleSnitch),
        Arc::new(InMemoryStreamStateStore::new()),
        alive.clone(),
    )
    .replacing(ep(2));
    planner.add_source_filter(SourceFilter::Alive(alive));

    planner.add_ranges("ks", &b_ranges, &strategy).unwrap();
    let plan = planner.build_plan();

    let mut streamed = Vec::new();
    for task in &plan.tasks {
        assert_ne!(task.source, ep(2), "dead node picked as source");
        assert_ne!(task.source, local, "streaming from ourselves");
        streamed.extend(task.ranges.iter().copied());
    }
    streamed.sort();
    let mut expected = b_ranges.clone();
    expected.sort();
    assert_eq!(streamed, expected, "every range of B gets exactly one source");
}

#[test]
fn strict_replacement_fails_when_the_handoff_replica_is_down() {
    // Same replacement, but C is down too. For the ranges where C is the
    // hand-off source, the planner must refuse with an explicit error
    // instead of silently streaming from an inconsistent replica.
    let ring = cluster();
    let strategy = SimpleStrategy::new(2);
    let snapshot = ring.clone_only_token_map();
    let b_ranges: Vec<Range> = strategy
        .address_ranges(&snapshot)
        .remove(&ep(2))
        .expect("B replicates something");

    let alive = Arc::new(FixedLiveness::of(vec![ep(1)]));
    let mut planner = RangePlanner::new(
        snapshot,
        Some(vec![t(20)]),
        ep(4),
        "Replace",
        true,
        Arc::new(SimpleSnitch),
        Arc::new(InMemoryStreamStateStore::new()),
        alive,
    )
    .replacing(ep(2));

    let err = planner.add_ranges("ks", &b_ranges, &strategy).unwrap_err();
    match err {
        PlanError::StrictSourceDown { down_source, .. } => assert_eq!(down_source, ep(3)),
        other => panic!("expected StrictSourceDown, got {other:?}"),
    }
}

#[test]
fn datacenter_filter_restricts_sources() {
    use ringmesh::{Location, Snitch};

    struct MappedSnitch;
    impl Snitch for MappedSnitch {
        fn datacenter(&self, endpoint: &EndpointId) -> String {
            if endpoint.broadcast.port == 7000 && endpoint.host_id == Uuid::from_u128(2) {
                "dc2".to_string()
            } else {
                Location::default().datacenter
            }
        }
        fn rack(&self, _endpoint: &EndpointId) -> String {
            Location::default().rack
        }
        fn compare_endpoints(
            &self,
            _target: &EndpointId,
            _a: &EndpointId,
            _b: &EndpointId,
        ) -> std::cmp::Ordering {
            std::cmp::Ordering::Equal
        }
    }

    let ring = cluster();
    let alive = Arc::new(FixedLiveness::of(vec![ep(1), ep(2), ep(3)]));
    let mut planner = RangePlanner::new(
        ring.clone_only_token_map(),
        None,
        ep(4),
        "Rebuild",
        false,
        Arc::new(MappedSnitch),
        Arc::new(InMemoryStreamStateStore::new()),
        alive,
    );
    planner.add_source_filter(SourceFilter::InDatacenter {
        snitch: Arc::new(MappedSnitch),
        datacenter: "dc2".to_string(),
    });

    planner
        .add_ranges("ks", &[r(10, 20)], &SimpleStrategy::new(3))
        .unwrap();
    let plan = planner.build_plan();
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].source, ep(2));
}

#[test]
fn whitelist_filter_composes_with_liveness() {
    let ring = cluster();
    let alive = Arc::new(FixedLiveness::of(vec![ep(1), ep(3)]));
    let mut planner = RangePlanner::new(
        ring.clone_only_token_map(),
        None,
        ep(4),
        "Rebuild",
        false,
        Arc::new(SimpleSnitch),
        Arc::new(InMemoryStreamStateStore::new()),
        alive.clone(),
    );
    planner.add_source_filter(SourceFilter::Alive(alive));
    planner.add_source_filter(SourceFilter::Whitelist(
        [ep(1), ep(2)].into_iter().collect(),
    ));

    // RF 3 replicas of (10,20] are {A, B, C}; the whitelist removes C and
    // liveness removes B, leaving A as the only acceptable source.
    planner
        .add_ranges("ks", &[r(10, 20)], &SimpleStrategy::new(3))
        .unwrap();
    let plan = planner.build_plan();
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].source, ep(1));
}
