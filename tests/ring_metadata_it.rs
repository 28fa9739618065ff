use ringmesh::gossip::state::{status_value, AppStateMap, HeartbeatState};
use ringmesh::{
    AppStateKey, DetectorConfig, EndpointId, EndpointState, GossipConfig, GossipDigestAck2,
    GossipMessage, Gossiper, Murmur3Partitioner, ReplicationStrategy, RingMetadata,
    RingStateSubscriber, SimpleStrategy, Token, VersionedValue, format_tokens,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WALL: u64 = 1_700_000_000_000;
const GEN: i32 = 1_700_000_000;

fn ep(n: u8) -> EndpointId {
    EndpointId::from_broadcast(
        format!("10.0.0.{n}:7000").parse().unwrap(),
        Some(Uuid::from_u128(n as u128)),
    )
}

fn t(value: i64) -> Token {
    Token(value)
}

/// A gossip engine wired to ring metadata the way a node composes them:
/// the ring subscribes to state changes and also answers membership
/// questions for the engine's status checks.
fn node(local: EndpointId, now: Instant) -> (Gossiper, Arc<RingMetadata>) {
    let ring = Arc::new(RingMetadata::new());
    let strategies: Vec<(String, Arc<dyn ReplicationStrategy>)> =
        vec![("ks".to_string(), Arc::new(SimpleStrategy::new(2)))];
    let mut engine = Gossiper::new(
        GossipConfig::new("ring-it", Vec::new()),
        local,
        DetectorConfig::default(),
        Arc::clone(&ring) as Arc<dyn ringmesh::MembershipView>,
        Arc::new(Murmur3Partitioner),
        29,
        now,
    );
    engine.register_subscriber(Box::new(RingStateSubscriber::new(
        Arc::clone(&ring),
        strategies,
    )));
    engine.start(GEN, Vec::new(), now);
    (engine, ring)
}

fn normal_state(token: i64, version_base: i32, now: Instant) -> EndpointState {
    let mut states = AppStateMap::new();
    states.insert(
        AppStateKey::Tokens,
        VersionedValue::new(format_tokens(&[t(token)]), version_base),
    );
    states.insert(
        AppStateKey::Status,
        VersionedValue::new(status_value::normal(&[t(token)]), version_base + 1),
    );
    states.insert(
        AppStateKey::StatusWithPort,
        VersionedValue::new(status_value::normal(&[t(token)]), version_base + 1),
    );
    EndpointState::with_states(
        HeartbeatState::with_version(GEN, version_base + 2),
        states,
        now,
    )
}

fn deliver(engine: &mut Gossiper, peer: &EndpointId, state: EndpointState, now: Instant) {
    let message = GossipMessage::Ack2(GossipDigestAck2 {
        states: vec![(peer.clone(), state)],
    });
    let replies = engine.handle_message(peer, message, now, WALL).unwrap();
    for (to, reply) in replies {
        if matches!(reply, GossipMessage::Echo) {
            engine.handle_echo_response(&to, now);
        }
    }
}

#[test]
fn gossiped_normal_states_build_the_ring() {
    let now = Instant::now();
    let (mut engine, ring) = node(ep(1), now);

    deliver(&mut engine, &ep(2), normal_state(20, 1, now), now);
    deliver(&mut engine, &ep(3), normal_state(30, 1, now), now);

    assert!(ring.is_member(&ep(2)));
    assert!(ring.is_member(&ep(3)));
    assert_eq!(ring.sorted_tokens(), vec![t(20), t(30)]);
    assert_eq!(ring.token_owner(t(20)), Some(ep(2)));

    // Ring members are exempt from fat-client removal no matter how long
    // they stay silent.
    let much_later = now + Duration::from_secs(3600);
    let _ = engine.tick(much_later, WALL);
    assert!(engine.is_known_endpoint(&ep(2)));
    assert!(ring.is_member(&ep(2)));
}

#[test]
fn silent_non_members_are_dropped_as_fat_clients() {
    let now = Instant::now();
    let (mut engine, ring) = node(ep(1), now);

    // A client that gossips but never announces tokens.
    let state = EndpointState::with_states(
        HeartbeatState::with_version(GEN, 1),
        AppStateMap::new(),
        now,
    );
    deliver(&mut engine, &ep(9), state, now);
    assert!(engine.is_known_endpoint(&ep(9)));
    assert!(!ring.is_member(&ep(9)));

    // Past the fat-client window the engine drops and quarantines it.
    let later = now + Duration::from_secs(31);
    let _ = engine.tick(later, WALL);
    assert!(engine.quarantined_endpoints().contains(&ep(9)));
}

#[test]
fn left_status_removes_the_member_and_quarantine_protects_it() {
    let now = Instant::now();
    let (mut engine, ring) = node(ep(1), now);
    deliver(&mut engine, &ep(2), normal_state(20, 1, now), now);
    assert!(ring.is_member(&ep(2)));

    // The node leaves; its LEFT state flows through gossip.
    let mut gone = normal_state(20, 1, now);
    let left = status_value::left(&[t(20)], WALL + 1000);
    gone.add_application_states(
        [
            (AppStateKey::Status, VersionedValue::new(left.clone(), 10)),
            (AppStateKey::StatusWithPort, VersionedValue::new(left, 10)),
        ],
        now,
    );
    deliver(&mut engine, &ep(2), gone, now);
    assert!(!ring.is_member(&ep(2)));

    // The engine-side removal quarantines the endpoint so stale NORMAL
    // gossip cannot resurrect it.
    engine.remove_endpoint(&ep(2), now);
    deliver(&mut engine, &ep(2), normal_state(20, 20, now), now);
    assert!(!ring.is_member(&ep(2)), "quarantined endpoint re-joined the ring");
}

#[test]
fn bootstrap_gossip_yields_pending_ranges() {
    let now = Instant::now();
    let (mut engine, ring) = node(ep(1), now);
    deliver(&mut engine, &ep(2), normal_state(20, 1, now), now);
    deliver(&mut engine, &ep(3), normal_state(30, 1, now), now);

    // A fourth node announces a bootstrap at token 25.
    let mut states = AppStateMap::new();
    states.insert(
        AppStateKey::Tokens,
        VersionedValue::new(format_tokens(&[t(25)]), 1),
    );
    states.insert(
        AppStateKey::StatusWithPort,
        VersionedValue::new(status_value::bootstrapping(&[t(25)]), 2),
    );
    let joining = EndpointState::with_states(
        HeartbeatState::with_version(GEN, 3),
        states,
        now,
    );
    deliver(&mut engine, &ep(4), joining, now);

    assert_eq!(ring.bootstrap_tokens().get(&t(25)), Some(&ep(4)));
    let pending = ring.pending_ranges("ks");
    assert!(!pending.is_empty());
    assert!(!pending.ranges_for(&ep(4)).is_empty());
    assert!(ring.pending_endpoints_for("ks", t(25)).contains(&ep(4)));
}
