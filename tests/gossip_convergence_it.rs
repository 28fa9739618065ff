use ringmesh::gossip::state::status_value;
use ringmesh::{
    AppStateKey, DetectorConfig, EndpointId, GossipConfig, GossipMessage, Gossiper,
    Murmur3Partitioner, NoMembers, ShadowPoll, Token, format_tokens,
};
use std::collections::BTreeMap;
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

fn engine(local: EndpointId, seeds: Vec<EndpointId>, rng_seed: u64, now: Instant) -> Gossiper {
    Gossiper::new(
        GossipConfig::new("convergence", seeds),
        local,
        DetectorConfig::default(),
        Arc::new(NoMembers),
        Arc::new(Murmur3Partitioner),
        rng_seed,
        now,
    )
}

fn announce_normal(engine: &mut Gossiper, token: i64, now: Instant) {
    let tokens = [Token(token)];
    engine.add_local_state(AppStateKey::Tokens, format_tokens(&tokens), now);
    engine.set_local_status(status_value::normal(&tokens), now);
}

/// Synchronously routes every queued message, including the replies each
/// delivery produces, until the wires are quiet.
fn pump(
    engines: &mut BTreeMap<EndpointId, Gossiper>,
    mut queue: Vec<(EndpointId, EndpointId, GossipMessage)>,
    now: Instant,
) {
    while let Some((from, to, message)) = queue.pop() {
        let Some(engine) = engines.get_mut(&to) else {
            continue;
        };
        let replies = engine
            .handle_message(&from, message, now, WALL)
            .expect("in-cluster messages are well formed");
        for (next, reply) in replies {
            queue.push((to.clone(), next, reply));
        }
    }
}

/// One tick of `from`, with its SYN payload delivered to every `target`.
/// The engine picks its own peers too, but reusing the payload keeps the
/// exchange schedule deterministic.
fn tick_to(
    engines: &mut BTreeMap<EndpointId, Gossiper>,
    from: &EndpointId,
    targets: &[EndpointId],
    now: Instant,
) {
    let outbound = engines
        .get_mut(from)
        .expect("engine exists")
        .tick(now, WALL);
    let syn = outbound
        .into_iter()
        .map(|(_, message)| message)
        .find(|message| matches!(message, GossipMessage::Syn(_)))
        .expect("tick produced a syn");
    let queue = targets
        .iter()
        .map(|target| (from.clone(), target.clone(), syn.clone()))
        .collect();
    pump(engines, queue, now);
}

/// Boots a node the way a real one joins: shadow round against the seed,
/// then start, announce, and apply the collected cluster state.
fn join_via_shadow_round(
    engines: &mut BTreeMap<EndpointId, Gossiper>,
    id: &EndpointId,
    seeds: Vec<EndpointId>,
    token: i64,
    rng_seed: u64,
    now: Instant,
) {
    let mut joiner = engine(id.clone(), seeds, rng_seed, now);
    let shadow_syns = joiner.start_shadow_round(Vec::new(), now);
    engines.insert(id.clone(), joiner);
    let queue = shadow_syns
        .into_iter()
        .map(|(to, message)| (id.clone(), to, message))
        .collect();
    pump(engines, queue, now);

    let collected = match engines
        .get_mut(id)
        .unwrap()
        .poll_shadow_round(now)
        .expect("seed answered")
    {
        ShadowPoll::Complete(states) => states,
        other => panic!("shadow round did not finish: {other:?}"),
    };

    {
        let joiner = engines.get_mut(id).unwrap();
        joiner.start(GEN, Vec::new(), now);
        announce_normal(joiner, token, now);
    }
    let mut echoes = Vec::new();
    engines
        .get_mut(id)
        .unwrap()
        .apply_state_locally(collected, now, WALL, &mut echoes);
    let queue = echoes
        .into_iter()
        .map(|(to, message)| (id.clone(), to, message))
        .collect();
    pump(engines, queue, now);
}

#[test]
fn three_node_cluster_converges_through_the_seed() {
    let start = Instant::now();
    let a = ep(1);
    let b = ep(2);
    let c = ep(3);
    let seeds = vec![a.clone()];

    let mut engines = BTreeMap::new();
    let mut seed_engine = engine(a.clone(), seeds.clone(), 1, start);
    seed_engine.start(GEN, Vec::new(), start);
    announce_normal(&mut seed_engine, 10, start);
    engines.insert(a.clone(), seed_engine);

    let mut now = start + Duration::from_secs(1);
    join_via_shadow_round(&mut engines, &b, seeds.clone(), 20, 2, now);

    // A and B gossip twice before C shows up.
    for _ in 0..2 {
        now += Duration::from_secs(1);
        tick_to(&mut engines, &b, &[a.clone()], now);
        tick_to(&mut engines, &a, &[b.clone()], now);
    }
    assert!(engines[&a].is_alive(&b));
    assert!(engines[&b].is_alive(&a));

    // C joins through the seed.
    now += Duration::from_secs(1);
    join_via_shadow_round(&mut engines, &c, seeds.clone(), 30, 3, now);

    for _ in 0..3 {
        now += Duration::from_secs(1);
        tick_to(&mut engines, &a, &[b.clone(), c.clone()], now);
        tick_to(&mut engines, &b, &[a.clone(), c.clone()], now);
        tick_to(&mut engines, &c, &[a.clone(), b.clone()], now);
    }

    // A and B know C's token.
    for id in [&a, &b] {
        let seen = engines[id]
            .endpoint_state(&c)
            .and_then(|state| state.application_state(AppStateKey::Tokens).cloned())
            .expect("token state for C");
        assert_eq!(seen.value, "30");
    }

    // C's view of A and B matches A's view of A and B exactly.
    for id in [&a, &b] {
        let at_a = engines[&a].endpoint_state(id).expect("state at A");
        let at_c = engines[&c].endpoint_state(id).expect("state at C");
        assert_eq!(at_a, at_c, "diverged view of {id}");
    }
}

#[test]
fn merged_views_are_version_monotone() {
    let start = Instant::now();
    let a = ep(1);
    let b = ep(2);
    let seeds = vec![a.clone()];

    let mut engines = BTreeMap::new();
    let mut seed_engine = engine(a.clone(), seeds.clone(), 7, start);
    seed_engine.start(GEN, Vec::new(), start);
    announce_normal(&mut seed_engine, 10, start);
    engines.insert(a.clone(), seed_engine);

    let mut now = start + Duration::from_secs(1);
    join_via_shadow_round(&mut engines, &b, seeds.clone(), 20, 8, now);

    let mut last_seen = (0, 0);
    for round in 0..10 {
        now += Duration::from_secs(1);
        tick_to(&mut engines, &b, &[a.clone()], now);
        tick_to(&mut engines, &a, &[b.clone()], now);

        let state = engines[&a].endpoint_state(&b).expect("A knows B");
        let seen = (state.heartbeat().generation, state.max_version());
        assert!(
            seen >= last_seen,
            "view of B regressed in round {round}: {seen:?} < {last_seen:?}"
        );
        last_seen = seen;
    }
    assert!(last_seen > (GEN, 0), "B's heartbeat never advanced at A");
}

#[test]
fn restart_with_newer_generation_replaces_the_old_state() {
    let start = Instant::now();
    let a = ep(1);
    let b = ep(2);
    let seeds = vec![a.clone()];

    let mut engines = BTreeMap::new();
    let mut seed_engine = engine(a.clone(), seeds.clone(), 11, start);
    seed_engine.start(GEN, Vec::new(), start);
    announce_normal(&mut seed_engine, 10, start);
    engines.insert(a.clone(), seed_engine);

    let mut now = start + Duration::from_secs(1);
    join_via_shadow_round(&mut engines, &b, seeds.clone(), 20, 12, now);
    for _ in 0..2 {
        now += Duration::from_secs(1);
        tick_to(&mut engines, &b, &[a.clone()], now);
        tick_to(&mut engines, &a, &[b.clone()], now);
    }
    assert_eq!(engines[&a].current_generation(&b), Some(GEN));

    // B restarts with a fresh generation and a different token.
    engines.remove(&b);
    now += Duration::from_secs(30);
    let mut reborn = engine(b.clone(), seeds.clone(), 13, now);
    reborn.start(GEN + 60, Vec::new(), now);
    announce_normal(&mut reborn, 25, now);
    engines.insert(b.clone(), reborn);

    for _ in 0..2 {
        now += Duration::from_secs(1);
        tick_to(&mut engines, &b, &[a.clone()], now);
        tick_to(&mut engines, &a, &[b.clone()], now);
    }

    assert_eq!(engines[&a].current_generation(&b), Some(GEN + 60));
    let tokens_at_a = engines[&a]
        .endpoint_state(&b)
        .and_then(|state| state.application_state(AppStateKey::Tokens).cloned())
        .expect("tokens after restart");
    assert_eq!(tokens_at_a.value, "25");
}
