//! The anti-entropy engine. One instance owns every endpoint state this
//! node knows about and drives the SYN/ACK/ACK2 exchange. The engine is
//! deterministic: callers inject the monotonic clock, the wall clock and
//! the RNG seed, and every handler returns the messages to put on the
//! wire instead of sending them itself.

use crate::config::{GossipConfig, A_VERY_LONG_TIME, MAX_GENERATION_SKEW};
use crate::endpoint::{EndpointId, NodeAddr};
use crate::gossip::detector::{DetectorConfig, PhiFailureDetector};
use crate::gossip::messages::{
    GossipDigest, GossipDigestAck, GossipDigestAck2, GossipDigestSyn, GossipMessage,
};
use crate::gossip::state::{
    status_value, AppStateKey, EndpointState, HeartbeatState, VersionGenerator, VersionedValue,
};
use crate::gossip::subscriber::StateChangeSubscriber;
use crate::ring::token::{parse_tokens, Partitioner, Token};
use crate::telemetry::MetricsRegistry;
use log::{debug, info, trace, warn};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Messages a handler wants sent, paired with their destination.
pub type Outbound = Vec<(EndpointId, GossipMessage)>;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("cluster name mismatch: ours `{ours}`, peer sent `{theirs}`")]
    ClusterMismatch { ours: String, theirs: String },
    #[error("partitioner mismatch: ours `{ours}`, peer sent `{theirs}`")]
    PartitionerMismatch { ours: String, theirs: String },
    #[error("endpoint {0} is not known to gossip")]
    UnknownEndpoint(EndpointId),
    #[error("generation for {endpoint} changed from {expected} to {actual}; it is alive")]
    GenerationChanged {
        endpoint: EndpointId,
        expected: i32,
        actual: i32,
    },
}

#[derive(Debug, Error)]
pub enum ShadowRoundError {
    #[error("no seed answered the shadow round within {0:?}")]
    NoSeedResponse(Duration),
}

/// The ring's answer to "does this endpoint own tokens". Gossip needs it to
/// tell members apart from fat clients.
pub trait MembershipView: Send + Sync {
    fn is_member(&self, endpoint: &EndpointId) -> bool;
}

/// Membership view for nodes that have not wired a ring yet.
pub struct NoMembers;

impl MembershipView for NoMembers {
    fn is_member(&self, _endpoint: &EndpointId) -> bool {
        false
    }
}

/// Progress of a pre-join shadow round.
#[derive(Debug)]
pub enum ShadowPoll {
    /// Still inside the window; nothing to do right now.
    Waiting,
    /// Still inside the window; re-send these shadow SYNs.
    Resend(Outbound),
    /// The round finished with the collected cluster state (possibly empty
    /// when this node is the first seed up).
    Complete(Vec<(EndpointId, EndpointState)>),
}

#[derive(Debug)]
struct ShadowRound {
    started: Instant,
    last_send: Instant,
    targets: Vec<EndpointId>,
    collected: Vec<(EndpointId, EndpointState)>,
    seeds_in_shadow: BTreeSet<EndpointId>,
    complete: bool,
}

pub struct Gossiper {
    config: GossipConfig,
    local: EndpointId,
    states: HashMap<EndpointId, EndpointState>,
    live: BTreeSet<EndpointId>,
    /// Peer -> when it became unreachable.
    unreachable: HashMap<EndpointId, Instant>,
    /// Peer -> quarantine start. Gossip about these is dropped until the
    /// quarantine delay has elapsed.
    just_removed: HashMap<EndpointId, Instant>,
    /// Peer -> wall-clock millis after which its dead state may be evicted.
    expire_times: HashMap<EndpointId, u64>,
    seeds: BTreeSet<EndpointId>,
    versions: VersionGenerator,
    detector: PhiFailureDetector,
    membership: Arc<dyn MembershipView>,
    partitioner: Arc<dyn Partitioner>,
    subscribers: Vec<Box<dyn StateChangeSubscriber>>,
    rng: ChaCha20Rng,
    enabled: bool,
    pending_echoes: BTreeSet<EndpointId>,
    shadow: Option<ShadowRound>,
    last_processed_message_at: Instant,
    rounds_completed: u64,
    convictions: u64,
}

impl Gossiper {
    pub fn new(
        config: GossipConfig,
        local: EndpointId,
        detector_config: DetectorConfig,
        membership: Arc<dyn MembershipView>,
        partitioner: Arc<dyn Partitioner>,
        rng_seed: u64,
        now: Instant,
    ) -> Self {
        let seeds = config
            .seeds
            .iter()
            .filter(|seed| seed.broadcast != local.broadcast)
            .cloned()
            .collect();
        Self {
            config,
            local,
            states: HashMap::new(),
            live: BTreeSet::new(),
            unreachable: HashMap::new(),
            just_removed: HashMap::new(),
            expire_times: HashMap::new(),
            seeds,
            versions: VersionGenerator::default(),
            detector: PhiFailureDetector::new(detector_config),
            membership,
            partitioner,
            subscribers: Vec::new(),
            rng: ChaCha20Rng::seed_from_u64(rng_seed),
            enabled: false,
            pending_echoes: BTreeSet::new(),
            shadow: None,
            last_processed_message_at: now,
            rounds_completed: 0,
            convictions: 0,
        }
    }

    pub fn register_subscriber(&mut self, subscriber: Box<dyn StateChangeSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn local_endpoint(&self) -> &EndpointId {
        &self.local
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Initializes the local state with the given generation and begins
    /// gossiping. The generation is the node's wall-clock seconds at
    /// process start.
    pub fn start(
        &mut self,
        generation: i32,
        preload: Vec<(AppStateKey, String)>,
        now: Instant,
    ) {
        self.maybe_initialize_local_state(generation, now);
        for (key, value) in preload {
            self.add_local_state(key, value, now);
        }
        self.enabled = true;
        info!(
            "gossip started for {} with generation {}",
            self.local, generation
        );
    }

    pub fn maybe_initialize_local_state(&mut self, generation: i32, now: Instant) {
        self.states
            .entry(self.local.clone())
            .or_insert_with(|| EndpointState::new(HeartbeatState::new(generation), now));
    }

    /// Bumps the local generation past anything the cluster has seen from
    /// us. Used when rejoining with the same address.
    pub fn force_newer_generation(&mut self) {
        if let Some(state) = self.states.get_mut(&self.local) {
            state.heartbeat_mut().force_newer_generation();
        }
    }

    /// Adds one locally originated application state. Subscribers observe
    /// the change synchronously, exactly as for remote updates.
    pub fn add_local_state(&mut self, key: AppStateKey, value: String, now: Instant) {
        let versioned = VersionedValue::new(value, self.versions.next());
        if let Some(state) = self.states.get(&self.local) {
            for subscriber in &self.subscribers {
                subscriber.before_change(&self.local, state, key, &versioned);
            }
        }
        if let Some(state) = self.states.get_mut(&self.local) {
            state.add_application_state(key, versioned.clone(), now);
        }
        for subscriber in &self.subscribers {
            subscriber.on_change(&self.local, key, &versioned);
        }
    }

    /// Writes both status keys, so peers reading either the legacy or the
    /// port-aware key agree on the payload.
    pub fn set_local_status(&mut self, payload: String, now: Instant) {
        self.add_local_state(AppStateKey::Status, payload.clone(), now);
        self.add_local_state(AppStateKey::StatusWithPort, payload, now);
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// One gossip round: bump the heartbeat, pick peers, and run the
    /// periodic status check. Returns the SYNs to send.
    pub fn tick(&mut self, now: Instant, wall_millis: u64) -> Outbound {
        if !self.enabled {
            return Vec::new();
        }
        let versions = &self.versions;
        if let Some(state) = self.states.get_mut(&self.local) {
            state.heartbeat_mut().update(versions);
            trace!("local heartbeat is now {}", state.heartbeat().version);
        }

        let mut out = Vec::new();
        let digests = self.make_random_gossip_digest();
        if !digests.is_empty() {
            let syn = GossipMessage::Syn(GossipDigestSyn {
                cluster_name: self.config.cluster_name.clone(),
                partitioner_name: self.config.partitioner_name.clone(),
                digests,
            });
            let gossiped_to_seed = self.gossip_to_live_member(&syn, &mut out);
            self.maybe_gossip_to_unreachable(&syn, &mut out);
            // Guards against partitions where disjoint groups only ever talk
            // to disjoint subsets of the seeds.
            if !gossiped_to_seed || self.live.len() < self.seeds.len() {
                self.maybe_gossip_to_seed(&syn, &mut out);
            }
            self.status_check(now, wall_millis);
            self.rounds_completed += 1;
        }
        out
    }

    fn make_random_gossip_digest(&mut self) -> Vec<GossipDigest> {
        let mut endpoints: Vec<EndpointId> = self.states.keys().cloned().collect();
        endpoints.shuffle(&mut self.rng);
        endpoints
            .into_iter()
            .map(|endpoint| {
                let state = &self.states[&endpoint];
                let generation = state.heartbeat().generation;
                let max_version = state.max_version();
                GossipDigest::new(endpoint, generation, max_version)
            })
            .collect()
    }

    fn gossip_to_live_member(&mut self, syn: &GossipMessage, out: &mut Outbound) -> bool {
        let candidates: Vec<EndpointId> = self.live.iter().cloned().collect();
        let Some(peer) = candidates.choose(&mut self.rng).cloned() else {
            return false;
        };
        out.push((peer.clone(), syn.clone()));
        self.seeds.contains(&peer)
    }

    fn maybe_gossip_to_unreachable(&mut self, syn: &GossipMessage, out: &mut Outbound) {
        if self.unreachable.is_empty() {
            return;
        }
        let probability = self.unreachable.len() as f64 / (self.live.len() as f64 + 1.0);
        if self.rng.gen::<f64>() < probability {
            let candidates: Vec<EndpointId> = self.unreachable.keys().cloned().collect();
            if let Some(peer) = candidates.choose(&mut self.rng).cloned() {
                out.push((peer, syn.clone()));
            }
        }
    }

    fn maybe_gossip_to_seed(&mut self, syn: &GossipMessage, out: &mut Outbound) {
        if self.seeds.is_empty() {
            return;
        }
        let send = if self.live.is_empty() {
            true
        } else {
            let probability =
                self.seeds.len() as f64 / (self.live.len() + self.unreachable.len()) as f64;
            self.rng.gen::<f64>() <= probability
        };
        if send {
            let candidates: Vec<EndpointId> = self.seeds.iter().cloned().collect();
            if let Some(seed) = candidates.choose(&mut self.rng).cloned() {
                out.push((seed, syn.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Message handlers
    // ------------------------------------------------------------------

    /// Routes one inbound message. Returns the replies to send.
    pub fn handle_message(
        &mut self,
        from: &EndpointId,
        message: GossipMessage,
        now: Instant,
        wall_millis: u64,
    ) -> Result<Outbound, GossipError> {
        match message {
            GossipMessage::Syn(syn) => self.handle_syn(from, syn, now, wall_millis),
            GossipMessage::Ack(ack) => Ok(self.handle_ack(from, ack, now, wall_millis)),
            GossipMessage::Ack2(ack2) => Ok(self.handle_ack2(from, ack2, now, wall_millis)),
            GossipMessage::Shutdown => {
                self.handle_peer_shutdown(from, now);
                Ok(Vec::new())
            }
            GossipMessage::Echo => Ok(vec![(from.clone(), GossipMessage::EchoResponse)]),
            GossipMessage::EchoResponse => {
                self.handle_echo_response(from, now);
                Ok(Vec::new())
            }
        }
    }

    pub fn handle_syn(
        &mut self,
        from: &EndpointId,
        syn: GossipDigestSyn,
        now: Instant,
        _wall_millis: u64,
    ) -> Result<Outbound, GossipError> {
        if !self.enabled && self.shadow.is_none() {
            trace!("ignoring syn from {from}: gossip is disabled");
            return Ok(Vec::new());
        }
        self.last_processed_message_at = now;
        if syn.cluster_name != self.config.cluster_name {
            return Err(GossipError::ClusterMismatch {
                ours: self.config.cluster_name.clone(),
                theirs: syn.cluster_name,
            });
        }
        if syn.partitioner_name != self.config.partitioner_name {
            return Err(GossipError::PartitionerMismatch {
                ours: self.config.partitioner_name.clone(),
                theirs: syn.partitioner_name,
            });
        }

        if syn.digests.is_empty() {
            // A shadow request. A node that is itself still in a shadow
            // round answers empty so the peer can tell nobody is up yet.
            debug!("received a shadow round syn from {from}");
            let states = if self.shadow.is_some() {
                Vec::new()
            } else {
                self.states
                    .iter()
                    .map(|(endpoint, state)| (endpoint.clone(), state.clone()))
                    .collect()
            };
            return Ok(vec![(
                from.clone(),
                GossipMessage::Ack(GossipDigestAck {
                    requests: Vec::new(),
                    states,
                }),
            )]);
        }

        let (requests, states) = self.examine_digests(&syn.digests);
        Ok(vec![(
            from.clone(),
            GossipMessage::Ack(GossipDigestAck { requests, states }),
        )])
    }

    /// One comparison per digest: request what the peer knows better, ship
    /// what we know better.
    fn examine_digests(
        &self,
        digests: &[GossipDigest],
    ) -> (Vec<GossipDigest>, Vec<(EndpointId, EndpointState)>) {
        let mut requests = Vec::new();
        let mut deltas = Vec::new();
        for digest in digests {
            let Some(local) = self.states.get(&digest.endpoint) else {
                requests.push(GossipDigest::new(
                    digest.endpoint.clone(),
                    digest.generation,
                    0,
                ));
                continue;
            };
            let local_generation = local.heartbeat().generation;
            let local_max = local.max_version();
            match digest.generation.cmp(&local_generation) {
                Ordering::Greater => {
                    requests.push(GossipDigest::new(
                        digest.endpoint.clone(),
                        digest.generation,
                        0,
                    ));
                }
                Ordering::Less => {
                    self.push_delta(&digest.endpoint, local, 0, &mut deltas);
                }
                Ordering::Equal => match digest.max_version.cmp(&local_max) {
                    Ordering::Greater => {
                        requests.push(GossipDigest::new(
                            digest.endpoint.clone(),
                            local_generation,
                            local_max,
                        ));
                    }
                    Ordering::Less => {
                        self.push_delta(&digest.endpoint, local, digest.max_version, &mut deltas);
                    }
                    Ordering::Equal => {}
                },
            }
        }
        (requests, deltas)
    }

    fn push_delta(
        &self,
        endpoint: &EndpointId,
        local: &EndpointState,
        floor: i32,
        deltas: &mut Vec<(EndpointId, EndpointState)>,
    ) {
        if let Some(delta) = local.state_for_version_above(floor) {
            deltas.push((endpoint.clone(), delta));
        }
    }

    pub fn handle_ack(
        &mut self,
        from: &EndpointId,
        ack: GossipDigestAck,
        now: Instant,
        wall_millis: u64,
    ) -> Outbound {
        self.last_processed_message_at = now;
        if self.shadow.is_some() {
            self.maybe_finish_shadow_round(from, &ack);
            return Vec::new();
        }
        if !self.enabled {
            trace!("ignoring ack from {from}: gossip is disabled");
            return Vec::new();
        }

        let mut out = Vec::new();
        if !ack.states.is_empty() {
            self.notify_failure_detector(&ack.states, now);
            self.apply_state_locally(ack.states, now, wall_millis, &mut out);
        }

        let mut deltas = Vec::new();
        for request in &ack.requests {
            if let Some(local) = self.states.get(&request.endpoint) {
                self.push_delta(&request.endpoint, local, request.max_version, &mut deltas);
            }
        }
        out.push((
            from.clone(),
            GossipMessage::Ack2(GossipDigestAck2 { states: deltas }),
        ));
        out
    }

    pub fn handle_ack2(
        &mut self,
        from: &EndpointId,
        ack2: GossipDigestAck2,
        now: Instant,
        wall_millis: u64,
    ) -> Outbound {
        if !self.enabled {
            trace!("ignoring ack2 from {from}: gossip is disabled");
            return Vec::new();
        }
        self.last_processed_message_at = now;
        let mut out = Vec::new();
        self.notify_failure_detector(&ack2.states, now);
        self.apply_state_locally(ack2.states, now, wall_millis, &mut out);
        out
    }

    pub fn handle_echo_response(&mut self, from: &EndpointId, now: Instant) {
        if self.pending_echoes.remove(from) {
            self.real_mark_alive(from, now);
        }
    }

    fn handle_peer_shutdown(&mut self, from: &EndpointId, now: Instant) {
        if !self.enabled {
            debug!("ignoring shutdown message from {from}: gossip is disabled");
            return;
        }
        if !self.states.contains_key(from) {
            debug!("ignoring shutdown message from unknown endpoint {from}");
            return;
        }
        self.mark_as_shutdown(from, now);
    }

    /// Feeds the detector every heartbeat that moved forward, before the
    /// merge mutates local state.
    fn notify_failure_detector(&mut self, incoming: &[(EndpointId, EndpointState)], now: Instant) {
        for (endpoint, remote) in incoming {
            if *endpoint == self.local {
                continue;
            }
            let report = match self.states.get(endpoint) {
                None => true,
                Some(local) => {
                    let remote_heartbeat = remote.heartbeat();
                    let local_heartbeat = local.heartbeat();
                    remote_heartbeat.generation > local_heartbeat.generation
                        || (remote_heartbeat.generation == local_heartbeat.generation
                            && remote_heartbeat.version > local_heartbeat.version)
                }
            };
            if report {
                self.detector.report(endpoint, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// The authoritative merge of remote endpoint states into our map.
    pub fn apply_state_locally(
        &mut self,
        incoming: Vec<(EndpointId, EndpointState)>,
        now: Instant,
        wall_millis: u64,
        out: &mut Outbound,
    ) {
        let max_generation = (wall_millis / 1000) as i64 + MAX_GENERATION_SKEW.as_secs() as i64;
        for (endpoint, remote) in incoming {
            if endpoint == self.local || endpoint.broadcast == self.local.broadcast {
                continue;
            }
            if self.just_removed.contains_key(&endpoint) {
                debug!("ignoring gossip for {endpoint} because it is quarantined");
                continue;
            }
            let remote_generation = remote.heartbeat().generation;
            if (remote_generation as i64) > max_generation {
                warn!(
                    "received an invalid gossip generation {} for peer {endpoint}; local time is {}",
                    remote_generation,
                    wall_millis / 1000
                );
                continue;
            }

            match self.states.get(&endpoint) {
                None => {
                    self.handle_major_state_change(&endpoint, remote, now, out);
                }
                Some(local) => {
                    let local_generation = local.heartbeat().generation;
                    match remote_generation.cmp(&local_generation) {
                        Ordering::Greater => {
                            self.handle_major_state_change(&endpoint, remote, now, out);
                        }
                        Ordering::Less => {
                            trace!(
                                "ignoring remote generation {remote_generation} < {local_generation} for {endpoint}"
                            );
                        }
                        Ordering::Equal => {
                            if remote.max_version() > local.max_version() {
                                self.apply_new_states(&endpoint, &remote, now);
                            } else {
                                trace!(
                                    "ignoring remote version {} <= {} for {endpoint}",
                                    remote.max_version(),
                                    local.max_version()
                                );
                            }
                            self.maybe_mark_alive(&endpoint, out);
                        }
                    }
                }
            }
        }
    }

    /// Wholesale replacement on a generation change (restart or first
    /// contact).
    fn handle_major_state_change(
        &mut self,
        endpoint: &EndpointId,
        remote: EndpointState,
        now: Instant,
        out: &mut Outbound,
    ) {
        if let Some(previous) = self.states.get(endpoint) {
            if !remote.in_dead_state() {
                info!("node {endpoint} has restarted, now UP");
            }
            for subscriber in &self.subscribers {
                subscriber.on_restart(endpoint, previous);
            }
        } else if !remote.in_dead_state() {
            info!("node {endpoint} is now part of the cluster");
        }

        let mut fresh = remote;
        fresh.touch(now);
        let dead = fresh.in_dead_state();
        self.states.insert(endpoint.clone(), fresh);

        if let Some(state) = self.states.get(endpoint) {
            let state = state.clone();
            for subscriber in &self.subscribers {
                subscriber.on_join(endpoint, &state);
            }
            let entries: Vec<(AppStateKey, VersionedValue)> = state
                .states()
                .map(|(key, value)| (*key, value.clone()))
                .collect();
            for (key, value) in &entries {
                for subscriber in &self.subscribers {
                    subscriber.on_change(endpoint, *key, value);
                }
            }
        }

        self.detector.report(endpoint, now);
        if dead {
            self.mark_dead(endpoint, now);
        } else {
            self.maybe_mark_alive(endpoint, out);
        }
    }

    /// Same-generation merge: adopt the newer heartbeat and every entry
    /// strictly newer than what we hold.
    fn apply_new_states(&mut self, endpoint: &EndpointId, remote: &EndpointState, now: Instant) {
        let Some(local) = self.states.get(endpoint) else {
            return;
        };
        debug_assert_eq!(remote.heartbeat().generation, local.heartbeat().generation);

        let updates: Vec<(AppStateKey, VersionedValue)> = remote
            .states()
            .filter(|(key, value)| {
                local
                    .application_state(**key)
                    .map(|existing| existing.version < value.version)
                    .unwrap_or(true)
            })
            .map(|(key, value)| (*key, value.clone()))
            .collect();

        for (key, value) in &updates {
            for subscriber in &self.subscribers {
                subscriber.before_change(endpoint, local, *key, value);
            }
        }

        let adopt_heartbeat = remote.heartbeat().version > local.heartbeat().version;
        if let Some(local) = self.states.get_mut(endpoint) {
            if adopt_heartbeat {
                local.set_heartbeat(remote.heartbeat(), now);
            }
            local.add_application_states(updates.clone(), now);
        }

        for (key, value) in &updates {
            for subscriber in &self.subscribers {
                subscriber.on_change(endpoint, *key, value);
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Sends an echo and promotes the endpoint only once the reply comes
    /// back, so a replayed heartbeat alone cannot resurrect a peer.
    fn maybe_mark_alive(&mut self, endpoint: &EndpointId, out: &mut Outbound) {
        let Some(state) = self.states.get(endpoint) else {
            return;
        };
        if state.is_alive() || state.in_dead_state() {
            return;
        }
        if self.pending_echoes.insert(endpoint.clone()) {
            debug!("requesting echo from {endpoint} before marking it alive");
            out.push((endpoint.clone(), GossipMessage::Echo));
        }
    }

    fn real_mark_alive(&mut self, endpoint: &EndpointId, now: Instant) {
        let Some(state) = self.states.get_mut(endpoint) else {
            return;
        };
        state.mark_alive();
        state.touch(now);
        self.live.insert(endpoint.clone());
        self.unreachable.remove(endpoint);
        info!("endpoint {endpoint} is now UP");
        if let Some(state) = self.states.get(endpoint) {
            let state = state.clone();
            for subscriber in &self.subscribers {
                subscriber.on_alive(endpoint, &state);
            }
        }
    }

    fn mark_dead(&mut self, endpoint: &EndpointId, now: Instant) {
        let Some(state) = self.states.get_mut(endpoint) else {
            return;
        };
        state.mark_dead();
        self.live.remove(endpoint);
        self.pending_echoes.remove(endpoint);
        self.unreachable.entry(endpoint.clone()).or_insert(now);
        info!("endpoint {endpoint} is now DOWN");
        if let Some(state) = self.states.get(endpoint) {
            let state = state.clone();
            for subscriber in &self.subscribers {
                subscriber.on_dead(endpoint, &state);
            }
        }
    }

    /// Failure-detector verdict for one endpoint.
    pub fn convict(&mut self, endpoint: &EndpointId, phi: f64, now: Instant) {
        let Some(state) = self.states.get(endpoint) else {
            return;
        };
        if !state.is_alive() {
            return;
        }
        debug!(
            "convicting {endpoint} with phi {phi:.2}, status {:?}",
            state.status()
        );
        self.convictions += 1;
        if state.status() == Some(crate::gossip::state::GossipStatus::Shutdown) {
            self.mark_as_shutdown(endpoint, now);
        } else {
            self.mark_dead(endpoint, now);
        }
    }

    /// Records that the peer exited cleanly: pin its shutdown state above
    /// any in-flight update for this generation, then mark it dead.
    fn mark_as_shutdown(&mut self, endpoint: &EndpointId, now: Instant) {
        let shutdown_version = self.versions.next();
        let Some(state) = self.states.get_mut(endpoint) else {
            return;
        };
        state.add_application_states(
            [
                (
                    AppStateKey::Status,
                    VersionedValue::new(status_value::shutdown(), shutdown_version),
                ),
                (
                    AppStateKey::StatusWithPort,
                    VersionedValue::new(status_value::shutdown(), shutdown_version),
                ),
            ],
            now,
        );
        state.heartbeat_mut().force_highest_possible_version();
        self.detector.force_conviction(endpoint, now);
        self.mark_dead(endpoint, now);
    }

    // ------------------------------------------------------------------
    // Status check
    // ------------------------------------------------------------------

    fn status_check(&mut self, now: Instant, wall_millis: u64) {
        let fat_client_timeout = self.config.fat_client_timeout();
        let endpoints: Vec<EndpointId> = self
            .states
            .keys()
            .filter(|endpoint| **endpoint != self.local)
            .cloned()
            .collect();

        for endpoint in endpoints {
            if let Some(interpretation) = self.detector.interpret(&endpoint, now) {
                if let Some(conviction) = interpretation.conviction {
                    self.convict(&endpoint, conviction.phi, now);
                }
            }

            let Some(state) = self.states.get(&endpoint) else {
                continue;
            };
            let is_member = self.membership.is_member(&endpoint);
            let silent_for = now.saturating_duration_since(state.update_timestamp());

            // A fat client gossips but owns no tokens. Drop it once it has
            // been silent for half the quarantine window.
            if !is_member
                && !self.just_removed.contains_key(&endpoint)
                && silent_for > fat_client_timeout
            {
                info!(
                    "fat client {endpoint} has been silent for {silent_for:?}, removing from gossip"
                );
                self.remove_endpoint(&endpoint, now);
                continue;
            }

            if !is_member && !state.is_alive() && wall_millis > self.expire_time_for(&endpoint) {
                debug!("time to evict expired dead state for {endpoint}");
                self.evict_from_membership(&endpoint);
            }
        }

        let quarantine = self.config.quarantine_delay();
        self.just_removed.retain(|endpoint, since| {
            let keep = now.saturating_duration_since(*since) < quarantine;
            if !keep {
                debug!("{quarantine:?} elapsed, {endpoint} gossip quarantine over");
            }
            keep
        });

        if !self.live.is_empty()
            && now.saturating_duration_since(self.last_processed_message_at)
                > self.config.interval * 5
        {
            warn!(
                "gossip stage has processed no messages for {:?}; it may be backlogged",
                now.saturating_duration_since(self.last_processed_message_at)
            );
        }
    }

    fn expire_time_for(&self, endpoint: &EndpointId) -> u64 {
        self.expire_times.get(endpoint).copied().unwrap_or(u64::MAX)
    }

    /// Lets a LEFT/removed payload schedule eviction of the dead state.
    pub fn note_expire_time(&mut self, endpoint: &EndpointId, expire_at_millis: u64) {
        self.expire_times
            .insert(endpoint.clone(), expire_at_millis);
    }

    pub fn set_last_processed_message_at(&mut self, at: Instant) {
        self.last_processed_message_at = at;
    }

    // ------------------------------------------------------------------
    // Removal, replacement, assassination
    // ------------------------------------------------------------------

    /// Removes the endpoint from gossip and quarantines it so stale gossip
    /// cannot resurrect it.
    pub fn remove_endpoint(&mut self, endpoint: &EndpointId, now: Instant) {
        for subscriber in &self.subscribers {
            subscriber.on_remove(endpoint);
        }
        self.live.remove(endpoint);
        self.unreachable.remove(endpoint);
        self.pending_echoes.remove(endpoint);
        self.detector.remove(endpoint);
        self.quarantine_endpoint(endpoint, now);
        info!("removed {endpoint} from gossip");
    }

    fn quarantine_endpoint(&mut self, endpoint: &EndpointId, now: Instant) {
        self.just_removed.insert(endpoint.clone(), now);
    }

    /// Removal of an endpoint that has been replaced by a new node at the
    /// same position.
    pub fn replaced_endpoint(&mut self, endpoint: &EndpointId, now: Instant) {
        self.remove_endpoint(endpoint, now);
    }

    fn evict_from_membership(&mut self, endpoint: &EndpointId) {
        self.states.remove(endpoint);
        self.live.remove(endpoint);
        self.unreachable.remove(endpoint);
        self.pending_echoes.remove(endpoint);
        self.expire_times.remove(endpoint);
        self.detector.remove(endpoint);
        debug!("evicted {endpoint} from gossip");
    }

    /// First half of assassination: note the current generation. The caller
    /// must wait a ring delay before finishing, to confirm the node is not
    /// actually alive.
    pub fn begin_assassinate(&mut self, endpoint: &EndpointId, now: Instant) -> i32 {
        match self.states.get(endpoint) {
            Some(state) => state.heartbeat().generation,
            None => {
                // Never-seen endpoint: seed an empty state so the LEFT
                // broadcast has something to attach to.
                self.states
                    .insert(endpoint.clone(), EndpointState::new(HeartbeatState::new(0), now));
                0
            }
        }
    }

    /// Second half of assassination: force a LEFT state with a bumped
    /// generation and broadcast it through normal gossip. Fails when the
    /// generation moved, which means the node is alive.
    pub fn finish_assassinate(
        &mut self,
        endpoint: &EndpointId,
        observed_generation: i32,
        now: Instant,
        wall_millis: u64,
    ) -> Result<(), GossipError> {
        let tokens = {
            let Some(state) = self.states.get(endpoint) else {
                return Err(GossipError::UnknownEndpoint(endpoint.clone()));
            };
            let current = state.heartbeat().generation;
            if current != observed_generation {
                return Err(GossipError::GenerationChanged {
                    endpoint: endpoint.clone(),
                    expected: observed_generation,
                    actual: current,
                });
            }
            let from_state = state
                .application_state(AppStateKey::Tokens)
                .and_then(|value| parse_tokens(&value.value).ok())
                .unwrap_or_default();
            if from_state.is_empty() {
                warn!("unable to calculate tokens for {endpoint}, using a random token");
                vec![self.partitioner.random_token(&mut self.rng)]
            } else {
                from_state
            }
        };

        let expire_at = wall_millis + A_VERY_LONG_TIME.as_millis() as u64;
        let left_version = self.versions.next();
        let left = status_value::left(&tokens, expire_at);
        let mut condemned = match self.states.get(endpoint) {
            Some(state) => state.clone(),
            None => return Err(GossipError::UnknownEndpoint(endpoint.clone())),
        };
        condemned.heartbeat_mut().force_newer_generation();
        condemned.add_application_states(
            [
                (
                    AppStateKey::Status,
                    VersionedValue::new(left.clone(), left_version),
                ),
                (
                    AppStateKey::StatusWithPort,
                    VersionedValue::new(left, left_version),
                ),
            ],
            now,
        );
        self.note_expire_time(endpoint, expire_at);

        info!("assassinating {endpoint} via gossip");
        let mut out = Vec::new();
        self.handle_major_state_change(endpoint, condemned, now, &mut out);
        Ok(())
    }

    /// Advertises this node as the coordinator removing `endpoint`'s
    /// tokens.
    pub fn advertise_removing(
        &mut self,
        endpoint: &EndpointId,
        removed_host_id: Uuid,
        coordinator_host_id: Uuid,
        now: Instant,
    ) {
        let version = self.versions.next();
        let coordinator_version = self.versions.next();
        let Some(state) = self.states.get_mut(endpoint) else {
            return;
        };
        info!("advertising removal of {endpoint}");
        state.add_application_states(
            [
                (
                    AppStateKey::Status,
                    VersionedValue::new(status_value::removing(removed_host_id), version),
                ),
                (
                    AppStateKey::StatusWithPort,
                    VersionedValue::new(status_value::removing(removed_host_id), version),
                ),
                (
                    AppStateKey::RemovalCoordinator,
                    VersionedValue::new(coordinator_host_id.to_string(), coordinator_version),
                ),
            ],
            now,
        );
    }

    /// Marks the token removal finished, with an expiry after which the
    /// dead state may be evicted everywhere.
    pub fn advertise_token_removed(
        &mut self,
        endpoint: &EndpointId,
        removed_host_id: Uuid,
        now: Instant,
        wall_millis: u64,
    ) {
        let expire_at = wall_millis + A_VERY_LONG_TIME.as_millis() as u64;
        let version = self.versions.next();
        if let Some(state) = self.states.get_mut(endpoint) {
            state.add_application_states(
                [
                    (
                        AppStateKey::Status,
                        VersionedValue::new(status_value::removed(removed_host_id, expire_at), version),
                    ),
                    (
                        AppStateKey::StatusWithPort,
                        VersionedValue::new(status_value::removed(removed_host_id, expire_at), version),
                    ),
                ],
                now,
            );
            info!("completed removal of {endpoint}, dead state expires at {expire_at}");
        }
        self.note_expire_time(endpoint, expire_at);
    }

    /// Seeds gossip from the persisted peers table at startup. Every stored
    /// peer comes up as a generation-zero dead entry that real gossip
    /// overrides.
    pub fn load_saved_endpoints(
        &mut self,
        store: &dyn crate::store::PeerStore,
        now: Instant,
    ) -> usize {
        let mut loaded = 0;
        for record in store.peers() {
            if record.endpoint == self.local {
                continue;
            }
            self.add_saved_endpoint(&record.endpoint, &record.tokens, now);
            loaded += 1;
        }
        info!("seeded {loaded} endpoints from the peers table");
        loaded
    }

    /// Seeds a peer from persisted storage: generation zero, marked dead
    /// until real gossip proves otherwise.
    pub fn add_saved_endpoint(
        &mut self,
        endpoint: &EndpointId,
        tokens: &[Token],
        now: Instant,
    ) {
        if *endpoint == self.local {
            warn!("attempted to add our own address {endpoint} as a saved endpoint");
            return;
        }
        let token_version = self.versions.next();
        let host_version = self.versions.next();
        let mut state = self
            .states
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| EndpointState::new(HeartbeatState::new(0), now));
        let mut entries = Vec::new();
        if !tokens.is_empty() {
            entries.push((
                AppStateKey::Tokens,
                crate::gossip::state::tokens_value(tokens, token_version),
            ));
        }
        if !endpoint.has_nil_host_id() {
            entries.push((
                AppStateKey::HostId,
                VersionedValue::new(endpoint.host_id.to_string(), host_version),
            ));
        }
        state.add_application_states(entries, now);
        state.mark_dead();
        self.states.insert(endpoint.clone(), state);
        self.unreachable.insert(endpoint.clone(), now);
        debug!("added saved endpoint {endpoint}");
    }

    // ------------------------------------------------------------------
    // Shadow round
    // ------------------------------------------------------------------

    /// Begins the pre-join state collection: empty SYNs to the seeds (and
    /// any known peers), without advertising ourselves.
    pub fn start_shadow_round(&mut self, extra_peers: Vec<EndpointId>, now: Instant) -> Outbound {
        let mut targets: Vec<EndpointId> = self.seeds.iter().cloned().collect();
        for peer in extra_peers {
            if peer.broadcast != self.local.broadcast && !targets.contains(&peer) {
                targets.push(peer);
            }
        }
        self.shadow = Some(ShadowRound {
            started: now,
            last_send: now,
            targets: targets.clone(),
            collected: Vec::new(),
            seeds_in_shadow: BTreeSet::new(),
            complete: false,
        });
        info!("starting shadow gossip round, contacting {} peers", targets.len());
        self.shadow_syn_batch(&targets)
    }

    fn shadow_syn_batch(&self, targets: &[EndpointId]) -> Outbound {
        let syn = GossipMessage::Syn(GossipDigestSyn {
            cluster_name: self.config.cluster_name.clone(),
            partitioner_name: self.config.partitioner_name.clone(),
            digests: Vec::new(),
        });
        targets
            .iter()
            .map(|target| (target.clone(), syn.clone()))
            .collect()
    }

    fn maybe_finish_shadow_round(&mut self, respondent: &EndpointId, ack: &GossipDigestAck) {
        let is_seed = self.seeds.contains(respondent);
        let seed_count = self.seeds.len();
        let local_is_seed = self.local_is_seed();
        let Some(shadow) = self.shadow.as_mut() else {
            return;
        };
        if shadow.complete {
            return;
        }
        if ack.states.is_empty() {
            // The peer is itself still in a shadow round. If every seed is,
            // a seed node may conclude the cluster is starting fresh.
            if is_seed {
                shadow.seeds_in_shadow.insert(respondent.clone());
            }
            let all_seeds_shadowing =
                seed_count > 0 && shadow.seeds_in_shadow.len() == seed_count;
            if all_seeds_shadowing && local_is_seed {
                info!("all seeds are in a shadow round; concluding an empty shadow round");
                shadow.complete = true;
            }
        } else if is_seed || shadow.targets.contains(respondent) {
            debug!(
                "received a regular ack from {respondent}, can now exit shadow round"
            );
            shadow.collected = ack.states.clone();
            shadow.complete = true;
        }
    }

    fn local_is_seed(&self) -> bool {
        self.config
            .seeds
            .iter()
            .any(|seed| seed.broadcast == self.local.broadcast)
    }

    /// Drives the shadow round forward. Call once per tick interval.
    pub fn poll_shadow_round(&mut self, now: Instant) -> Result<ShadowPoll, ShadowRoundError> {
        let is_seed = self.local_is_seed();
        let deadline = self.config.shadow_round_deadline(is_seed);
        let interval = self.config.interval;
        let Some(shadow) = self.shadow.as_mut() else {
            return Ok(ShadowPoll::Waiting);
        };

        if shadow.complete {
            let collected = std::mem::take(&mut shadow.collected);
            self.shadow = None;
            return Ok(ShadowPoll::Complete(collected));
        }

        let elapsed = now.saturating_duration_since(shadow.started);
        if elapsed > deadline {
            if is_seed {
                // A seed that heard nothing is entitled to boot the cluster.
                info!("no responses after {elapsed:?}; seed concluding empty shadow round");
                self.shadow = None;
                return Ok(ShadowPoll::Complete(Vec::new()));
            }
            self.shadow = None;
            return Err(ShadowRoundError::NoSeedResponse(deadline));
        }

        if now.saturating_duration_since(shadow.last_send) >= interval {
            shadow.last_send = now;
            let targets = shadow.targets.clone();
            return Ok(ShadowPoll::Resend(self.shadow_syn_batch(&targets)));
        }
        Ok(ShadowPoll::Waiting)
    }

    pub fn in_shadow_round(&self) -> bool {
        self.shadow.is_some()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Announces an orderly exit: pin the shutdown status locally, tell
    /// every live peer, stop gossiping. The caller should allow a grace
    /// period for the announcements before dropping connections.
    pub fn announce_shutdown(&mut self, now: Instant) -> Outbound {
        if !self.enabled {
            return Vec::new();
        }
        info!("announcing shutdown to the cluster");
        self.set_local_status(status_value::shutdown(), now);
        let out = self
            .live
            .iter()
            .map(|peer| (peer.clone(), GossipMessage::Shutdown))
            .collect();
        self.enabled = false;
        out
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn endpoint_state(&self, endpoint: &EndpointId) -> Option<&EndpointState> {
        self.states.get(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointId> {
        self.states.keys()
    }

    pub fn endpoint_count(&self) -> usize {
        self.states.len()
    }

    pub fn is_alive(&self, endpoint: &EndpointId) -> bool {
        if *endpoint == self.local {
            return self.enabled;
        }
        self.states
            .get(endpoint)
            .map(|state| state.is_alive())
            .unwrap_or(false)
    }

    pub fn is_known_endpoint(&self, endpoint: &EndpointId) -> bool {
        self.states.contains_key(endpoint)
    }

    /// Endpoints gossiping without owning any tokens.
    pub fn is_gossip_only_member(&self, endpoint: &EndpointId) -> bool {
        self.states.contains_key(endpoint) && !self.membership.is_member(endpoint)
    }

    pub fn live_members(&self) -> BTreeSet<EndpointId> {
        let mut members = self.live.clone();
        if self.enabled {
            members.insert(self.local.clone());
        }
        members
    }

    pub fn unreachable_members(&self) -> BTreeSet<EndpointId> {
        self.unreachable.keys().cloned().collect()
    }

    pub fn live_token_owners(&self) -> BTreeSet<EndpointId> {
        self.live_members()
            .into_iter()
            .filter(|endpoint| self.membership.is_member(endpoint))
            .collect()
    }

    pub fn unreachable_token_owners(&self) -> BTreeSet<EndpointId> {
        self.unreachable
            .keys()
            .filter(|endpoint| self.membership.is_member(endpoint))
            .cloned()
            .collect()
    }

    /// How long the endpoint has been unreachable, zero if it is not.
    pub fn endpoint_downtime(&self, endpoint: &EndpointId, now: Instant) -> Duration {
        self.unreachable
            .get(endpoint)
            .map(|since| now.saturating_duration_since(*since))
            .unwrap_or(Duration::ZERO)
    }

    pub fn current_generation(&self, endpoint: &EndpointId) -> Option<i32> {
        self.states
            .get(endpoint)
            .map(|state| state.heartbeat().generation)
    }

    /// Host id advertised through gossip, falling back to the identity's.
    pub fn host_id(&self, endpoint: &EndpointId) -> Option<Uuid> {
        self.states
            .get(endpoint)
            .and_then(|state| state.host_id())
            .or_else(|| (!endpoint.has_nil_host_id()).then(|| endpoint.host_id))
    }

    pub fn endpoint_by_address(&self, address: &NodeAddr) -> Option<EndpointId> {
        self.states
            .keys()
            .find(|endpoint| endpoint.has_address(address))
            .cloned()
    }

    /// Orders two endpoints by startup: generation, then heartbeat version.
    pub fn compare_endpoint_startup(&self, a: &EndpointId, b: &EndpointId) -> Option<Ordering> {
        let sa = self.states.get(a)?.heartbeat();
        let sb = self.states.get(b)?.heartbeat();
        Some(
            sa.generation
                .cmp(&sb.generation)
                .then(sa.version.cmp(&sb.version)),
        )
    }

    pub fn release_versions(&self) -> BTreeMap<EndpointId, String> {
        self.states
            .iter()
            .filter_map(|(endpoint, state)| {
                state
                    .release_version()
                    .map(|version| (endpoint.clone(), version.to_string()))
            })
            .collect()
    }

    /// Whether we have gossiped with any configured seed, by identity.
    pub fn seen_any_seed(&self) -> bool {
        self.states.keys().any(|endpoint| self.seeds.contains(endpoint))
    }

    pub fn seeds(&self) -> Vec<EndpointId> {
        self.seeds.iter().cloned().collect()
    }

    /// Replaces the seed set, never admitting ourselves. Returns the new
    /// list for the management surface.
    pub fn reload_seeds(&mut self, seeds: Vec<EndpointId>) -> Vec<EndpointId> {
        self.seeds = seeds
            .into_iter()
            .filter(|seed| seed.broadcast != self.local.broadcast)
            .collect();
        self.seeds.iter().cloned().collect()
    }

    pub fn detector(&self) -> &PhiFailureDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut PhiFailureDetector {
        &mut self.detector
    }

    pub fn quarantined_endpoints(&self) -> BTreeSet<EndpointId> {
        self.just_removed.keys().cloned().collect()
    }

    pub fn publish_metrics(&self, metrics: &mut MetricsRegistry) {
        metrics.set_live_endpoints(self.live.len());
        metrics.set_unreachable_endpoints(self.unreachable.len());
        metrics.set_quarantined_endpoints(self.just_removed.len());
        metrics.set_known_endpoints(self.states.len());
        metrics.set_gossip_rounds_total(self.rounds_completed);
        metrics.set_convictions_total(self.convictions);
    }
}
