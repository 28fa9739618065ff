//! The authoritative map from tokens to endpoints, with the transient sets
//! that track joins, leaves, moves and replacements, and cached read-only
//! snapshots for replication and planning.
//!
//! All mutators take the write lock, all observers the read lock. The size
//! accessors deliberately read without coordination: they are monotone
//! enough for the diagnostics that use them. Pending-range state lives
//! behind its own mutex so a long calculation never blocks token lookups.

use crate::endpoint::{EndpointId, NodeAddr};
use crate::gossip::engine::MembershipView;
use crate::replication::ReplicationStrategy;
use crate::ring::pending::{calculate_pending_ranges, PendingRangeMap};
use crate::ring::range::Range;
use crate::ring::token::Token;
use crate::ring::topology::{Location, Topology};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("token {token} is already owned by {owner}")]
    TokenCollision { token: Token, owner: EndpointId },
    #[error("host id {host_id} is already bound to {existing}")]
    HostIdCollision {
        host_id: Uuid,
        existing: EndpointId,
    },
    #[error("{new_node} is trying to replace tokens {tokens:?} that {original} does not own")]
    ReplacementMismatch {
        new_node: EndpointId,
        original: EndpointId,
        tokens: Vec<Token>,
    },
}

/// Immutable view of the token map and topology. Cheap to clone for the
/// what-if arithmetic in pending-range and strict-source calculations.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    tokens: BTreeMap<Token, EndpointId>,
    endpoint_tokens: HashMap<EndpointId, BTreeSet<Token>>,
    topology: Topology,
}

impl RingSnapshot {
    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.tokens.keys().copied().collect()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoint_tokens.len()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointId> {
        self.endpoint_tokens.keys()
    }

    pub fn contains_endpoint(&self, endpoint: &EndpointId) -> bool {
        self.endpoint_tokens.contains_key(endpoint)
    }

    pub fn token_owner(&self, token: Token) -> Option<&EndpointId> {
        self.tokens.get(&token)
    }

    pub fn tokens_of(&self, endpoint: &EndpointId) -> Vec<Token> {
        self.endpoint_tokens
            .get(endpoint)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Walks the ring clockwise starting at the first token at or after
    /// `start`, wrapping once.
    pub fn ring_order(&self, start: Token) -> impl Iterator<Item = (&Token, &EndpointId)> {
        self.tokens.range(start..).chain(self.tokens.range(..start))
    }

    /// The greatest ring token strictly before `token`, wrapping to the
    /// maximum.
    pub fn predecessor(&self, token: Token) -> Option<Token> {
        self.tokens
            .range(..token)
            .next_back()
            .or_else(|| self.tokens.iter().next_back())
            .map(|(found, _)| *found)
    }

    /// The least ring token strictly after `token`, wrapping to the
    /// minimum.
    pub fn successor(&self, token: Token) -> Option<Token> {
        self.tokens
            .range((
                std::ops::Bound::Excluded(token),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(found, _)| *found)
    }

    /// `(predecessor(token), token]`. A single-token ring owns the full
    /// circle.
    pub fn primary_range_for(&self, token: Token) -> Option<Range> {
        self.predecessor(token)
            .map(|predecessor| Range::new(predecessor, token))
    }

    /// Places an endpoint at exactly the given tokens, releasing whatever
    /// it held before and reclaiming any token previously owned by somebody
    /// else.
    pub fn update_normal_tokens(&mut self, endpoint: &EndpointId, tokens: &[Token]) {
        if !self.topology.contains(endpoint) {
            self.topology.add_endpoint(endpoint, Location::default());
        }
        if let Some(old) = self.endpoint_tokens.remove(endpoint) {
            for token in old {
                self.tokens.remove(&token);
            }
        }
        let mut held = BTreeSet::new();
        for token in tokens {
            if let Some(previous) = self.tokens.insert(*token, endpoint.clone()) {
                if previous != *endpoint {
                    warn!("token {token} changing ownership from {previous} to {endpoint}");
                    if let Some(prev_held) = self.endpoint_tokens.get_mut(&previous) {
                        prev_held.remove(token);
                        if prev_held.is_empty() {
                            self.endpoint_tokens.remove(&previous);
                            self.topology.remove_endpoint(&previous);
                        }
                    }
                }
            }
            held.insert(*token);
        }
        self.endpoint_tokens.insert(endpoint.clone(), held);
    }

    pub fn set_location(&mut self, endpoint: &EndpointId, location: Location) {
        self.topology.add_endpoint(endpoint, location);
    }

    pub fn remove_endpoint(&mut self, endpoint: &EndpointId) {
        if let Some(tokens) = self.endpoint_tokens.remove(endpoint) {
            for token in tokens {
                self.tokens.remove(&token);
            }
        }
        self.topology.remove_endpoint(endpoint);
    }
}

#[derive(Debug, Default)]
struct RingState {
    ring: RingSnapshot,
    bootstrap_tokens: BTreeMap<Token, EndpointId>,
    leaving: BTreeSet<EndpointId>,
    moving: BTreeSet<(Token, EndpointId)>,
    /// Replacement node -> the node it is replacing.
    replacement_to_original: BTreeMap<EndpointId, EndpointId>,
}

pub struct RingMetadata {
    inner: RwLock<RingState>,
    pending: Mutex<HashMap<String, Arc<PendingRangeMap>>>,
    cached_snapshot: Mutex<Option<(u64, Arc<RingSnapshot>)>>,
    ring_version: AtomicU64,
}

impl Default for RingMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl RingMetadata {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RingState::default()),
            pending: Mutex::new(HashMap::new()),
            cached_snapshot: Mutex::new(None),
            ring_version: AtomicU64::new(0),
        }
    }

    /// Monotonic counter bumped on every mutation; derived caches key off
    /// it.
    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.ring_version.fetch_add(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    /// Promotes an endpoint to a normal member at the given tokens,
    /// retiring it from every transient set.
    pub fn update_normal_tokens(&self, endpoint: &EndpointId, tokens: &[Token]) {
        if tokens.is_empty() {
            return;
        }
        let mut state = self.inner.write();
        state
            .bootstrap_tokens
            .retain(|_, owner| owner != endpoint);
        state.leaving.remove(endpoint);
        state.moving.retain(|(_, mover)| mover != endpoint);
        state.replacement_to_original.remove(endpoint);
        state
            .replacement_to_original
            .retain(|_, original| original != endpoint);
        state.ring.update_normal_tokens(endpoint, tokens);
        drop(state);
        self.invalidate();
        debug!("{endpoint} is now a normal member with {} tokens", tokens.len());
    }

    /// Registers a joining endpoint's claimed tokens. Collisions with other
    /// bootstrappers, or with a member the endpoint is not replacing, are
    /// conflicts and leave the ring untouched.
    pub fn add_bootstrap_tokens(
        &self,
        tokens: &[Token],
        endpoint: &EndpointId,
    ) -> Result<(), RingError> {
        self.add_bootstrap_tokens_internal(tokens, endpoint, None)
    }

    /// Registers a bootstrap that replaces an existing member at its exact
    /// tokens.
    pub fn add_replace_tokens(
        &self,
        tokens: &[Token],
        new_node: &EndpointId,
        original: &EndpointId,
    ) -> Result<(), RingError> {
        {
            let state = self.inner.read();
            let original_tokens = state.ring.tokens_of(original);
            if !tokens
                .iter()
                .all(|token| original_tokens.contains(token))
            {
                return Err(RingError::ReplacementMismatch {
                    new_node: new_node.clone(),
                    original: original.clone(),
                    tokens: tokens.to_vec(),
                });
            }
        }
        self.add_bootstrap_tokens_internal(tokens, new_node, Some(original))?;
        let mut state = self.inner.write();
        state
            .replacement_to_original
            .insert(new_node.clone(), original.clone());
        drop(state);
        self.invalidate();
        Ok(())
    }

    fn add_bootstrap_tokens_internal(
        &self,
        tokens: &[Token],
        endpoint: &EndpointId,
        original: Option<&EndpointId>,
    ) -> Result<(), RingError> {
        let mut state = self.inner.write();
        for token in tokens {
            if let Some(owner) = state.bootstrap_tokens.get(token) {
                if owner != endpoint {
                    return Err(RingError::TokenCollision {
                        token: *token,
                        owner: owner.clone(),
                    });
                }
            }
            if let Some(owner) = state.ring.token_owner(*token) {
                if owner != endpoint && Some(owner) != original {
                    return Err(RingError::TokenCollision {
                        token: *token,
                        owner: owner.clone(),
                    });
                }
            }
        }
        state.bootstrap_tokens.retain(|_, owner| owner != endpoint);
        for token in tokens {
            state.bootstrap_tokens.insert(*token, endpoint.clone());
        }
        if !state.ring.topology.contains(endpoint) {
            state.ring.topology.add_endpoint(endpoint, Location::default());
        }
        drop(state);
        self.invalidate();
        Ok(())
    }

    /// Completion path for a finished (or abandoned) bootstrap.
    pub fn remove_bootstrap_tokens(&self, tokens: &[Token]) {
        let mut state = self.inner.write();
        for token in tokens {
            state.bootstrap_tokens.remove(token);
        }
        drop(state);
        self.invalidate();
    }

    pub fn add_leaving_endpoint(&self, endpoint: &EndpointId) {
        self.inner.write().leaving.insert(endpoint.clone());
        self.invalidate();
    }

    pub fn add_moving_endpoint(&self, token: Token, endpoint: &EndpointId) {
        self.inner
            .write()
            .moving
            .insert((token, endpoint.clone()));
        self.invalidate();
    }

    /// Completion path for a finished move.
    pub fn remove_from_moving(&self, endpoint: &EndpointId) {
        self.inner
            .write()
            .moving
            .retain(|(_, mover)| mover != endpoint);
        self.invalidate();
    }

    pub fn remove_endpoint(&self, endpoint: &EndpointId) {
        let mut state = self.inner.write();
        state.bootstrap_tokens.retain(|_, owner| owner != endpoint);
        state.leaving.remove(endpoint);
        state.moving.retain(|(_, mover)| mover != endpoint);
        state.replacement_to_original.remove(endpoint);
        state
            .replacement_to_original
            .retain(|_, original| original != endpoint);
        state.ring.remove_endpoint(endpoint);
        drop(state);
        self.invalidate();
        trace!("removed {endpoint} from ring metadata");
    }

    /// Records where an endpoint lives. Gossiped DC/RACK values land here.
    pub fn set_location(&self, endpoint: &EndpointId, location: Location) {
        self.inner.write().ring.set_location(endpoint, location);
        self.invalidate();
    }

    /// Guards the invariant that one host id maps to at most one endpoint.
    /// The caller decides what to do when the existing binding is dead.
    pub fn check_host_id_unique(
        &self,
        host_id: Uuid,
        endpoint: &EndpointId,
    ) -> Result<(), RingError> {
        let state = self.inner.read();
        for other in state.ring.endpoints() {
            if other.host_id == host_id && other != endpoint {
                return Err(RingError::HostIdCollision {
                    host_id,
                    existing: other.clone(),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn is_member(&self, endpoint: &EndpointId) -> bool {
        self.inner.read().ring.contains_endpoint(endpoint)
    }

    pub fn is_leaving(&self, endpoint: &EndpointId) -> bool {
        self.inner.read().leaving.contains(endpoint)
    }

    pub fn is_moving(&self, endpoint: &EndpointId) -> bool {
        self.inner
            .read()
            .moving
            .iter()
            .any(|(_, mover)| mover == endpoint)
    }

    pub fn tokens_of(&self, endpoint: &EndpointId) -> Vec<Token> {
        self.inner.read().ring.tokens_of(endpoint)
    }

    pub fn token_owner(&self, token: Token) -> Option<EndpointId> {
        self.inner.read().ring.token_owner(token).cloned()
    }

    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.inner.read().ring.sorted_tokens()
    }

    pub fn all_endpoints(&self) -> BTreeSet<EndpointId> {
        self.inner.read().ring.endpoints().cloned().collect()
    }

    pub fn bootstrap_tokens(&self) -> BTreeMap<Token, EndpointId> {
        self.inner.read().bootstrap_tokens.clone()
    }

    pub fn leaving_endpoints(&self) -> BTreeSet<EndpointId> {
        self.inner.read().leaving.clone()
    }

    pub fn moving_endpoints(&self) -> BTreeSet<(Token, EndpointId)> {
        self.inner.read().moving.clone()
    }

    pub fn replacement_node_for(&self, original: &EndpointId) -> Option<EndpointId> {
        self.inner
            .read()
            .replacement_to_original
            .iter()
            .find(|(_, old)| *old == original)
            .map(|(new, _)| new.clone())
    }

    pub fn replacing_node_of(&self, new_node: &EndpointId) -> Option<EndpointId> {
        self.inner
            .read()
            .replacement_to_original
            .get(new_node)
            .cloned()
    }

    pub fn endpoint_for_host_id(&self, host_id: Uuid) -> Option<EndpointId> {
        self.inner
            .read()
            .ring
            .endpoints()
            .find(|endpoint| endpoint.host_id == host_id)
            .cloned()
    }

    pub fn endpoint_for_address(&self, address: &NodeAddr) -> Option<EndpointId> {
        self.inner
            .read()
            .ring
            .endpoints()
            .find(|endpoint| endpoint.has_address(address))
            .cloned()
    }

    /// Racy by design: a size probe for diagnostics.
    pub fn size_of_all_endpoints(&self) -> usize {
        self.inner.read().ring.endpoint_count()
    }

    pub fn size_of_moving_endpoints(&self) -> usize {
        self.inner.read().moving.len()
    }

    pub fn size_of_leaving_endpoints(&self) -> usize {
        self.inner.read().leaving.len()
    }

    pub fn predecessor(&self, token: Token) -> Option<Token> {
        self.inner.read().ring.predecessor(token)
    }

    pub fn successor(&self, token: Token) -> Option<Token> {
        self.inner.read().ring.successor(token)
    }

    pub fn primary_ranges_for(&self, tokens: &[Token]) -> Vec<Range> {
        let state = self.inner.read();
        tokens
            .iter()
            .filter_map(|token| state.ring.primary_range_for(*token))
            .collect()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// A read-only snapshot of the token map and topology, shared until the
    /// next ring mutation invalidates it.
    pub fn clone_only_token_map(&self) -> Arc<RingSnapshot> {
        let version = self.ring_version();
        let mut cached = self.cached_snapshot.lock();
        if let Some((cached_version, snapshot)) = cached.as_ref() {
            if *cached_version == version {
                return Arc::clone(snapshot);
            }
        }
        let snapshot = Arc::new(self.inner.read().ring.clone());
        *cached = Some((version, Arc::clone(&snapshot)));
        snapshot
    }

    /// The ring as it will look once every leaving endpoint is gone.
    pub fn after_all_left(&self) -> RingSnapshot {
        let state = self.inner.read();
        let mut snapshot = state.ring.clone();
        for endpoint in &state.leaving {
            snapshot.remove_endpoint(endpoint);
        }
        snapshot
    }

    /// The ring once leaves and moves have both settled.
    pub fn after_all_settled(&self) -> RingSnapshot {
        let state = self.inner.read();
        let mut snapshot = state.ring.clone();
        for endpoint in &state.leaving {
            snapshot.remove_endpoint(endpoint);
        }
        for (token, endpoint) in &state.moving {
            snapshot.update_normal_tokens(endpoint, &[*token]);
        }
        snapshot
    }

    // ------------------------------------------------------------------
    // Pending ranges
    // ------------------------------------------------------------------

    /// Recomputes the pending ranges for one keyspace. Inputs are copied
    /// under the read lock; the calculation itself runs without any ring
    /// lock held.
    pub fn calculate_pending_ranges(
        &self,
        strategy: &dyn ReplicationStrategy,
        keyspace: &str,
    ) {
        // Whole calculations serialize on the pending mutex; the ring read
        // lock is only held while copying inputs.
        let mut pending = self.pending.lock();

        let (snapshot, bootstrap, leaving, moving) = {
            let state = self.inner.read();
            if state.bootstrap_tokens.is_empty()
                && state.leaving.is_empty()
                && state.moving.is_empty()
            {
                trace!(
                    "no bootstrapping, leaving or moving nodes; empty pending ranges for {keyspace}"
                );
                pending.insert(keyspace.to_string(), Arc::new(PendingRangeMap::default()));
                return;
            }
            (
                state.ring.clone(),
                state.bootstrap_tokens.clone(),
                state.leaving.clone(),
                state.moving.clone(),
            )
        };

        let started = Instant::now();
        let result =
            calculate_pending_ranges(strategy, &snapshot, &bootstrap, &leaving, &moving);
        debug!(
            "pending range calculation for {keyspace} completed in {:?}",
            started.elapsed()
        );
        pending.insert(keyspace.to_string(), Arc::new(result));
    }

    pub fn pending_ranges(&self, keyspace: &str) -> Arc<PendingRangeMap> {
        self.pending
            .lock()
            .get(keyspace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pending_endpoints_for(&self, keyspace: &str, token: Token) -> BTreeSet<EndpointId> {
        self.pending_ranges(keyspace).endpoints_for_token(token)
    }

    pub fn pending_ranges_for(&self, keyspace: &str, endpoint: &EndpointId) -> Vec<Range> {
        self.pending_ranges(keyspace).ranges_for(endpoint)
    }
}

impl MembershipView for RingMetadata {
    fn is_member(&self, endpoint: &EndpointId) -> bool {
        RingMetadata::is_member(self, endpoint)
    }
}
