//! Per-endpoint gossip state: a heartbeat plus a map of versioned
//! application values. Versions are only comparable within one
//! (endpoint, generation) pair; a newer generation invalidates everything
//! that came before it.

use crate::ring::token::{format_tokens, Token};
use log::trace;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Hands out the monotonically increasing versions shared by the local
/// heartbeat and every locally produced application state, so the two stay
/// totally ordered against each other.
#[derive(Debug, Default)]
pub struct VersionGenerator {
    current: AtomicI32,
}

impl VersionGenerator {
    pub fn next(&self) -> i32 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A string payload tagged with its version within the owning endpoint's
/// current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub version: i32,
}

impl VersionedValue {
    pub fn new(value: impl Into<String>, version: i32) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

impl fmt::Display for VersionedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.value, self.version)
    }
}

/// The fixed application-state enumeration. Wire frames carry the ordinal,
/// so variants must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum AppStateKey {
    Status = 0,
    Schema = 1,
    Dc = 2,
    Rack = 3,
    ReleaseVersion = 4,
    RemovalCoordinator = 5,
    InternalAddress = 6,
    RpcAddress = 7,
    Severity = 8,
    HostId = 9,
    Tokens = 10,
    RpcReady = 11,
    NativeAddress = 12,
    StatusWithPort = 13,
}

impl AppStateKey {
    pub const ALL: [AppStateKey; 14] = [
        AppStateKey::Status,
        AppStateKey::Schema,
        AppStateKey::Dc,
        AppStateKey::Rack,
        AppStateKey::ReleaseVersion,
        AppStateKey::RemovalCoordinator,
        AppStateKey::InternalAddress,
        AppStateKey::RpcAddress,
        AppStateKey::Severity,
        AppStateKey::HostId,
        AppStateKey::Tokens,
        AppStateKey::RpcReady,
        AppStateKey::NativeAddress,
        AppStateKey::StatusWithPort,
    ];

    pub fn ordinal(&self) -> u32 {
        *self as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }
}

pub const DELIMITER: char = ',';

/// Application-level lifecycle of an endpoint as carried in the STATUS
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipStatus {
    Bootstrapping,
    BootstrappingReplace,
    Normal,
    Leaving,
    Left,
    Moving,
    Removing,
    Removed,
    Shutdown,
    Hibernate,
}

impl GossipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GossipStatus::Bootstrapping => "BOOT",
            GossipStatus::BootstrappingReplace => "BOOT_REPLACE",
            GossipStatus::Normal => "NORMAL",
            GossipStatus::Leaving => "LEAVING",
            GossipStatus::Left => "LEFT",
            GossipStatus::Moving => "MOVING",
            GossipStatus::Removing => "removing",
            GossipStatus::Removed => "removed",
            GossipStatus::Shutdown => "shutdown",
            GossipStatus::Hibernate => "hibernate",
        }
    }

    pub fn parse(piece: &str) -> Option<Self> {
        Some(match piece {
            "BOOT" => GossipStatus::Bootstrapping,
            "BOOT_REPLACE" => GossipStatus::BootstrappingReplace,
            "NORMAL" => GossipStatus::Normal,
            "LEAVING" => GossipStatus::Leaving,
            "LEFT" => GossipStatus::Left,
            "MOVING" => GossipStatus::Moving,
            "removing" => GossipStatus::Removing,
            "removed" => GossipStatus::Removed,
            "shutdown" => GossipStatus::Shutdown,
            "hibernate" => GossipStatus::Hibernate,
            _ => return None,
        })
    }

    /// States whose owners no longer participate in the ring. Gossip still
    /// merges them so their departure propagates.
    pub fn is_dead_state(&self) -> bool {
        matches!(
            self,
            GossipStatus::Removing
                | GossipStatus::Removed
                | GossipStatus::Left
                | GossipStatus::Hibernate
        )
    }

    /// States for which a silent disappearance is expected rather than a
    /// failure worth shouting about.
    pub fn is_silent_shutdown_state(&self) -> bool {
        self.is_dead_state()
            || matches!(
                self,
                GossipStatus::Bootstrapping | GossipStatus::BootstrappingReplace
            )
    }
}

/// Builders for the STATUS payload strings. The first delimited piece is
/// always the status name; later pieces depend on the state.
pub mod status_value {
    use super::*;

    pub fn normal(tokens: &[Token]) -> String {
        with_first_token(GossipStatus::Normal, tokens)
    }

    pub fn bootstrapping(tokens: &[Token]) -> String {
        with_first_token(GossipStatus::Bootstrapping, tokens)
    }

    pub fn bootstrap_replace(replaced_host: Uuid) -> String {
        format!(
            "{}{}{}",
            GossipStatus::BootstrappingReplace.as_str(),
            DELIMITER,
            replaced_host
        )
    }

    pub fn leaving(tokens: &[Token]) -> String {
        with_first_token(GossipStatus::Leaving, tokens)
    }

    pub fn left(tokens: &[Token], expire_at_millis: u64) -> String {
        format!(
            "{}{}{}",
            with_first_token(GossipStatus::Left, tokens),
            DELIMITER,
            expire_at_millis
        )
    }

    pub fn moving(token: Token) -> String {
        format!("{}{}{}", GossipStatus::Moving.as_str(), DELIMITER, token)
    }

    pub fn removing(host_id: Uuid) -> String {
        format!("{}{}{}", GossipStatus::Removing.as_str(), DELIMITER, host_id)
    }

    pub fn removed(host_id: Uuid, expire_at_millis: u64) -> String {
        format!(
            "{}{}{}{}{}",
            GossipStatus::Removed.as_str(),
            DELIMITER,
            host_id,
            DELIMITER,
            expire_at_millis
        )
    }

    pub fn shutdown() -> String {
        format!("{}{}true", GossipStatus::Shutdown.as_str(), DELIMITER)
    }

    pub fn hibernate() -> String {
        format!("{}{}true", GossipStatus::Hibernate.as_str(), DELIMITER)
    }

    fn with_first_token(status: GossipStatus, tokens: &[Token]) -> String {
        match tokens.first() {
            Some(first) => format!("{}{}{}", status.as_str(), DELIMITER, first),
            None => status.as_str().to_string(),
        }
    }

    /// Extracts the expiry stamp from a LEFT or removed payload.
    pub fn parse_expire_millis(value: &str) -> Option<u64> {
        value.split(DELIMITER).nth(2)?.parse().ok()
    }
}

pub fn parse_status(value: &str) -> Option<GossipStatus> {
    let piece = value.split(DELIMITER).next()?;
    GossipStatus::parse(piece)
}

/// Heartbeat counters: the process generation and the version that climbs
/// every gossip round within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatState {
    pub generation: i32,
    pub version: i32,
}

impl HeartbeatState {
    pub fn new(generation: i32) -> Self {
        Self {
            generation,
            version: 0,
        }
    }

    pub fn with_version(generation: i32, version: i32) -> Self {
        Self {
            generation,
            version,
        }
    }

    pub fn update(&mut self, versions: &VersionGenerator) {
        self.version = versions.next();
    }

    pub fn force_newer_generation(&mut self) {
        self.generation += 1;
    }

    /// Makes every subsequent version comparison within this generation lose
    /// to us. Used when recording a final state for a dead endpoint.
    pub fn force_highest_possible_version(&mut self) {
        self.version = i32::MAX;
    }
}

pub type AppStateMap = BTreeMap<AppStateKey, VersionedValue>;

/// Everything gossip knows about one endpoint. Application states live in a
/// copy-on-write snapshot: writers swap a fresh map in, readers holding the
/// previous `Arc` keep a stable view. The update timestamp and liveness flag
/// are local bookkeeping and never serialized.
#[derive(Debug, Clone)]
pub struct EndpointState {
    heartbeat: HeartbeatState,
    app_states: Arc<AppStateMap>,
    update_timestamp: Instant,
    alive: bool,
}

/// Equality covers only what travels on the wire; the update timestamp and
/// liveness flag are local.
impl PartialEq for EndpointState {
    fn eq(&self, other: &Self) -> bool {
        self.heartbeat == other.heartbeat && self.app_states == other.app_states
    }
}

impl EndpointState {
    pub fn new(heartbeat: HeartbeatState, now: Instant) -> Self {
        Self::with_states(heartbeat, AppStateMap::new(), now)
    }

    pub fn with_states(heartbeat: HeartbeatState, states: AppStateMap, now: Instant) -> Self {
        Self {
            heartbeat,
            app_states: Arc::new(states),
            update_timestamp: now,
            alive: true,
        }
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.heartbeat
    }

    pub fn heartbeat_mut(&mut self) -> &mut HeartbeatState {
        &mut self.heartbeat
    }

    pub fn set_heartbeat(&mut self, heartbeat: HeartbeatState, now: Instant) {
        self.update_timestamp = now;
        self.heartbeat = heartbeat;
    }

    pub fn application_state(&self, key: AppStateKey) -> Option<&VersionedValue> {
        self.app_states.get(&key)
    }

    /// Stable snapshot of the application-state map.
    pub fn snapshot(&self) -> Arc<AppStateMap> {
        Arc::clone(&self.app_states)
    }

    pub fn states(&self) -> impl Iterator<Item = (&AppStateKey, &VersionedValue)> {
        self.app_states.iter()
    }

    pub fn add_application_state(&mut self, key: AppStateKey, value: VersionedValue, now: Instant) {
        self.add_application_states([(key, value)], now);
    }

    /// Atomically replaces the snapshot with one carrying the new entries.
    pub fn add_application_states<I>(&mut self, entries: I, now: Instant)
    where
        I: IntoIterator<Item = (AppStateKey, VersionedValue)>,
    {
        let mut copy = (*self.app_states).clone();
        for (key, value) in entries {
            copy.insert(key, value);
        }
        self.app_states = Arc::new(copy);
        self.update_timestamp = now;
    }

    pub fn update_timestamp(&self) -> Instant {
        self.update_timestamp
    }

    pub fn touch(&mut self, now: Instant) {
        self.update_timestamp = now;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// The greatest of the heartbeat version and every application-state
    /// version.
    pub fn max_version(&self) -> i32 {
        self.app_states
            .values()
            .map(|value| value.version)
            .chain(std::iter::once(self.heartbeat.version))
            .max()
            .unwrap_or(self.heartbeat.version)
    }

    /// The subset of this state strictly newer than `version`, for shipping
    /// during reconciliation. The heartbeat is included only when it is
    /// itself newer; stale heartbeats are discarded on the receiving side.
    pub fn state_for_version_above(&self, version: i32) -> Option<EndpointState> {
        let heartbeat = HeartbeatState::with_version(
            self.heartbeat.generation,
            self.heartbeat.version,
        );
        let newer: AppStateMap = self
            .app_states
            .iter()
            .filter(|(_, value)| value.version > version)
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        if newer.is_empty() && self.heartbeat.version <= version {
            return None;
        }
        trace!(
            "shipping {} states above version {}",
            newer.len(),
            version
        );
        Some(EndpointState::with_states(
            heartbeat,
            newer,
            self.update_timestamp,
        ))
    }

    /// The current status, preferring the port-aware key and falling back to
    /// the legacy one.
    pub fn status(&self) -> Option<GossipStatus> {
        self.status_value().and_then(|value| parse_status(value))
    }

    fn status_value(&self) -> Option<&str> {
        self.application_state(AppStateKey::StatusWithPort)
            .or_else(|| self.application_state(AppStateKey::Status))
            .map(|value| value.value.as_str())
    }

    pub fn in_dead_state(&self) -> bool {
        self.status().is_some_and(|status| status.is_dead_state())
    }

    pub fn is_silent_shutdown_state(&self) -> bool {
        self.status()
            .is_some_and(|status| status.is_silent_shutdown_state())
    }

    pub fn is_rpc_ready(&self) -> bool {
        self.application_state(AppStateKey::RpcReady)
            .is_some_and(|value| value.value == "true")
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.application_state(AppStateKey::HostId)
            .and_then(|value| value.value.parse().ok())
    }

    pub fn schema_version(&self) -> Option<Uuid> {
        self.application_state(AppStateKey::Schema)
            .and_then(|value| value.value.parse().ok())
    }

    pub fn release_version(&self) -> Option<&str> {
        self.application_state(AppStateKey::ReleaseVersion)
            .map(|value| value.value.as_str())
    }

    /// Expiry carried in a LEFT or removed payload, if any.
    pub fn status_expire_millis(&self) -> Option<u64> {
        self.status_value().and_then(status_value::parse_expire_millis)
    }
}

/// Convenience for the TOKENS value payload.
pub fn tokens_value(tokens: &[Token], version: i32) -> VersionedValue {
    VersionedValue::new(format_tokens(tokens), version)
}
