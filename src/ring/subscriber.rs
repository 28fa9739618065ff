//! Bridges gossip to the ring: watches STATUS/TOKENS/DC/RACK/HOST_ID
//! values as they are applied and projects them into ring metadata,
//! recomputing pending ranges after every effective transition.

use crate::endpoint::EndpointId;
use crate::gossip::state::{parse_status, AppStateKey, EndpointState, GossipStatus, VersionedValue};
use crate::gossip::subscriber::StateChangeSubscriber;
use crate::replication::ReplicationStrategy;
use crate::ring::metadata::RingMetadata;
use crate::ring::token::{parse_tokens, Token};
use crate::ring::topology::Location;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What this subscriber has seen gossip say about one endpoint. Changes
/// arrive one entry at a time and in local apply order, so transitions are
/// recomputed from the accumulated view instead of a single entry.
#[derive(Debug, Default, Clone)]
struct PeerView {
    status: Option<String>,
    status_with_port: Option<String>,
    tokens: Vec<Token>,
    datacenter: Option<String>,
    rack: Option<String>,
    host_id: Option<Uuid>,
}

impl PeerView {
    fn effective_status(&self) -> Option<GossipStatus> {
        self.status_with_port
            .as_deref()
            .or(self.status.as_deref())
            .and_then(parse_status)
    }

    fn moving_target(&self) -> Option<Token> {
        let raw = self.status_with_port.as_deref().or(self.status.as_deref())?;
        let piece = raw.split(crate::gossip::state::DELIMITER).nth(1)?;
        piece.trim().parse::<i64>().ok().map(Token)
    }

    fn replaced_host(&self) -> Option<Uuid> {
        let raw = self.status_with_port.as_deref().or(self.status.as_deref())?;
        raw.split(crate::gossip::state::DELIMITER)
            .nth(1)?
            .parse()
            .ok()
    }
}

pub struct RingStateSubscriber {
    ring: Arc<RingMetadata>,
    keyspaces: Vec<(String, Arc<dyn ReplicationStrategy>)>,
    views: Mutex<HashMap<EndpointId, PeerView>>,
}

impl RingStateSubscriber {
    pub fn new(
        ring: Arc<RingMetadata>,
        keyspaces: Vec<(String, Arc<dyn ReplicationStrategy>)>,
    ) -> Self {
        Self {
            ring,
            keyspaces,
            views: Mutex::new(HashMap::new()),
        }
    }

    fn recompute_pending(&self) {
        for (keyspace, strategy) in &self.keyspaces {
            self.ring.calculate_pending_ranges(strategy.as_ref(), keyspace);
        }
    }

    fn absorb(&self, endpoint: &EndpointId, key: AppStateKey, value: &str) -> PeerView {
        let mut views = self.views.lock();
        let view = views.entry(endpoint.clone()).or_default();
        match key {
            AppStateKey::Status => view.status = Some(value.to_string()),
            AppStateKey::StatusWithPort => view.status_with_port = Some(value.to_string()),
            AppStateKey::Tokens => match parse_tokens(value) {
                Ok(tokens) => view.tokens = tokens,
                Err(err) => warn!("ignoring malformed TOKENS value from {endpoint}: {err}"),
            },
            AppStateKey::Dc => view.datacenter = Some(value.to_string()),
            AppStateKey::Rack => view.rack = Some(value.to_string()),
            AppStateKey::HostId => view.host_id = value.parse().ok(),
            _ => {}
        }
        view.clone()
    }

    /// Reconciles the ring with everything currently known about the
    /// endpoint.
    fn apply(&self, endpoint: &EndpointId, view: &PeerView) {
        if let Some(host_id) = view.host_id {
            if let Err(err) = self.ring.check_host_id_unique(host_id, endpoint) {
                warn!("host id conflict for {endpoint}: {err}");
            }
        }
        if view.datacenter.is_some() || view.rack.is_some() {
            let default = Location::default();
            self.ring.set_location(
                endpoint,
                Location::new(
                    view.datacenter.clone().unwrap_or(default.datacenter),
                    view.rack.clone().unwrap_or(default.rack),
                ),
            );
        }

        let Some(status) = view.effective_status() else {
            return;
        };
        let mut changed = true;
        match status {
            GossipStatus::Normal => {
                if view.tokens.is_empty() {
                    changed = false;
                } else {
                    self.ring.update_normal_tokens(endpoint, &view.tokens);
                    info!("{endpoint} state NORMAL with {} tokens", view.tokens.len());
                }
            }
            GossipStatus::Bootstrapping => {
                if view.tokens.is_empty() {
                    changed = false;
                } else if let Err(err) =
                    self.ring.add_bootstrap_tokens(&view.tokens, endpoint)
                {
                    warn!("rejecting bootstrap of {endpoint}: {err}");
                    changed = false;
                }
            }
            GossipStatus::BootstrappingReplace => {
                changed = self.handle_replace(endpoint, view);
            }
            GossipStatus::Leaving | GossipStatus::Removing => {
                self.ring.add_leaving_endpoint(endpoint);
                debug!("{endpoint} is leaving the ring");
            }
            GossipStatus::Left | GossipStatus::Removed => {
                self.ring.remove_endpoint(endpoint);
                info!("{endpoint} has left the ring");
            }
            GossipStatus::Moving => match view.moving_target() {
                Some(token) => {
                    self.ring.add_moving_endpoint(token, endpoint);
                    debug!("{endpoint} is moving to token {token}");
                }
                None => {
                    warn!("MOVING status for {endpoint} carries no target token");
                    changed = false;
                }
            },
            GossipStatus::Shutdown | GossipStatus::Hibernate => changed = false,
        }
        if changed {
            self.recompute_pending();
        }
    }

    fn handle_replace(&self, endpoint: &EndpointId, view: &PeerView) -> bool {
        if view.tokens.is_empty() {
            return false;
        }
        let original = view
            .replaced_host()
            .and_then(|host_id| self.ring.endpoint_for_host_id(host_id));
        let result = match original {
            Some(original) => {
                info!("{endpoint} is bootstrapping to replace {original}");
                self.ring
                    .add_replace_tokens(&view.tokens, endpoint, &original)
            }
            None => {
                warn!("replacement target of {endpoint} is unknown; treating as plain bootstrap");
                self.ring.add_bootstrap_tokens(&view.tokens, endpoint)
            }
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("rejecting replacement bootstrap of {endpoint}: {err}");
                false
            }
        }
    }
}

impl StateChangeSubscriber for RingStateSubscriber {
    fn on_join(&self, endpoint: &EndpointId, state: &EndpointState) {
        let mut view = PeerView::default();
        for (key, value) in state.states() {
            match key {
                AppStateKey::Status => view.status = Some(value.value.clone()),
                AppStateKey::StatusWithPort => {
                    view.status_with_port = Some(value.value.clone())
                }
                AppStateKey::Tokens => view.tokens = parse_tokens(&value.value).unwrap_or_default(),
                AppStateKey::Dc => view.datacenter = Some(value.value.clone()),
                AppStateKey::Rack => view.rack = Some(value.value.clone()),
                AppStateKey::HostId => view.host_id = value.value.parse().ok(),
                _ => {}
            }
        }
        self.views.lock().insert(endpoint.clone(), view.clone());
        self.apply(endpoint, &view);
    }

    fn on_change(&self, endpoint: &EndpointId, key: AppStateKey, value: &VersionedValue) {
        let relevant = matches!(
            key,
            AppStateKey::Status
                | AppStateKey::StatusWithPort
                | AppStateKey::Tokens
                | AppStateKey::Dc
                | AppStateKey::Rack
                | AppStateKey::HostId
        );
        if !relevant {
            return;
        }
        let view = self.absorb(endpoint, key, &value.value);
        // Only a status or token entry can change ring ownership; location
        // and identity entries are absorbed into the view above.
        if matches!(
            key,
            AppStateKey::Status
                | AppStateKey::StatusWithPort
                | AppStateKey::Tokens
                | AppStateKey::Dc
                | AppStateKey::Rack
        ) {
            self.apply(endpoint, &view);
        }
    }

    fn on_remove(&self, endpoint: &EndpointId) {
        self.views.lock().remove(endpoint);
        if self.ring.is_member(endpoint) {
            self.ring.remove_endpoint(endpoint);
            self.recompute_pending();
        }
    }
}
