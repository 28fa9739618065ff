//! Callbacks fired as gossip mutates endpoint state. Implementations run
//! synchronously on the gossip path and must not block on cluster I/O.

use crate::endpoint::EndpointId;
use crate::gossip::state::{AppStateKey, EndpointState, VersionedValue};

/// Observer of endpoint lifecycle and application-state changes. All
/// methods default to no-ops so implementations subscribe to what they
/// care about. Notifications arrive in local apply order, which is not
/// necessarily source order; handlers must be idempotent.
pub trait StateChangeSubscriber: Send + Sync {
    /// Called before an application-state entry is applied.
    fn before_change(
        &self,
        endpoint: &EndpointId,
        state: &EndpointState,
        key: AppStateKey,
        new_value: &VersionedValue,
    ) {
        let _ = (endpoint, state, key, new_value);
    }

    /// A previously unknown endpoint appeared with full state.
    fn on_join(&self, endpoint: &EndpointId, state: &EndpointState) {
        let _ = (endpoint, state);
    }

    fn on_alive(&self, endpoint: &EndpointId, state: &EndpointState) {
        let _ = (endpoint, state);
    }

    fn on_dead(&self, endpoint: &EndpointId, state: &EndpointState) {
        let _ = (endpoint, state);
    }

    /// One application-state entry was applied.
    fn on_change(&self, endpoint: &EndpointId, key: AppStateKey, value: &VersionedValue) {
        let _ = (endpoint, key, value);
    }

    fn on_remove(&self, endpoint: &EndpointId) {
        let _ = endpoint;
    }

    /// The endpoint came back with a newer generation.
    fn on_restart(&self, endpoint: &EndpointId, state: &EndpointState) {
        let _ = (endpoint, state);
    }
}
