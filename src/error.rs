use crate::gossip::engine::{GossipError, ShadowRoundError};
use crate::ring::metadata::RingError;
use crate::streaming::planner::PlanError;
use crate::wire::ProtocolError;
use thiserror::Error;

/// Umbrella error for callers that drive several subsystems at once.
/// Individual modules surface their own enums; this exists for the
/// composition layer.
#[derive(Debug, Error)]
pub enum RingmeshError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Gossip(#[from] GossipError),
    #[error(transparent)]
    ShadowRound(#[from] ShadowRoundError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("{0}")]
    Other(String),
}
