//! The anti-entropy membership protocol: endpoint state, failure
//! detection, the wire messages and the engine that ties them together.

pub mod detector;
pub mod engine;
pub mod messages;
pub mod state;
pub mod subscriber;

pub use detector::{Conviction, DetectorConfig, Interpretation, PhiFailureDetector};
pub use engine::{
    GossipError, Gossiper, MembershipView, NoMembers, Outbound, ShadowPoll, ShadowRoundError,
};
pub use messages::{
    GossipDigest, GossipDigestAck, GossipDigestAck2, GossipDigestSyn, GossipMessage,
};
pub use state::{
    parse_status, status_value, AppStateKey, AppStateMap, EndpointState, GossipStatus,
    HeartbeatState, VersionGenerator, VersionedValue,
};
pub use subscriber::StateChangeSubscriber;
