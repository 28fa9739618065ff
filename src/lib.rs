//! ringmesh: the cluster-membership and ring-state core of a peer-to-peer
//! partitioned key-value store. Gossip disseminates per-endpoint version
//! vectors, ring metadata tracks token ownership through joins, leaves,
//! moves and replacements, and the range planner turns a ring snapshot
//! into a fetch plan for nodes that must stream data in.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod gossip;
pub mod management;
pub mod replication;
pub mod ring;
#[cfg(feature = "net")]
pub mod runtime;
pub mod snitch;
pub mod store;
pub mod streaming;
pub mod telemetry;
pub mod wire;

pub use config::{GossipConfig, A_VERY_LONG_TIME, DEFAULT_RING_DELAY, MAX_GENERATION_SKEW};
pub use endpoint::{AddrParseError, EndpointId, NodeAddr};
pub use error::RingmeshError;
pub use gossip::{
    AppStateKey, Conviction, DetectorConfig, EndpointState, GossipDigest, GossipDigestAck,
    GossipDigestAck2, GossipDigestSyn, GossipError, GossipMessage, GossipStatus, Gossiper,
    HeartbeatState, Interpretation, MembershipView, NoMembers, Outbound, PhiFailureDetector,
    ShadowPoll, ShadowRoundError, StateChangeSubscriber, VersionGenerator, VersionedValue,
};
pub use management::{assassinate_endpoint, reload_seeds, ClusterSummary};
pub use replication::{NetworkTopologyStrategy, ReplicationStrategy, SimpleStrategy};
pub use ring::{
    calculate_pending_ranges, format_tokens, parse_tokens, Location, Murmur3Partitioner,
    Partitioner, PendingRangeMap, Range, RingError, RingMetadata, RingSnapshot,
    RingStateSubscriber, Token, Topology,
};
#[cfg(feature = "net")]
pub use runtime::{generation_from_wall_clock, GossipService, GossipTransport};
pub use snitch::{GossipSnitch, SimpleSnitch, Snitch};
pub use store::{
    InMemoryPeerStore, InMemoryStreamStateStore, PeerRecord, PeerStore, StreamStateStore,
};
pub use streaming::{
    balanced_fetch_map, FetchPlan, FetchTask, FixedLiveness, LivenessView, PlanError,
    RangePlanner, SourceFilter, StreamTransport,
};
pub use telemetry::{MetricsRegistry, MetricsSnapshot, SILENCE_BUCKETS_MS};
pub use wire::{ProtocolError, CURRENT_VERSION, VERSION_30, VERSION_40};
