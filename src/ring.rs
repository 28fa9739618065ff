//! Token-ring metadata: positions, arcs, topology, and the authoritative
//! token-to-endpoint map with its derived pending-range views.

pub mod metadata;
pub mod pending;
pub mod range;
pub mod subscriber;
pub mod token;
pub mod topology;

pub use metadata::{RingError, RingMetadata, RingSnapshot};
pub use pending::{calculate_pending_ranges, PendingRangeMap};
pub use range::Range;
pub use subscriber::RingStateSubscriber;
pub use token::{format_tokens, parse_tokens, Murmur3Partitioner, Partitioner, Token};
pub use topology::{Location, Topology};
