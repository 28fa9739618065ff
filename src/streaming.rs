//! Planning of range fetches: which live replica hands us each range we
//! need, under the configured consistency rules, balanced across sources.

pub mod balance;
pub mod planner;

pub use balance::balanced_fetch_map;
pub use planner::{
    FetchPlan, FetchTask, FixedLiveness, LivenessView, PlanError, RangePlanner, SourceFilter,
    StreamTransport,
};
