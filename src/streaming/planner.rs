//! Builds the fetch plan for a node that must stream token ranges from
//! existing replicas: bootstrap, replace, rebuild. For every desired range
//! the planner picks one acceptable source, either the closest candidate
//! or, under strict consistency, the unique replica handing off its
//! responsibility.

use crate::endpoint::EndpointId;
use crate::replication::ReplicationStrategy;
use crate::ring::metadata::RingSnapshot;
use crate::ring::range::Range;
use crate::ring::token::Token;
use crate::snitch::Snitch;
use crate::store::StreamStateStore;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no sources found for range {range} in keyspace {keyspace}")]
    NoSources { keyspace: String, range: Range },
    #[error(
        "unable to find sufficient sources for streaming range {range} in keyspace {keyspace} \
         with RF=1; ensure this keyspace contains replicas in the source datacenter"
    )]
    NoSourcesRf1 { keyspace: String, range: Range },
    #[error("expected one hand-off source for range {range} in keyspace {keyspace}, found {count}")]
    StrictSourceCount {
        keyspace: String,
        range: Range,
        count: usize,
    },
    #[error(
        "a node required to move the data consistently is down ({down_source}); restart without \
         strict consistency to stream range {range} from a potentially inconsistent replica"
    )]
    StrictSourceDown { down_source: EndpointId, range: Range },
}

/// Liveness as currently believed by this node's failure detection.
pub trait LivenessView: Send + Sync {
    fn is_alive(&self, endpoint: &EndpointId) -> bool;
}

/// A frozen liveness set, for planners running against a snapshot and for
/// tests.
#[derive(Debug, Clone, Default)]
pub struct FixedLiveness {
    alive: BTreeSet<EndpointId>,
}

impl FixedLiveness {
    pub fn of(alive: impl IntoIterator<Item = EndpointId>) -> Self {
        Self {
            alive: alive.into_iter().collect(),
        }
    }
}

impl LivenessView for FixedLiveness {
    fn is_alive(&self, endpoint: &EndpointId) -> bool {
        self.alive.contains(endpoint)
    }
}

/// Predicates a streaming source must pass. Composed by AND; the local
/// node is additionally always excluded from actual transfers.
pub enum SourceFilter {
    /// Source must currently be alive per the failure detector.
    Alive(Arc<dyn LivenessView>),
    /// Source must live in the given datacenter.
    InDatacenter {
        snitch: Arc<dyn Snitch>,
        datacenter: String,
    },
    /// Source must not be this node.
    ExcludeLocalNode,
    /// Source must be explicitly whitelisted.
    Whitelist(BTreeSet<EndpointId>),
}

impl SourceFilter {
    fn accepts(&self, endpoint: &EndpointId, local: &EndpointId) -> bool {
        match self {
            SourceFilter::Alive(liveness) => liveness.is_alive(endpoint),
            SourceFilter::InDatacenter { snitch, datacenter } => {
                snitch.datacenter(endpoint) == *datacenter
            }
            SourceFilter::ExcludeLocalNode => endpoint != local,
            SourceFilter::Whitelist(allowed) => allowed.contains(endpoint),
        }
    }
}

/// One source streaming a set of ranges for one keyspace.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub keyspace: String,
    pub source: EndpointId,
    pub ranges: Vec<Range>,
}

/// The finished plan, ready for the streaming transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPlan {
    pub tasks: Vec<FetchTask>,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn dispatch(&self, transport: &mut dyn StreamTransport) {
        for task in &self.tasks {
            transport.request_ranges(&task.source, &task.keyspace, &task.ranges);
        }
    }
}

/// The external transfer mechanism the plan is handed to.
pub trait StreamTransport {
    fn request_ranges(&mut self, source: &EndpointId, keyspace: &str, ranges: &[Range]);
}

pub struct RangePlanner {
    ring: Arc<RingSnapshot>,
    /// The tokens this node will own, when known (bootstrap/replace).
    tokens: Option<Vec<Token>>,
    local: EndpointId,
    /// The dead node this one stands in for, when replacing. It can never
    /// be a source, and strict hand-off is computed on the ring without it.
    replacing: Option<EndpointId>,
    description: String,
    use_strict_consistency: bool,
    snitch: Arc<dyn Snitch>,
    state_store: Arc<dyn StreamStateStore>,
    liveness: Arc<dyn LivenessView>,
    filters: Vec<SourceFilter>,
    to_fetch: BTreeMap<String, BTreeMap<EndpointId, Vec<Range>>>,
}

impl RangePlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<RingSnapshot>,
        tokens: Option<Vec<Token>>,
        local: EndpointId,
        description: impl Into<String>,
        use_strict_consistency: bool,
        snitch: Arc<dyn Snitch>,
        state_store: Arc<dyn StreamStateStore>,
        liveness: Arc<dyn LivenessView>,
    ) -> Self {
        Self {
            ring,
            tokens,
            local,
            replacing: None,
            description: description.into(),
            use_strict_consistency,
            snitch,
            state_store,
            liveness,
            filters: Vec::new(),
            to_fetch: BTreeMap::new(),
        }
    }

    /// Marks this plan as a replacement of the given (dead) endpoint.
    pub fn replacing(mut self, original: EndpointId) -> Self {
        self.replacing = Some(original);
        self
    }

    pub fn add_source_filter(&mut self, filter: SourceFilter) {
        self.filters.push(filter);
    }

    /// Plans the fetches for one keyspace's desired ranges.
    pub fn add_ranges(
        &mut self,
        keyspace: &str,
        desired: &[Range],
        strategy: &dyn ReplicationStrategy,
    ) -> Result<(), PlanError> {
        let strict = self.use_strict_sources(strategy);
        let candidates = if strict {
            self.strict_sources(keyspace, desired, strategy)?
        } else {
            self.all_sources(keyspace, desired, strategy)?
        };
        for (range, sources) in &candidates {
            for source in sources {
                debug!(
                    "{}: range {range} exists on {source} for keyspace {keyspace}",
                    self.description
                );
            }
        }

        let fetch = if strict || strategy.replication_factor() == 1 {
            self.simple_fetch_map(keyspace, &candidates, strategy.replication_factor())?
        } else {
            self.balanced_fetch_map(keyspace, &candidates)?
        };
        Self::validate_fetch_map(&candidates, &fetch, &self.local, &self.filters);

        for (source, ranges) in fetch {
            info!(
                "{}: streaming {} ranges from {source} for keyspace {keyspace}",
                self.description,
                ranges.len()
            );
            self.to_fetch
                .entry(keyspace.to_string())
                .or_default()
                .entry(source)
                .or_default()
                .extend(ranges);
        }
        Ok(())
    }

    /// Strict hand-off sourcing applies when bootstrapping with the flag on
    /// and the cluster is bigger than one replica set.
    fn use_strict_sources(&self, strategy: &dyn ReplicationStrategy) -> bool {
        self.use_strict_consistency
            && self.tokens.is_some()
            && self.ring.endpoint_count() != strategy.replication_factor()
    }

    /// Candidate sources per desired range: the current replicas of the
    /// ring range containing it, closest first.
    fn all_sources(
        &self,
        keyspace: &str,
        desired: &[Range],
        strategy: &dyn ReplicationStrategy,
    ) -> Result<BTreeMap<Range, Vec<EndpointId>>, PlanError> {
        let range_addresses = strategy.range_addresses(&self.ring);
        let mut candidates = BTreeMap::new();
        for desired_range in desired {
            let covering = range_addresses
                .iter()
                .find(|(range, _)| range.contains_range(desired_range));
            match covering {
                Some((_, replicas)) => {
                    let preferred = self
                        .snitch
                        .sorted_by_proximity(&self.local, replicas.clone());
                    candidates.insert(*desired_range, preferred);
                }
                None => {
                    return Err(PlanError::NoSources {
                        keyspace: keyspace.to_string(),
                        range: *desired_range,
                    })
                }
            }
        }
        Ok(candidates)
    }

    /// Strict mode: for each desired range the single replica that stops
    /// being responsible once this node's tokens are inserted. That replica
    /// must be unique and alive. A node being replaced is dead by
    /// definition, so both sides of the comparison run on the ring without
    /// it.
    fn strict_sources(
        &self,
        keyspace: &str,
        desired: &[Range],
        strategy: &dyn ReplicationStrategy,
    ) -> Result<BTreeMap<Range, Vec<EndpointId>>, PlanError> {
        let Some(tokens) = self.tokens.as_ref() else {
            return Err(PlanError::NoSources {
                keyspace: keyspace.to_string(),
                range: desired.first().copied().unwrap_or(Range::new(
                    Token::default(),
                    Token::default(),
                )),
            });
        };

        let mut base_ring = (*self.ring).clone();
        if let Some(original) = &self.replacing {
            base_ring.remove_endpoint(original);
        }
        let current = strategy.range_addresses(&base_ring);
        let mut future_ring = base_ring.clone();
        future_ring.update_normal_tokens(&self.local, tokens);

        let mut candidates = BTreeMap::new();
        for desired_range in desired {
            let mut matches: Vec<EndpointId> = Vec::new();
            for (range, old_replicas) in &current {
                if !range.contains_range(desired_range) {
                    continue;
                }
                let new: BTreeSet<EndpointId> = strategy
                    .natural_endpoints(desired_range.right, &future_ring)
                    .into_iter()
                    .collect();
                // Only be strict when the replica set is actually full; a
                // keyspace can carry a higher RF than there are nodes.
                if old_replicas.len() == strategy.replication_factor() {
                    let handed_off: Vec<&EndpointId> = old_replicas
                        .iter()
                        .filter(|replica| !new.contains(*replica))
                        .collect();
                    if handed_off.len() != 1 {
                        return Err(PlanError::StrictSourceCount {
                            keyspace: keyspace.to_string(),
                            range: *desired_range,
                            count: handed_off.len(),
                        });
                    }
                    matches.push(handed_off[0].clone());
                } else if let Some(first) = old_replicas.first() {
                    matches.push(first.clone());
                }
            }

            match matches.len() {
                0 => {
                    return Err(PlanError::NoSources {
                        keyspace: keyspace.to_string(),
                        range: *desired_range,
                    })
                }
                1 => {}
                count => {
                    return Err(PlanError::StrictSourceCount {
                        keyspace: keyspace.to_string(),
                        range: *desired_range,
                        count,
                    })
                }
            }
            let source = matches.remove(0);
            if !self.liveness.is_alive(&source) {
                return Err(PlanError::StrictSourceDown {
                    down_source: source,
                    range: *desired_range,
                });
            }
            candidates.insert(*desired_range, vec![source]);
        }
        Ok(candidates)
    }

    /// Walks each range's candidates in proximity order and takes the first
    /// acceptable one. Finding ourselves satisfies the range without a
    /// transfer.
    fn simple_fetch_map(
        &self,
        keyspace: &str,
        candidates: &BTreeMap<Range, Vec<EndpointId>>,
        replication_factor: usize,
    ) -> Result<BTreeMap<EndpointId, Vec<Range>>, PlanError> {
        let mut fetch: BTreeMap<EndpointId, Vec<Range>> = BTreeMap::new();
        for (range, sources) in candidates {
            let mut found = false;
            for source in sources {
                if !self
                    .filters
                    .iter()
                    .all(|filter| filter.accepts(source, &self.local))
                {
                    continue;
                }
                if *source == self.local {
                    // We already hold the data; nothing to stream.
                    found = true;
                    continue;
                }
                fetch.entry(source.clone()).or_default().push(*range);
                found = true;
                break;
            }
            if !found {
                if replication_factor == 1 {
                    if self.use_strict_consistency {
                        return Err(PlanError::NoSourcesRf1 {
                            keyspace: keyspace.to_string(),
                            range: *range,
                        });
                    }
                    warn!(
                        "unable to find sufficient sources for streaming range {range} in \
                         keyspace {keyspace} with RF=1; keyspace might be missing data"
                    );
                } else {
                    return Err(PlanError::NoSources {
                        keyspace: keyspace.to_string(),
                        range: *range,
                    });
                }
            }
        }
        Ok(fetch)
    }

    /// Balanced assignment across acceptable non-local candidates.
    fn balanced_fetch_map(
        &self,
        keyspace: &str,
        candidates: &BTreeMap<Range, Vec<EndpointId>>,
    ) -> Result<BTreeMap<EndpointId, Vec<Range>>, PlanError> {
        let mut acceptable: BTreeMap<Range, Vec<EndpointId>> = BTreeMap::new();
        for (range, sources) in candidates {
            let mut satisfied_locally = false;
            let mut filtered = Vec::new();
            for source in sources {
                if !self
                    .filters
                    .iter()
                    .all(|filter| filter.accepts(source, &self.local))
                {
                    continue;
                }
                if *source == self.local {
                    satisfied_locally = true;
                    continue;
                }
                filtered.push(source.clone());
            }
            if satisfied_locally {
                // We already hold the data; leave the range out of the
                // assignment entirely.
                continue;
            }
            acceptable.insert(*range, filtered);
        }
        match crate::streaming::balance::balanced_fetch_map(&acceptable) {
            Some(assignment) => Ok(assignment),
            None => {
                let stranded = acceptable
                    .iter()
                    .find(|(_, sources)| sources.is_empty())
                    .map(|(range, _)| *range)
                    .unwrap_or_else(|| {
                        Range::new(Token::default(), Token::default())
                    });
                Err(PlanError::NoSources {
                    keyspace: keyspace.to_string(),
                    range: stranded,
                })
            }
        }
    }

    /// Every produced entry must name an acceptable, non-local candidate.
    /// A violation here is a programmer error, not an operator problem.
    fn validate_fetch_map(
        candidates: &BTreeMap<Range, Vec<EndpointId>>,
        fetch: &BTreeMap<EndpointId, Vec<Range>>,
        local: &EndpointId,
        filters: &[SourceFilter],
    ) {
        for (source, ranges) in fetch {
            assert!(
                source != local,
                "trying to stream range(s) {ranges:?} from ourselves"
            );
            for range in ranges {
                let allowed = candidates
                    .get(range)
                    .map(|sources| sources.contains(source))
                    .unwrap_or(false);
                assert!(
                    allowed,
                    "trying to stream range {range} from non-candidate {source}"
                );
                assert!(
                    filters.iter().all(|filter| filter.accepts(source, local)),
                    "source {source} for range {range} fails a source filter"
                );
            }
        }
    }

    /// Finalizes the plan, dropping anything the state store already holds.
    pub fn build_plan(&self) -> FetchPlan {
        let mut tasks = Vec::new();
        for (keyspace, per_source) in &self.to_fetch {
            let available: HashSet<Range> = self.state_store.available_ranges(keyspace);
            for (source, ranges) in per_source {
                let residual: Vec<Range> = ranges
                    .iter()
                    .filter(|range| !available.contains(range))
                    .copied()
                    .collect();
                if residual.is_empty() {
                    info!(
                        "all ranges from {source} for keyspace {keyspace} are already \
                         available; skipping"
                    );
                    continue;
                }
                if residual.len() < ranges.len() {
                    info!(
                        "some ranges of keyspace {keyspace} are already available; \
                         skipping those"
                    );
                }
                tasks.push(FetchTask {
                    keyspace: keyspace.clone(),
                    source: source.clone(),
                    ranges: residual,
                });
            }
        }
        FetchPlan { tasks }
    }
}
