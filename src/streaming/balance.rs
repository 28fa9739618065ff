//! Balanced assignment of ranges to sources. Every range must get exactly
//! one source from its candidate list, and no source should carry more
//! than its fair share. The solver raises the per-source load bound
//! progressively and augments within it, so the first feasible bound is
//! also the most balanced one.

use crate::endpoint::EndpointId;
use crate::ring::range::Range;
use std::collections::{BTreeMap, BTreeSet};

/// Assigns each range one source. Returns `None` when some range has no
/// candidates at all; otherwise a feasible assignment always exists.
///
/// Deterministic: ranges are processed in ascending order of their left
/// bound and candidates in ascending source identity, so equal-cost
/// solutions always tie-break the same way.
pub fn balanced_fetch_map(
    candidates: &BTreeMap<Range, Vec<EndpointId>>,
) -> Option<BTreeMap<EndpointId, Vec<Range>>> {
    if candidates.is_empty() {
        return Some(BTreeMap::new());
    }
    if candidates.values().any(Vec::is_empty) {
        return None;
    }

    let ordered: BTreeMap<Range, Vec<EndpointId>> = candidates
        .iter()
        .map(|(range, sources)| {
            let mut sources = sources.clone();
            sources.sort();
            sources.dedup();
            (*range, sources)
        })
        .collect();
    let source_count = ordered
        .values()
        .flatten()
        .collect::<BTreeSet<_>>()
        .len();
    let range_count = ordered.len();
    let min_bound = ((range_count + source_count - 1) / source_count).max(1);

    for bound in min_bound..=range_count {
        let mut loads: BTreeMap<EndpointId, Vec<Range>> = BTreeMap::new();
        let mut feasible = true;
        for range in ordered.keys() {
            let mut visited = BTreeSet::new();
            if !try_assign(*range, bound, &mut visited, &mut loads, &ordered) {
                feasible = false;
                break;
            }
        }
        if feasible {
            return Some(loads);
        }
    }
    None
}

/// One augmenting step: take a free slot if any candidate has one, else
/// displace an already-assigned range onto another source.
fn try_assign(
    range: Range,
    bound: usize,
    visited: &mut BTreeSet<EndpointId>,
    loads: &mut BTreeMap<EndpointId, Vec<Range>>,
    candidates: &BTreeMap<Range, Vec<EndpointId>>,
) -> bool {
    let Some(sources) = candidates.get(&range) else {
        return false;
    };
    for source in sources {
        if visited.contains(source) {
            continue;
        }
        visited.insert(source.clone());
        let load = loads.get(source).map(Vec::len).unwrap_or(0);
        if load < bound {
            loads.entry(source.clone()).or_default().push(range);
            return true;
        }
        let assigned = loads.get(source).cloned().unwrap_or_default();
        for displaced in assigned {
            if try_assign(displaced, bound, visited, loads, candidates) {
                if let Some(slot) = loads.get_mut(source) {
                    slot.retain(|held| *held != displaced);
                    slot.push(range);
                }
                return true;
            }
        }
    }
    false
}
