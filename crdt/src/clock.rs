//! Known-state version vectors.
//!
//! A delete op carries a snapshot of the emitter's awareness at delete time,
//! used during apply to distinguish "child we saw and meant to delete" from
//! "concurrent child we never knew about". Per replica the snapshot is a
//! frontier (all counters up to and including it) plus sparse ranges for
//! replicas with gaps.

use crate::id::{Dot, ReplicaId};
use anyhow::{anyhow, Result};
use ciborium::value::Value;
use range_collections::{AbstractRangeSet, RangeSet, RangeSet2};
use std::collections::{btree_map, BTreeMap};
use std::iter::FromIterator;
use std::ops::Bound;

/// A version vector over replica counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KnownState(BTreeMap<ReplicaId, RangeSet2<u64>>);

impl FromIterator<Dot> for KnownState {
    fn from_iter<T: IntoIterator<Item = Dot>>(iter: T) -> Self {
        let mut state = Self::new();
        for dot in iter {
            state.insert(dot);
        }
        state
    }
}

impl KnownState {
    pub fn new() -> Self {
        Self(Default::default())
    }

    /// Creates a known state from a map of frontiers (inclusive). A frontier
    /// of `f` implies awareness of all counters `1..=f`; zero entries are
    /// ignored.
    pub fn from_map(x: BTreeMap<ReplicaId, u64>) -> Self {
        Self(
            x.into_iter()
                .filter(|(_, max)| *max > 0)
                .map(|(i, max)| (i, RangeSet::from(1..max + 1)))
                .collect(),
        )
    }

    /// Does the snapshot cover this dot, i.e. had the emitter seen the op it
    /// identifies?
    pub fn covers(&self, dot: &Dot) -> bool {
        self.0
            .get(&dot.replica)
            .map(|range| range.contains(&dot.counter))
            .unwrap_or_default()
    }

    pub fn insert(&mut self, dot: Dot) {
        if dot.counter == 0 {
            return;
        }
        let counter = dot.counter;
        let range = RangeSet::from(counter..counter + 1);
        match self.0.get_mut(&dot.replica) {
            Some(existing) => {
                *existing |= range;
            }
            None => {
                self.0.insert(dot.replica, range);
            }
        }
    }

    /// The highest counter known for a replica. Replicas not in the set have
    /// an implied frontier of 0.
    pub fn max(&self, replica: &ReplicaId) -> u64 {
        if let Some(r) = self.0.get(replica) {
            r.boundaries()
                .last()
                .map(|x| *x - 1)
                .expect("must not have explicit empty ranges")
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges with another known state.
    pub fn union(&mut self, other: &Self) {
        for (k, vr) in other.0.iter() {
            match self.0.entry(*k) {
                btree_map::Entry::Occupied(e) => {
                    e.into_mut().union_with(vr);
                }
                btree_map::Entry::Vacant(e) => {
                    e.insert(vr.clone());
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Dot> + '_ {
        self.0.iter().flat_map(|(id, ranges)| {
            ranges.iter().flat_map(move |(from, to)| {
                elems(from, to)
                    .filter(|counter| *counter != 0)
                    .map(move |counter| Dot::new(*id, counter))
            })
        })
    }

    /// Splits a replica's ranges into (frontier, explicit ranges). The
    /// frontier absorbs the contiguous prefix starting at counter 1; the
    /// rest are inclusive `[lo, hi]` pairs.
    fn split(ranges: &RangeSet2<u64>) -> (u64, Vec<(u64, u64)>) {
        let b = ranges.boundaries();
        let mut frontier = 0;
        let mut rest = Vec::new();
        for pair in b.chunks(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if lo <= 1 && frontier == 0 && rest.is_empty() {
                frontier = hi - 1;
            } else {
                rest.push((lo, hi - 1));
            }
        }
        (frontier, rest)
    }

    /// Canonical deterministic CBOR form:
    /// `{entries: [{replica, frontier, ranges: [[lo, hi]]}]}` with entries
    /// sorted by replica bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::with_capacity(self.0.len());
        for (replica, ranges) in self.0.iter() {
            let (frontier, rest) = Self::split(ranges);
            let ranges = rest
                .into_iter()
                .map(|(lo, hi)| {
                    Value::Array(vec![Value::Integer(lo.into()), Value::Integer(hi.into())])
                })
                .collect();
            entries.push(crate::cose::canonical_map(vec![
                (
                    Value::Text("replica".into()),
                    Value::Bytes(replica.as_bytes().to_vec()),
                ),
                (
                    Value::Text("frontier".into()),
                    Value::Integer(frontier.into()),
                ),
                (Value::Text("ranges".into()), Value::Array(ranges)),
            ])?);
        }
        let value = crate::cose::canonical_map(vec![(
            Value::Text("entries".into()),
            Value::Array(entries),
        )])?;
        crate::cose::encode(&value)
    }

    /// Decodes the canonical CBOR form; falls back to legacy JSON input
    /// (`{"<replica>": frontier}` maps shipped by older deployments).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let canonical = crate::cose::decode(bytes)
            .and_then(|value| Self::from_value(&value));
        match canonical {
            Ok(state) => Ok(state),
            Err(err) => Self::decode_legacy_json(bytes).map_err(|_| err),
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| anyhow!("known_state: expected map"))?;
        let entries = crate::cose::map_get_text(map, "entries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("known_state: missing entries"))?;
        let mut state = BTreeMap::new();
        for entry in entries {
            let entry = entry
                .as_map()
                .ok_or_else(|| anyhow!("known_state: entry is not a map"))?;
            let replica = crate::cose::map_get_text(entry, "replica")
                .and_then(|v| v.as_bytes())
                .filter(|b| b.len() == 32)
                .ok_or_else(|| anyhow!("known_state: bad replica"))?;
            let mut id = [0; 32];
            id.copy_from_slice(replica);
            let replica = ReplicaId::new(id);
            let frontier = crate::cose::map_get_text(entry, "frontier")
                .and_then(|v| v.as_integer())
                .map(|i| i128::from(i) as u64)
                .unwrap_or_default();
            let mut set: RangeSet2<u64> = if frontier > 0 {
                RangeSet::from(1..frontier + 1)
            } else {
                RangeSet::empty()
            };
            if let Some(ranges) = crate::cose::map_get_text(entry, "ranges").and_then(|v| v.as_array())
            {
                for range in ranges {
                    let range = range
                        .as_array()
                        .filter(|r| r.len() == 2)
                        .ok_or_else(|| anyhow!("known_state: bad range"))?;
                    let lo = range[0]
                        .as_integer()
                        .map(|i| i128::from(i) as u64)
                        .ok_or_else(|| anyhow!("known_state: bad range bound"))?;
                    let hi = range[1]
                        .as_integer()
                        .map(|i| i128::from(i) as u64)
                        .ok_or_else(|| anyhow!("known_state: bad range bound"))?;
                    if lo == 0 || hi < lo {
                        return Err(anyhow!("known_state: bad range [{}, {}]", lo, hi));
                    }
                    set |= RangeSet::from(lo..hi + 1);
                }
            }
            if !set.is_empty() {
                state.insert(replica, set);
            }
        }
        Ok(Self(state))
    }

    fn decode_legacy_json(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let map = value
            .as_object()
            .ok_or_else(|| anyhow!("known_state: expected json object"))?;
        let mut frontiers = BTreeMap::new();
        for (replica, frontier) in map {
            let replica: ReplicaId = replica.parse()?;
            let frontier = frontier
                .as_u64()
                .ok_or_else(|| anyhow!("known_state: bad frontier"))?;
            frontiers.insert(replica, frontier);
        }
        Ok(Self::from_map(frontiers))
    }
}

fn elems(lower: Bound<&u64>, upper: Bound<&u64>) -> std::ops::Range<u64> {
    match (lower, upper) {
        (Bound::Included(lower), Bound::Excluded(upper)) => *lower..*upper,
        (Bound::Unbounded, Bound::Excluded(upper)) => 0..*upper,
        _ => panic!(),
    }
}
