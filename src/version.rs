//! Version vectors: per-actor counters with a partial dominance order.
//!
//! A vector answers one question cheaply: "is there evidence of changes I
//! don't have?" Missing actors count as 0, so the comparison runs over the
//! union of keys and needs no tie-break.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Detecting Concurrent Writes)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-actor counter map. Counters never decrease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: HashMap<Uuid, u64>,
}

impl VersionVector {
    /// Create an empty vector ("I have seen nothing").
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for an actor; missing entries are 0.
    pub fn get(&self, actor: Uuid) -> u64 {
        self.counters.get(&actor).copied().unwrap_or(0)
    }

    /// Raise an actor's counter to `seq`. Lowering is a no-op, and a zero
    /// counter is never materialized (equivalent to a missing entry).
    pub fn observe(&mut self, actor: Uuid, seq: u64) {
        if seq > self.get(actor) {
            self.counters.insert(actor, seq);
        }
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (&actor, &seq) in &other.counters {
            self.observe(actor, seq);
        }
    }

    /// True iff `self[actor] >= other[actor]` for every actor in either vector.
    pub fn dominates_or_equal(&self, other: &VersionVector) -> bool {
        other
            .counters
            .iter()
            .all(|(&actor, &seq)| self.get(actor) >= seq)
    }

    /// A witness actor for which `self` has seen less than `other`,
    /// or `None` if `self` dominates `other`.
    pub fn strictly_behind(&self, other: &VersionVector) -> Option<Uuid> {
        other
            .counters
            .iter()
            .find(|(&actor, &seq)| self.get(actor) < seq)
            .map(|(&actor, _)| actor)
    }

    /// Number of actors with a non-zero counter.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True for a vector with no observed actors.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate over `(actor, counter)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, u64)> + '_ {
        self.counters.iter().map(|(&a, &s)| (a, s))
    }

    /// Sum of all counters (total changes this vector accounts for).
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }
}

impl FromIterator<(Uuid, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (Uuid, u64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (actor, seq) in iter {
            vector.observe(actor, seq);
        }
        vector
    }
}
