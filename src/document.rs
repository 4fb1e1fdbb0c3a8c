//! The replicated canvas document: a convergent change-based data type.
//!
//! The document value (title, nodes, edges) is derived purely from the set
//! of applied changes. Merge is deterministic, commutative, and idempotent:
//!
//! - Every change is tagged `(actor, seq)`; a change already accounted for
//!   by the version vector is a duplicate and ignored.
//! - Changes from one actor apply in sequence order; a gap leaves the later
//!   change unapplied. The vector then stays behind the sender's advertised
//!   vector, which is how the sync layer detects loss — gaps never corrupt
//!   state.
//! - Concurrent writes to the same element resolve last-writer-wins on
//!   `(stamp, actor)`, where `stamp` is a Lamport timestamp, so every
//!   replica picks the same winner regardless of delivery order.
//!
//! Two documents holding the same change set are equal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::version::VersionVector;

/// One canvas mutation. The unit the wire protocol and the durable log carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Set the document title.
    SetTitle(String),
    /// Create or replace a node.
    PutNode {
        id: Uuid,
        label: String,
        parent: Option<Uuid>,
        x: f64,
        y: f64,
    },
    /// Delete a node.
    RemoveNode { id: Uuid },
    /// Create or replace an edge between two nodes.
    PutEdge { id: Uuid, from: Uuid, to: Uuid },
    /// Delete an edge.
    RemoveEdge { id: Uuid },
}

/// An immutable unit of mutation.
///
/// `seq` is the per-actor sequence number (starting at 1). `stamp` is a
/// Lamport timestamp used only for last-writer-wins tie-breaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: Uuid,
    pub seq: u64,
    pub stamp: u64,
    pub op: ChangeOp,
}

/// A node as currently visible in the document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub label: String,
    pub parent: Option<Uuid>,
    pub x: f64,
    pub y: f64,
}

/// An edge as currently visible in the document value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: Uuid,
    pub to: Uuid,
}

/// A last-writer-wins register keyed by `(stamp, actor)`.
/// `value: None` is a tombstone (element removed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Register<T> {
    stamp: u64,
    actor: Uuid,
    value: Option<T>,
}

impl<T> Register<T> {
    /// Whether a write stamped `(stamp, actor)` supersedes this register.
    fn loses_to(&self, stamp: u64, actor: Uuid) -> bool {
        (stamp, actor) > (self.stamp, self.actor)
    }
}

/// The shared replicated document.
///
/// Owned by a registry entry; sessions mutate it only through the sync
/// layer under the document's mutex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    /// Applied changes per actor; `seq` of `history[a][i]` is `i + 1`.
    history: HashMap<Uuid, Vec<Change>>,
    /// Summary of `history`: how many changes from each actor are applied.
    vector: VersionVector,
    title: Register<String>,
    nodes: HashMap<Uuid, Register<Node>>,
    edges: HashMap<Uuid, Register<Edge>>,
    /// Highest Lamport stamp seen, for authoring new changes.
    max_stamp: u64,
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self {
            history: HashMap::new(),
            vector: VersionVector::new(),
            title: none_register(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            max_stamp: 0,
        }
    }
}

impl ReplicatedDocument {
    /// An empty document (no changes applied).
    pub fn init() -> Self {
        Self::default()
    }

    /// Apply a batch of changes. Returns the number of newly applied
    /// changes; duplicates and out-of-sequence changes are skipped.
    ///
    /// The batch may arrive in any order: it is sorted by `(actor, seq)`
    /// first, so reordering within a delivery never loses data. A change
    /// whose predecessor is missing entirely is left unapplied, which the
    /// caller detects by comparing vectors afterwards.
    pub fn apply_changes(&mut self, changes: &[Change]) -> usize {
        let mut ordered: Vec<&Change> = changes.iter().collect();
        ordered.sort_by_key(|c| (c.actor, c.seq));

        let mut applied = 0;
        for change in ordered {
            let known = self.vector.get(change.actor);
            if change.seq <= known {
                continue; // duplicate delivery
            }
            if change.seq != known + 1 {
                continue; // gap: predecessor missing
            }
            self.integrate(change);
            self.vector.observe(change.actor, change.seq);
            self.history
                .entry(change.actor)
                .or_default()
                .push(change.clone());
            if change.stamp > self.max_stamp {
                self.max_stamp = change.stamp;
            }
            applied += 1;
        }
        applied
    }

    /// Author a local change: assign the next sequence number for `actor`,
    /// stamp it past everything seen so far, apply it, and return it for
    /// the wire / the durable log.
    pub fn apply_local(&mut self, actor: Uuid, op: ChangeOp) -> Change {
        let change = Change {
            actor,
            seq: self.vector.get(actor) + 1,
            stamp: self.max_stamp + 1,
            op,
        };
        let applied = self.apply_changes(std::slice::from_ref(&change));
        debug_assert_eq!(applied, 1);
        change
    }

    /// All applied changes the peer summarized by `peer` has not seen,
    /// ordered by `(actor, seq)`.
    pub fn changes_since(&self, peer: &VersionVector) -> Vec<Change> {
        let mut out = Vec::new();
        for (&actor, log) in &self.history {
            let seen = peer.get(actor) as usize;
            if seen < log.len() {
                out.extend_from_slice(&log[seen..]);
            }
        }
        out.sort_by_key(|c| (c.actor, c.seq));
        out
    }

    /// The vector summarizing every applied change.
    pub fn current_vector(&self) -> VersionVector {
        self.vector.clone()
    }

    /// Total number of applied changes.
    pub fn change_count(&self) -> u64 {
        self.vector.total()
    }

    /// Apply one in-sequence change to the derived value.
    fn integrate(&mut self, change: &Change) {
        match &change.op {
            ChangeOp::SetTitle(title) => {
                Self::write(&mut self.title, change, Some(title.clone()));
            }
            ChangeOp::PutNode {
                id,
                label,
                parent,
                x,
                y,
            } => {
                let node = Node {
                    label: label.clone(),
                    parent: *parent,
                    x: *x,
                    y: *y,
                };
                Self::write(self.nodes.entry(*id).or_insert_with(none_register), change, Some(node));
            }
            ChangeOp::RemoveNode { id } => {
                Self::write(self.nodes.entry(*id).or_insert_with(none_register), change, None);
            }
            ChangeOp::PutEdge { id, from, to } => {
                let edge = Edge {
                    from: *from,
                    to: *to,
                };
                Self::write(self.edges.entry(*id).or_insert_with(none_register), change, Some(edge));
            }
            ChangeOp::RemoveEdge { id } => {
                Self::write(self.edges.entry(*id).or_insert_with(none_register), change, None);
            }
        }
    }

    fn write<T>(slot: &mut Register<T>, change: &Change, value: Option<T>) {
        if slot.loses_to(change.stamp, change.actor) {
            *slot = Register {
                stamp: change.stamp,
                actor: change.actor,
                value,
            };
        }
    }

    // ─── Derived value ────────────────────────────────────────────────

    /// Current title, if any change has set one.
    pub fn title(&self) -> Option<&str> {
        self.title.value.as_deref()
    }

    /// Live (non-tombstoned) node count.
    pub fn node_count(&self) -> usize {
        self.nodes.values().filter(|r| r.value.is_some()).count()
    }

    /// Live edge count.
    pub fn edge_count(&self) -> usize {
        self.edges.values().filter(|r| r.value.is_some()).count()
    }

    /// Look up a live node.
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id).and_then(|r| r.value.as_ref())
    }

    /// Look up a live edge.
    pub fn edge(&self, id: Uuid) -> Option<&Edge> {
        self.edges.get(&id).and_then(|r| r.value.as_ref())
    }

    /// True if no change has ever been applied.
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }
}

// `Register<T>` has no natural Default when T doesn't; an explicit zero
// register (loses to every real write) keeps `write` free of special cases.
fn none_register<T>() -> Register<T> {
    Register {
        stamp: 0,
        actor: Uuid::nil(),
        value: None,
    }
}
