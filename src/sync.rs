//! Two-party synchronization protocol.
//!
//! A `PeerSyncConnection` keeps one remote peer converging toward the local
//! document store for any number of multiplexed documents. There are no
//! explicit acks: per (peer, document) the connection tracks the vector the
//! peer last advertised (`received`) and the vector we last advertised
//! (`sent`), and every event — open, local mutation, incoming message —
//! re-evaluates the same rule:
//!
//! - peer provably behind us → send the minimal change set,
//! - our clock moved past what we last advertised → send a vector-only
//!   probe so the peer can detect its gap,
//! - otherwise stay quiet.
//!
//! Because document merge is idempotent and order-independent, duplicate or
//! reordered delivery is safe. The one unsafe case is a *gap* in an actor's
//! sequence: after applying a delta the local vector must dominate the
//! sender's advertised vector, and if it does not, the delta was incomplete
//! and the merge is rolled back (see [`SyncError::MergeAnomaly`]).

use std::collections::HashMap;

use uuid::Uuid;

use crate::document::ReplicatedDocument;
use crate::error::SyncError;
use crate::protocol::SyncMessage;
use crate::version::VersionVector;

/// Default number of changes applied per scheduler turn.
pub const DEFAULT_APPLY_CHUNK: usize = 256;

/// Per-document view of one remote peer. Both vectors start absent:
/// "peer state unknown".
#[derive(Debug, Default)]
struct PeerDocState {
    received: Option<VersionVector>,
    sent: Option<VersionVector>,
}

/// Result of processing one incoming message.
#[derive(Debug)]
pub struct ReceiveOutcome {
    /// Number of changes newly applied to the local document.
    pub applied: usize,
    /// Message to send back to the peer, if the evaluation produced one.
    pub reply: Option<SyncMessage>,
}

/// Protocol endpoint for a single remote peer.
pub struct PeerSyncConnection {
    docs: HashMap<Uuid, PeerDocState>,
    apply_chunk: usize,
}

impl Default for PeerSyncConnection {
    fn default() -> Self {
        Self::new(DEFAULT_APPLY_CHUNK)
    }
}

impl PeerSyncConnection {
    /// Create a connection applying at most `apply_chunk` changes per
    /// scheduler turn.
    pub fn new(apply_chunk: usize) -> Self {
        Self {
            docs: HashMap::new(),
            apply_chunk: apply_chunk.max(1),
        }
    }

    /// Evaluate every currently known document for proactive advertisement.
    /// Returns the initial messages to send to the peer.
    pub fn open<'a>(
        &mut self,
        docs: impl IntoIterator<Item = (Uuid, &'a ReplicatedDocument)>,
    ) -> Vec<SyncMessage> {
        docs.into_iter()
            .filter_map(|(doc_id, doc)| self.evaluate(doc_id, doc, false))
            .collect()
    }

    /// Re-evaluate one document after a local mutation. Returns the delta
    /// or probe to send, if any.
    pub fn maybe_send_changes(
        &mut self,
        doc_id: Uuid,
        doc: &ReplicatedDocument,
    ) -> Option<SyncMessage> {
        self.evaluate(doc_id, doc, false)
    }

    /// Process one incoming message for `doc`, applying any carried changes
    /// in bounded chunks (yielding between chunks so a large initial sync
    /// cannot monopolize the scheduler).
    ///
    /// On a detected merge anomaly the document is rolled back to its
    /// pre-message value and the error is returned; the peer must resync.
    pub async fn receive_msg(
        &mut self,
        doc: &mut ReplicatedDocument,
        msg: &SyncMessage,
    ) -> Result<ReceiveOutcome, SyncError> {
        self.docs
            .entry(msg.doc_id)
            .or_default()
            .received = Some(msg.vector.clone());

        let mut applied = 0;
        if let Some(changes) = &msg.changes {
            let snapshot = doc.clone();

            // Sort once across the whole batch so chunk boundaries cannot
            // manufacture sequence gaps.
            let mut ordered = changes.clone();
            ordered.sort_by_key(|c| (c.actor, c.seq));

            for chunk in ordered.chunks(self.apply_chunk) {
                applied += doc.apply_changes(chunk);
                tokio::task::yield_now().await;
            }

            if let Some(behind_actor) = doc.current_vector().strictly_behind(&msg.vector) {
                // Incomplete change set: roll back, require resync.
                *doc = snapshot;
                return Err(SyncError::MergeAnomaly {
                    doc_id: msg.doc_id,
                    behind_actor,
                });
            }
        }

        let reply = self.evaluate(msg.doc_id, doc, msg.resync);
        Ok(ReceiveOutcome { applied, reply })
    }

    /// Discard all per-peer state. The shared documents are untouched.
    pub fn close(&mut self) {
        self.docs.clear();
    }

    /// The vector most recently advertised *by* the peer for `doc_id`.
    pub fn received_vector(&self, doc_id: Uuid) -> Option<&VersionVector> {
        self.docs.get(&doc_id).and_then(|s| s.received.as_ref())
    }

    /// The vector most recently advertised *to* the peer for `doc_id`.
    pub fn sent_vector(&self, doc_id: Uuid) -> Option<&VersionVector> {
        self.docs.get(&doc_id).and_then(|s| s.sent.as_ref())
    }

    /// The core evaluation rule shared by open / local-change / receive.
    ///
    /// With `resync` set the peer asked for its full outstanding diff
    /// unconditionally, so the sent-vector suppression is bypassed.
    fn evaluate(
        &mut self,
        doc_id: Uuid,
        doc: &ReplicatedDocument,
        resync: bool,
    ) -> Option<SyncMessage> {
        let state = self.docs.entry(doc_id).or_default();
        let local = doc.current_vector();

        match &state.received {
            Some(received) if resync || received.strictly_behind(&local).is_some() => {
                let changes = doc.changes_since(received);
                if !changes.is_empty() {
                    state.sent = Some(local.clone());
                    return Some(SyncMessage::delta(doc_id, local, changes));
                }
            }
            _ => {}
        }

        // No data to send: advertise our clock if the peer hasn't seen this
        // vector from us yet. An empty vector here doubles as "I have
        // nothing, please send everything".
        if resync || state.sent.as_ref() != Some(&local) {
            state.sent = Some(local.clone());
            return Some(SyncMessage::probe(doc_id, local));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ChangeOp;

    fn actor(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn doc_id() -> Uuid {
        Uuid::from_bytes([0xAA; 16])
    }

    /// Drive messages between two connections until neither has anything
    /// left to say. Returns the number of messages exchanged.
    async fn converge(
        a: &mut PeerSyncConnection,
        doc_a: &mut ReplicatedDocument,
        b: &mut PeerSyncConnection,
        doc_b: &mut ReplicatedDocument,
        first: SyncMessage,
    ) -> usize {
        let mut exchanged = 0;
        let mut inbox_b = vec![first];
        let mut inbox_a = Vec::new();

        while !inbox_a.is_empty() || !inbox_b.is_empty() {
            for msg in inbox_b.drain(..) {
                exchanged += 1;
                let outcome = b.receive_msg(doc_b, &msg).await.unwrap();
                inbox_a.extend(outcome.reply);
            }
            for msg in inbox_a.drain(..) {
                exchanged += 1;
                let outcome = a.receive_msg(doc_a, &msg).await.unwrap();
                inbox_b.extend(outcome.reply);
            }
            assert!(exchanged < 64, "protocol did not quiesce");
        }
        exchanged
    }

    #[tokio::test]
    async fn test_cold_peer_receives_everything() {
        let mut doc_a = ReplicatedDocument::init();
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("x".into()));
        let mut doc_b = ReplicatedDocument::init();

        let mut a = PeerSyncConnection::default();
        let mut b = PeerSyncConnection::default();

        // A opens the connection and advertises
        let opening = a.open([(doc_id(), &doc_a)]);
        assert_eq!(opening.len(), 1);

        converge(&mut a, &mut doc_a, &mut b, &mut doc_b, opening[0].clone()).await;

        assert_eq!(doc_b.title(), Some("x"));
        assert_eq!(doc_a, doc_b);
    }

    #[tokio::test]
    async fn test_local_change_pushes_minimal_delta() {
        let mut doc_a = ReplicatedDocument::init();
        let mut doc_b = ReplicatedDocument::init();
        let mut a = PeerSyncConnection::default();
        let mut b = PeerSyncConnection::default();

        // Handshake on empty documents
        let opening = a.open([(doc_id(), &doc_a)]);
        converge(&mut a, &mut doc_a, &mut b, &mut doc_b, opening[0].clone()).await;

        // Now A mutates; the connection should emit exactly the new change
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("x".into()));
        let msg = a.maybe_send_changes(doc_id(), &doc_a).unwrap();
        let changes = msg.changes.as_ref().unwrap();
        assert_eq!(changes.len(), 1);

        let outcome = b.receive_msg(&mut doc_b, &msg).await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(doc_b.title(), Some("x"));

        // B acks with a probe; after that neither side has anything to say
        let ack = outcome.reply.expect("probe ack after apply");
        let back = a.receive_msg(&mut doc_a, &ack).await.unwrap();
        assert!(back.reply.is_none());
        assert!(a.maybe_send_changes(doc_id(), &doc_a).is_none());
        assert_eq!(doc_a, doc_b);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_harmless() {
        let mut doc_a = ReplicatedDocument::init();
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("x".into()));
        let mut doc_b = ReplicatedDocument::init();
        let mut b = PeerSyncConnection::default();

        let msg = SyncMessage::delta(
            doc_id(),
            doc_a.current_vector(),
            doc_a.changes_since(&VersionVector::new()),
        );

        for _ in 0..3 {
            b.receive_msg(&mut doc_b, &msg).await.unwrap();
        }
        assert_eq!(doc_b, doc_a);
        assert_eq!(doc_b.change_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_message_recovered_by_probe() {
        let mut doc_a = ReplicatedDocument::init();
        let mut doc_b = ReplicatedDocument::init();
        let mut a = PeerSyncConnection::default();
        let mut b = PeerSyncConnection::default();

        let opening = a.open([(doc_id(), &doc_a)]);
        converge(&mut a, &mut doc_a, &mut b, &mut doc_b, opening[0].clone()).await;

        // A makes a change whose delta is lost in transit
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("lost".into()));
        let _dropped = a.maybe_send_changes(doc_id(), &doc_a).unwrap();

        // A's next mutation produces a delta containing both changes,
        // because `received` still reflects what B actually has.
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("second".into()));
        let msg = a.maybe_send_changes(doc_id(), &doc_a).unwrap();
        assert_eq!(msg.changes.as_ref().unwrap().len(), 2);

        let outcome = b.receive_msg(&mut doc_b, &msg).await.unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(doc_b.title(), Some("second"));
        assert_eq!(doc_a, doc_b);
    }

    #[tokio::test]
    async fn test_gap_detected_as_merge_anomaly_with_rollback() {
        let mut doc_a = ReplicatedDocument::init();
        let _c1 = doc_a.apply_local(actor(1), ChangeOp::SetTitle("one".into()));
        let c2 = doc_a.apply_local(actor(1), ChangeOp::SetTitle("two".into()));

        let mut doc_b = ReplicatedDocument::init();
        doc_b.apply_local(actor(2), ChangeOp::SetTitle("local".into()));
        let before = doc_b.clone();

        // Delta advertises A's full vector but carries only c2: a gap.
        let msg = SyncMessage::delta(doc_id(), doc_a.current_vector(), vec![c2]);
        let mut b = PeerSyncConnection::default();
        let err = b.receive_msg(&mut doc_b, &msg).await.unwrap_err();

        assert!(matches!(err, SyncError::MergeAnomaly { .. }));
        // Rolled back to the pre-message value
        assert_eq!(doc_b, before);
    }

    #[tokio::test]
    async fn test_resync_bypasses_sent_suppression() {
        let mut doc_a = ReplicatedDocument::init();
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("x".into()));
        let mut a = PeerSyncConnection::default();

        // Peer claims to know nothing and asks for a full resend, twice.
        let req = SyncMessage::resync_request(doc_id(), VersionVector::new());
        let first = a.receive_msg(&mut doc_a, &req).await.unwrap();
        let second = a.receive_msg(&mut doc_a, &req).await.unwrap();

        for outcome in [first, second] {
            let reply = outcome.reply.expect("resync must always answer");
            assert_eq!(reply.changes.as_ref().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_out_of_order_connect_converges_without_full_resync() {
        // B already holds state before the connection opens
        let mut doc_a = ReplicatedDocument::init();
        doc_a.apply_local(actor(1), ChangeOp::SetTitle("from_a".into()));
        let mut doc_b = doc_a.clone();
        doc_b.apply_local(
            actor(2),
            ChangeOp::PutNode {
                id: Uuid::from_bytes([5; 16]),
                label: "n".into(),
                parent: None,
                x: 0.0,
                y: 0.0,
            },
        );

        let mut a = PeerSyncConnection::default();
        let mut b = PeerSyncConnection::default();

        let opening = a.open([(doc_id(), &doc_a)]);
        let exchanged =
            converge(&mut a, &mut doc_a, &mut b, &mut doc_b, opening[0].clone()).await;

        assert_eq!(doc_a, doc_b);
        assert_eq!(doc_a.node_count(), 1);
        // Minimal traffic: B only ever had to send its one missing change
        assert!(exchanged <= 5, "exchanged {exchanged} messages");
    }

    #[tokio::test]
    async fn test_close_discards_peer_state_only() {
        let mut doc = ReplicatedDocument::init();
        doc.apply_local(actor(1), ChangeOp::SetTitle("x".into()));

        let mut conn = PeerSyncConnection::default();
        let probe = SyncMessage::probe(doc_id(), VersionVector::new());
        conn.receive_msg(&mut doc, &probe).await.unwrap();
        assert!(conn.received_vector(doc_id()).is_some());

        conn.close();
        assert!(conn.received_vector(doc_id()).is_none());
        assert!(conn.sent_vector(doc_id()).is_none());
        assert_eq!(doc.title(), Some("x"));
    }

    #[tokio::test]
    async fn test_chunked_apply_large_batch() {
        let mut source = ReplicatedDocument::init();
        for i in 0..1000u64 {
            source.apply_local(
                actor(1),
                ChangeOp::PutNode {
                    id: Uuid::from_u64_pair(0, i),
                    label: format!("n{i}"),
                    parent: None,
                    x: i as f64,
                    y: 0.0,
                },
            );
        }

        let msg = SyncMessage::delta(
            doc_id(),
            source.current_vector(),
            source.changes_since(&VersionVector::new()),
        );

        let mut replica = ReplicatedDocument::init();
        let mut conn = PeerSyncConnection::new(64);
        let outcome = conn.receive_msg(&mut replica, &msg).await.unwrap();

        assert_eq!(outcome.applied, 1000);
        assert_eq!(replica, source);
    }
}
