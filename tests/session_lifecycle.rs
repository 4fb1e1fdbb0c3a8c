//! Session and registry lifecycle integration tests.
//!
//! Verifies:
//! - Two sessions on one document: a change from one reaches the other and
//!   lands exactly once in the durable log
//! - Concurrent updates on one document serialize under the mutex with no
//!   lost updates
//! - Grace-delay teardown, reconnect reuse, and fresh load after eviction
//! - Debounced snapshot saves, with immediate flush on title changes
//! - Out-of-band deletion fails every live session gracefully

use atlas_collab::auth::{AccessClaims, Unlimited};
use atlas_collab::document::{ChangeOp, ReplicatedDocument};
use atlas_collab::metrics::SyncMetrics;
use atlas_collab::protocol::SyncMessage;
use atlas_collab::registry::{decode_document, DocumentRegistry, RegistryConfig};
use atlas_collab::session::DocumentSession;
use atlas_collab::storage::{ChangeStore, StoreConfig};
use atlas_collab::error::SyncError;
use atlas_collab::version::VersionVector;

use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::time::Duration;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn test_registry() -> (Arc<DocumentRegistry>, TempDir) {
    let dir = tempdir().unwrap();
    let store = Arc::new(ChangeStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let registry = Arc::new(DocumentRegistry::new(
        store,
        Arc::new(SyncMetrics::new()),
        RegistryConfig::for_testing(),
    ));
    (registry, dir)
}

async fn open_session(registry: &Arc<DocumentRegistry>, doc_id: Uuid) -> DocumentSession {
    DocumentSession::open(
        registry.clone(),
        Arc::new(Unlimited),
        AccessClaims::owner_of(doc_id, Uuid::new_v4()),
    )
    .await
    .unwrap()
}

/// Build a delta message as a remote peer would: apply ops on a scratch
/// replica and advertise its resulting vector.
fn peer_delta(actor: Uuid, doc_id: Uuid, ops: Vec<ChangeOp>) -> SyncMessage {
    let mut doc = ReplicatedDocument::init();
    let changes: Vec<_> = ops.into_iter().map(|op| doc.apply_local(actor, op)).collect();
    SyncMessage::delta(doc_id, doc.current_vector(), changes)
}

fn put_node(i: u8) -> ChangeOp {
    ChangeOp::PutNode {
        id: Uuid::from_bytes([i; 16]),
        label: format!("n{i}"),
        parent: None,
        x: f64::from(i),
        y: 0.0,
    }
}

// ─── Two sessions, one document ──────────────────────────────────────────────

#[tokio::test]
async fn test_change_from_one_session_reaches_peer_and_log_once() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut a = open_session(&registry, doc_id).await;
    let mut b = open_session(&registry, doc_id).await;

    // Empty log ⇒ both sessions see an empty document
    assert!(a.announce().await.is_ok());
    // B's peer announces with an empty vector
    let b_hello = SyncMessage::probe(doc_id, VersionVector::new());
    b.on_update(&b_hello).await.unwrap();

    // A's peer sets the title
    let delta = peer_delta(actor, doc_id, vec![ChangeOp::SetTitle("x".into())]);
    let outcome = a.on_update(&delta).await.unwrap();
    assert_eq!(outcome.applied, 1);

    // B's next flush carries exactly that change to its peer
    let msg = b.flush_remote_changes().await.unwrap().expect("delta for B");
    let changes = msg.changes.expect("changes present");
    assert_eq!(changes.len(), 1);

    // Applying it on B's peer replica yields the same document value
    let mut b_replica = ReplicatedDocument::init();
    b_replica.apply_changes(&changes);
    assert_eq!(b_replica.title(), Some("x"));

    // Durable log for the document contains exactly that one change
    let log = registry.store().load_change_log(doc_id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], changes[0]);
}

#[tokio::test]
async fn test_concurrent_updates_serialize_without_lost_updates() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();

    const SESSIONS: usize = 8;
    const CHANGES_EACH: u8 = 5;

    let mut handles = Vec::new();
    for s in 0..SESSIONS {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let mut session = DocumentSession::open(
                registry,
                Arc::new(Unlimited),
                AccessClaims::owner_of(doc_id, Uuid::new_v4()),
            )
            .await
            .unwrap();

            // Each task's peer contributes disjoint nodes from its own actor
            let actor = Uuid::from_u64_pair(1, s as u64);
            let ops: Vec<_> = (0..CHANGES_EACH)
                .map(|i| ChangeOp::PutNode {
                    id: Uuid::from_u64_pair(s as u64 + 1, u64::from(i)),
                    label: format!("s{s}_n{i}"),
                    parent: None,
                    x: 0.0,
                    y: 0.0,
                })
                .collect();
            let msg = peer_delta(actor, doc_id, ops);
            session.on_update(&msg).await.unwrap();
            session.close();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let expected = SESSIONS as u64 * u64::from(CHANGES_EACH);

    // The union of all disjoint changes, with the log count matching the
    // sum of every individually applied delta — no lost updates.
    assert_eq!(registry.store().change_count(doc_id).unwrap(), expected);
    let mut replayed = ReplicatedDocument::init();
    replayed.apply_changes(&registry.store().load_change_log(doc_id).unwrap());
    assert_eq!(replayed.change_count(), expected);
    assert_eq!(replayed.node_count(), expected as usize);
}

// ─── Lifecycle: grace delay, reuse, eviction ─────────────────────────────────

#[tokio::test]
async fn test_reconnect_within_grace_sees_shared_state() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut session = open_session(&registry, doc_id).await;
    let msg = peer_delta(actor, doc_id, vec![put_node(1)]);
    session.on_update(&msg).await.unwrap();
    session.close();

    // Reconnect inside the grace window: same live entry, no fresh load
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut again = open_session(&registry, doc_id).await;
    assert_eq!(registry.entry_count().await, 1);

    // The shared in-memory document is immediately visible
    let out = again
        .on_update(&SyncMessage::probe(doc_id, VersionVector::new()))
        .await
        .unwrap();
    let reply = out.reply.expect("reply to empty probe");
    assert_eq!(reply.changes.expect("full diff").len(), 1);

    again.close();
    // After the grace delay with zero sessions the entry is evicted
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.entry_count().await, 0);

    // A later attach loads fresh from the durable log
    let mut fresh = open_session(&registry, doc_id).await;
    let out = fresh
        .on_update(&SyncMessage::probe(doc_id, VersionVector::new()))
        .await
        .unwrap();
    assert_eq!(out.reply.unwrap().changes.unwrap().len(), 1);
}

// ─── Snapshot saves ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_save_is_debounced() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut session = open_session(&registry, doc_id).await;

    // Node-only updates: persisted to the log at once, snapshot deferred
    let msg = peer_delta(actor, doc_id, vec![put_node(1), put_node(2)]);
    session.on_update(&msg).await.unwrap();

    assert_eq!(registry.store().change_count(doc_id).unwrap(), 2);
    assert!(registry.store().load_snapshot(doc_id).is_err());

    // After a quiet debounce window the snapshot lands, and decodes back
    // to the committed document
    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = registry.store().load_snapshot(doc_id).unwrap();
    let doc = decode_document(&snapshot).unwrap();
    assert_eq!(doc.node_count(), 2);
}

#[tokio::test]
async fn test_title_change_flushes_snapshot_immediately() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut session = open_session(&registry, doc_id).await;
    let msg = peer_delta(actor, doc_id, vec![ChangeOp::SetTitle("atlas".into())]);
    session.on_update(&msg).await.unwrap();

    // No debounce wait: the snapshot is already durable
    let snapshot = registry.store().load_snapshot(doc_id).unwrap();
    let doc = decode_document(&snapshot).unwrap();
    assert_eq!(doc.title(), Some("atlas"));
}

#[tokio::test]
async fn test_update_burst_coalesces_to_one_save() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut session = open_session(&registry, doc_id).await;

    // A burst of node updates inside the debounce window; each message
    // carries the peer's cumulative history so far
    for n in 1..=6u8 {
        let ops: Vec<_> = (1..=n).map(put_node).collect();
        session
            .on_update(&peer_delta(actor, doc_id, ops))
            .await
            .unwrap();
    }
    assert!(registry.store().load_snapshot(doc_id).is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let doc = decode_document(&registry.store().load_snapshot(doc_id).unwrap()).unwrap();
    assert_eq!(doc.node_count(), 6);
}

// ─── Out-of-band deletion ────────────────────────────────────────────────────

#[tokio::test]
async fn test_deletion_fails_all_live_sessions_gracefully() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut a = open_session(&registry, doc_id).await;
    let mut b = open_session(&registry, doc_id).await;
    a.on_update(&peer_delta(actor, doc_id, vec![put_node(1)]))
        .await
        .unwrap();

    // The REST deletion path removes the document out-of-band
    registry.delete_document(doc_id).await.unwrap();

    // Both sessions fail their next operation; neither resurrects the doc
    let probe = SyncMessage::probe(doc_id, VersionVector::new());
    for session in [&mut a, &mut b] {
        let err = session.on_update(&probe).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(id) if id == doc_id));
    }
    assert!(!registry.store().document_exists(doc_id).unwrap());
    assert_eq!(registry.entry_count().await, 0);
}

// ─── Observability ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_metrics_track_sessions_and_content() {
    let (registry, _dir) = test_registry();
    let doc_id = Uuid::new_v4();
    let actor = Uuid::new_v4();

    let mut a = open_session(&registry, doc_id).await;
    let _b = open_session(&registry, doc_id).await;

    a.on_update(&peer_delta(actor, doc_id, vec![put_node(1), put_node(2)]))
        .await
        .unwrap();

    let snap = registry.metrics().snapshot();
    assert_eq!(snap.changes_received, 2);
    let doc_snap = snap.docs.get(&doc_id).expect("doc metrics registered");
    assert_eq!(doc_snap.sessions, 2);
    assert_eq!(doc_snap.nodes, 2);
    assert_eq!(doc_snap.edges, 0);
    assert_eq!(doc_snap.load_duration.count, 1);
}
