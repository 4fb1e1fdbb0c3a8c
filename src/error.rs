//! Error taxonomy for the sync engine.
//!
//! The split mirrors how failures propagate: protocol errors reject a single
//! message, merge anomalies and limit violations fail the in-flight update
//! (document unchanged), access/not-found/persistence errors are terminal
//! for the operation that hit them. A failure on one session never corrupts
//! or blocks other sessions on the same document — everything unwinds to
//! "mutex released, document unchanged".

use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Failures surfaced by the sync, registry, and session layers.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed or misrouted message. Rejects the message, keeps the session.
    Protocol(ProtocolError),
    /// Message addressed to a document this session is not bound to.
    DocumentMismatch { bound: Uuid, got: Uuid },
    /// After applying a peer's changes the local vector is still behind its
    /// advertised vector: evidence of silently dropped data. The document
    /// was rolled back; the peer must resync.
    MergeAnomaly { doc_id: Uuid, behind_actor: Uuid },
    /// The update would push the document past the owner's node limit.
    LimitExceeded { limit: u32, nodes: usize },
    /// Write attempted without write rights, or read refused at handshake.
    AccessDenied { doc_id: Uuid, user_id: Uuid },
    /// The bound document was deleted out-of-band.
    NotFound(Uuid),
    /// Replaying the durable log produced a change count that disagrees
    /// with the document: a corrupted or partially written log.
    CorruptLog {
        doc_id: Uuid,
        replayed: u64,
        counted: u64,
    },
    /// Durable-store call failed; in-memory state was not advanced.
    Storage(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Protocol(e) => write!(f, "protocol error: {e}"),
            SyncError::DocumentMismatch { bound, got } => {
                write!(f, "message for document {got} on a session bound to {bound}")
            }
            SyncError::MergeAnomaly {
                doc_id,
                behind_actor,
            } => write!(
                f,
                "merge anomaly on {doc_id}: still behind peer for actor {behind_actor}, resync required"
            ),
            SyncError::LimitExceeded { limit, nodes } => {
                write!(f, "node limit exceeded: {nodes} nodes > limit {limit}")
            }
            SyncError::AccessDenied { doc_id, user_id } => {
                write!(f, "access denied for user {user_id} on document {doc_id}")
            }
            SyncError::NotFound(id) => write!(f, "document not found: {id}"),
            SyncError::CorruptLog {
                doc_id,
                replayed,
                counted,
            } => write!(
                f,
                "corrupt change log for {doc_id}: replayed {replayed} entries, document counts {counted}"
            ),
            SyncError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e)
    }
}

impl SyncError {
    /// Whether the failure only rejects the offending message, leaving the
    /// session healthy. A write-denied session keeps its read path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_)
                | SyncError::DocumentMismatch { .. }
                | SyncError::LimitExceeded { .. }
                | SyncError::AccessDenied { .. }
        )
    }
}
