//! Per-connection document sessions.
//!
//! A [`DocumentSession`] turns one authenticated transport connection into
//! a live, synchronized view of exactly one document, sharing in-memory
//! state with every other session on that document through the registry.
//! The session owns the connection's [`PeerSyncConnection`] and nothing
//! else: the document belongs to the registry entry.
//!
//! The update path (`on_update`) runs entirely under the document's mutex
//! and follows a strict order:
//!
//! 1. reject misrouted messages (protocol error, session survives),
//! 2. snapshot the old document,
//! 3. re-query the owner's node limit (limits change out-of-band, so they
//!    are never cached at session start),
//! 4. merge into a working copy via the sync connection,
//! 5. reject over-limit results — the shared document is untouched,
//! 6. reject writes from read-only sessions,
//! 7. append the new changes to the durable log,
//! 8. only then commit the working copy into the registry entry.
//!
//! Step 7-before-8 is what keeps in-memory state from ever advancing past
//! what was durably appended. Broadcast is implicit: the commit bumps the
//! entry's revision and every other session computes its own outgoing diff.

use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::{AccessClaims, LimitProvider};
use crate::error::SyncError;
use crate::protocol::SyncMessage;
use crate::registry::{DocEntry, DocumentRegistry};
use crate::sync::PeerSyncConnection;

/// Result of one accepted update.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// Changes newly applied to the shared document.
    pub applied: usize,
    /// Changes appended to the durable log.
    pub appended: usize,
    /// Reply owed to the originating peer, if any.
    pub reply: Option<SyncMessage>,
}

/// One client's live session on one document.
pub struct DocumentSession {
    claims: AccessClaims,
    registry: Arc<DocumentRegistry>,
    limits: Arc<dyn LimitProvider>,
    entry: Arc<DocEntry>,
    conn: PeerSyncConnection,
    closed: bool,
}

impl DocumentSession {
    /// Create a session for an authenticated connection. Refused outright
    /// when the claims carry no read access.
    pub async fn open(
        registry: Arc<DocumentRegistry>,
        limits: Arc<dyn LimitProvider>,
        claims: AccessClaims,
    ) -> Result<Self, SyncError> {
        if !claims.readable {
            return Err(SyncError::AccessDenied {
                doc_id: claims.doc_id,
                user_id: claims.user_id,
            });
        }

        let entry = registry.attach(claims.doc_id).await;
        if claims.owner {
            entry.set_owner_if_unset(claims.user_id);
        }
        log::info!(
            "session opened: user {} on document {} ({} attached)",
            claims.user_id,
            claims.doc_id,
            entry.session_count()
        );

        Ok(Self {
            claims,
            registry,
            limits,
            entry,
            conn: PeerSyncConnection::default(),
            closed: false,
        })
    }

    pub fn doc_id(&self) -> uuid::Uuid {
        self.claims.doc_id
    }

    pub fn claims(&self) -> &AccessClaims {
        &self.claims
    }

    /// Subscribe to shared-document mutations (for the transport loop's
    /// select). A fired notification means [`Self::flush_remote_changes`]
    /// may have something to send.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.entry.subscribe()
    }

    /// Initial advertisement: wait for the document to finish loading,
    /// then let the sync connection evaluate what to tell the peer.
    pub async fn announce(&mut self) -> Result<Vec<SyncMessage>, SyncError> {
        let guard = self.entry.lock_ready().await?;
        let messages = self.conn.open([(self.claims.doc_id, &guard.doc)]);
        Ok(messages)
    }

    /// Process one incoming message from this session's peer.
    ///
    /// Serialized against every other mutating operation on the document
    /// by the entry's mutex. A failure leaves the shared document exactly
    /// as it was — "mutex released, document unchanged".
    pub async fn on_update(&mut self, msg: &SyncMessage) -> Result<UpdateOutcome, SyncError> {
        let result = self.on_update_inner(msg).await;
        if let Err(e) = &result {
            self.registry.metrics().record_error();
            log::warn!(
                "update failed for user {} on {}: {e}",
                self.claims.user_id,
                self.claims.doc_id
            );
        }
        result
    }

    async fn on_update_inner(&mut self, msg: &SyncMessage) -> Result<UpdateOutcome, SyncError> {
        if msg.doc_id != self.claims.doc_id {
            return Err(SyncError::DocumentMismatch {
                bound: self.claims.doc_id,
                got: msg.doc_id,
            });
        }

        let mut state = self.entry.lock_ready().await?;
        let old_vector = state.doc.current_vector();
        let old_title_set = state.doc.title().map(str::to_owned);

        // Re-fetched per update, never cached: the owner's plan can change
        // while the session is alive.
        let owner = self.entry.owner().unwrap_or(self.claims.user_id);
        let limit = self.limits.node_limit(owner);

        // Merge into a working copy; the shared document is replaced only
        // after the durable append succeeds.
        let mut working = state.doc.clone();
        let outcome = self.conn.receive_msg(&mut working, msg).await?;

        if let Some(limit) = limit {
            let nodes = working.node_count();
            if nodes > limit as usize {
                return Err(SyncError::LimitExceeded { limit, nodes });
            }
        }

        let new_changes = working.changes_since(&old_vector);
        if !new_changes.is_empty() {
            if !self.claims.writeable {
                return Err(SyncError::AccessDenied {
                    doc_id: self.claims.doc_id,
                    user_id: self.claims.user_id,
                });
            }

            self.registry
                .store()
                .append_changes(self.claims.doc_id, &new_changes)?;

            // Durably appended: commit into the registry entry.
            let title_changed = working.title().map(str::to_owned) != old_title_set;
            self.entry.metrics().set_content_gauges(
                working.node_count() as u64,
                working.edge_count() as u64,
            );
            self.registry
                .metrics()
                .record_changes_received(new_changes.len() as u64);
            state.doc = working;

            if title_changed {
                // Title changes are rare and high-value: flush the snapshot
                // now instead of waiting out the debounce window.
                self.entry.cancel_pending_save();
                self.registry.save_snapshot_locked(&self.entry, &state);
            } else {
                self.registry.schedule_snapshot_save(&self.entry);
            }

            drop(state);
            self.entry.bump_revision();
        } else {
            drop(state);
        }

        Ok(UpdateOutcome {
            applied: outcome.applied,
            appended: new_changes.len(),
            reply: outcome.reply,
        })
    }

    /// Recompute this peer's outgoing diff after another session mutated
    /// the shared document. Returns the delta or probe to send, if any.
    pub async fn flush_remote_changes(&mut self) -> Result<Option<SyncMessage>, SyncError> {
        let guard = self.entry.lock_ready().await?;
        Ok(self.conn.maybe_send_changes(self.claims.doc_id, &guard.doc))
    }

    /// Build a resync request for the peer, advertising our current vector.
    /// Sent after a detected merge anomaly so the peer resends its full
    /// outstanding diff.
    pub async fn request_resync(&mut self) -> Result<SyncMessage, SyncError> {
        let guard = self.entry.lock_ready().await?;
        Ok(SyncMessage::resync_request(
            self.claims.doc_id,
            guard.doc.current_vector(),
        ))
    }

    /// Detach from the registry. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.conn.close();
        self.registry.detach(&self.entry);
        log::info!(
            "session closed: user {} on document {}",
            self.claims.user_id,
            self.claims.doc_id
        );
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}
