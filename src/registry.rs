//! Process-wide document registry.
//!
//! One [`DocEntry`] per live document holds the shared in-memory replica,
//! the per-document mutex that serializes every mutating operation, the
//! attached-session count, and two cancellable scheduled tasks (debounced
//! snapshot save, delayed cleanup). Sessions receive a cheap `Arc` into the
//! entry; the registry owns the entries and is injected — never ambient
//! global state — so tests get a fresh registry each.
//!
//! Locking: the unit of mutual exclusion is one document. Independent
//! documents proceed fully concurrently; the registry's own map lock is
//! held only for lookup/insert/remove, never across document I/O.
//!
//! Lifecycle of an entry:
//! ```text
//! attach (first) ──► Loading ──► Ready ◄──── attach/detach (n times)
//!                       │          │
//!                       ▼          ▼ last detach + grace delay
//!                    Failed     evicted (persist check, metrics linger)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::ReplicatedDocument;
use crate::error::SyncError;
use crate::metrics::{DocMetrics, SyncMetrics};
use crate::storage::{ChangeStore, StoreError};

/// Registry timing and chunking knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Debounce window for snapshot saves; a burst of updates inside the
    /// window produces one save.
    pub save_debounce: Duration,
    /// Grace delay after the last detach before the entry is torn down.
    pub cleanup_grace: Duration,
    /// How long evicted documents' metrics stay scrapeable.
    pub metrics_linger: Duration,
    /// Changes replayed per scheduler turn during a cold load.
    pub load_chunk: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_secs(2),
            cleanup_grace: Duration::from_secs(20),
            metrics_linger: Duration::from_secs(30),
            load_chunk: 512,
        }
    }
}

impl RegistryConfig {
    /// Config for testing (tight windows, small chunks).
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(40),
            cleanup_grace: Duration::from_millis(80),
            metrics_linger: Duration::from_millis(40),
            load_chunk: 64,
        }
    }
}

/// A cancellable one-shot scheduled task.
///
/// `schedule` replaces any pending task (reschedule semantics), so a burst
/// of triggers inside the delay window collapses to one execution, and
/// "timer fires" can never race "already cancelled": the fired task body is
/// responsible for re-validating its preconditions.
#[derive(Debug, Default)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, cancelling any previously scheduled run.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Cancel the pending run, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether a run is still pending or executing.
    pub fn is_scheduled(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Load state of a registry entry.
#[derive(Debug, Clone)]
pub enum LoadPhase {
    /// Change log replay in progress.
    Loading,
    /// Document usable.
    Ready,
    /// Cold load failed; every session operation surfaces the error.
    Failed(SyncError),
    /// Deleted out-of-band; operations fail with not-found.
    Deleted,
}

/// The mutex-protected part of an entry.
#[derive(Debug)]
pub struct DocState {
    pub phase: LoadPhase,
    pub doc: ReplicatedDocument,
}

/// Shared state for one live document.
pub struct DocEntry {
    doc_id: Uuid,
    /// The per-document mutex: load, merge-update, snapshot save, and
    /// cleanup all run to completion under it.
    state: Mutex<DocState>,
    /// Attached sessions; updated atomically with attach/detach.
    sessions: AtomicUsize,
    /// Bumped on every committed mutation and phase transition; sessions
    /// subscribe to learn when to recompute their outgoing diff.
    revision: watch::Sender<u64>,
    save_task: StdMutex<DelayedTask>,
    cleanup_task: StdMutex<DelayedTask>,
    /// Owning user, for limit resolution. Set by the first owner session.
    owner: StdMutex<Option<Uuid>>,
    metrics: Arc<DocMetrics>,
}

impl DocEntry {
    fn new(doc_id: Uuid, metrics: Arc<DocMetrics>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            doc_id,
            state: Mutex::new(DocState {
                phase: LoadPhase::Loading,
                doc: ReplicatedDocument::init(),
            }),
            sessions: AtomicUsize::new(0),
            revision,
            save_task: StdMutex::new(DelayedTask::idle()),
            cleanup_task: StdMutex::new(DelayedTask::idle()),
            owner: StdMutex::new(None),
            metrics,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Acquire the document mutex regardless of phase.
    pub async fn lock_state(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().await
    }

    /// Acquire the document mutex once the entry has left `Loading`,
    /// surfacing load failures and out-of-band deletion.
    pub async fn lock_ready(&self) -> Result<MutexGuard<'_, DocState>, SyncError> {
        loop {
            let mut rx = self.revision.subscribe();
            let guard = self.state.lock().await;
            match &guard.phase {
                LoadPhase::Ready => return Ok(guard),
                LoadPhase::Failed(e) => return Err(e.clone()),
                LoadPhase::Deleted => return Err(SyncError::NotFound(self.doc_id)),
                LoadPhase::Loading => {
                    drop(guard);
                    if rx.changed().await.is_err() {
                        return Err(SyncError::NotFound(self.doc_id));
                    }
                }
            }
        }
    }

    /// Number of currently attached sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Subscribe to mutation/phase notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Notify subscribers that the document or its phase changed.
    pub fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub fn owner(&self) -> Option<Uuid> {
        *self.owner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_owner_if_unset(&self, user_id: Uuid) {
        let mut owner = self
            .owner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if owner.is_none() {
            *owner = Some(user_id);
        }
    }

    pub fn metrics(&self) -> &Arc<DocMetrics> {
        &self.metrics
    }

    /// Cancel a pending debounced save (used when flushing immediately).
    pub fn cancel_pending_save(&self) {
        self.save_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cancel();
    }

    fn with_save_task(&self, f: impl FnOnce(&mut DelayedTask)) {
        f(&mut self
            .save_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner));
    }

    fn with_cleanup_task(&self, f: impl FnOnce(&mut DelayedTask)) {
        f(&mut self
            .cleanup_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner));
    }
}

/// Process-wide table of live documents.
pub struct DocumentRegistry {
    entries: RwLock<HashMap<Uuid, Arc<DocEntry>>>,
    store: Arc<ChangeStore>,
    metrics: Arc<SyncMetrics>,
    config: RegistryConfig,
}

impl DocumentRegistry {
    pub fn new(store: Arc<ChangeStore>, metrics: Arc<SyncMetrics>, config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Attach a session to a document: look up or create the entry,
    /// cancel any pending cleanup, and bump the session count. A newly
    /// created entry starts its chunked load in the background — attachment
    /// never blocks on the load.
    pub async fn attach(self: &Arc<Self>, doc_id: Uuid) -> Arc<DocEntry> {
        let mut entries = self.entries.write().await;
        let (entry, created) = match entries.get(&doc_id) {
            Some(entry) => (entry.clone(), false),
            None => {
                let entry = Arc::new(DocEntry::new(doc_id, self.metrics.doc(doc_id)));
                entries.insert(doc_id, entry.clone());
                (entry, true)
            }
        };
        entry.with_cleanup_task(|t| t.cancel());
        entry.sessions.fetch_add(1, Ordering::SeqCst);
        entry.metrics.session_attached();
        drop(entries);

        if created {
            let registry = self.clone();
            let load_entry = entry.clone();
            tokio::spawn(async move {
                registry.load(load_entry).await;
            });
        }

        entry
    }

    /// Detach a session. When the last session leaves, cleanup is scheduled
    /// after the grace delay — a reconnect inside the window cancels it and
    /// reuses the in-memory document.
    pub fn detach(self: &Arc<Self>, entry: &Arc<DocEntry>) {
        entry.metrics.session_detached();
        let previous = entry.sessions.fetch_sub(1, Ordering::SeqCst);
        if previous != 1 {
            return;
        }

        let registry = self.clone();
        let cleanup_entry = entry.clone();
        let grace = self.config.cleanup_grace;
        entry.with_cleanup_task(move |t| {
            t.schedule(grace, async move {
                registry.cleanup(cleanup_entry).await;
            });
        });
    }

    /// Look up a live entry without attaching.
    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<DocEntry>> {
        self.entries.read().await.get(&doc_id).cloned()
    }

    /// Number of live entries.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Cold load: replay the durable change log onto an empty document in
    /// fixed-size chunks, yielding between chunks, verifying after each
    /// chunk that replay progress matches the document's own count — a
    /// mismatch means a corrupted or partially written log.
    ///
    /// Runs once per cold entry, under the document's mutex.
    async fn load(&self, entry: Arc<DocEntry>) {
        let doc_id = entry.doc_id();
        let started = Instant::now();
        let mut guard = entry.lock_state().await;

        let log = match self.store.load_change_log(doc_id) {
            Ok(log) => log,
            Err(e) => {
                log::error!("failed to read change log for {doc_id}: {e}");
                guard.phase = LoadPhase::Failed(SyncError::Storage(e));
                drop(guard);
                entry.bump_revision();
                return;
            }
        };

        let mut doc = ReplicatedDocument::init();
        let mut replayed: u64 = 0;
        for chunk in log.chunks(self.config.load_chunk.max(1)) {
            doc.apply_changes(chunk);
            replayed += chunk.len() as u64;
            // Every log entry must land: a duplicate or a sequence gap in
            // the log means it was corrupted or partially written.
            let counted = doc.change_count();
            if replayed != counted {
                log::error!(
                    "corrupt change log for {doc_id}: replayed {replayed}, document counts {counted}"
                );
                guard.phase = LoadPhase::Failed(SyncError::CorruptLog {
                    doc_id,
                    replayed,
                    counted,
                });
                drop(guard);
                entry.bump_revision();
                return;
            }
            tokio::task::yield_now().await;
        }

        entry.metrics.load_duration.record(started.elapsed());
        entry
            .metrics
            .set_content_gauges(doc.node_count() as u64, doc.edge_count() as u64);
        log::debug!(
            "loaded document {doc_id}: {} changes in {:?}",
            doc.change_count(),
            started.elapsed()
        );

        guard.doc = doc;
        guard.phase = LoadPhase::Ready;
        drop(guard);
        entry.bump_revision();
    }

    /// Debounce a snapshot save for `entry`. Each call pushes the deadline
    /// out; a quiet `save_debounce` window triggers one save.
    pub fn schedule_snapshot_save(self: &Arc<Self>, entry: &Arc<DocEntry>) {
        let registry = self.clone();
        let save_entry = entry.clone();
        let debounce = self.config.save_debounce;
        entry.with_save_task(move |t| {
            t.schedule(debounce, async move {
                let guard = save_entry.lock_state().await;
                registry.save_snapshot_locked(&save_entry, &guard);
            });
        });
    }

    /// Persist a snapshot of the entry's current document. The caller holds
    /// the document mutex; failures are logged and the in-memory state is
    /// left as-is (the change log remains the source of truth).
    pub fn save_snapshot_locked(&self, entry: &DocEntry, state: &DocState) {
        if !matches!(state.phase, LoadPhase::Ready) {
            return;
        }
        let started = Instant::now();
        match encode_document(&state.doc) {
            Ok(bytes) => match self.store.save_snapshot(entry.doc_id(), &bytes) {
                Ok(_) => {
                    entry.metrics.save_duration.record(started.elapsed());
                    log::debug!("saved snapshot for {} in {:?}", entry.doc_id(), started.elapsed());
                }
                Err(e) => {
                    self.metrics.record_error();
                    log::error!("snapshot save failed for {}: {e}", entry.doc_id());
                }
            },
            Err(e) => {
                self.metrics.record_error();
                log::error!("snapshot encode failed for {}: {e}", entry.doc_id());
            }
        }
    }

    /// Tear down an idle entry after the grace delay. Re-validates that no
    /// session reattached, compares durable vs in-memory change counts, and
    /// releases the metrics handle after the linger window.
    async fn cleanup(self: Arc<Self>, entry: Arc<DocEntry>) {
        let doc_id = entry.doc_id();

        // Claim the entry under the map lock so a concurrent attach either
        // finds it first (and we bail) or misses it and loads fresh. The
        // identity check keeps a stale timer from evicting a successor
        // entry registered under the same id.
        {
            let mut entries = self.entries.write().await;
            if entry.session_count() > 0 {
                return;
            }
            match entries.get(&doc_id) {
                Some(current) if Arc::ptr_eq(current, &entry) => {
                    entries.remove(&doc_id);
                }
                _ => return,
            }
        }

        entry.cancel_pending_save();
        let guard = entry.lock_state().await;
        if let LoadPhase::Ready = guard.phase {
            let in_memory = guard.doc.change_count();
            match self.store.change_count(doc_id) {
                Ok(durable) if in_memory > durable => {
                    // Local ahead of the log: persist before evicting.
                    self.save_snapshot_locked(&entry, &guard);
                }
                Ok(durable) if durable > in_memory => {
                    log::warn!(
                        "store ahead of memory for {doc_id} ({durable} > {in_memory}), skipping eviction write"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    self.metrics.record_error();
                    log::error!("change count check failed for {doc_id} during cleanup: {e}");
                }
            }
        }
        drop(guard);
        log::debug!("evicted document {doc_id}");

        // Keep final gauge values scrapeable for one more linger window.
        let metrics = self.metrics.clone();
        let linger = self.config.metrics_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            metrics.release_doc(doc_id);
        });
    }

    /// Out-of-band deletion (e.g. the REST deletion path). Live sessions on
    /// the document fail their next operation with not-found instead of
    /// resurrecting it.
    pub async fn delete_document(&self, doc_id: Uuid) -> Result<(), SyncError> {
        let removed = self.entries.write().await.remove(&doc_id);
        if let Some(entry) = removed {
            entry.cancel_pending_save();
            entry.with_cleanup_task(|t| t.cancel());
            let mut guard = entry.lock_state().await;
            guard.phase = LoadPhase::Deleted;
            drop(guard);
            entry.bump_revision();
        }
        self.store.delete_document(doc_id)?;
        Ok(())
    }
}

fn encode_document(doc: &ReplicatedDocument) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(doc, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a snapshot produced by [`DocumentRegistry::save_snapshot_locked`].
pub fn decode_document(bytes: &[u8]) -> Result<ReplicatedDocument, StoreError> {
    let (doc, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(doc)
}
