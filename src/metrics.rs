//! Advisory observability: counters, per-document gauges, and duration
//! histograms.
//!
//! Everything here is atomics behind `Arc`s — lock-free on the hot path,
//! read via `snapshot()`. Metrics never affect correctness: recording is
//! infallible and a released handle simply stops being scraped. Document
//! handles outlive their registry entry by a linger delay so scrape-based
//! collectors can read final values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use uuid::Uuid;

/// Histogram bucket upper bounds, in microseconds.
const BUCKET_BOUNDS_MICROS: [u64; 8] = [
    100,       // 100μs
    1_000,     // 1ms
    5_000,     // 5ms
    25_000,    // 25ms
    100_000,   // 100ms
    500_000,   // 500ms
    2_000_000, // 2s
    u64::MAX,
];

/// Fixed-bucket duration histogram.
#[derive(Debug, Default)]
pub struct DurationHistogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let idx = BUCKET_BOUNDS_MICROS
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(BUCKET_BOUNDS_MICROS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            sum_micros: self.sum_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, Default)]
pub struct HistogramSnapshot {
    pub buckets: [u64; 8],
    pub count: u64,
    pub sum_micros: u64,
}

impl HistogramSnapshot {
    pub fn mean_micros(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_micros as f64 / self.count as f64
    }
}

/// Per-document gauges and histograms.
#[derive(Debug, Default)]
pub struct DocMetrics {
    /// Live node count
    nodes: AtomicU64,
    /// Live edge count
    edges: AtomicU64,
    /// Currently attached sessions
    sessions: AtomicU64,
    pub load_duration: DurationHistogram,
    pub save_duration: DurationHistogram,
}

impl DocMetrics {
    pub fn set_content_gauges(&self, nodes: u64, edges: u64) {
        self.nodes.store(nodes, Ordering::Relaxed);
        self.edges.store(edges, Ordering::Relaxed);
    }

    pub fn session_attached(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_detached(&self) {
        // Saturating: a detach without a matching attach is a bug upstream,
        // not a reason to wrap the gauge.
        let _ = self
            .sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn snapshot(&self) -> DocMetricsSnapshot {
        DocMetricsSnapshot {
            nodes: self.nodes.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            load_duration: self.load_duration.snapshot(),
            save_duration: self.save_duration.snapshot(),
        }
    }
}

/// Point-in-time view of one document's gauges.
#[derive(Debug, Clone, Default)]
pub struct DocMetricsSnapshot {
    pub nodes: u64,
    pub edges: u64,
    pub sessions: u64,
    pub load_duration: HistogramSnapshot,
    pub save_duration: HistogramSnapshot,
}

/// Process-wide sync metrics.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Changes applied from remote peers
    changes_received: AtomicU64,
    /// Failed operations (any taxonomy class)
    errors: AtomicU64,
    /// Per-document handles, kept past eviction for a linger window
    docs: RwLock<HashMap<Uuid, Arc<DocMetrics>>>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_changes_received(&self, n: u64) {
        self.changes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get or create the handle for a document.
    pub fn doc(&self, doc_id: Uuid) -> Arc<DocMetrics> {
        if let Some(m) = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&doc_id)
        {
            return m.clone();
        }
        self.docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(doc_id)
            .or_default()
            .clone()
    }

    /// Drop the handle for an evicted document. Callers delay this past
    /// eviction so final gauge values stay scrapeable.
    pub fn release_doc(&self, doc_id: Uuid) {
        self.docs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&doc_id);
    }

    /// Whether a document handle is currently registered.
    pub fn has_doc(&self, doc_id: Uuid) -> bool {
        self.docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&doc_id)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let docs = self
            .docs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(&id, m)| (id, m.snapshot()))
            .collect();
        MetricsSnapshot {
            changes_received: self.changes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            docs,
        }
    }
}

/// Point-in-time view of all sync metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub changes_received: u64,
    pub errors: u64,
    pub docs: HashMap<Uuid, DocMetricsSnapshot>,
}
