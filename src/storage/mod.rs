//! Durable persistence for collaborative documents.
//!
//! The engine needs exactly three operations from the store — an ordered
//! per-document change log (`append_changes` / `load_change_log`) and a
//! read-optimized snapshot projection (`save_snapshot`) — each atomic at
//! single-document granularity. No cross-document transactions.
//!
//! ```text
//! ┌──────────────┐   append_changes   ┌───────────────┐
//! │ Session layer│ ─────────────────► │ ChangeStore   │
//! │ (in-memory)  │   save_snapshot    │ (RocksDB)     │
//! └──────┬───────┘                    └──────┬────────┘
//!        │ cold load                         │ column families
//!        ▼                                   ▼
//! ┌──────────────┐    ┌────────────────────────────────────┐
//! │ Replicated   │    │ CF "changes"   — ordered change log │
//! │ document     │    │ CF "snapshots" — LZ4 projections    │
//! │ (replayed)   │    │ CF "metadata"  — counts, timestamps │
//! └──────────────┘    └────────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (log-structured storage)

pub mod rocks;

pub use rocks::{ChangeStore, DocumentMetadata, StoreConfig, StoreError};
