//! # atlas-collab — Real-time document synchronization for Atlas
//!
//! Many concurrent connections read and mutate one logical shared canvas
//! document; every connection's replica converges through a change-based
//! CRDT, and the result is durably persisted without blocking the rest of
//! the process.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket    ┌─────────────────┐
//! │ Client       │ ◄────────────► │ DocumentSession │ (one per connection)
//! └──────────────┘  SyncMessage   └────────┬────────┘
//!                                          │ attach/detach
//!                                          ▼
//!                                 ┌─────────────────┐
//!                                 │ DocumentRegistry │ doc_id → DocEntry
//!                                 │  shared document │ mutex, refcount,
//!                                 │  + scheduled     │ debounced save,
//!                                 │    tasks         │ grace-delay cleanup
//!                                 └────────┬────────┘
//!                                          │ change log + snapshots
//!                                          ▼
//!                                 ┌─────────────────┐
//!                                 │ ChangeStore      │ RocksDB, LZ4
//!                                 └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`version`] — version vectors with partial dominance order
//! - [`document`] — the convergent replicated canvas document
//! - [`protocol`] — binary wire protocol (bincode-encoded [`SyncMessage`])
//! - [`sync`] — per-peer synchronization state machine
//! - [`registry`] — shared in-memory documents, lifecycle, scheduled tasks
//! - [`session`] — per-connection sessions: validation, persistence ordering
//! - [`storage`] — durable change log and snapshot store
//! - [`auth`] — access-claims and resource-limit seams
//! - [`metrics`] — advisory counters, gauges, histograms
//! - [`server`] — WebSocket front-end

pub mod auth;
pub mod document;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;
pub mod version;

// Re-exports for convenience
pub use auth::{AccessClaims, AccessError, AccessPolicy, LimitProvider};
pub use document::{Change, ChangeOp, Edge, Node, ReplicatedDocument};
pub use error::SyncError;
pub use metrics::{DocMetrics, MetricsSnapshot, SyncMetrics};
pub use protocol::{ProtocolError, SyncMessage};
pub use registry::{DelayedTask, DocEntry, DocumentRegistry, LoadPhase, RegistryConfig};
pub use server::{ServerConfig, SyncServer};
pub use session::{DocumentSession, UpdateOutcome};
pub use storage::{ChangeStore, DocumentMetadata, StoreConfig, StoreError};
pub use sync::{PeerSyncConnection, ReceiveOutcome};
pub use version::VersionVector;
