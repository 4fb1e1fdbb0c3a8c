//! Wire protocol for peer synchronization.
//!
//! One message shape covers the whole protocol (bincode-encoded):
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────┬─────────┐
//! │ doc_id   │ vector        │ changes?         │ resync  │
//! │ 16 bytes │ actor→counter │ delta or absent  │ 1 byte  │
//! └──────────┴───────────────┴──────────────────┴─────────┘
//! ```
//!
//! A message with `changes` present is a delta; without `changes` it is a
//! vector-only probe (heartbeat / clock advertisement). `resync: true` asks
//! the receiver to resend its full outstanding diff unconditionally.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Change;
use crate::version::VersionVector;

/// Top-level protocol message, multiplexing any number of documents over
/// one transport channel by `doc_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub doc_id: Uuid,
    /// The sender's current vector for this document.
    pub vector: VersionVector,
    /// Changes the sender believes the receiver is missing. Absent on
    /// probes.
    pub changes: Option<Vec<Change>>,
    /// Request the receiver to recompute and resend its full diff.
    pub resync: bool,
}

impl SyncMessage {
    /// A delta carrying changes up to `vector`.
    pub fn delta(doc_id: Uuid, vector: VersionVector, changes: Vec<Change>) -> Self {
        Self {
            doc_id,
            vector,
            changes: Some(changes),
            resync: false,
        }
    }

    /// A vector-only probe advertising local state.
    pub fn probe(doc_id: Uuid, vector: VersionVector) -> Self {
        Self {
            doc_id,
            vector,
            changes: None,
            resync: false,
        }
    }

    /// A probe that additionally requests a full resend. An empty vector
    /// here means "I have nothing, please send everything".
    pub fn resync_request(doc_id: Uuid, vector: VersionVector) -> Self {
        Self {
            doc_id,
            vector,
            changes: None,
            resync: true,
        }
    }

    /// True when the message carries no changes.
    pub fn is_probe(&self) -> bool {
        self.changes.is_none()
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Serialization(e) => write!(f, "serialization error: {e}"),
            ProtocolError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
