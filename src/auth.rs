//! Session-establishment and resource-limit seams.
//!
//! Token issuance, share/role resolution, and plan quotas live outside this
//! crate. The engine consumes two narrow interfaces: an [`AccessPolicy`]
//! that turns a transport handshake into [`AccessClaims`], and a
//! [`LimitProvider`] queried again on every update — limits can change
//! out-of-band, so they are never cached at session start.

use uuid::Uuid;

/// What the external auth layer resolved for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessClaims {
    pub doc_id: Uuid,
    pub user_id: Uuid,
    /// May attach and receive changes.
    pub readable: bool,
    /// May submit changes.
    pub writeable: bool,
    /// Owns the document (limits are resolved against the owner).
    pub owner: bool,
}

impl AccessClaims {
    /// Full rights, as the owner. Handy for tests and trusted tooling.
    pub fn owner_of(doc_id: Uuid, user_id: Uuid) -> Self {
        Self {
            doc_id,
            user_id,
            readable: true,
            writeable: true,
            owner: true,
        }
    }

    /// Read-only rights.
    pub fn reader_of(doc_id: Uuid, user_id: Uuid) -> Self {
        Self {
            doc_id,
            user_id,
            readable: true,
            writeable: false,
            owner: false,
        }
    }
}

/// Handshake-time authorization failure.
#[derive(Debug, Clone)]
pub enum AccessError {
    /// Token did not resolve to any identity.
    InvalidToken,
    /// Identity resolved but has no read access to the document.
    Denied { doc_id: Uuid },
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessError::InvalidToken => write!(f, "invalid access token"),
            AccessError::Denied { doc_id } => write!(f, "no read access to document {doc_id}"),
        }
    }
}

impl std::error::Error for AccessError {}

/// Resolves a handshake into access claims. Implemented by the external
/// auth layer; injected into the server.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, doc_id: Uuid, token: &str) -> Result<AccessClaims, AccessError>;
}

/// Per-owner node-count limit. `None` means unlimited.
/// Re-queried on every update.
pub trait LimitProvider: Send + Sync {
    fn node_limit(&self, owner_id: Uuid) -> Option<u32>;
}

/// Development policy: every token is accepted with full rights and the
/// token string is hashed into a stable user id.
pub struct OpenPolicy;

impl AccessPolicy for OpenPolicy {
    fn authorize(&self, doc_id: Uuid, token: &str) -> Result<AccessClaims, AccessError> {
        let mut bytes = [0u8; 16];
        for (i, b) in token.bytes().enumerate() {
            bytes[i % 16] ^= b.wrapping_add(i as u8);
        }
        Ok(AccessClaims::owner_of(doc_id, Uuid::from_bytes(bytes)))
    }
}

/// No limits at all (development default).
pub struct Unlimited;

impl LimitProvider for Unlimited {
    fn node_limit(&self, _owner_id: Uuid) -> Option<u32> {
        None
    }
}

/// The same limit for every owner.
pub struct FixedLimit(pub u32);

impl LimitProvider for FixedLimit {
    fn node_limit(&self, _owner_id: Uuid) -> Option<u32> {
        Some(self.0)
    }
}
