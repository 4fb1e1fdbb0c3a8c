//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocEntry (doc_id) ── shared document ── mutex
//! Client B ──┘         │
//!                      ├── ChangeStore (RocksDB)
//!                      │       ├── change log
//!                      │       └── snapshots (LZ4)
//!                      │
//!                      └── revision watch ── each session computes
//!                                            its own outgoing diff
//! ```
//!
//! The handshake carries the document id in the request path and the access
//! token in the query string (`/sync/<doc_id>?token=…`); the injected
//! [`AccessPolicy`] resolves it before a session exists, and read-denied
//! connections are refused with `403` at handshake time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{AccessClaims, AccessPolicy, LimitProvider};
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::protocol::SyncMessage;
use crate::registry::{DocumentRegistry, RegistryConfig};
use crate::session::DocumentSession;
use crate::storage::{ChangeStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence directory
    pub storage_path: PathBuf,
    /// Registry timing/chunking knobs
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: PathBuf::from("atlas_data"),
            registry: RegistryConfig::default(),
        }
    }
}

/// The sync server: accepts WebSocket connections, authenticates them, and
/// pumps messages between each transport and its document session.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    policy: Arc<dyn AccessPolicy>,
    limits: Arc<dyn LimitProvider>,
}

impl SyncServer {
    /// Create a server, opening the durable store at the configured path.
    pub fn new(
        config: ServerConfig,
        policy: Arc<dyn AccessPolicy>,
        limits: Arc<dyn LimitProvider>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(ChangeStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?);
        let registry = Arc::new(DocumentRegistry::new(
            store,
            Arc::new(SyncMetrics::new()),
            config.registry.clone(),
        ));
        Ok(Self {
            config,
            registry,
            policy,
            limits,
        })
    }

    /// Create a server around an existing registry (tests, embedding).
    pub fn with_registry(
        config: ServerConfig,
        registry: Arc<DocumentRegistry>,
        policy: Arc<dyn AccessPolicy>,
        limits: Arc<dyn LimitProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            policy,
            limits,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let policy = self.policy.clone();
            let limits = self.limits.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, policy, limits).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection end to end.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        policy: Arc<dyn AccessPolicy>,
        limits: Arc<dyn LimitProvider>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Authenticate during the HTTP upgrade so read-denied connections
        // never become sessions.
        let mut claims_slot: Option<AccessClaims> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match authorize_request(req, policy.as_ref()) {
                Ok(claims) => {
                    claims_slot = Some(claims);
                    Ok(resp)
                }
                Err(reason) => {
                    log::warn!("handshake refused from {addr}: {reason}");
                    let mut refusal = ErrorResponse::new(Some(reason));
                    *refusal.status_mut() = StatusCode::FORBIDDEN;
                    Err(refusal)
                }
            }
        })
        .await?;

        let claims = match claims_slot {
            Some(claims) => claims,
            None => return Ok(()), // refused during handshake
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!(
            "websocket established from {addr}: user {} on document {}",
            claims.user_id,
            claims.doc_id
        );

        let mut session = DocumentSession::open(registry, limits, claims).await?;
        let mut revision_rx = session.subscribe();

        // Initial advertisement (waits for the cold load to finish)
        for msg in session.announce().await? {
            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
        }

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            match session.on_update(&msg).await {
                                Ok(outcome) => {
                                    if let Some(reply) = outcome.reply {
                                        ws_sender
                                            .send(Message::Binary(reply.encode()?.into()))
                                            .await?;
                                    }
                                }
                                Err(e @ SyncError::MergeAnomaly { .. }) => {
                                    // Dropped data detected: the document
                                    // was rolled back, demand a full resend.
                                    log::warn!("merge anomaly from {addr}: {e}");
                                    if let Ok(req) = session.request_resync().await {
                                        ws_sender
                                            .send(Message::Binary(req.encode()?.into()))
                                            .await?;
                                    }
                                }
                                Err(e) if e.is_recoverable() => {
                                    // Reject the message, keep the session.
                                    log::warn!("rejected update from {addr}: {e}");
                                }
                                Err(e) => {
                                    // Terminal for this session: tell the
                                    // peer why, then close.
                                    log::error!("fatal session error from {addr}: {e}");
                                    let _ = ws_sender
                                        .send(Message::Close(Some(close_frame(&e))))
                                        .await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                changed = revision_rx.changed() => {
                    if changed.is_err() {
                        break; // entry torn down
                    }
                    match session.flush_remote_changes().await {
                        Ok(Some(msg)) => {
                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("flush failed for {addr}: {e}");
                            let _ = ws_sender
                                .send(Message::Close(Some(close_frame(&e))))
                                .await;
                            break;
                        }
                    }
                }
            }
        }

        session.close();
        Ok(())
    }
}

/// Resolve `/sync/<doc_id>?token=…` against the access policy.
fn authorize_request(req: &Request, policy: &dyn AccessPolicy) -> Result<AccessClaims, String> {
    let uri = req.uri();
    let (doc_id, token) = parse_target(uri.path(), uri.query())
        .ok_or_else(|| format!("malformed sync path: {uri}"))?;

    let claims = policy
        .authorize(doc_id, &token)
        .map_err(|e| e.to_string())?;
    if !claims.readable {
        return Err(format!("no read access to document {doc_id}"));
    }
    Ok(claims)
}

/// Extract `(doc_id, token)` from the request path and query string.
fn parse_target(path: &str, query: Option<&str>) -> Option<(Uuid, String)> {
    let doc_id = path
        .strip_prefix("/sync/")
        .and_then(|rest| Uuid::parse_str(rest.trim_end_matches('/')).ok())?;

    let token = query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .unwrap_or("")
        .to_string();

    Some((doc_id, token))
}

fn close_frame(
    error: &SyncError,
) -> tokio_tungstenite::tungstenite::protocol::CloseFrame {
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: CloseCode::Error,
        reason: error.to_string().into(),
    }
}
