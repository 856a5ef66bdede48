//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! TCP accept ─► handshake (auth gate, bounded by handshake_timeout_ms)
//!                  │ 401/403 before upgrade on failure
//!                  ▼
//!            DocumentRegistry::attach(projectId) ─► Step1 per file + presence
//!                  │
//!     ┌────────────┴──────────── select! ───────────────────────┐
//!     │ socket frame   → sync::handle_frame → direct replies     │
//!     │ broadcast rx   → forward unless we sent it; on lag resync│
//!     │ heartbeat tick → ping; close after two silent intervals  │
//!     └────────────┬─────────────────────────────────────────────┘
//!                  ▼
//!            DocumentRegistry::detach (exactly once)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{authorize, Admission, AuthRejection, Credentials, PermissionResolver, TokenVerifier};
use crate::connection::{Connection, ConnectionId};
use crate::document::{Attachment, Document, DocumentConfig};
use crate::error::CollabError;
use crate::hydration::FileStore;
use crate::protocol::{Frame, PING, PONG};
use crate::registry::DocumentRegistry;
use crate::storage::{DeltaLog, DocumentStore, StoreConfig};
use crate::sync;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per document
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Ping interval; two silent intervals close the connection
    pub heartbeat_interval_secs: u64,
    /// Upper bound on the upgrade handshake, auth included
    pub handshake_timeout_ms: u64,
    /// Delta log directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            handshake_timeout_ms: 5_000,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    fn document_config(&self) -> DocumentConfig {
        DocumentConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_connections: self.max_peers_per_room,
        }
    }
}

/// External services the server consults.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn TokenVerifier>,
    pub resolver: Arc<dyn PermissionResolver>,
    pub files: Arc<dyn FileStore>,
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    resolver: Arc<dyn PermissionResolver>,
    stats: AtomicServerStats,
}

impl SyncServer {
    /// Build a server, opening the RocksDB delta log if `storage_path` is set.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Result<Self, CollabError> {
        let log = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!(
                    "Opened delta log at {} (sequence {})",
                    store.path().display(),
                    store.sequence()
                );
                Some(Arc::new(store) as Arc<dyn DeltaLog>)
            }
            None => None,
        };
        Ok(Self::with_log(config, collaborators, log))
    }

    /// Build a server around an existing delta log.
    pub fn with_log(
        config: ServerConfig,
        collaborators: Collaborators,
        log: Option<Arc<dyn DeltaLog>>,
    ) -> Self {
        let registry = Arc::new(DocumentRegistry::new(
            collaborators.files,
            log,
            config.document_config(),
        ));
        Self {
            config,
            registry,
            verifier: collaborators.verifier,
            resolver: collaborators.resolver,
            stats: AtomicServerStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let Some((mut ws, admission)) = self.handshake(stream, addr).await else {
            self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let connection = Connection::new(admission.identity.clone(), admission.permission)
            .with_active_file(admission.active_file.clone());
        let conn_id = connection.id;
        log::info!(
            "Connection {conn_id} from {addr} ({}, {:?}) for project {}",
            connection.label(),
            admission.permission,
            admission.project_id
        );

        let (doc, attachment) = match self
            .registry
            .attach(&admission.project_id, &admission.project_path, connection)
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                log::warn!("Attach to {} failed for {addr}: {e}", admission.project_id);
                let code = match &e {
                    CollabError::RoomFull { .. } => CloseCode::Again,
                    _ => CloseCode::Error,
                };
                let _ = ws
                    .close(Some(CloseFrame { code, reason: e.to_string().into() }))
                    .await;
                return Ok(());
            }
        };

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let result = self.pump(ws, &doc, conn_id, attachment).await;

        // Runs on every exit path of the pump
        self.registry.detach(&doc, conn_id).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} closed");
        result
    }

    /// Upgrade the socket, running the auth gate inside the handshake.
    async fn handshake(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<(tokio_tungstenite::WebSocketStream<TcpStream>, Admission)> {
        let mut admission: Option<Admission> = None;
        let verifier = self.verifier.as_ref();
        let resolver = self.resolver.as_ref();

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let authorization = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            let result = Credentials::from_parts(request.uri().query(), authorization)
                .and_then(|creds| authorize(creds, verifier, resolver));
            match result {
                Ok(admitted) => {
                    admission = Some(admitted);
                    Ok(response)
                }
                Err(rejection) => Err(rejection_response(rejection)),
            }
        };

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        match tokio::time::timeout(timeout, tokio_tungstenite::accept_hdr_async(stream, callback)).await {
            Ok(Ok(ws)) => admission.map(|a| (ws, a)),
            Ok(Err(e)) => {
                log::info!("Rejected upgrade from {addr}: {e}");
                None
            }
            Err(_) => {
                log::warn!("Handshake from {addr} timed out after {timeout:?}");
                None
            }
        }
    }

    async fn pump(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        doc: &Arc<Document>,
        conn_id: ConnectionId,
        attachment: Attachment,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let Attachment { mut receiver, initial } = attachment;

        for frame in &initial {
            send_frame(&mut ws_sender, frame).await?;
        }

        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            for reply in sync::handle_frame(doc, conn_id, &data).await {
                                send_frame(&mut ws_sender, &reply).await?;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            if text.as_str() == PING {
                                ws_sender.send(Message::Text(PONG.into())).await?;
                            } else {
                                log::debug!("Ignoring text frame on {} from {conn_id}", doc.id());
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {} from {conn_id}: {e}", doc.id());
                            break;
                        }
                    }
                }

                envelope = receiver.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            if envelope.is_for(conn_id) {
                                ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            doc.broadcast().record_dropped(skipped);
                            log::warn!("Connection {conn_id} lagged by {skipped} frames on {}; resyncing", doc.id());
                            for frame in doc.resync_frames().await {
                                send_frame(&mut ws_sender, &frame).await?;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() >= heartbeat * 2 {
                        log::info!("Connection {conn_id} idle for {:?}; closing", last_seen.elapsed());
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }
}

fn rejection_response(rejection: AuthRejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status_code()).unwrap_or(StatusCode::FORBIDDEN);
    response
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = frame.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
