//! WebSocket bridge between an editor and the sync server.
//!
//! Provides:
//! - One connection per open document, shared by every file of the project
//! - Per-file bindings that turn editor edits into deltas
//! - Catch-up handshake per sub-document and a synced signal per file
//! - Presence publishing and a live collaborator list
//!
//! ```text
//!  editor ──► FileBinding::insert ──► local_edit ──► outgoing ──► writer task ──► ws
//!  editor ◄── ClientEvent::RemoteChange ◄── reader task ◄────────────────────── ws
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;
use uuid::Uuid;

use crate::presence::{Awareness, ClientId, Cursor, PresenceFields, PresenceState};
use crate::protocol::{AwarenessUpdate, Frame, ProtocolError, SyncMessage, SyncStep, PONG};
use crate::replica::{is_empty_update, Replica, ReplicaError, TextEdit};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by a [`DocumentHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost; the UI should offer a reconnect
    Disconnected,
    /// First catch-up for a file completed
    FileSynced(String),
    /// A remote delta changed a file
    RemoteChange { file: String },
    /// Presence entries were added, updated or removed
    PresenceChanged(Vec<ClientId>),
}

/// Bridge errors.
#[derive(Debug)]
pub enum ClientError {
    InvalidUrl(String),
    /// Upgrade refused with this HTTP status
    Rejected(u16),
    Connect(String),
    Protocol(ProtocolError),
    Replica(ReplicaError),
    /// The connection is gone; the edit was kept locally only
    Disconnected,
    /// A file did not finish its catch-up in time
    SyncTimeout(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(e) => write!(f, "Invalid server URL: {e}"),
            Self::Rejected(status) => write!(f, "Connection rejected with status {status}"),
            Self::Connect(e) => write!(f, "Connection failed: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Replica(e) => write!(f, "Replica error: {e}"),
            Self::Disconnected => write!(f, "Not connected"),
            Self::SyncTimeout(file) => write!(f, "Timed out syncing {file}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<ReplicaError> for ClientError {
    fn from(e: ReplicaError) -> Self {
        ClientError::Replica(e)
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct CollabClient {
    server_url: String,
    token: Option<String>,
    share_token: Option<String>,
    name: String,
}

impl CollabClient {
    /// `server_url` is the `ws://` or `wss://` endpoint.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: None,
            share_token: None,
            name: "Anonymous".to_string(),
        }
    }

    /// Bearer token sent in the `Authorization` header.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_share_token(mut self, sid: impl Into<String>) -> Self {
        self.share_token = Some(sid.into());
        self
    }

    /// Display name published in presence.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Upgrade URL for `document_id`.
    pub fn session_url(&self, document_id: &str, active_file: Option<&str>) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("projectId", document_id);
            if let Some(sid) = &self.share_token {
                query.append_pair("sid", sid);
            }
            if let Some(file) = active_file {
                query.append_pair("activeFile", file);
            }
        }
        Ok(url)
    }

    /// Open one connection for `document_id` and publish initial presence.
    pub async fn open(&self, document_id: &str, active_file: Option<&str>) -> Result<DocumentHandle, ClientError> {
        let url = self.session_url(document_id, active_file)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(WsError::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()));
            }
            Err(e) => return Err(ClientError::Connect(e.to_string())),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            document_id: document_id.to_string(),
            client_id: Uuid::new_v4().as_u64_pair().0,
            session: Mutex::new(Session { replica: Replica::new(), awareness: Awareness::new() }),
            synced: watch::channel(HashSet::new()).0,
            state: watch::channel(ConnectionState::Connecting).0,
            outgoing: out_tx,
            events: event_tx,
        });
        shared.state.send_replace(ConnectionState::Connected);
        shared.emit(ClientEvent::Connected);
        log::info!("Connected to document {document_id} as client {}", shared.client_id);

        // Reader task: process incoming WebSocket messages
        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => reader_shared.handle_frame(&data).await,
                    Ok(Message::Text(text)) if text.as_str() == PONG => {}
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket error on {}: {e}", reader_shared.document_id);
                        break;
                    }
                }
            }
            reader_shared.state.send_replace(ConnectionState::Disconnected);
            reader_shared.emit(ClientEvent::Disconnected);
            log::info!("Disconnected from document {}", reader_shared.document_id);
        });

        let handle = DocumentHandle {
            shared,
            event_rx: Some(event_rx),
            name: self.name.clone(),
            tasks: vec![writer, reader],
        };
        handle
            .set_presence(PresenceFields {
                name: self.name.clone(),
                active_file: active_file.map(str::to_string),
                ..PresenceFields::default()
            })
            .await?;
        Ok(handle)
    }
}

struct Session {
    replica: Replica,
    awareness: Awareness,
}

struct Shared {
    document_id: String,
    client_id: ClientId,
    session: Mutex<Session>,
    /// Files whose first catch-up completed
    synced: watch::Sender<HashSet<String>>,
    state: watch::Sender<ConnectionState>,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Sender<ClientEvent>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Dropping client event on {}: {e}", self.document_id);
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let encoded = frame.encode()?;
        self.outgoing
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    fn mark_synced(&self, file: &str) {
        let newly = self.synced.send_if_modified(|synced| synced.insert(file.to_string()));
        if newly {
            log::debug!("File {}/{file} synced", self.document_id);
            self.emit(ClientEvent::FileSynced(file.to_string()));
        }
    }

    async fn handle_frame(&self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame on {}: {e}", self.document_id);
                return;
            }
        };
        let replies = match frame {
            Frame::Sync(msg) => self.handle_sync(msg).await,
            Frame::Awareness(update) => {
                self.handle_awareness(&update).await;
                Vec::new()
            }
        };
        for reply in replies {
            if self.send(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn handle_sync(&self, msg: SyncMessage) -> Vec<Frame> {
        match msg.step {
            SyncStep::Step1 => {
                let (replies, caught_up) = {
                    let mut session = self.session.lock().await;
                    let sub_doc = session.replica.sub_doc(&msg.file);
                    let diff = match sub_doc.diff_since(&msg.payload) {
                        Ok(diff) => diff,
                        Err(e) => {
                            log::warn!("Bad state vector for {}/{}: {e}", self.document_id, msg.file);
                            return Vec::new();
                        }
                    };
                    let behind = sub_doc.lacks(&msg.payload).unwrap_or(false);

                    let mut replies = Vec::with_capacity(2);
                    if !is_empty_update(&diff) {
                        replies.push(Frame::Sync(SyncMessage::step2(msg.file.clone(), diff)));
                    }
                    if behind {
                        replies.push(Frame::Sync(SyncMessage::step1(msg.file.clone(), sub_doc.state_vector())));
                    }
                    (replies, !behind)
                };
                if caught_up {
                    self.mark_synced(&msg.file);
                }
                replies
            }
            SyncStep::Step2 | SyncStep::Update => {
                let applied = {
                    let mut session = self.session.lock().await;
                    session.replica.sub_doc(&msg.file).apply_remote_delta(&msg.payload)
                };
                match applied {
                    Ok(()) => {
                        if msg.step == SyncStep::Step2 {
                            self.mark_synced(&msg.file);
                        }
                        if !is_empty_update(&msg.payload) {
                            self.emit(ClientEvent::RemoteChange { file: msg.file });
                        }
                    }
                    Err(e) => log::warn!("Dropping delta for {}/{}: {e}", self.document_id, msg.file),
                }
                Vec::new()
            }
        }
    }

    async fn handle_awareness(&self, update: &AwarenessUpdate) {
        let changes = self.session.lock().await.awareness.apply(update);
        if !changes.is_empty() {
            log::trace!("Presence changed on {}: {changes:?}", self.document_id);
            self.emit(ClientEvent::PresenceChanged(changes.changed_ids()));
        }
    }
}

/// An open document session.
pub struct DocumentHandle {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    name: String,
    tasks: Vec<JoinHandle<()>>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &str {
        &self.shared.document_id
    }

    /// This session's awareness client id.
    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Bind `file` on the already open connection and request its catch-up.
    pub async fn bind_file(&self, file: &str) -> Result<FileBinding, ClientError> {
        let state_vector = {
            let mut session = self.shared.session.lock().await;
            session.replica.sub_doc(file).state_vector()
        };
        if !self.shared.synced.borrow().contains(file) {
            self.shared
                .send(&Frame::Sync(SyncMessage::step1(file, state_vector)))
                .await?;
        }
        Ok(FileBinding { shared: Arc::clone(&self.shared), file: file.to_string() })
    }

    /// Plain text of `file` as this replica sees it.
    pub async fn current_text(&self, file: &str) -> Option<String> {
        let session = self.shared.session.lock().await;
        session.replica.get(file).map(|d| d.text())
    }

    /// Files materialized in the local replica.
    pub async fn files(&self) -> Vec<String> {
        self.shared.session.lock().await.replica.files()
    }

    /// Other live collaborators, ordered by client id.
    pub async fn collaborators(&self) -> Vec<(ClientId, PresenceState)> {
        let session = self.shared.session.lock().await;
        let mut out: Vec<(ClientId, PresenceState)> = session
            .awareness
            .states()
            .filter(|(id, _)| *id != self.shared.client_id)
            .map(|(id, s)| (id, s.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Replace this session's presence wholesale.
    pub async fn set_presence(&self, fields: PresenceFields) -> Result<(), ClientError> {
        let entry = {
            let mut session = self.shared.session.lock().await;
            let state = PresenceState::from_fields(self.shared.client_id, fields);
            session.awareness.set_local(self.shared.client_id, state)
        };
        self.shared
            .send(&Frame::Awareness(AwarenessUpdate::new(vec![entry])))
            .await
    }

    /// Publish the active file and cursor, keeping the display name.
    pub async fn set_cursor(&self, file: &str, cursor: Option<Cursor>) -> Result<(), ClientError> {
        self.set_presence(PresenceFields {
            name: self.name.clone(),
            active_file: Some(file.to_string()),
            cursor,
            ..PresenceFields::default()
        })
        .await
    }

    /// Withdraw presence and close the connection.
    pub async fn close(self) -> Result<(), ClientError> {
        let removal = self.shared.session.lock().await.awareness.remove(self.shared.client_id);
        if let Some(entry) = removal {
            self.shared
                .send(&Frame::Awareness(AwarenessUpdate::new(vec![entry])))
                .await?;
        }
        let _ = self.shared.outgoing.send(Message::Close(None)).await;
        Ok(())
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        // The writer drains queued frames and the close before exiting
        if let Some(reader) = self.tasks.pop() {
            reader.abort();
        }
    }
}

/// The editor-facing view of one file.
#[derive(Clone)]
pub struct FileBinding {
    shared: Arc<Shared>,
    file: String,
}

impl FileBinding {
    pub fn file(&self) -> &str {
        &self.file
    }

    pub async fn insert(&self, at: u32, text: &str) -> Result<(), ClientError> {
        self.edit(TextEdit::Insert { at, text: text.to_string() }).await
    }

    pub async fn delete(&self, at: u32, len: u32) -> Result<(), ClientError> {
        self.edit(TextEdit::Delete { at, len }).await
    }

    /// Replace the whole text with the smallest equivalent edit.
    pub async fn replace(&self, content: &str) -> Result<(), ClientError> {
        self.edit(TextEdit::Replace { content: content.to_string() }).await
    }

    pub async fn text(&self) -> String {
        let session = self.shared.session.lock().await;
        session.replica.get(&self.file).map(|d| d.text()).unwrap_or_default()
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.borrow().contains(&self.file)
    }

    /// Wait for the first catch-up of this file.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.shared.synced.subscribe();
        // Bound so the `wait_for` guard drops before `rx`
        let waited = match tokio::time::timeout(timeout, rx.wait_for(|synced| synced.contains(&self.file))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::SyncTimeout(self.file.clone())),
        };
        waited
    }

    /// Content to populate the editor with.
    ///
    /// Waits for the catch-up; if it does not arrive in time, falls back to
    /// a non-empty `cache`.
    pub async fn initial_content(&self, cache: Option<&str>, timeout: Duration) -> Result<String, ClientError> {
        match self.wait_synced(timeout).await {
            Ok(()) => Ok(self.text().await),
            Err(e) => match cache.filter(|c| !c.is_empty()) {
                Some(cached) => {
                    log::info!("Using cached content for {} after {e}", self.file);
                    Ok(cached.to_string())
                }
                None => Err(e),
            },
        }
    }

    async fn edit(&self, edit: TextEdit) -> Result<(), ClientError> {
        let delta = {
            let mut session = self.shared.session.lock().await;
            session.replica.sub_doc(&self.file).local_edit(&edit)?
        };
        match delta {
            Some(delta) => {
                self.shared
                    .send(&Frame::Sync(SyncMessage::update(self.file.clone(), delta)))
                    .await
            }
            None => Ok(()),
        }
    }
}
