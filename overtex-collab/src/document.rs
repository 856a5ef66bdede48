//! A live document: replicated files, presence, and attached connections.
//!
//! ```text
//!              ┌──────────────── Document (project P1) ───────────────┐
//!              │ Mutex<DocumentState>                                  │
//!              │   replica      main.tex · refs.bib · chapters/1.tex   │
//!  attach ───► │   awareness    client id → (clock, presence)          │
//!  detach ───► │   connections  ConnectionId → Connection              │
//!              │   owners       client id → ConnectionId               │
//!              │ BroadcastGroup ─────────► every attached receiver     │
//!              │ Option<dyn DeltaLog>                                  │
//!              └───────────────────────────────────────────────────────┘
//! ```
//!
//! All mutation of one document happens under its own mutex. Different
//! documents never share a lock, and nothing here touches the registry
//! table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::connection::{Connection, ConnectionId};
use crate::error::CollabError;
use crate::presence::{Awareness, ClientId, PresenceState};
use crate::protocol::{Frame, SyncMessage};
use crate::replica::Replica;
use crate::storage::DeltaLog;

/// Limits applied to every document a registry creates.
#[derive(Debug, Clone, Copy)]
pub struct DocumentConfig {
    /// Frames buffered per receiver before it lags
    pub broadcast_capacity: usize,
    pub max_connections: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self { broadcast_capacity: 256, max_connections: 100 }
    }
}

/// Mutable state of a document, guarded by [`Document`]'s mutex.
pub struct DocumentState {
    pub replica: Replica,
    pub awareness: Awareness,
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    /// Which connection published each awareness client id
    pub(crate) owners: HashMap<ClientId, ConnectionId>,
    evicted: bool,
}

impl DocumentState {
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Step 1 for every sub-document plus the presence snapshot.
    pub fn sync_frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self
            .replica
            .files()
            .into_iter()
            .filter_map(|name| {
                let sv = self.replica.get(&name)?.state_vector();
                Some(Frame::Sync(SyncMessage::step1(name, sv)))
            })
            .collect();

        let snapshot = self.awareness.snapshot();
        if !snapshot.is_empty() {
            frames.push(Frame::Awareness(snapshot));
        }
        frames
    }
}

/// What a newly attached connection starts with.
pub struct Attachment {
    pub receiver: broadcast::Receiver<Envelope>,
    /// Frames to send before anything from `receiver`
    pub initial: Vec<Frame>,
}

/// Outcome of [`Document::detach`].
#[derive(Debug, Default)]
pub struct Detached {
    /// No connections remain; the document is now evicted
    pub now_empty: bool,
    /// Awareness ids removed on behalf of the departed connection
    pub removed: Vec<ClientId>,
    /// Per-file full state and the last logged sequence, for compaction
    pub snapshot: Option<(Vec<(String, Vec<u8>)>, u64)>,
}

/// The live collaborative session for one project.
pub struct Document {
    id: String,
    project_path: PathBuf,
    state: Mutex<DocumentState>,
    broadcast: BroadcastGroup,
    log: Option<Arc<dyn DeltaLog>>,
    max_connections: usize,
    /// Highest delta-log sequence this document has seen
    last_seq: AtomicU64,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        project_path: impl Into<PathBuf>,
        replica: Replica,
        config: DocumentConfig,
        log: Option<Arc<dyn DeltaLog>>,
        last_seq: u64,
    ) -> Self {
        Self {
            id: id.into(),
            project_path: project_path.into(),
            state: Mutex::new(DocumentState {
                replica,
                awareness: Awareness::new(),
                connections: HashMap::new(),
                owners: HashMap::new(),
                evicted: false,
            }),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            log,
            max_connections: config.max_connections,
            last_seq: AtomicU64::new(last_seq),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Take this document's turn.
    pub async fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }

    /// Add a connection and return its receiver and catch-up frames.
    pub async fn attach(&self, connection: Connection) -> Result<Attachment, CollabError> {
        let mut state = self.state.lock().await;
        if state.evicted {
            return Err(CollabError::Evicted(self.id.clone()));
        }
        if state.connections.len() >= self.max_connections {
            return Err(CollabError::RoomFull {
                doc_id: self.id.clone(),
                max: self.max_connections,
            });
        }

        // Subscribe before taking the catch-up snapshot so no delta falls
        // between the two
        let receiver = self.broadcast.subscribe();
        let initial = state.sync_frames();

        log::info!(
            "Attached {} ({}) to document {} [{} connections]",
            connection.id,
            connection.label(),
            self.id,
            state.connections.len() + 1
        );
        state.connections.insert(connection.id, connection);

        Ok(Attachment { receiver, initial })
    }

    /// Remove a connection and its presence entries.
    ///
    /// When the last connection leaves the document is marked evicted; any
    /// later [`attach`](Self::attach) fails with [`CollabError::Evicted`].
    pub async fn detach(&self, id: ConnectionId) -> Detached {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.remove(&id) else {
            return Detached::default();
        };

        let mut removals = Vec::new();
        for client_id in &connection.awareness_ids {
            if state.owners.get(client_id) == Some(&id) {
                state.owners.remove(client_id);
            }
            if let Some(entry) = state.awareness.remove(*client_id) {
                removals.push(entry);
            }
        }
        let removed: Vec<ClientId> = removals.iter().map(|e| e.client_id).collect();

        if !removals.is_empty() {
            let frame = Frame::Awareness(crate::protocol::AwarenessUpdate::new(removals));
            if let Err(e) = self.broadcast.broadcast(None, &frame) {
                log::warn!("Failed to broadcast presence removal on {}: {e}", self.id);
            }
        }

        log::info!(
            "Detached {} ({}) from document {} [{} connections]",
            id,
            connection.label(),
            self.id,
            state.connections.len()
        );

        let now_empty = state.connections.is_empty();
        let snapshot = if now_empty {
            state.evicted = true;
            self.log
                .as_ref()
                .map(|_| (state.replica.snapshots(), self.last_seq.load(Ordering::SeqCst)))
        } else {
            None
        };

        Detached { now_empty, removed, snapshot }
    }

    /// Catch-up frames for a connection whose receiver lagged.
    pub async fn resync_frames(&self) -> Vec<Frame> {
        self.state.lock().await.sync_frames()
    }

    /// Append an applied delta to the log, if one is engaged.
    ///
    /// The write runs on the blocking pool. Failures are logged; the
    /// in-memory merge stands.
    pub async fn persist(&self, file: &str, update: &[u8]) {
        let Some(log) = &self.log else {
            return;
        };
        let log = Arc::clone(log);
        let (doc_id, name, delta) = (self.id.clone(), file.to_string(), update.to_vec());
        let appended = tokio::task::spawn_blocking(move || log.append(&doc_id, &name, &delta)).await;

        match appended {
            Ok(Ok(seq)) => {
                self.last_seq.fetch_max(seq, Ordering::SeqCst);
            }
            Ok(Err(e)) => log::error!("Failed to persist delta for {}/{file}: {e}", self.id),
            Err(e) => log::error!("Persist task for {}/{file} failed: {e}", self.id),
        }
    }

    /// Current merged text of `file`, if materialized.
    pub async fn text(&self, file: &str) -> Option<String> {
        self.state.lock().await.replica.get(file).map(|d| d.text())
    }

    pub async fn files(&self) -> Vec<String> {
        self.state.lock().await.replica.files()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_evicted(&self) -> bool {
        self.state.lock().await.evicted
    }

    /// Live presence entries.
    pub async fn collaborators(&self) -> Vec<(ClientId, PresenceState)> {
        let state = self.state.lock().await;
        let mut out: Vec<(ClientId, PresenceState)> = state
            .awareness
            .states()
            .map(|(id, s)| (id, s.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
