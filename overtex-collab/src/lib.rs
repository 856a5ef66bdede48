//! # overtex-collab: Real-time document sync for Overtex
//!
//! Lets many editor sessions edit the files of one LaTeX project at once,
//! merging concurrent edits with a CRDT and fanning out presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌──────────────────┐
//! │ CollabClient  │ ◄────────────────► │ SyncServer       │
//! │ (per session) │    Binary frames   │ (auth gate)      │
//! └──────┬────────┘                    └────────┬─────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌───────────────┐                    ┌──────────────────┐
//! │ Replica       │                    │ DocumentRegistry │──► FileStore (hydration)
//! │ (local)       │                    │  └─ Document     │──► DeltaLog (optional)
//! └───────────────┘                    │      ├ Replica   │
//!                                      │      ├ Awareness │
//!                                      │      └ Broadcast │
//!                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Binary wire format (discriminator byte + bincode payload)
//! - [`replica`] - One yrs text document per project file
//! - [`presence`] - Last-write-wins awareness entries
//! - [`auth`] - Upgrade credentials, token and permission collaborators
//! - [`document`] / [`registry`] - Live documents and their lifecycle
//! - [`sync`] - Server side of the two-step reconciliation
//! - [`broadcast`] - Per-document fan-out
//! - [`hydration`] - Seeding from the project directory
//! - [`storage`] - Durable delta log (RocksDB) and an in-memory variant
//! - [`server`] - WebSocket sync server
//! - [`client`] - Editor-side bridge

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod document;
pub mod error;
pub mod hydration;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{
    Admission, AuthRejection, Credentials, Grant, Identity, Permission, PermissionResolver,
    StaticAuth, TokenVerifier,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{
    ClientError, ClientEvent, CollabClient, ConnectionState, DocumentHandle, FileBinding,
};
pub use connection::{Connection, ConnectionId};
pub use document::{Document, DocumentConfig};
pub use error::CollabError;
pub use hydration::{DiskFileStore, FileStore, HydrationError};
pub use presence::{Awareness, ClientId, Cursor, PresenceFields, PresenceState};
pub use protocol::{AwarenessEntry, AwarenessUpdate, Frame, MessageType, ProtocolError, SyncMessage, SyncStep};
pub use registry::DocumentRegistry;
pub use replica::{Replica, ReplicaError, SubDocument, TextEdit};
pub use server::{Collaborators, ServerConfig, ServerStats, SyncServer};
pub use storage::{DeltaLog, DocumentMetadata, DocumentStore, LoggedDelta, MemoryDeltaLog, StoreConfig, StoreError};
