//! Document lifecycle errors.

use crate::hydration::HydrationError;
use crate::protocol::ProtocolError;
use crate::replica::ReplicaError;
use crate::storage::StoreError;

/// Failures creating, attaching to, or reading from a live document.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// Project files could not be read during creation
    Hydration(HydrationError),
    /// Delta log could not be opened or replayed
    Store(StoreError),
    Protocol(ProtocolError),
    Replica(ReplicaError),
    /// Document already has `max` connections
    RoomFull { doc_id: String, max: usize },
    /// Document was evicted while the attach was in flight
    Evicted(String),
    /// No live document with this id
    NotLive(String),
    /// No sub-document with this name
    UnknownFile(String),
    /// A blocking task panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hydration(e) => write!(f, "Hydration failed: {e}"),
            Self::Store(e) => write!(f, "Delta log error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Replica(e) => write!(f, "Replica error: {e}"),
            Self::RoomFull { doc_id, max } => {
                write!(f, "Document {doc_id} is full ({max} connections)")
            }
            Self::Evicted(id) => write!(f, "Document {id} was evicted"),
            Self::NotLive(id) => write!(f, "Document {id} is not live"),
            Self::UnknownFile(name) => write!(f, "Unknown file: {name}"),
            Self::Task(e) => write!(f, "Background task failed: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<HydrationError> for CollabError {
    fn from(e: HydrationError) -> Self {
        CollabError::Hydration(e)
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Store(e)
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e)
    }
}

impl From<ReplicaError> for CollabError {
    fn from(e: ReplicaError) -> Self {
        CollabError::Replica(e)
    }
}

impl From<tokio::task::JoinError> for CollabError {
    fn from(e: tokio::task::JoinError) -> Self {
        CollabError::Task(e.to_string())
    }
}
