//! Durable delta log for live documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append(doc, file, delta)  ┌──────────────────┐
//! │ SyncHandler  │ ─────────────────────────► │ dyn DeltaLog     │
//! └──────────────┘                            │  ├ DocumentStore │ RocksDB + LZ4
//! ┌──────────────┐  load(doc) on creation     │  └ MemoryDeltaLog│ tests
//! │ Registry     │ ◄───────────────────────── │                  │
//! │              │ ─────────────────────────► │                  │
//! └──────────────┘  compact(doc, snapshots)   └──────────────────┘
//!                   on eviction
//! ```
//!
//! `load` yields per-file snapshots first (sequence 0), then deltas in
//! append order. Replaying them through the merge engine reconstructs the
//! converged state of the last live session.

pub mod rocks;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// One replayable record: a snapshot or an incremental delta for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedDelta {
    /// Global append sequence; 0 for snapshots
    pub seq: u64,
    pub file: String,
    pub update: Vec<u8>,
}

/// Append-only, per-document store of encoded updates.
///
/// Implementations are synchronous. Appends are small and issued outside the
/// document lock; loads run on the blocking pool during document creation.
pub trait DeltaLog: Send + Sync {
    /// Append one delta for `file` of `doc_id`. Returns its sequence number.
    fn append(&self, doc_id: &str, file: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// Every snapshot and delta recorded for `doc_id`, snapshots first.
    fn load(&self, doc_id: &str) -> Result<Vec<LoggedDelta>, StoreError>;

    /// Replace per-file snapshots and drop deltas with `seq <= up_to_seq`.
    /// Returns the number of deltas removed.
    fn compact(
        &self,
        doc_id: &str,
        snapshots: &[(String, Vec<u8>)],
        up_to_seq: u64,
    ) -> Result<u64, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(String),
    /// Document ids may not contain NUL
    InvalidKey(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::InvalidKey(id) => write!(f, "Invalid document id: {id:?}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

#[derive(Default)]
struct MemoryEntry {
    snapshots: BTreeMap<String, Vec<u8>>,
    deltas: Vec<LoggedDelta>,
}

/// In-process [`DeltaLog`] for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryDeltaLog {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    sequence: AtomicU64,
}

impl MemoryDeltaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deltas currently held for `doc_id` (snapshots excluded).
    pub fn delta_count(&self, doc_id: &str) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.get(doc_id).map_or(0, |e| e.deltas.len()))
            .unwrap_or(0)
    }

    /// Files with a stored snapshot for `doc_id`.
    pub fn snapshot_files(&self, doc_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(doc_id)
                    .map(|e| e.snapshots.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::DatabaseError("memory log lock poisoned".into())
}

impl DeltaLog for MemoryDeltaLog {
    fn append(&self, doc_id: &str, file: &str, update: &[u8]) -> Result<u64, StoreError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.entry(doc_id.to_string()).or_default().deltas.push(LoggedDelta {
            seq,
            file: file.to_string(),
            update: update.to_vec(),
        });
        Ok(seq)
    }

    fn load(&self, doc_id: &str) -> Result<Vec<LoggedDelta>, StoreError> {
        let entries = self.entries.lock().map_err(poisoned)?;
        let Some(entry) = entries.get(doc_id) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<LoggedDelta> = entry
            .snapshots
            .iter()
            .map(|(file, update)| LoggedDelta { seq: 0, file: file.clone(), update: update.clone() })
            .collect();
        out.extend(entry.deltas.iter().cloned());
        Ok(out)
    }

    fn compact(
        &self,
        doc_id: &str,
        snapshots: &[(String, Vec<u8>)],
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let entry = entries.entry(doc_id.to_string()).or_default();
        for (file, snapshot) in snapshots {
            entry.snapshots.insert(file.clone(), snapshot.clone());
        }
        let before = entry.deltas.len();
        entry.deltas.retain(|d| d.seq > up_to_seq);
        Ok((before - entry.deltas.len()) as u64)
    }
}
