//! RocksDB-backed delta log.
//!
//! Column families:
//! - `documents` - per-file snapshots written at eviction (LZ4 compressed),
//!   keyed by `<doc_id>\0<file>`
//! - `deltas`    - incremental updates (LZ4 compressed), keyed by
//!   `<doc_id>\0<seq:8 bytes big-endian>` so a prefix scan yields append order
//! - `metadata`  - per-document counters (bincode), keyed by `<doc_id>`

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{DeltaLog, LoggedDelta, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("overtex_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored in the `metadata` family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Highest sequence appended for this document
    pub last_seq: u64,
    /// Deltas currently stored (not yet compacted)
    pub delta_count: u64,
    /// Files covered by the latest snapshot set
    pub snapshot_files: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = now_secs();
        Self {
            doc_id: doc_id.to_string(),
            last_seq: 0,
            delta_count: 0,
            snapshot_files: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredDelta {
    file: String,
    update: Vec<u8>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed [`DeltaLog`].
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Global append sequence, recovered from the highest stored key
    sequence: AtomicU64,
    /// Serializes metadata read-modify-write
    meta_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened delta log at {} (sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            meta_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DELTAS => opts.set_max_write_buffer_number(4),
            _ => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    /// Highest sequence found in any delta key.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_DELTAS) else {
            return Ok(0);
        };
        let mut max = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = seq_from_key(&key) {
                max = max.max(seq);
            }
        }
        Ok(max)
    }

    /// Per-document counters, if anything was ever written for `doc_id`.
    pub fn load_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    /// Current global sequence.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn keys_with_prefix(
        &self,
        cf: &rocksdb::ColumnFamily,
        prefix: &[u8],
    ) -> Result<Vec<Box<[u8]>>, StoreError> {
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn metadata_or_new(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    fn lock_meta(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.meta_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("metadata lock poisoned".into()))
    }
}

impl DeltaLog for DocumentStore {
    fn append(&self, doc_id: &str, file: &str, update: &[u8]) -> Result<u64, StoreError> {
        let prefix = doc_prefix(doc_id)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let record = StoredDelta { file: file.to_string(), update: update.to_vec() };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let _guard = self.lock_meta()?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.last_seq = seq;
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_deltas, delta_key(&prefix, seq), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(seq)
    }

    fn load(&self, doc_id: &str) -> Result<Vec<LoggedDelta>, StoreError> {
        let prefix = doc_prefix(doc_id)?;
        let mut out = Vec::new();

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        for item in self.db.iterator_cf(cf_docs, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let file = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            out.push(LoggedDelta { seq: 0, file, update });
        }

        let cf_deltas = self.cf(CF_DELTAS)?;
        for item in self.db.iterator_cf(cf_deltas, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(seq) = seq_from_key(&key) else {
                continue;
            };
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let (record, _): (StoredDelta, usize) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            out.push(LoggedDelta { seq, file: record.file, update: record.update });
        }

        Ok(out)
    }

    fn compact(
        &self,
        doc_id: &str,
        snapshots: &[(String, Vec<u8>)],
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(doc_id)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock_meta()?;
        let mut batch = WriteBatch::default();

        for (file, snapshot) in snapshots {
            let mut key = prefix.clone();
            key.extend_from_slice(file.as_bytes());
            batch.put_cf(cf_docs, key, lz4_flex::compress_prepend_size(snapshot));
        }

        let mut removed = 0u64;
        for key in self.keys_with_prefix(cf_deltas, &prefix)? {
            match seq_from_key(&key) {
                Some(seq) if seq <= up_to_seq => {
                    batch.delete_cf(cf_deltas, &key);
                    removed += 1;
                }
                _ => {}
            }
        }

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.delta_count = meta.delta_count.saturating_sub(removed);
        meta.snapshot_files = snapshots.len() as u64;
        meta.updated_at = now_secs();
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);

        // Snapshots and delta removal land atomically
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(removed)
    }
}

fn doc_prefix(doc_id: &str) -> Result<Vec<u8>, StoreError> {
    if doc_id.is_empty() || doc_id.contains('\0') {
        return Err(StoreError::InvalidKey(doc_id.to_string()));
    }
    let mut prefix = Vec::with_capacity(doc_id.len() + 1);
    prefix.extend_from_slice(doc_id.as_bytes());
    prefix.push(0);
    Ok(prefix)
}

fn delta_key(prefix: &[u8], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = key.get(key.len().checked_sub(8)?..)?.try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
