//! Process-wide table of live documents.
//!
//! ```text
//! get_or_create(id)
//!   │  lock table ── entry(id) ── clone Arc<OnceCell> ── unlock
//!   ▼
//! OnceCell::get_or_try_init ── exactly one caller builds, others wait
//!   │   ├─ replay delta log      (blocking pool)
//!   │   ├─ list project files    (blocking pool)
//!   │   └─ seed sub-docs the log never saw, log the seeding deltas
//!   ▼
//! Arc<Document>
//! ```
//!
//! The table lock is only held to look up or swap a cell, never across
//! disk I/O. A failed build removes its cell so the next attempt starts
//! from scratch.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use crate::connection::{Connection, ConnectionId};
use crate::document::{Attachment, Document, DocumentConfig};
use crate::error::CollabError;
use crate::hydration::{self, FileStore};
use crate::replica::Replica;
use crate::storage::DeltaLog;

type Slot = Arc<OnceCell<Arc<Document>>>;

/// Owner of every live [`Document`], injected where needed.
pub struct DocumentRegistry {
    documents: Mutex<HashMap<String, Slot>>,
    files: Arc<dyn FileStore>,
    log: Option<Arc<dyn DeltaLog>>,
    config: DocumentConfig,
}

impl DocumentRegistry {
    pub fn new(
        files: Arc<dyn FileStore>,
        log: Option<Arc<dyn DeltaLog>>,
        config: DocumentConfig,
    ) -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            files,
            log,
            config,
        }
    }

    /// The live document for `doc_id`, building it on first use.
    pub async fn get_or_create(
        &self,
        doc_id: &str,
        project_path: &Path,
    ) -> Result<Arc<Document>, CollabError> {
        loop {
            let slot = {
                let mut docs = self.documents.lock().await;
                docs.entry(doc_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let built = slot
                .get_or_try_init(|| self.build(doc_id, project_path))
                .await
                .cloned();

            let mut docs = self.documents.lock().await;
            let current = docs.get(doc_id).cloned();
            match built {
                Ok(doc) => match current {
                    Some(cur) if Arc::ptr_eq(&cur, &slot) => return Ok(doc),
                    // Our cell was dropped by a failed builder we raced with
                    None => {
                        docs.insert(doc_id.to_string(), slot);
                        return Ok(doc);
                    }
                    // Someone else replaced it; use theirs
                    Some(_) => continue,
                },
                Err(e) => {
                    if let Some(cur) = current {
                        if Arc::ptr_eq(&cur, &slot) && cur.get().is_none() {
                            docs.remove(doc_id);
                        }
                    }
                    log::warn!("Failed to create document {doc_id}: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn build(&self, doc_id: &str, project_path: &Path) -> Result<Arc<Document>, CollabError> {
        let mut replica = Replica::new();
        let mut last_seq = 0u64;
        let mut logged = HashSet::new();

        if let Some(log) = &self.log {
            let log = Arc::clone(log);
            let id = doc_id.to_string();
            let records = tokio::task::spawn_blocking(move || log.load(&id)).await??;
            let replayed = records.len();
            for record in records {
                last_seq = last_seq.max(record.seq);
                logged.insert(record.file.clone());
                if let Err(e) = replica.sub_doc(&record.file).apply_remote_delta(&record.update) {
                    log::warn!("Skipping corrupt log record {} for {doc_id}/{}: {e}", record.seq, record.file);
                }
            }
            if replayed > 0 {
                log::info!("Replayed {replayed} log records for document {doc_id}");
            }
        }

        let files = Arc::clone(&self.files);
        let path = project_path.to_path_buf();
        let listed = tokio::task::spawn_blocking(move || files.list_text_files(&path)).await??;
        let listed_count = listed.len();

        let seeded = hydration::seed(&mut replica, listed, &logged);
        if let Some(log) = &self.log {
            for (file, delta) in &seeded {
                match log.append(doc_id, file, delta) {
                    Ok(seq) => last_seq = last_seq.max(seq),
                    Err(e) => log::error!("Failed to log seed of {doc_id}/{file}: {e}"),
                }
            }
        }

        log::info!(
            "Created document {doc_id} from {} ({listed_count} files, {} seeded)",
            project_path.display(),
            seeded.len()
        );

        Ok(Arc::new(Document::new(
            doc_id,
            project_path,
            replica,
            self.config,
            self.log.clone(),
            last_seq,
        )))
    }

    /// Attach `connection` to the document, creating it if needed.
    pub async fn attach(
        &self,
        doc_id: &str,
        project_path: &Path,
        connection: Connection,
    ) -> Result<(Arc<Document>, Attachment), CollabError> {
        loop {
            let doc = self.get_or_create(doc_id, project_path).await?;
            match doc.attach(connection.clone()).await {
                Ok(attachment) => return Ok((doc, attachment)),
                // Lost a race with the last detach; start over on a fresh build
                Err(CollabError::Evicted(_)) => self.forget(&doc).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach a connection; evict the document if it was the last one.
    pub async fn detach(&self, doc: &Arc<Document>, connection: ConnectionId) {
        let outcome = doc.detach(connection).await;
        if !outcome.now_empty {
            return;
        }

        if let (Some(log), Some((snapshots, up_to_seq))) = (&self.log, outcome.snapshot) {
            let log = Arc::clone(log);
            let id = doc.id().to_string();
            let files = snapshots.len();
            let compacted =
                tokio::task::spawn_blocking(move || log.compact(&id, &snapshots, up_to_seq)).await;
            match compacted {
                Ok(Ok(removed)) => log::info!(
                    "Snapshotted {files} files of {} and compacted {removed} deltas",
                    doc.id()
                ),
                Ok(Err(e)) => log::error!("Failed to compact log for {}: {e}", doc.id()),
                Err(e) => log::error!("Compaction task for {} failed: {e}", doc.id()),
            }
        }

        self.forget(doc).await;
        log::info!("Evicted document {}", doc.id());
    }

    /// Drop `doc` from the table if it is still the registered instance.
    async fn forget(&self, doc: &Arc<Document>) {
        let mut docs = self.documents.lock().await;
        let registered = docs
            .get(doc.id())
            .and_then(|slot| slot.get())
            .is_some_and(|live| Arc::ptr_eq(live, doc));
        if registered {
            docs.remove(doc.id());
        }
    }

    /// The live document, without creating one.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<Document>> {
        let docs = self.documents.lock().await;
        docs.get(doc_id).and_then(|slot| slot.get().cloned())
    }

    pub async fn contains(&self, doc_id: &str) -> bool {
        self.get(doc_id).await.is_some()
    }

    /// Number of live documents.
    pub async fn len(&self) -> usize {
        let docs = self.documents.lock().await;
        docs.values().filter(|slot| slot.get().is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Merged text of `file` in a live document.
    pub async fn current_text(&self, doc_id: &str, file: &str) -> Option<String> {
        self.get(doc_id).await?.text(file).await
    }

    /// Write the merged text of `file` back through the file store.
    ///
    /// Only the explicit-save path calls this; live edits are never
    /// flushed to disk on their own.
    pub async fn write_back(&self, doc_id: &str, file: &str) -> Result<(), CollabError> {
        let doc = self
            .get(doc_id)
            .await
            .ok_or_else(|| CollabError::NotLive(doc_id.to_string()))?;
        let text = doc
            .text(file)
            .await
            .ok_or_else(|| CollabError::UnknownFile(file.to_string()))?;

        let files = Arc::clone(&self.files);
        let project_path: PathBuf = doc.project_path().to_path_buf();
        let relative = file.to_string();
        tokio::task::spawn_blocking(move || files.save(&project_path, &relative, &text)).await??;
        log::info!("Wrote back {doc_id}/{file}");
        Ok(())
    }
}
