//! Local metadata index: batches, chunks and file records.
//!
//! Every batch is its own JSON document under `<index>.batches/`, rewritten
//! atomically (write-then-rename) after each change to that batch. The index
//! file itself only holds the id sequence and the most recent destination.
//! An edit is applied to a copy of the batch document; the copy replaces the
//! live one only once it is on disk, so a failed write leaves the previous
//! state in place.
//!
//! Writers touching the same batch serialize on the document's mutex (and on
//! `batch_lock` across multi-step updates). Writers on different batches never
//! wait for each other's disk writes.
//!
//! Older indexes kept everything in the index file; they are split into
//! per-batch documents when opened. Snapshots (`backup_to`) use that single
//! file layout, so a snapshot can be opened directly as an index.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use svault_core::{
    Aggregate, Batch, BatchFilter, BatchStatus, ChunkRecord, DestinationTotals, FileRecord,
    SvaultError, SvaultResult,
};

use crate::manifest::Manifest;

const INDEX_VERSION: u32 = 2;

/// Contents of the index file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Header {
    #[serde(default)]
    version: u32,
    /// Last sequence number handed out in a batch id
    #[serde(default)]
    next_seq: u64,
    /// Destination picked for the most recently created batch
    #[serde(default)]
    last_assigned: Option<String>,
}

/// One batch with its chunk and file rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchDocument {
    batch: Batch,
    #[serde(default)]
    chunks: BTreeMap<u64, ChunkRecord>,
    #[serde(default)]
    files: Vec<FileRecord>,
}

/// Whole index in one document: backups, and indexes written before batches
/// got their own files.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    last_assigned: Option<String>,
    #[serde(default)]
    batches: BTreeMap<String, Batch>,
    #[serde(default)]
    chunks: BTreeMap<String, BTreeMap<u64, ChunkRecord>>,
    #[serde(default)]
    files: BTreeMap<String, Vec<FileRecord>>,
}

impl Snapshot {
    fn into_documents(mut self) -> Vec<BatchDocument> {
        let batches = std::mem::take(&mut self.batches);
        batches
            .into_iter()
            .map(|(id, batch)| BatchDocument {
                batch,
                chunks: self.chunks.remove(&id).unwrap_or_default(),
                files: self.files.remove(&id).unwrap_or_default(),
            })
            .collect()
    }
}

/// `None` once the batch has been purged or replaced.
type Slot = Arc<Mutex<Option<BatchDocument>>>;

struct Entry {
    destination: String,
    doc: Slot,
}

impl Entry {
    fn new(doc: BatchDocument) -> Self {
        Self {
            destination: doc.batch.destination.clone(),
            doc: Arc::new(Mutex::new(Some(doc))),
        }
    }
}

/// Attributes of a batch known before its id and destination are assigned.
#[derive(Debug, Clone, Default)]
pub struct BatchDraft {
    pub original_name: String,
    pub source_path: PathBuf,
    pub is_directory: bool,
    pub total_size: u64,
    pub file_count: u64,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub segment_size: u64,
    pub salt: String,
    pub kdf_iterations: u32,
    pub key_check: String,
}

/// Rows of a batch rebuilt from its remote manifest.
#[derive(Debug, Clone)]
pub struct ReconciledBatch {
    pub batch: Batch,
    pub chunks: Vec<ChunkRecord>,
    pub files: Vec<FileRecord>,
}

impl ReconciledBatch {
    fn into_document(self) -> BatchDocument {
        BatchDocument {
            batch: self.batch,
            chunks: self.chunks.into_iter().map(|c| (c.index, c)).collect(),
            files: self.files,
        }
    }
}

pub struct MetadataIndex {
    path: PathBuf,
    batches_dir: PathBuf,
    header: Mutex<Header>,
    docs: RwLock<BTreeMap<String, Entry>>,
    batch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataIndex {
    /// Open the index at `path`, starting empty if the file does not exist.
    ///
    /// An unreadable or unparseable file is reported, never repaired.
    pub fn open(path: &Path) -> SvaultResult<Self> {
        let batches_dir = path.with_extension("batches");
        let snapshot: Snapshot = if path.exists() {
            let content = std::fs::read(path).map_err(|e| unavailable(path, e))?;
            serde_json::from_slice(&content).map_err(|e| unavailable(path, e))?
        } else {
            Snapshot::default()
        };
        let header = Header {
            version: INDEX_VERSION,
            next_seq: snapshot.next_seq,
            last_assigned: snapshot.last_assigned.clone(),
        };

        let mut docs = load_documents(&batches_dir)?;
        let legacy = snapshot.into_documents();
        if !legacy.is_empty() {
            let count = legacy.len();
            for doc in legacy {
                let id = doc.batch.batch_id.clone();
                if docs.contains_key(&id) {
                    continue;
                }
                write_atomic(&batches_dir.join(format!("{id}.json")), &doc)?;
                docs.insert(id, doc);
            }
            write_atomic(path, &header)?;
            info!(path = %path.display(), batches = count, "index split into per-batch documents");
        }
        debug!(path = %path.display(), batches = docs.len(), "index loaded");

        Ok(Self {
            path: path.to_path_buf(),
            batches_dir,
            header: Mutex::new(header),
            docs: RwLock::new(docs.into_iter().map(|(id, d)| (id, Entry::new(d))).collect()),
            batch_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Per-batch async lock. Hold it across a multi-step update of one batch.
    pub fn batch_lock(&self, batch_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .batch_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(batch_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn header(&self) -> MutexGuard<'_, Header> {
        self.header.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn docs(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.docs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn docs_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.docs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn doc_path(&self, batch_id: &str) -> PathBuf {
        self.batches_dir.join(format!("{batch_id}.json"))
    }

    fn slot(&self, batch_id: &str) -> SvaultResult<Slot> {
        self.docs()
            .get(batch_id)
            .map(|e| e.doc.clone())
            .ok_or_else(|| SvaultError::BatchNotFound(batch_id.to_string()))
    }

    /// Read from one batch document.
    fn view<T>(&self, batch_id: &str, f: impl FnOnce(&BatchDocument) -> T) -> SvaultResult<T> {
        let slot = self.slot(batch_id)?;
        let doc = lock_slot(&slot);
        doc.as_ref()
            .map(f)
            .ok_or_else(|| SvaultError::BatchNotFound(batch_id.to_string()))
    }

    /// Apply `f` to a copy of one batch document, persist it, then swap it in.
    fn mutate<T>(
        &self,
        batch_id: &str,
        f: impl FnOnce(&mut BatchDocument) -> SvaultResult<T>,
    ) -> SvaultResult<T> {
        let slot = self.slot(batch_id)?;
        let mut live = lock_slot(&slot);
        let Some(current) = live.as_ref() else {
            return Err(SvaultError::BatchNotFound(batch_id.to_string()));
        };
        let mut next = current.clone();
        let out = f(&mut next)?;
        write_atomic(&self.doc_path(batch_id), &next)?;
        *live = Some(next);
        Ok(out)
    }

    /// Create a batch row and its file rows.
    ///
    /// `choose` receives the per-destination assignment counts and the most
    /// recently assigned destination, and returns the destination to use.
    /// Creations are serialized so concurrent slices see each other's choice.
    pub fn create_batch<F>(
        &self,
        draft: BatchDraft,
        files: Vec<FileRecord>,
        choose: F,
    ) -> SvaultResult<Batch>
    where
        F: FnOnce(&BTreeMap<String, u64>, Option<&str>) -> SvaultResult<String>,
    {
        let mut header = self.header();
        let loads = self.destination_loads();
        let destination = choose(&loads, header.last_assigned.as_deref())?;

        let now = Utc::now();
        let stamp = now.format("%Y%m%d_%H%M%S");
        let mut seq = header.next_seq + 1;
        let mut batch_id = format!("BATCH_{stamp}_{seq:04}");
        while self.contains(&batch_id) {
            seq += 1;
            batch_id = format!("BATCH_{stamp}_{seq:04}");
        }

        let batch = Batch {
            batch_id: batch_id.clone(),
            original_name: draft.original_name,
            source_path: draft.source_path,
            is_directory: draft.is_directory,
            total_size: draft.total_size,
            file_count: draft.file_count,
            chunk_count: 0,
            stored_size: 0,
            status: BatchStatus::Pending,
            created_at: now.timestamp(),
            title: draft.title,
            tags: draft.tags,
            description: draft.description,
            destination: destination.clone(),
            segment_size: draft.segment_size,
            salt: draft.salt,
            kdf_iterations: draft.kdf_iterations,
            key_check: draft.key_check,
            card_id: None,
            manifest_locator: None,
        };

        // A sequence number is never handed out twice, even if the batch
        // document below fails to persist.
        let next_header = Header {
            version: INDEX_VERSION,
            next_seq: seq,
            last_assigned: Some(destination),
        };
        write_atomic(&self.path, &next_header)?;
        *header = next_header;

        let doc = BatchDocument {
            batch: batch.clone(),
            chunks: BTreeMap::new(),
            files,
        };
        write_atomic(&self.doc_path(&batch_id), &doc)?;
        self.docs_mut().insert(batch_id, Entry::new(doc));
        Ok(batch)
    }

    pub fn get_batch(&self, batch_id: &str) -> SvaultResult<Batch> {
        self.view(batch_id, |doc| doc.batch.clone())
    }

    /// A batch and its chunk rows, ordered by index.
    pub fn batch_with_chunks(&self, batch_id: &str) -> SvaultResult<(Batch, Vec<ChunkRecord>)> {
        self.view(batch_id, |doc| {
            (doc.batch.clone(), doc.chunks.values().cloned().collect())
        })
    }

    pub fn files(&self, batch_id: &str) -> SvaultResult<Vec<FileRecord>> {
        self.view(batch_id, |doc| doc.files.clone())
    }

    /// Apply an in-place edit to a batch row.
    pub fn update_batch(
        &self,
        batch_id: &str,
        edit: impl FnOnce(&mut Batch),
    ) -> SvaultResult<Batch> {
        self.mutate(batch_id, |doc| {
            edit(&mut doc.batch);
            Ok(doc.batch.clone())
        })
    }

    pub fn mark_status(&self, batch_id: &str, status: BatchStatus) -> SvaultResult<Batch> {
        self.update_batch(batch_id, |b| b.status = status)
    }

    /// Insert or replace one chunk row. The parent batch must exist.
    pub fn record_chunk(&self, record: ChunkRecord) -> SvaultResult<()> {
        let batch_id = record.batch_id.clone();
        self.mutate(&batch_id, |doc| {
            doc.chunks.insert(record.index, record);
            Ok(())
        })
    }

    /// Mark a batch complete and mirror its manifest, in one write.
    pub fn finalize_batch(&self, manifest: &Manifest, manifest_locator: &str) -> SvaultResult<Batch> {
        self.mutate(&manifest.batch_id, |doc| {
            let (mut batch, chunks) = manifest.to_rows(manifest_locator, doc.batch.card_id.clone());
            batch.source_path = doc.batch.source_path.clone();

            doc.chunks = chunks.into_iter().map(|c| (c.index, c)).collect();
            doc.files = manifest.files.clone();
            doc.batch = batch.clone();
            Ok(batch)
        })
    }

    /// Insert a batch rebuilt from the remote history. Returns `false` when a
    /// row with the same id already exists.
    pub fn insert_reconciled(&self, rows: ReconciledBatch) -> SvaultResult<bool> {
        let mut header = self.header();
        let batch_id = rows.batch.batch_id.clone();
        if self.contains(&batch_id) {
            return Ok(false);
        }

        if let Some(seq) = sequence_of(&batch_id).filter(|seq| *seq > header.next_seq) {
            let next_header = Header {
                next_seq: seq,
                ..header.clone()
            };
            write_atomic(&self.path, &next_header)?;
            *header = next_header;
        }

        let doc = rows.into_document();
        write_atomic(&self.doc_path(&batch_id), &doc)?;
        self.docs_mut().insert(batch_id, Entry::new(doc));
        Ok(true)
    }

    /// Replace every row with `rows` in one step. The new documents are
    /// written to a staging directory that is swapped in only once all of
    /// them are on disk; any failure leaves the current rows untouched. The
    /// id sequence keeps counting.
    pub fn replace_all(&self, rows: Vec<ReconciledBatch>) -> SvaultResult<u64> {
        let mut header = self.header();
        let mut docs = self.docs_mut();

        // Hold every current document so no writer persists a stale copy
        // into the swapped-in directory.
        let old: Vec<Slot> = docs.values().map(|e| e.doc.clone()).collect();
        let mut held: Vec<_> = old.iter().map(lock_slot).collect();

        let staging = self.batches_dir.with_extension("staging");
        remove_dir_if_present(&staging)?;
        std::fs::create_dir_all(&staging).map_err(|e| unavailable(&staging, e))?;

        let mut next_seq = header.next_seq;
        let mut next = BTreeMap::new();
        for row in rows {
            let id = row.batch.batch_id.clone();
            if let Some(seq) = sequence_of(&id) {
                next_seq = next_seq.max(seq);
            }
            let doc = row.into_document();
            if let Err(e) = write_atomic(&staging.join(format!("{id}.json")), &doc) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
            next.insert(id, Entry::new(doc));
        }

        let next_header = Header {
            version: INDEX_VERSION,
            next_seq,
            last_assigned: header.last_assigned.clone(),
        };
        if let Err(e) = write_atomic(&self.path, &next_header) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        *header = next_header;

        let retired = self.batches_dir.with_extension("retired");
        remove_dir_if_present(&retired)?;
        if self.batches_dir.exists() {
            std::fs::rename(&self.batches_dir, &retired)
                .map_err(|e| unavailable(&self.batches_dir, e))?;
        }
        if let Err(e) = std::fs::rename(&staging, &self.batches_dir) {
            let _ = std::fs::rename(&retired, &self.batches_dir);
            return Err(unavailable(&self.batches_dir, e));
        }
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %retired.display(), "could not remove replaced batch documents: {e}");
            }
        }

        for doc in held.iter_mut() {
            **doc = None;
        }
        drop(held);

        let dropped = docs.len();
        let inserted = next.len() as u64;
        *docs = next;
        info!(dropped, inserted, "index rows replaced");
        Ok(inserted)
    }

    /// Discard every row. The id sequence keeps counting.
    pub fn reset(&self) -> SvaultResult<()> {
        self.replace_all(Vec::new()).map(drop)
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        self.docs().contains_key(batch_id)
    }

    /// Remove a batch with its chunk and file rows.
    pub fn purge_batch(&self, batch_id: &str) -> SvaultResult<()> {
        let slot = self.slot(batch_id)?;
        let mut doc = lock_slot(&slot);
        if doc.is_none() {
            return Err(SvaultError::BatchNotFound(batch_id.to_string()));
        }
        let path = self.doc_path(batch_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(&path, e)),
        }
        *doc = None;
        drop(doc);

        let mut docs = self.docs_mut();
        if docs.get(batch_id).is_some_and(|e| Arc::ptr_eq(&e.doc, &slot)) {
            docs.remove(batch_id);
        }
        Ok(())
    }

    fn all_batches(&self) -> Vec<Batch> {
        let slots: Vec<Slot> = self.docs().values().map(|e| e.doc.clone()).collect();
        slots
            .iter()
            .filter_map(|slot| lock_slot(slot).as_ref().map(|d| d.batch.clone()))
            .collect()
    }

    /// Batches matching `filter`, oldest first.
    pub fn list_batches(&self, filter: &BatchFilter) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .all_batches()
            .into_iter()
            .filter(|b| filter.matches(b))
            .collect();
        batches.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        batches
    }

    /// Totals over the stored rows. Tombstoned batches only show up in
    /// `by_status`.
    pub fn stats(&self) -> Aggregate {
        let mut agg = Aggregate::default();
        for batch in self.all_batches() {
            *agg.by_status.entry(batch.status.to_string()).or_default() += 1;
            if batch.status == BatchStatus::Deleted {
                continue;
            }
            agg.batch_count += 1;
            agg.total_size += batch.total_size;
            agg.stored_size += batch.stored_size;
            agg.chunk_count += batch.chunk_count;
            agg.file_count += batch.file_count;
            let dest = agg
                .by_destination
                .entry(batch.destination.clone())
                .or_insert_with(DestinationTotals::default);
            dest.batches += 1;
            dest.stored_size += batch.stored_size;
        }
        agg
    }

    /// Number of batches ever assigned to each destination, whatever their
    /// status.
    pub fn destination_loads(&self) -> BTreeMap<String, u64> {
        let mut loads = BTreeMap::new();
        for entry in self.docs().values() {
            *loads.entry(entry.destination.clone()).or_default() += 1;
        }
        loads
    }

    fn snapshot(&self) -> Snapshot {
        let header = self.header().clone();
        let slots: Vec<Slot> = self.docs().values().map(|e| e.doc.clone()).collect();
        let mut snapshot = Snapshot {
            version: header.version,
            next_seq: header.next_seq,
            last_assigned: header.last_assigned,
            ..Default::default()
        };
        for slot in &slots {
            if let Some(doc) = lock_slot(slot).as_ref() {
                let id = doc.batch.batch_id.clone();
                snapshot.chunks.insert(id.clone(), doc.chunks.clone());
                snapshot.files.insert(id.clone(), doc.files.clone());
                snapshot.batches.insert(id, doc.batch.clone());
            }
        }
        snapshot
    }

    /// Snapshot of the whole index as one JSON document.
    pub fn backup_bytes(&self) -> SvaultResult<Vec<u8>> {
        serde_json::to_vec_pretty(&self.snapshot()).map_err(|e| SvaultError::Other(e.into()))
    }

    /// Write a snapshot of the whole index to `dest`.
    pub fn backup_to(&self, dest: &Path) -> SvaultResult<()> {
        write_atomic(dest, &self.snapshot())?;
        info!(path = %dest.display(), "index backup written");
        Ok(())
    }
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<BatchDocument>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load_documents(dir: &Path) -> SvaultResult<BTreeMap<String, BatchDocument>> {
    let mut docs = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(docs),
        Err(e) => return Err(unavailable(dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| unavailable(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read(&path).map_err(|e| unavailable(&path, e))?;
        let doc: BatchDocument =
            serde_json::from_slice(&content).map_err(|e| unavailable(&path, e))?;
        docs.insert(doc.batch.batch_id.clone(), doc);
    }
    Ok(docs)
}

/// Trailing sequence number of a `BATCH_..._NNNN` id.
fn sequence_of(batch_id: &str) -> Option<u64> {
    batch_id.rsplit('_').next()?.parse().ok()
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> SvaultResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| unavailable(path, e))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json).map_err(|e| unavailable(path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| unavailable(path, e))?;
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> SvaultResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(unavailable(dir, e)),
    }
}

fn unavailable(path: &Path, reason: impl std::fmt::Display) -> SvaultError {
    SvaultError::IndexUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
