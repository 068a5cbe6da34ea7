//! Slicing and resuming.
//!
//! The packed stream is produced on blocking threads: one writes the tar
//! stream into a pipe, another cuts it into segments, compresses, encrypts
//! and hashes each one. Staged chunks cross a bounded channel to the async
//! side, which uploads them with bounded concurrency and records every
//! outcome in the index as it happens. Memory stays at a few chunks no matter
//! how large the input is.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svault_chunks::{
    compress, expected_chunk_count, hash_bytes, hash_to_hex, scan, write_archive, Chunker,
    ScanResult,
};
use svault_core::{
    format_bytes, BatchStatus, ChunkRecord, ChunkStatus, FileRecord, SvaultError,
    SvaultResult,
};
use svault_crypto::{encode_salt, encrypt_chunk, generate_salt, key_check, verify_key_check, BatchKey};
use svault_storage::{BlobMeta, BlobTransport, CardChannel};

use crate::card::render_card;
use crate::distribution::choose_destination;
use crate::engine::{crypto_error, join_error, transport_error, Engine, Progress, ProgressFn, SliceOptions};
use crate::index::{BatchDraft, MetadataIndex};
use crate::manifest::{encode, Manifest};
use crate::retry::{with_retry, RetryPolicy};

/// A compressed, encrypted segment waiting to be sent.
struct StagedChunk {
    index: u64,
    plain_size: u64,
    plain_hash: String,
    cipher_hash: String,
    data: Bytes,
    prior_attempts: u32,
}

/// How far the producer got through the packed stream.
struct StreamSummary {
    /// Segments seen, uploaded before or not
    total: u64,
    /// Reached the end of the stream
    complete: bool,
}

#[derive(Clone)]
struct UploadCtx {
    batch_id: String,
    destination: String,
    blobs: Arc<dyn BlobTransport>,
    index: Arc<MetadataIndex>,
    retry: RetryPolicy,
    progress: Option<ProgressFn>,
    uploaded: Arc<AtomicU64>,
}

impl UploadCtx {
    fn emit(&self, event: Progress) {
        if let Some(cb) = &self.progress {
            cb(&event);
        }
    }
}

impl Engine {
    /// Pack `input` (a file or folder) into a new batch and upload it.
    ///
    /// Returns the batch id. On partial failure or cancellation the batch is
    /// left `failed` and can be resumed.
    pub async fn slice(&self, input: &Path, options: SliceOptions) -> SvaultResult<String> {
        let scanned = self.scan_input(input).await?;
        let segment_size = self.settings.segment_size()?;

        let salt = generate_salt();
        let key = self.derive_key_raw(salt, self.settings.kdf).await?;

        let draft = BatchDraft {
            original_name: scanned.root_name.clone(),
            source_path: std::path::absolute(input)?,
            is_directory: scanned.is_directory,
            total_size: scanned.total_size(),
            file_count: scanned.files.len() as u64,
            title: options.title.clone(),
            tags: options.tags.clone(),
            description: options.description.clone(),
            segment_size,
            salt: encode_salt(&salt),
            kdf_iterations: self.settings.kdf.iterations,
            key_check: key_check(&key),
        };

        let configured = &self.settings.destinations;
        let explicit = options.destination.as_deref();
        let batch = self
            .index
            .create_batch(draft, scanned.records(), |loads, last| {
                choose_destination(configured, explicit, loads, last)
            })?;
        let batch_id = batch.batch_id.clone();

        info!(
            batch_id = %batch_id,
            destination = %batch.destination,
            files = batch.file_count,
            size = %format_bytes(batch.total_size),
            skipped = scanned.skipped,
            "batch created"
        );
        self.emit(Progress::Scanned {
            batch_id: batch_id.clone(),
            files: batch.file_count,
            bytes: batch.total_size,
            estimated_chunks: expected_chunk_count(batch.total_size, segment_size).max(1),
        });

        if let Some(card_id) = self.refresh_card(&batch, 0).await {
            self.index
                .update_batch(&batch_id, |b| b.card_id = Some(card_id))?;
        }

        let cancel = options.cancel.unwrap_or_default();
        self.upload_batch(&batch_id, scanned, key, cancel, "slice").await?;
        Ok(batch_id)
    }

    /// Finish an interrupted batch, uploading only the chunks still owed.
    pub async fn resume(&self, batch_id: &str) -> SvaultResult<()> {
        self.resume_with(batch_id, CancellationToken::new()).await
    }

    pub async fn resume_with(&self, batch_id: &str, cancel: CancellationToken) -> SvaultResult<()> {
        let batch = self.index.get_batch(batch_id)?;
        if !batch.status.is_resumable() {
            return Err(SvaultError::InvalidState {
                batch_id: batch_id.to_string(),
                status: batch.status,
                operation: "resume",
            });
        }

        let scanned = self.scan_input(&batch.source_path).await?;
        let recorded = self.index.files(batch_id)?;
        if let Some(err) = first_file_difference(batch_id, &recorded, &scanned.records()) {
            return Err(err);
        }

        let key = self.derive_key(&batch.salt, batch.kdf_iterations).await?;
        if !verify_key_check(&key, &batch.key_check) {
            return Err(SvaultError::KeyMismatch {
                batch_id: batch_id.to_string(),
            });
        }

        info!(batch_id, status = %batch.status, "resuming batch");
        self.upload_batch(batch_id, scanned, key, cancel, "resume").await
    }

    async fn scan_input(&self, input: &Path) -> SvaultResult<ScanResult> {
        if tokio::fs::metadata(input).await.is_err() {
            return Err(SvaultError::InputNotFound(input.to_path_buf()));
        }
        let path = input.to_path_buf();
        let exclude = self.settings.exclude.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&path, &exclude))
            .await
            .map_err(join_error)?;
        scanned.map_err(|e| {
            if input.exists() {
                SvaultError::Other(e)
            } else {
                SvaultError::InputNotFound(input.to_path_buf())
            }
        })
    }

    /// Stream, upload and record every chunk of a batch not yet uploaded.
    ///
    /// The batch is re-read under its lock: another slice or resume may have
    /// finished it while this one waited.
    async fn upload_batch(
        &self,
        batch_id: &str,
        scanned: ScanResult,
        key: BatchKey,
        cancel: CancellationToken,
        operation: &'static str,
    ) -> SvaultResult<()> {
        let lock = self.index.batch_lock(batch_id);
        let _guard = lock.lock().await;

        let batch = self.index.get_batch(batch_id)?;
        if !batch.status.is_resumable() {
            return Err(SvaultError::InvalidState {
                batch_id: batch_id.to_string(),
                status: batch.status,
                operation,
            });
        }
        let batch_id = batch.batch_id.clone();

        let ensured = with_retry(&self.settings.retry, "ensure destination", || {
            let blobs = self.blobs.clone();
            let dest = batch.destination.clone();
            async move { blobs.ensure_destination(&dest).await }
        })
        .await;
        if let Err(e) = ensured.result {
            let err = transport_error(format!("preparing destination {}", batch.destination), e);
            return Err(self.fail(&batch_id, err));
        }

        let (_, rows) = self.index.batch_with_chunks(&batch_id)?;
        let already = rows
            .iter()
            .filter(|c| c.status == ChunkStatus::Uploaded)
            .count() as u64;
        let existing: HashMap<u64, ChunkRecord> = rows.into_iter().map(|c| (c.index, c)).collect();
        self.index.mark_status(&batch_id, BatchStatus::Uploading)?;

        let uploaded = Arc::new(AtomicU64::new(already));
        let ctx = UploadCtx {
            batch_id: batch_id.clone(),
            destination: batch.destination.clone(),
            blobs: self.blobs.clone(),
            index: self.index.clone(),
            retry: self.settings.retry,
            progress: self.progress.clone(),
            uploaded: uploaded.clone(),
        };

        let concurrency = self.settings.upload_concurrency.max(1);
        let (tx, mut rx) = mpsc::channel::<StagedChunk>(concurrency);
        let producer = {
            let batch_id = batch_id.clone();
            let segment_size = batch.segment_size as usize;
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                produce(&batch_id, scanned, segment_size, &key, &existing, &cancel, tx)
            })
        };

        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(card_ticker(
            self.cards.clone(),
            self.index.clone(),
            batch_id.clone(),
            uploaded.clone(),
            self.settings.card_update_interval,
            ticker_stop.clone(),
        ));

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut cancelled = false;
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => { cancelled = true; break; }
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| SvaultError::Other(e.into()))?
                }
            };
            let staged = tokio::select! {
                biased;
                _ = cancel.cancelled() => { cancelled = true; break; }
                staged = rx.recv() => match staged {
                    Some(staged) => staged,
                    None => break,
                },
            };
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                upload_chunk(ctx, staged).await
            });
        }
        drop(rx);

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let res = joined.map_err(join_error).and_then(|r| r);
            if let Err(e) = res {
                fatal.get_or_insert(e);
            }
        }
        ticker_stop.cancel();
        let _ = ticker.await;

        let produced = producer.await.map_err(join_error)?;
        if let Some(err) = fatal {
            return Err(self.fail(&batch_id, err));
        }
        let summary = match produced {
            Ok(summary) => summary,
            Err(err) => return Err(self.fail(&batch_id, err)),
        };

        let (_, rows) = self.index.batch_with_chunks(&batch_id)?;
        let done = rows
            .iter()
            .filter(|c| c.index < summary.total && c.status == ChunkStatus::Uploaded)
            .count() as u64;

        if !summary.complete || (cancelled && done < summary.total) {
            warn!(batch_id = %batch_id, uploaded = done, "upload cancelled");
            self.mark_failed(&batch_id);
            return Err(SvaultError::Cancelled {
                batch_id,
                uploaded: done,
            });
        }

        let total = summary.total;
        self.index.update_batch(&batch_id, |b| b.chunk_count = total)?;

        let failed: Vec<u64> = (0..total)
            .filter(|i| {
                !rows
                    .iter()
                    .any(|c| c.index == *i && c.status == ChunkStatus::Uploaded)
            })
            .collect();
        if !failed.is_empty() {
            let err = SvaultError::PartialUpload {
                batch_id: batch_id.clone(),
                uploaded: done,
                total,
                failed,
            };
            return Err(self.fail(&batch_id, err));
        }

        self.record_batch(&batch_id)
            .await
            .map_err(|e| self.fail(&batch_id, e))
    }

    /// Upload the manifest, publish the final card and mark the batch
    /// complete.
    async fn record_batch(&self, batch_id: &str) -> SvaultResult<()> {
        let (batch, chunks) = self.index.batch_with_chunks(batch_id)?;
        let files = self.index.files(batch_id)?;
        let manifest = Manifest::from_batch(&batch, &chunks, &files)?;
        let bytes = Bytes::from(encode(&manifest)?);

        let meta = BlobMeta::manifest(batch_id);
        let attempt = with_retry(&self.settings.retry, "upload manifest", || {
            let blobs = self.blobs.clone();
            let dest = batch.destination.clone();
            let data = bytes.clone();
            let meta = meta.clone();
            async move { blobs.upload_blob(&dest, data, &meta).await }
        })
        .await;
        let locator = attempt
            .result
            .map_err(|e| transport_error("uploading manifest", e))?;

        let (complete, _) = manifest.to_rows(locator.as_str(), batch.card_id.clone());
        let card_id = self
            .publish_card(&complete, manifest.chunks.len() as u64)
            .await?;
        if batch.card_id.as_deref() != Some(card_id.as_str()) {
            self.index
                .update_batch(batch_id, |b| b.card_id = Some(card_id))?;
        }

        let finalized = self.index.finalize_batch(&manifest, locator.as_str())?;
        info!(
            batch_id,
            chunks = finalized.chunk_count,
            stored = %format_bytes(finalized.stored_size),
            manifest = %locator,
            "batch complete"
        );
        Ok(())
    }

    /// Mark a batch failed (resumable) and hand back `err`.
    fn fail(&self, batch_id: &str, err: SvaultError) -> SvaultError {
        warn!(batch_id, kind = err.kind(), "batch failed: {err}");
        self.mark_failed(batch_id);
        err
    }

    fn mark_failed(&self, batch_id: &str) {
        if let Err(mark) = self.index.mark_status(batch_id, BatchStatus::Failed) {
            warn!(batch_id, "could not mark batch failed: {mark}");
        }
    }
}

/// Blocking half of the pipeline: pack, segment, compress, encrypt.
fn produce(
    batch_id: &str,
    scanned: ScanResult,
    segment_size: usize,
    key: &BatchKey,
    existing: &HashMap<u64, ChunkRecord>,
    cancel: &CancellationToken,
    tx: mpsc::Sender<StagedChunk>,
) -> SvaultResult<StreamSummary> {
    let (reader, writer) = std::io::pipe()?;
    let packer = std::thread::Builder::new()
        .name("svault-pack".into())
        .spawn(move || write_archive(&scanned, writer).map(drop))?;

    let mut summary = StreamSummary {
        total: 0,
        complete: true,
    };
    let mut outcome = Ok(());

    for segment in Chunker::new(reader, segment_size) {
        if cancel.is_cancelled() {
            summary.complete = false;
            break;
        }
        let segment = match segment {
            Ok(segment) => segment,
            Err(e) => {
                outcome = Err(SvaultError::Io(e));
                break;
            }
        };
        summary.total = segment.index + 1;
        let plain_hash = hash_to_hex(&segment.hash);

        let prior = existing.get(&segment.index);
        if let Some(row) = prior {
            if !row.plain_hash.is_empty() && row.plain_hash != plain_hash {
                outcome = Err(SvaultError::chunk_integrity(
                    batch_id,
                    segment.index,
                    row.plain_hash.clone(),
                    plain_hash,
                ));
                break;
            }
            if row.status == ChunkStatus::Uploaded {
                debug!(batch_id, index = segment.index, "chunk already uploaded");
                continue;
            }
        }

        let staged = compress(&segment.data)
            .map_err(SvaultError::Other)
            .and_then(|compressed| {
                encrypt_chunk(key, batch_id, segment.index, &compressed)
                    .map_err(|e| crypto_error(batch_id, segment.index, e))
            })
            .map(|encrypted| StagedChunk {
                index: segment.index,
                plain_size: segment.data.len() as u64,
                plain_hash,
                cipher_hash: hash_to_hex(&hash_bytes(&encrypted)),
                data: Bytes::from(encrypted),
                prior_attempts: prior.map(|r| r.attempts).unwrap_or(0),
            });
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };

        if tx.blocking_send(staged).is_err() {
            // Receiver gone: the upload side stopped scheduling.
            summary.complete = false;
            break;
        }
    }

    let packed = packer
        .join()
        .map_err(|_| SvaultError::Other(anyhow::anyhow!("packing thread panicked")))?;
    outcome?;
    if summary.complete {
        packed.map_err(SvaultError::Other)?;
    }
    Ok(summary)
}

async fn upload_chunk(ctx: UploadCtx, staged: StagedChunk) -> SvaultResult<()> {
    let meta = BlobMeta::chunk(&ctx.batch_id, staged.index);
    let attempt = with_retry(&ctx.retry, "upload chunk", || {
        let blobs = ctx.blobs.clone();
        let dest = ctx.destination.clone();
        let data = staged.data.clone();
        let meta = meta.clone();
        async move { blobs.upload_blob(&dest, data, &meta).await }
    })
    .await;

    let mut record = ChunkRecord {
        batch_id: ctx.batch_id.clone(),
        index: staged.index,
        plain_size: staged.plain_size,
        stored_size: staged.data.len() as u64,
        plain_hash: staged.plain_hash,
        cipher_hash: staged.cipher_hash,
        locator: None,
        status: ChunkStatus::Pending,
        attempts: staged.prior_attempts + attempt.attempts,
        last_error: None,
    };

    match attempt.result {
        Ok(locator) => {
            record.locator = Some(locator.into_string());
            record.status = ChunkStatus::Uploaded;
            persist_chunk(&ctx.index, record).await?;
            let uploaded = ctx.uploaded.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(batch_id = %ctx.batch_id, index = staged.index, uploaded, "chunk uploaded");
            ctx.emit(Progress::ChunkUploaded {
                batch_id: ctx.batch_id.clone(),
                index: staged.index,
                uploaded,
            });
        }
        Err(e) => {
            warn!(
                batch_id = %ctx.batch_id,
                index = staged.index,
                attempts = attempt.attempts,
                "chunk upload failed: {e}"
            );
            record.status = ChunkStatus::Failed;
            record.last_error = Some(e.to_string());
            persist_chunk(&ctx.index, record).await?;
            ctx.emit(Progress::ChunkFailed {
                batch_id: ctx.batch_id.clone(),
                index: staged.index,
                error: e.to_string(),
            });
        }
    }
    Ok(())
}

/// Chunk rows are written to disk; keep that off the async workers.
async fn persist_chunk(index: &Arc<MetadataIndex>, record: ChunkRecord) -> SvaultResult<()> {
    let index = index.clone();
    tokio::task::spawn_blocking(move || index.record_chunk(record))
        .await
        .map_err(join_error)?
}

/// Edit the batch card with the upload count, at most once per `every`.
async fn card_ticker(
    cards: Arc<dyn CardChannel>,
    index: Arc<MetadataIndex>,
    batch_id: String,
    uploaded: Arc<AtomicU64>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    let mut last = uploaded.load(Ordering::SeqCst);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = uploaded.load(Ordering::SeqCst);
        if now == last {
            continue;
        }
        last = now;

        let Ok(batch) = index.get_batch(&batch_id) else {
            break;
        };
        let Some(card_id) = batch.card_id.as_deref() else {
            continue;
        };
        if let Err(e) = cards.update_card(card_id, &render_card(&batch, now)).await {
            debug!(batch_id = %batch_id, "progress card update failed: {e}");
        }
    }
}

/// First difference between the recorded and rescanned file lists.
fn first_file_difference(
    batch_id: &str,
    recorded: &[FileRecord],
    current: &[FileRecord],
) -> Option<SvaultError> {
    for rec in recorded {
        match current.iter().find(|c| c.relative_path == rec.relative_path) {
            None => {
                return Some(SvaultError::file_integrity(
                    batch_id,
                    &rec.relative_path,
                    rec.hash.clone(),
                    "missing",
                ))
            }
            Some(cur) if cur.hash != rec.hash => {
                return Some(SvaultError::file_integrity(
                    batch_id,
                    &rec.relative_path,
                    rec.hash.clone(),
                    cur.hash.clone(),
                ))
            }
            Some(cur) if cur != rec => {
                return Some(SvaultError::file_integrity(
                    batch_id,
                    &rec.relative_path,
                    describe(rec),
                    describe(cur),
                ))
            }
            Some(_) => {}
        }
    }
    current
        .iter()
        .find(|c| !recorded.iter().any(|r| r.relative_path == c.relative_path))
        .map(|extra| {
            SvaultError::file_integrity(batch_id, &extra.relative_path, "absent", extra.hash.clone())
        })
}

fn describe(rec: &FileRecord) -> String {
    format!("size {} mode {:o} mtime {}", rec.size, rec.mode, rec.mtime)
}
