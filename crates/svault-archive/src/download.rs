//! Assembling and verifying.
//!
//! Assemble fetches every chunk into a per-batch cache directory, checks
//! each ciphertext hash in sequence order, then streams decrypt and
//! decompress into the tar unpacker on blocking threads. Chunks already in
//! the cache with a matching hash are never downloaded again. The cache of a
//! batch is dropped when the batch is deleted, or right after assembling
//! when the settings say not to keep it.

use bytes::Bytes;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use svault_chunks::{decompress, hash_bytes, hash_file_streaming, hash_to_hex, unpack_archive};
use svault_core::{
    format_bytes, BatchStatus, ChunkMismatch, ChunkRecord, FileRecord, SvaultError, SvaultResult,
    VerifyReport,
};
use svault_crypto::{decrypt_chunk, verify_key_check, BatchKey};
use svault_storage::{BlobTransport, Locator, TransportError};

use crate::engine::{crypto_error, join_error, transport_error, Engine, Progress};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembleReport {
    pub batch_id: String,
    pub output: PathBuf,
    pub files: u64,
    pub bytes: u64,
    /// Chunks fetched from the transport
    pub downloaded: u64,
    /// Chunks served from the local cache
    pub cached: u64,
}

impl Engine {
    /// Restore a complete batch into `output`.
    pub async fn assemble(&self, batch_id: &str, output: &Path) -> SvaultResult<AssembleReport> {
        let (batch, chunks) = self.index.batch_with_chunks(batch_id)?;
        if batch.status != BatchStatus::Complete {
            return Err(SvaultError::InvalidState {
                batch_id: batch_id.to_string(),
                status: batch.status,
                operation: "assemble",
            });
        }
        check_layout(batch_id, batch.chunk_count, &chunks)?;
        let files = self.index.files(batch_id)?;

        let key = self.derive_key(&batch.salt, batch.kdf_iterations).await?;
        if !batch.key_check.is_empty() && !verify_key_check(&key, &batch.key_check) {
            return Err(SvaultError::KeyMismatch {
                batch_id: batch_id.to_string(),
            });
        }

        let cache = self.settings.cache_dir.join(batch_id);
        tokio::fs::create_dir_all(&cache).await?;
        let (downloaded, cached) = self.fetch_into_cache(batch_id, &chunks, &cache).await?;
        debug!(batch_id, downloaded, cached, "chunks local");

        let chunks = Arc::new(chunks);
        {
            let batch_id = batch_id.to_string();
            let chunks = chunks.clone();
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || verify_cached(&batch_id, &chunks, &cache))
                .await
                .map_err(join_error)??;
        }

        let unpacked = {
            let batch_id = batch_id.to_string();
            let chunks = chunks.clone();
            let cache = cache.clone();
            let output = output.to_path_buf();
            // Legacy manifests carry no segment size; their segments stayed
            // under the transport cap.
            let segment_size = match batch.segment_size {
                0 => self.settings.chunk_size_cap,
                n => n,
            };
            tokio::task::spawn_blocking(move || {
                restore(&batch_id, &chunks, &cache, &key, segment_size, &output)
            })
            .await
            .map_err(join_error)??
        };
        self.emit(Progress::Unpacked {
            batch_id: batch_id.to_string(),
            files: unpacked,
        });

        {
            let batch_id = batch_id.to_string();
            let output = output.to_path_buf();
            tokio::task::spawn_blocking(move || check_files(&batch_id, &files, &output))
                .await
                .map_err(join_error)??;
        }

        if !self.settings.keep_chunk_cache {
            if let Err(e) = self.evict_cache(batch_id).await {
                warn!(batch_id, "could not drop chunk cache: {e}");
            }
        }

        info!(
            batch_id,
            output = %output.display(),
            files = unpacked,
            size = %format_bytes(batch.total_size),
            downloaded,
            cached,
            "batch assembled"
        );
        Ok(AssembleReport {
            batch_id: batch_id.to_string(),
            output: output.to_path_buf(),
            files: unpacked,
            bytes: batch.total_size,
            downloaded,
            cached,
        })
    }

    /// Re-fetch every chunk of a complete batch and compare ciphertext hashes.
    /// Nothing is decrypted or cached.
    pub async fn verify(&self, batch_id: &str) -> SvaultResult<VerifyReport> {
        let (batch, chunks) = self.index.batch_with_chunks(batch_id)?;
        if batch.status != BatchStatus::Complete {
            return Err(SvaultError::InvalidState {
                batch_id: batch_id.to_string(),
                status: batch.status,
                operation: "verify",
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.download_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for chunk in &chunks {
            let Some(locator) = chunk.locator.clone() else {
                tasks.spawn(std::future::ready((chunk.index, chunk.cipher_hash.clone(), Ok(None))));
                continue;
            };
            let blobs = self.blobs.clone();
            let retry = self.settings.retry;
            let semaphore = semaphore.clone();
            let index = chunk.index;
            let expected = chunk.cipher_hash.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let fetched = match fetch_blob(&blobs, &retry, &Locator::new(locator)).await {
                    Ok(data) => {
                        match tokio::task::spawn_blocking(move || hash_to_hex(&hash_bytes(&data)))
                            .await
                        {
                            Ok(actual) => Ok(Some(actual)),
                            Err(e) => Err(TransportError::Failure(e.to_string())),
                        }
                    }
                    Err(TransportError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                };
                (index, expected, fetched)
            });
        }

        let mut mismatches = Vec::new();
        let mut failure: Option<(u64, TransportError)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, expected, fetched) = joined.map_err(join_error)?;
            match fetched {
                Ok(Some(actual)) if actual == expected => {}
                Ok(Some(actual)) => mismatches.push(ChunkMismatch {
                    index,
                    expected,
                    actual,
                }),
                Ok(None) => mismatches.push(ChunkMismatch {
                    index,
                    expected,
                    actual: "missing".into(),
                }),
                Err(e) => {
                    if failure.as_ref().map_or(true, |(i, _)| index < *i) {
                        failure = Some((index, e));
                    }
                }
            }
        }
        if let Some((index, e)) = failure {
            return Err(transport_error(format!("fetching chunk {index} of {batch_id}"), e));
        }
        mismatches.sort_by_key(|m| m.index);

        let report = VerifyReport {
            batch_id: batch_id.to_string(),
            chunks_checked: chunks.len() as u64,
            mismatches,
        };
        match report.first_mismatch() {
            None => info!(batch_id, chunks = report.chunks_checked, "batch verified"),
            Some(first) => warn!(
                batch_id,
                index = first.index,
                expected = %first.expected,
                actual = %first.actual,
                mismatches = report.mismatches.len(),
                "batch verification failed"
            ),
        }
        Ok(report)
    }

    /// Remove the local chunk cache of a batch. Returns whether one existed.
    pub async fn evict_cache(&self, batch_id: &str) -> SvaultResult<bool> {
        let mut parts = Path::new(batch_id).components();
        if !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None)) {
            return Err(SvaultError::BatchNotFound(batch_id.to_string()));
        }
        let cache = self.settings.cache_dir.join(batch_id);
        match tokio::fs::remove_dir_all(&cache).await {
            Ok(()) => {
                debug!(batch_id, path = %cache.display(), "chunk cache dropped");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Make every chunk available in `cache`, downloading only what is
    /// missing or stale. Returns (downloaded, cached).
    async fn fetch_into_cache(
        &self,
        batch_id: &str,
        chunks: &[ChunkRecord],
        cache: &Path,
    ) -> SvaultResult<(u64, u64)> {
        let total = chunks.len() as u64;
        let fetched = Arc::new(AtomicU64::new(0));
        let semaphore = Arc::new(Semaphore::new(self.settings.download_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for chunk in chunks {
            let blobs = self.blobs.clone();
            let retry = self.settings.retry;
            let semaphore = semaphore.clone();
            let path = chunk_path(cache, chunk.index);
            let chunk = chunk.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let res = cache_chunk(&blobs, &retry, &chunk, &path).await;
                (chunk.index, res)
            });
        }

        let mut downloaded = 0;
        let mut cached = 0;
        let mut first_error: Option<(u64, SvaultError)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, res) = joined.map_err(join_error)?;
            match res {
                Ok(was_cached) => {
                    if was_cached {
                        cached += 1;
                    } else {
                        downloaded += 1;
                    }
                    let n = fetched.fetch_add(1, Ordering::SeqCst) + 1;
                    self.emit(Progress::ChunkFetched {
                        batch_id: batch_id.to_string(),
                        index,
                        fetched: n,
                        total,
                    });
                }
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(i, _)| index < *i) {
                        first_error = Some((index, e));
                    }
                }
            }
        }

        match first_error {
            Some((index, SvaultError::Transport { message, .. })) => Err(SvaultError::Transport {
                context: format!("fetching chunk {index} of {batch_id}"),
                message,
            }),
            Some((_, e)) => Err(e),
            None => Ok((downloaded, cached)),
        }
    }
}

/// Ensure `path` holds the chunk's ciphertext. Returns whether the cached
/// copy was reused.
async fn cache_chunk(
    blobs: &Arc<dyn BlobTransport>,
    retry: &RetryPolicy,
    chunk: &ChunkRecord,
    path: &Path,
) -> SvaultResult<bool> {
    if let Ok(existing) = tokio::fs::read(path).await {
        if hash_to_hex(&hash_bytes(&existing)) == chunk.cipher_hash {
            return Ok(true);
        }
        debug!(index = chunk.index, "cached chunk is stale");
    }

    let locator = chunk
        .locator
        .clone()
        .ok_or_else(|| SvaultError::chunk_integrity(&chunk.batch_id, chunk.index, "recorded", "missing"))?;
    let data = fetch_blob(blobs, retry, &Locator::new(locator.clone()))
        .await
        .map_err(|e| transport_error(format!("downloading {locator}"), e))?;

    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(false)
}

async fn fetch_blob(
    blobs: &Arc<dyn BlobTransport>,
    retry: &RetryPolicy,
    locator: &Locator,
) -> Result<Bytes, TransportError> {
    with_retry(retry, "download blob", || {
        let blobs = blobs.clone();
        let locator = locator.clone();
        async move { blobs.download_blob(&locator).await }
    })
    .await
    .result
}

fn chunk_path(cache: &Path, index: u64) -> PathBuf {
    cache.join(format!("chunk-{index:06}.bin"))
}

/// Chunk rows must run 0..chunk_count with a locator each.
fn check_layout(batch_id: &str, chunk_count: u64, chunks: &[ChunkRecord]) -> SvaultResult<()> {
    for expected in 0..chunk_count {
        match chunks.get(expected as usize) {
            Some(c) if c.index == expected && c.locator.is_some() => {}
            _ => {
                return Err(SvaultError::chunk_integrity(
                    batch_id, expected, "recorded", "missing",
                ))
            }
        }
    }
    if chunks.len() as u64 != chunk_count {
        return Err(SvaultError::chunk_integrity(
            batch_id,
            chunk_count,
            "absent",
            "unexpected chunk row",
        ));
    }
    Ok(())
}

/// Check cached ciphertext in sequence order; the lowest mismatch wins.
fn verify_cached(batch_id: &str, chunks: &[ChunkRecord], cache: &Path) -> SvaultResult<()> {
    for chunk in chunks {
        let data = std::fs::read(chunk_path(cache, chunk.index))?;
        let actual = hash_to_hex(&hash_bytes(&data));
        if actual != chunk.cipher_hash {
            return Err(SvaultError::chunk_integrity(
                batch_id,
                chunk.index,
                chunk.cipher_hash.clone(),
                actual,
            ));
        }
    }
    Ok(())
}

/// Decrypt and decompress cached chunks in order, feeding the unpacker.
fn restore(
    batch_id: &str,
    chunks: &[ChunkRecord],
    cache: &Path,
    key: &BatchKey,
    segment_size: u64,
    output: &Path,
) -> SvaultResult<u64> {
    let (reader, mut writer) = std::io::pipe()?;
    let dest = output.to_path_buf();
    let unpacker = std::thread::Builder::new()
        .name("svault-unpack".into())
        .spawn(move || unpack_archive(reader, &dest))?;

    let mut outcome = Ok(());
    for chunk in chunks {
        let step = std::fs::read(chunk_path(cache, chunk.index))
            .map_err(SvaultError::from)
            .and_then(|encrypted| {
                decrypt_chunk(key, batch_id, chunk.index, &encrypted)
                    .map_err(|e| crypto_error(batch_id, chunk.index, e))
            })
            .and_then(|compressed| {
                let bound = segment_size.max(chunk.plain_size) as usize;
                decompress(&compressed, bound).map_err(SvaultError::Other)
            })
            .and_then(|plain| {
                if !chunk.plain_hash.is_empty() {
                    let actual = hash_to_hex(&hash_bytes(&plain));
                    if actual != chunk.plain_hash {
                        return Err(SvaultError::chunk_integrity(
                            batch_id,
                            chunk.index,
                            chunk.plain_hash.clone(),
                            actual,
                        ));
                    }
                }
                writer.write_all(&plain).map_err(SvaultError::from)
            });
        if let Err(e) = step {
            outcome = Err(e);
            break;
        }
    }
    drop(writer);

    let unpacked = unpacker
        .join()
        .map_err(|_| SvaultError::Other(anyhow::anyhow!("unpack thread panicked")))?;
    match (outcome, unpacked) {
        // A refused entry stops the unpacker and breaks our pipe; report why.
        (Err(SvaultError::Io(_)), Err(e)) => Err(SvaultError::Other(e)),
        (Err(e), _) => Err(e),
        (Ok(()), unpacked) => unpacked.map_err(SvaultError::Other),
    }
}

/// Re-check size and hash of every restored file.
fn check_files(batch_id: &str, files: &[FileRecord], output: &Path) -> SvaultResult<()> {
    for file in files {
        let path = output.join(&file.relative_path);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                return Err(SvaultError::file_integrity(
                    batch_id,
                    &file.relative_path,
                    file.hash.clone(),
                    "missing",
                ))
            }
        };
        if meta.len() != file.size {
            return Err(SvaultError::file_integrity(
                batch_id,
                &file.relative_path,
                format!("{} bytes", file.size),
                format!("{} bytes", meta.len()),
            ));
        }
        let actual = hash_to_hex(&hash_file_streaming(&path)?);
        if actual != file.hash {
            return Err(SvaultError::file_integrity(
                batch_id,
                &file.relative_path,
                file.hash.clone(),
                actual,
            ));
        }
    }
    Ok(())
}
