//! Archive engine: configuration, shared handles and the small operations.
//!
//! Slicing and resuming live in `upload`, assembling and verifying in
//! `download`, index reconciliation in `reconcile`. They all hang off
//! `Engine` so every operation sees the same settings, secret, index and
//! transports.

use bytes::Bytes;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svault_chunks::segment_budget;
use svault_core::config::{expand_tilde, SvaultConfig};
use svault_core::{Aggregate, Batch, BatchFilter, BatchStatus, SvaultError, SvaultResult};
use svault_crypto::{
    decode_salt, derive_batch_key, BatchKey, CryptoError, KdfParams, ENCRYPTION_OVERHEAD,
    SALT_SIZE,
};
use svault_storage::{BlobKind, BlobMeta, BlobTransport, CardChannel, Locator, TransportError};

use crate::card::render_card;
use crate::index::MetadataIndex;
use crate::retry::{with_retry, RetryPolicy};

/// Progress events emitted while an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Input scanned and batch row created
    Scanned {
        batch_id: String,
        files: u64,
        bytes: u64,
        /// Lower bound on the number of chunks
        estimated_chunks: u64,
    },
    ChunkUploaded {
        batch_id: String,
        index: u64,
        uploaded: u64,
    },
    ChunkFailed {
        batch_id: String,
        index: u64,
        error: String,
    },
    /// A chunk is available locally, downloaded or from the cache
    ChunkFetched {
        batch_id: String,
        index: u64,
        fetched: u64,
        total: u64,
    },
    Unpacked {
        batch_id: String,
        files: u64,
    },
}

/// Progress callback, shared with worker tasks.
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Everything the engine needs from configuration, resolved once.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size_cap: u64,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub retry: RetryPolicy,
    pub card_update_interval: Duration,
    pub destinations: Vec<String>,
    pub index_destination: String,
    pub backup_destination: String,
    pub kdf: KdfParams,
    pub cache_dir: PathBuf,
    /// Leave chunks in `cache_dir` after a successful assemble
    pub keep_chunk_cache: bool,
    pub exclude: Vec<glob::Pattern>,
}

impl EngineSettings {
    pub fn from_config(config: &SvaultConfig) -> SvaultResult<Self> {
        config.validate()?;
        let exclude = config
            .engine
            .exclude_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| SvaultError::Config(format!("invalid exclude pattern '{p}': {e}")))
            })
            .collect::<SvaultResult<Vec<_>>>()?;

        Ok(Self {
            chunk_size_cap: config.engine.chunk_size_cap,
            upload_concurrency: config.engine.upload_concurrency,
            download_concurrency: config.engine.download_concurrency,
            retry: RetryPolicy {
                max_attempts: config.engine.max_attempts,
                base_delay: Duration::from_millis(config.engine.retry_base_delay_ms),
                attempt_timeout: Duration::from_secs(config.engine.attempt_timeout_secs),
            },
            card_update_interval: Duration::from_millis(config.engine.card_update_interval_ms),
            destinations: config.distribution.destinations.clone(),
            index_destination: config.distribution.index_destination.clone(),
            backup_destination: config.distribution.backup_destination.clone(),
            kdf: KdfParams {
                iterations: config.crypto.kdf_iterations,
            },
            cache_dir: expand_tilde(&config.index.cache_dir),
            keep_chunk_cache: config.index.keep_chunk_cache,
            exclude,
        })
    }

    /// Largest plaintext segment whose transmitted form stays within the cap.
    pub fn segment_size(&self) -> SvaultResult<u64> {
        segment_budget(self.chunk_size_cap, ENCRYPTION_OVERHEAD as u64).ok_or_else(|| {
            SvaultError::Config(format!(
                "chunk size cap {} leaves no room for data",
                self.chunk_size_cap
            ))
        })
    }
}

/// Per-call options for `Engine::slice`.
#[derive(Debug, Clone, Default)]
pub struct SliceOptions {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    /// Send to this destination instead of the round-robin choice
    pub destination: Option<String>,
    /// Stops scheduling new chunk uploads when cancelled
    pub cancel: Option<CancellationToken>,
}

pub struct Engine {
    pub(crate) settings: EngineSettings,
    pub(crate) secret: SecretString,
    pub(crate) index: Arc<MetadataIndex>,
    pub(crate) blobs: Arc<dyn BlobTransport>,
    pub(crate) cards: Arc<dyn CardChannel>,
    pub(crate) progress: Option<ProgressFn>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        secret: SecretString,
        index: Arc<MetadataIndex>,
        blobs: Arc<dyn BlobTransport>,
        cards: Arc<dyn CardChannel>,
    ) -> Self {
        Self {
            settings,
            secret,
            index,
            blobs,
            cards,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    pub(crate) fn emit(&self, event: Progress) {
        if let Some(cb) = &self.progress {
            cb(&event);
        }
    }

    pub fn list_batches(&self, filter: &BatchFilter) -> Vec<Batch> {
        self.index.list_batches(filter)
    }

    pub fn stats(&self) -> Aggregate {
        self.index.stats()
    }

    /// Tombstone a batch and drop its local chunk cache. With `also_remote`,
    /// delete its blobs too and purge the rows once every deletion is
    /// confirmed.
    pub async fn delete(&self, batch_id: &str, also_remote: bool) -> SvaultResult<()> {
        let lock = self.index.batch_lock(batch_id);
        let _guard = lock.lock().await;

        let (_, chunks) = self.index.batch_with_chunks(batch_id)?;
        let batch = self.index.mark_status(batch_id, BatchStatus::Deleted)?;
        if let Some(card_id) = self.refresh_card(&batch, 0).await {
            if batch.card_id.as_deref() != Some(card_id.as_str()) {
                self.index
                    .update_batch(batch_id, |b| b.card_id = Some(card_id))?;
            }
        }
        info!(batch_id, also_remote, "batch tombstoned");
        if let Err(e) = self.evict_cache(batch_id).await {
            warn!(batch_id, "could not drop chunk cache: {e}");
        }

        if !also_remote {
            return Ok(());
        }

        let mut locators: Vec<String> = chunks.into_iter().filter_map(|c| c.locator).collect();
        locators.extend(batch.manifest_locator.clone());

        for loc in &locators {
            let locator = Locator::new(loc.clone());
            let attempt = with_retry(&self.settings.retry, "delete blob", || {
                let blobs = self.blobs.clone();
                let locator = locator.clone();
                async move { blobs.delete_blob(&locator).await }
            })
            .await;
            match attempt.result {
                Ok(()) => {}
                Err(TransportError::NotFound(_)) => debug!(locator = %loc, "blob already gone"),
                Err(e) => return Err(transport_error(format!("deleting {loc}"), e)),
            }
        }

        self.index.purge_batch(batch_id)?;
        info!(batch_id, blobs = locators.len(), "batch deleted remotely and purged");
        Ok(())
    }

    /// Upload a snapshot of the metadata index to the backup destination.
    pub async fn backup_index(&self) -> SvaultResult<Locator> {
        let snapshot = Bytes::from(self.index.backup_bytes()?);
        let dest = self.settings.backup_destination.clone();
        let meta = BlobMeta {
            batch_id: format!("index-{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")),
            kind: BlobKind::IndexBackup,
        };

        let ensured = with_retry(&self.settings.retry, "ensure backup destination", || {
            let blobs = self.blobs.clone();
            let dest = dest.clone();
            async move { blobs.ensure_destination(&dest).await }
        })
        .await;
        ensured
            .result
            .map_err(|e| transport_error(format!("preparing {dest}"), e))?;

        let uploaded = with_retry(&self.settings.retry, "upload index backup", || {
            let blobs = self.blobs.clone();
            let dest = dest.clone();
            let data = snapshot.clone();
            let meta = meta.clone();
            async move { blobs.upload_blob(&dest, data, &meta).await }
        })
        .await;
        let locator = uploaded
            .result
            .map_err(|e| transport_error("uploading index backup", e))?;

        info!(locator = %locator, bytes = snapshot.len(), "index backup uploaded");
        Ok(locator)
    }

    /// Derive the key of a batch from its stored salt, off the async runtime.
    pub(crate) async fn derive_key(&self, salt_b64: &str, iterations: u32) -> SvaultResult<BatchKey> {
        let salt = decode_salt(salt_b64).map_err(|e| SvaultError::Other(e.into()))?;
        self.derive_key_raw(salt, KdfParams { iterations }).await
    }

    pub(crate) async fn derive_key_raw(
        &self,
        salt: [u8; SALT_SIZE],
        params: KdfParams,
    ) -> SvaultResult<BatchKey> {
        let secret = self.secret.clone();
        tokio::task::spawn_blocking(move || derive_batch_key(&secret, &salt, &params))
            .await
            .map_err(join_error)?
            .map_err(|e| SvaultError::Other(e.into()))
    }

    /// Post or edit the card of `batch`. Failures are logged, not returned.
    pub(crate) async fn refresh_card(&self, batch: &Batch, uploaded: u64) -> Option<String> {
        match self.publish_card(batch, uploaded).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(batch_id = %batch.batch_id, "card update failed: {e}");
                None
            }
        }
    }

    /// Post or edit the card of `batch`, returning its id. A card that has
    /// vanished is posted again.
    pub(crate) async fn publish_card(&self, batch: &Batch, uploaded: u64) -> SvaultResult<String> {
        let body = render_card(batch, uploaded);

        if let Some(card_id) = &batch.card_id {
            let edited = with_retry(&self.settings.retry, "update card", || {
                let cards = self.cards.clone();
                let card_id = card_id.clone();
                let body = body.clone();
                async move { cards.update_card(&card_id, &body).await }
            })
            .await;
            match edited.result {
                Ok(()) => return Ok(card_id.clone()),
                Err(TransportError::NotFound(_)) => {
                    debug!(batch_id = %batch.batch_id, card_id = %card_id, "card vanished, posting a new one")
                }
                Err(e) => return Err(transport_error("updating card", e)),
            }
        }

        let index_dest = self.settings.index_destination.clone();
        let posted = with_retry(&self.settings.retry, "post card", || {
            let cards = self.cards.clone();
            let dest = index_dest.clone();
            let body = body.clone();
            async move { cards.post_card(&dest, &body).await }
        })
        .await;
        posted
            .result
            .map_err(|e| transport_error("posting card", e))
    }
}

pub(crate) fn transport_error(context: impl Into<String>, err: TransportError) -> SvaultError {
    match err {
        TransportError::NotFound(what) => SvaultError::RemoteNotFound(what),
        other => SvaultError::Transport {
            context: context.into(),
            message: other.to_string(),
        },
    }
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> SvaultError {
    SvaultError::Other(anyhow::anyhow!("worker task failed: {err}"))
}

pub(crate) fn crypto_error(batch_id: &str, index: u64, err: CryptoError) -> SvaultError {
    match err {
        CryptoError::Authentication | CryptoError::Truncated { .. } => {
            SvaultError::Authentication {
                batch_id: batch_id.to_string(),
                index,
            }
        }
        other => SvaultError::Other(other.into()),
    }
}
