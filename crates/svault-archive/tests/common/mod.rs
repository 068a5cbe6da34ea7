//! Shared fixtures: in-memory transport with fault injection, fast engine
//! settings and deterministic input trees.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use svault_archive::retry::RetryPolicy;
use svault_archive::{Engine, EngineSettings, MetadataIndex};
use svault_crypto::KdfParams;
use svault_storage::{
    BlobKind, BlobMeta, BlobTransport, Card, CardChannel, Locator, OpendalTransport,
    TransportError,
};

pub const SECRET: &str = "correct horse battery staple";

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

/// OpenDAL transport that counts traffic, can fail chosen chunk uploads or
/// every download, and can slow chunk uploads down.
pub struct FaultyTransport {
    inner: OpendalTransport,
    pub chunk_uploads: AtomicU64,
    pub manifest_uploads: AtomicU64,
    pub downloads: AtomicU64,
    /// chunk index → remaining injected failures
    failures: Mutex<HashMap<u64, u32>>,
    downloads_fail: AtomicBool,
    upload_delay: Mutex<Duration>,
}

impl FaultyTransport {
    pub fn new(op: Operator) -> Self {
        Self {
            inner: OpendalTransport::new(op),
            chunk_uploads: AtomicU64::new(0),
            manifest_uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            downloads_fail: AtomicBool::new(false),
            upload_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every download fail with a retryable error.
    pub fn fail_downloads(&self, fail: bool) {
        self.downloads_fail.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long before each chunk upload.
    pub fn slow_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    /// Fail the next `times` uploads of chunk `index`.
    pub fn fail_chunk(&self, index: u64, times: u32) {
        self.failures.lock().unwrap().insert(index, times);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn reset_counters(&self) {
        self.chunk_uploads.store(0, Ordering::SeqCst);
        self.manifest_uploads.store(0, Ordering::SeqCst);
        self.downloads.store(0, Ordering::SeqCst);
    }

    pub fn chunk_uploads(&self) -> u64 {
        self.chunk_uploads.load(Ordering::SeqCst)
    }

    pub fn manifest_uploads(&self) -> u64 {
        self.manifest_uploads.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    fn take_failure(&self, index: u64) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&index) {
            Some(0) | None => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl BlobTransport for FaultyTransport {
    async fn ensure_destination(&self, dest: &str) -> Result<(), TransportError> {
        self.inner.ensure_destination(dest).await
    }

    async fn upload_blob(
        &self,
        dest: &str,
        data: Bytes,
        meta: &BlobMeta,
    ) -> Result<Locator, TransportError> {
        if let BlobKind::Chunk { index } = meta.kind {
            let delay = *self.upload_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.take_failure(index) {
                return Err(TransportError::Failure(format!("injected failure for chunk {index}")));
            }
            let locator = self.inner.upload_blob(dest, data, meta).await?;
            self.chunk_uploads.fetch_add(1, Ordering::SeqCst);
            return Ok(locator);
        }
        if meta.kind == BlobKind::Manifest {
            self.manifest_uploads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.upload_blob(dest, data, meta).await
    }

    async fn download_blob(&self, locator: &Locator) -> Result<Bytes, TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.downloads_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Failure("503 service unavailable".into()));
        }
        self.inner.download_blob(locator).await
    }

    async fn list_blobs(&self, dest: &str) -> Result<Vec<Locator>, TransportError> {
        self.inner.list_blobs(dest).await
    }

    async fn delete_blob(&self, locator: &Locator) -> Result<(), TransportError> {
        self.inner.delete_blob(locator).await
    }
}

#[async_trait]
impl CardChannel for FaultyTransport {
    async fn post_card(&self, index_dest: &str, body: &str) -> Result<String, TransportError> {
        self.inner.post_card(index_dest, body).await
    }

    async fn update_card(&self, card_id: &str, body: &str) -> Result<(), TransportError> {
        self.inner.update_card(card_id, body).await
    }

    async fn list_cards(&self, index_dest: &str) -> Result<Vec<Card>, TransportError> {
        self.inner.list_cards(index_dest).await
    }
}

/// Small cap so modest inputs span many chunks; cheap KDF; near-zero backoff.
pub fn fast_settings(cache_dir: &Path) -> EngineSettings {
    EngineSettings {
        chunk_size_cap: 16 * 1024,
        upload_concurrency: 3,
        download_concurrency: 3,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(10),
        },
        card_update_interval: Duration::from_millis(20),
        destinations: vec!["archive-1".into(), "archive-2".into(), "archive-3".into()],
        index_destination: "archive-index".into(),
        backup_destination: "archive-backups".into(),
        kdf: KdfParams { iterations: 1_000 },
        cache_dir: cache_dir.to_path_buf(),
        keep_chunk_cache: true,
        exclude: [".DS_Store", "Thumbs.db", "__MACOSX"]
            .iter()
            .map(|p| glob::Pattern::new(p).unwrap())
            .collect(),
    }
}

/// One deployment: remote storage, local index, scratch space.
pub struct Harness {
    pub tmp: TempDir,
    pub op: Operator,
    pub transport: Arc<FaultyTransport>,
    pub index: Arc<MetadataIndex>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let op = memory_operator();
        let transport = Arc::new(FaultyTransport::new(op.clone()));
        let index = Arc::new(MetadataIndex::open(&tmp.path().join("state/index.json")).unwrap());
        Self {
            tmp,
            op,
            transport,
            index,
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(SECRET, self.index.clone(), "cache")
    }

    /// An engine on the same remote with its own index and cache.
    pub fn engine_with(&self, secret: &str, index: Arc<MetadataIndex>, cache: &str) -> Engine {
        Engine::new(
            fast_settings(&self.tmp.path().join(cache)),
            SecretString::from(secret.to_string()),
            index,
            self.transport.clone(),
            self.transport.clone(),
        )
    }

    /// The default engine with adjusted settings.
    pub fn engine_configured(&self, adjust: impl FnOnce(&mut EngineSettings)) -> Engine {
        let mut settings = fast_settings(&self.tmp.path().join("cache"));
        adjust(&mut settings);
        Engine::new(
            settings,
            SecretString::from(SECRET.to_string()),
            self.index.clone(),
            self.transport.clone(),
            self.transport.clone(),
        )
    }

    /// Chunk files cached for `batch_id` by engines using the default cache.
    pub fn cached_chunks(&self, batch_id: &str) -> usize {
        match std::fs::read_dir(self.path("cache").join(batch_id)) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// A second, empty index, as on a machine that lost its local state.
    pub fn fresh_index(&self, name: &str) -> Arc<MetadataIndex> {
        Arc::new(MetadataIndex::open(&self.tmp.path().join(name).join("index.json")).unwrap())
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }
}

/// Deterministic, poorly compressible bytes.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// A folder with nested files, an empty directory and an ignored file.
/// Roughly 200 KiB, so a 16 KiB cap gives a dozen or more chunks.
pub fn write_tree(root: &Path) -> PathBuf {
    let dir = root.join("photos");
    std::fs::create_dir_all(dir.join("2024/summer")).unwrap();
    std::fs::create_dir_all(dir.join("empty")).unwrap();
    std::fs::write(dir.join("readme.txt"), b"holiday pictures\n").unwrap();
    std::fs::write(dir.join("2024/a.jpg"), pseudo_random(90_000, 1)).unwrap();
    std::fs::write(dir.join("2024/summer/b.jpg"), pseudo_random(70_000, 2)).unwrap();
    std::fs::write(dir.join("2024/summer/c.raw"), pseudo_random(40_000, 3)).unwrap();
    std::fs::write(dir.join(".DS_Store"), b"finder noise").unwrap();
    dir
}

/// Assert every regular file under `expected` exists with equal bytes under
/// `actual`.
pub fn assert_same_files(expected: &Path, actual: &Path, ignored: &[&str]) {
    for entry in std::fs::read_dir(expected).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let src = entry.path();
        let dst = actual.join(&*name);
        if ignored.contains(&name.as_ref()) {
            assert!(!dst.exists(), "{} should not be restored", dst.display());
            continue;
        }
        if src.is_dir() {
            assert!(dst.is_dir(), "missing directory {}", dst.display());
            assert_same_files(&src, &dst, ignored);
        } else {
            let a = std::fs::read(&src).unwrap();
            let b = std::fs::read(&dst).unwrap_or_else(|_| panic!("missing {}", dst.display()));
            assert_eq!(a, b, "content differs: {}", dst.display());
        }
    }
}
