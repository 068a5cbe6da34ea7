use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SvaultError, SvaultResult};

/// Default chunk size cap: 9.5 MiB, just under a 10 MiB attachment limit.
pub const DEFAULT_CHUNK_SIZE_CAP: u64 = 9_961_472;

/// Smallest cap accepted by `validate()`.
pub const MIN_CHUNK_SIZE_CAP: u64 = 64 * 1024;

/// PBKDF2-HMAC-SHA256 iteration floor for configured deployments.
pub const MIN_KDF_ITERATIONS: u32 = 600_000;

/// Top-level configuration (loaded from svault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SvaultConfig {
    pub engine: EngineConfig,
    pub distribution: DistributionConfig,
    pub crypto: CryptoConfig,
    pub index: IndexConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the size of every transmitted chunk, in bytes
    pub chunk_size_cap: u64,
    /// Largest blob the transport accepts
    pub transport_limit: u64,
    /// Concurrent chunk uploads per batch
    pub upload_concurrency: usize,
    /// Concurrent chunk downloads per batch
    pub download_concurrency: usize,
    /// Total attempts per chunk before it is marked failed
    pub max_attempts: u32,
    /// First backoff delay; doubles on every retry
    pub retry_base_delay_ms: u64,
    /// Timeout for a single transport call
    pub attempt_timeout_secs: u64,
    /// Minimum interval between progress edits of a batch card
    pub card_update_interval_ms: u64,
    /// File name patterns skipped while scanning (glob syntax)
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Ordered destinations that receive chunks (round-robin)
    pub destinations: Vec<String>,
    /// Destination holding the human-readable batch cards
    pub index_destination: String,
    /// Destination receiving metadata index snapshots
    pub backup_destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations for new batches
    pub kdf_iterations: u32,
    /// Environment variable holding the encryption secret
    pub secret_env: String,
    /// File holding the encryption secret (used when the variable is unset)
    pub secret_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Metadata index JSON file
    pub path: PathBuf,
    /// Local cache of downloaded chunks, one directory per batch
    pub cache_dir: PathBuf,
    /// Keep a batch's downloaded chunks after it has been assembled, so a
    /// repeat restore needs no downloads. Deleting a batch always drops them.
    pub keep_chunk_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob backend: "fs", "memory", or "s3"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket
    pub bucket: String,
    /// Enforce HTTPS for S3 connections
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_cap: DEFAULT_CHUNK_SIZE_CAP,
            transport_limit: 10 * 1024 * 1024,
            upload_concurrency: 5,
            download_concurrency: 5,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            attempt_timeout_secs: 120,
            card_update_interval_ms: 1200,
            exclude_patterns: vec![
                ".DS_Store".into(),
                "Thumbs.db".into(),
                "__MACOSX".into(),
            ],
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            destinations: vec!["archive-1".into()],
            index_destination: "archive-index".into(),
            backup_destination: "archive-backups".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            secret_env: "SVAULT_SECRET".into(),
            secret_file: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/svault/index.json"),
            cache_dir: PathBuf::from("~/.cache/svault/chunks"),
            keep_chunk_cache: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("~/.local/share/svault/remote"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "svault".into(),
            enforce_tls: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl SvaultConfig {
    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> SvaultResult<()> {
        let e = &self.engine;
        if e.chunk_size_cap > e.transport_limit {
            return Err(SvaultError::Config(format!(
                "engine.chunk_size_cap ({}) exceeds engine.transport_limit ({})",
                e.chunk_size_cap, e.transport_limit
            )));
        }
        if e.chunk_size_cap < MIN_CHUNK_SIZE_CAP {
            return Err(SvaultError::Config(format!(
                "engine.chunk_size_cap ({}) is below the minimum of {MIN_CHUNK_SIZE_CAP}",
                e.chunk_size_cap
            )));
        }
        if e.upload_concurrency == 0 || e.download_concurrency == 0 {
            return Err(SvaultError::Config(
                "engine concurrency must be at least 1".into(),
            ));
        }
        if e.max_attempts == 0 {
            return Err(SvaultError::Config(
                "engine.max_attempts must be at least 1".into(),
            ));
        }
        for pattern in &e.exclude_patterns {
            glob::Pattern::new(pattern).map_err(|err| {
                SvaultError::Config(format!("invalid exclude pattern '{pattern}': {err}"))
            })?;
        }

        let d = &self.distribution;
        if d.destinations.is_empty() {
            return Err(SvaultError::Config(
                "distribution.destinations must name at least one destination".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for dest in &d.destinations {
            if !seen.insert(dest) {
                return Err(SvaultError::Config(format!(
                    "destination '{dest}' is listed twice"
                )));
            }
        }
        if d.index_destination.is_empty() {
            return Err(SvaultError::Config(
                "distribution.index_destination must be set".into(),
            ));
        }

        if self.crypto.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(SvaultError::Config(format!(
                "crypto.kdf_iterations ({}) is below the minimum of {MIN_KDF_ITERATIONS}",
                self.crypto.kdf_iterations
            )));
        }

        match self.storage.backend.as_str() {
            "fs" | "memory" | "s3" => Ok(()),
            other => Err(SvaultError::Config(format!(
                "unknown storage.backend '{other}' (expected fs, memory, or s3)"
            ))),
        }
    }
}

impl CryptoConfig {
    /// Read the encryption secret from the environment, falling back to
    /// `secret_file`.
    pub fn load_secret(&self) -> SvaultResult<SecretString> {
        if let Ok(value) = std::env::var(&self.secret_env) {
            if !value.is_empty() {
                return Ok(SecretString::from(value));
            }
        }
        match &self.secret_file {
            Some(path) => read_secret_file(&expand_tilde(path)),
            None => Err(SvaultError::Config(format!(
                "no encryption secret: set {} or crypto.secret_file",
                self.secret_env
            ))),
        }
    }
}

fn read_secret_file(path: &Path) -> SvaultResult<SecretString> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SvaultError::Config(format!("reading secret file {}: {e}", path.display()))
    })?;
    let trimmed = content.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(SvaultError::Config(format!(
            "secret file {} is empty",
            path.display()
        )));
    }
    Ok(SecretString::from(trimmed.to_string()))
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}
