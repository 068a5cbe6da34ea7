//! Batch manifest: versioned JSON describing everything needed to rebuild a
//! batch from its chunks.
//!
//! The manifest is uploaded as a sibling blob of the chunks and mirrored in
//! the metadata index. It carries the KDF salt and a key-check tag, never the
//! key. v1 manifests (no plaintext hashes, files keyed by id) are migrated on
//! read; versions newer than `MANIFEST_VERSION` are refused.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use svault_chunks::COMPRESSION_LEVEL;
use svault_core::{Batch, BatchStatus, ChunkRecord, ChunkStatus, FileRecord, SvaultError};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Decode(String),

    #[error("unsupported manifest version {found} (newest supported: {max})")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("inconsistent manifest: {0}")]
    Invalid(String),
}

impl From<ManifestError> for SvaultError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::UnsupportedVersion { found, max } => {
                SvaultError::UnsupportedVersion { found, max }
            }
            other => SvaultError::ManifestDecode(other.to_string()),
        }
    }
}

/// Algorithm identifiers recorded with every batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithms {
    pub compression: String,
    pub compression_level: i32,
    pub encryption: String,
    pub hash: String,
    pub kdf: String,
}

impl Default for Algorithms {
    fn default() -> Self {
        Self {
            compression: "zstd".into(),
            compression_level: COMPRESSION_LEVEL,
            encryption: "xchacha20poly1305".into(),
            hash: "blake3".into(),
            kdf: "pbkdf2-hmac-sha256".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub index: u64,
    pub plain_size: u64,
    pub stored_size: u64,
    /// Empty for migrated v1 manifests
    pub plain_hash: String,
    pub cipher_hash: String,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub batch_id: String,
    pub original_name: String,
    pub is_directory: bool,
    pub created_at: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub destination: String,
    pub total_size: u64,
    pub stored_size: u64,
    pub segment_size: u64,
    pub algorithms: Algorithms,
    pub kdf_iterations: u32,
    /// Base64 KDF salt
    pub salt: String,
    pub key_check: String,
    pub chunks: Vec<ManifestChunk>,
    pub files: Vec<FileRecord>,
}

impl Manifest {
    /// Build the manifest of a batch whose chunks are all uploaded.
    pub fn from_batch(
        batch: &Batch,
        chunks: &[ChunkRecord],
        files: &[FileRecord],
    ) -> Result<Self, ManifestError> {
        let mut entries = Vec::with_capacity(chunks.len());
        for c in chunks {
            let locator = match (&c.locator, c.status) {
                (Some(loc), ChunkStatus::Uploaded) => loc.clone(),
                _ => {
                    return Err(ManifestError::Invalid(format!(
                        "chunk {} of {} is not uploaded",
                        c.index, batch.batch_id
                    )))
                }
            };
            entries.push(ManifestChunk {
                index: c.index,
                plain_size: c.plain_size,
                stored_size: c.stored_size,
                plain_hash: c.plain_hash.clone(),
                cipher_hash: c.cipher_hash.clone(),
                locator,
            });
        }
        entries.sort_by_key(|c| c.index);

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            batch_id: batch.batch_id.clone(),
            original_name: batch.original_name.clone(),
            is_directory: batch.is_directory,
            created_at: batch.created_at,
            title: batch.title.clone(),
            tags: batch.tags.clone(),
            description: batch.description.clone(),
            destination: batch.destination.clone(),
            total_size: batch.total_size,
            stored_size: entries.iter().map(|c| c.stored_size).sum(),
            segment_size: batch.segment_size,
            algorithms: Algorithms::default(),
            kdf_iterations: batch.kdf_iterations,
            salt: batch.salt.clone(),
            key_check: batch.key_check.clone(),
            chunks: entries,
            files: files.to_vec(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that chunk indices are contiguous from 0 and totals add up.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (expected, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != expected as u64 {
                return Err(ManifestError::Invalid(format!(
                    "chunk sequence broken: expected index {expected}, found {}",
                    chunk.index
                )));
            }
            if chunk.locator.is_empty() {
                return Err(ManifestError::Invalid(format!(
                    "chunk {} has no locator",
                    chunk.index
                )));
            }
        }
        let stored: u64 = self.chunks.iter().map(|c| c.stored_size).sum();
        if stored != self.stored_size {
            return Err(ManifestError::Invalid(format!(
                "stored size {} does not match chunk total {stored}",
                self.stored_size
            )));
        }
        let files: u64 = self.files.iter().map(|f| f.size).sum();
        if files != self.total_size {
            return Err(ManifestError::Invalid(format!(
                "total size {} does not match file total {files}",
                self.total_size
            )));
        }
        Ok(())
    }

    /// Index rows for this manifest, as a completed batch.
    pub fn to_rows(&self, manifest_locator: &str, card_id: Option<String>) -> (Batch, Vec<ChunkRecord>) {
        let batch = Batch {
            batch_id: self.batch_id.clone(),
            original_name: self.original_name.clone(),
            source_path: Default::default(),
            is_directory: self.is_directory,
            total_size: self.total_size,
            file_count: self.files.len() as u64,
            chunk_count: self.chunks.len() as u64,
            stored_size: self.stored_size,
            status: BatchStatus::Complete,
            created_at: self.created_at,
            title: self.title.clone(),
            tags: self.tags.clone(),
            description: self.description.clone(),
            destination: self.destination.clone(),
            segment_size: self.segment_size,
            salt: self.salt.clone(),
            kdf_iterations: self.kdf_iterations,
            key_check: self.key_check.clone(),
            card_id,
            manifest_locator: Some(manifest_locator.to_string()),
        };
        let chunks = self
            .chunks
            .iter()
            .map(|c| ChunkRecord {
                batch_id: self.batch_id.clone(),
                index: c.index,
                plain_size: c.plain_size,
                stored_size: c.stored_size,
                plain_hash: c.plain_hash.clone(),
                cipher_hash: c.cipher_hash.clone(),
                locator: Some(c.locator.clone()),
                status: ChunkStatus::Uploaded,
                attempts: 0,
                last_error: None,
            })
            .collect();
        (batch, chunks)
    }

    pub fn is_legacy(&self) -> bool {
        self.version < MANIFEST_VERSION
    }
}

/// Serialize a manifest as pretty JSON.
pub fn encode(manifest: &Manifest) -> Result<Vec<u8>, ManifestError> {
    serde_json::to_vec_pretty(manifest).map_err(|e| ManifestError::Decode(e.to_string()))
}

/// Parse manifest bytes of any supported version, migrating v1.
pub fn decode(data: &[u8]) -> Result<Manifest, ManifestError> {
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| ManifestError::Decode(e.to_string()))?;
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ManifestError::Decode("missing version field".into()))?;

    let manifest = match version {
        1 => {
            let legacy: ManifestV1 = serde_json::from_value(value)
                .map_err(|e| ManifestError::Decode(e.to_string()))?;
            legacy.migrate()
        }
        2 => serde_json::from_value(value).map_err(|e| ManifestError::Decode(e.to_string()))?,
        found => {
            return Err(ManifestError::UnsupportedVersion {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                max: MANIFEST_VERSION,
            })
        }
    };
    manifest.validate()?;
    Ok(manifest)
}

/// v1 layout: one hash per chunk (of the transmitted bytes), files keyed by id.
#[derive(Debug, Deserialize)]
struct ManifestV1 {
    batch_id: String,
    original_name: String,
    #[serde(default)]
    is_directory: bool,
    #[serde(default)]
    created_at: i64,
    destination: String,
    total_size: u64,
    salt: String,
    iterations: u32,
    #[serde(default)]
    key_check: String,
    chunks: Vec<ChunkV1>,
    #[serde(default)]
    files: BTreeMap<String, FileV1>,
}

#[derive(Debug, Deserialize)]
struct ChunkV1 {
    index: u64,
    hash: String,
    size: u64,
    locator: String,
}

#[derive(Debug, Deserialize)]
struct FileV1 {
    path: String,
    size: u64,
    hash: String,
}

impl ManifestV1 {
    fn migrate(self) -> Manifest {
        let mut chunks: Vec<ManifestChunk> = self
            .chunks
            .into_iter()
            .map(|c| ManifestChunk {
                index: c.index,
                plain_size: 0,
                stored_size: c.size,
                plain_hash: String::new(),
                cipher_hash: c.hash,
                locator: c.locator,
            })
            .collect();
        chunks.sort_by_key(|c| c.index);

        let mut files: Vec<FileRecord> = self
            .files
            .into_values()
            .map(|f| FileRecord {
                relative_path: f.path,
                size: f.size,
                hash: f.hash,
                mode: 0o644,
                mtime: 0,
            })
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        Manifest {
            version: 1,
            batch_id: self.batch_id,
            original_name: self.original_name,
            is_directory: self.is_directory,
            created_at: self.created_at,
            title: None,
            tags: Vec::new(),
            description: None,
            destination: self.destination,
            total_size: self.total_size,
            stored_size: chunks.iter().map(|c| c.stored_size).sum(),
            segment_size: 0,
            algorithms: Algorithms::default(),
            kdf_iterations: self.iterations,
            salt: self.salt,
            key_check: self.key_check,
            chunks,
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            batch_id: "BATCH_20261019_101500_0001".into(),
            original_name: "photos".into(),
            is_directory: true,
            created_at: 1_760_000_000,
            title: Some("Holiday".into()),
            tags: vec!["2025".into()],
            description: None,
            destination: "vault-a".into(),
            total_size: 12,
            stored_size: 300,
            segment_size: 1024,
            algorithms: Algorithms::default(),
            kdf_iterations: 600_000,
            salt: "c2FsdHNhbHRzYWx0c2FsdA==".into(),
            key_check: "ab".repeat(32),
            chunks: vec![
                ManifestChunk {
                    index: 0,
                    plain_size: 1024,
                    stored_size: 200,
                    plain_hash: "11".repeat(32),
                    cipher_hash: "22".repeat(32),
                    locator: "vault-a/B/B.part000000.bin".into(),
                },
                ManifestChunk {
                    index: 1,
                    plain_size: 500,
                    stored_size: 100,
                    plain_hash: "33".repeat(32),
                    cipher_hash: "44".repeat(32),
                    locator: "vault-a/B/B.part000001.bin".into(),
                },
            ],
            files: vec![FileRecord {
                relative_path: "photos/a.jpg".into(),
                size: 12,
                hash: "55".repeat(32),
                mode: 0o644,
                mtime: 1_700_000_000,
            }],
        }
    }

    #[test]
    fn test_v2_roundtrip() {
        let m = sample();
        let parsed = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(parsed, m);
        assert!(!parsed.is_legacy());
    }

    #[test]
    fn test_v1_migration() {
        let v1 = r#"{
            "version": 1,
            "batch_id": "BATCH_20240101_0001",
            "original_name": "notes.txt",
            "destination": "storage-1",
            "total_size": 5,
            "salt": "c2FsdHNhbHRzYWx0c2FsdA==",
            "iterations": 600000,
            "chunks": [
                {"index": 1, "hash": "bb", "size": 40, "locator": "m/2"},
                {"index": 0, "hash": "aa", "size": 60, "locator": "m/1"}
            ],
            "files": {"f1": {"path": "notes.txt", "size": 5, "hash": "cc"}}
        }"#;
        let m = decode(v1.as_bytes()).unwrap();

        assert!(m.is_legacy());
        assert_eq!(m.kdf_iterations, 600_000);
        assert_eq!(m.stored_size, 100);
        assert_eq!(m.chunks[0].cipher_hash, "aa");
        assert_eq!(m.chunks[1].locator, "m/2");
        assert!(m.chunks[0].plain_hash.is_empty());
        assert_eq!(m.files[0].relative_path, "notes.txt");
    }

    #[test]
    fn test_future_version_is_refused() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = serde_json::json!(3);
        let bytes = serde_json::to_vec(&value).unwrap();

        match decode(&bytes) {
            Err(ManifestError::UnsupportedVersion { found: 3, max: 2 }) => {}
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(decode(b"not json"), Err(ManifestError::Decode(_))));
        assert!(matches!(decode(b"{}"), Err(ManifestError::Decode(_))));
    }

    #[test]
    fn test_gap_in_chunks_is_invalid() {
        let mut m = sample();
        m.chunks.remove(0);
        m.stored_size = 100;
        assert!(matches!(m.validate(), Err(ManifestError::Invalid(_))));
    }

    #[test]
    fn test_rows_from_manifest() {
        let m = sample();
        let (batch, chunks) = m.to_rows("vault-a/B/B.manifest.json", Some("card-1".into()));
        assert_eq!(batch.status, BatchStatus::Complete);
        assert_eq!(batch.chunk_count, 2);
        assert_eq!(batch.file_count, 1);
        assert_eq!(chunks[1].index, 1);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Uploaded));

        let rebuilt = Manifest::from_batch(&batch, &chunks, &m.files).unwrap();
        assert_eq!(rebuilt, m);
    }

    #[test]
    fn test_error_maps_to_engine_error() {
        let err: SvaultError = ManifestError::UnsupportedVersion { found: 9, max: 2 }.into();
        assert!(matches!(err, SvaultError::UnsupportedVersion { found: 9, .. }));
    }
}
