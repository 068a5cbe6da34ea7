use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a batch in the metadata index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Row created, nothing transmitted yet
    Pending,
    /// Chunks are being transmitted
    Uploading,
    /// Every chunk acknowledged and the manifest persisted remotely
    Complete,
    /// At least one chunk exhausted its retries (resumable)
    Failed,
    /// Tombstoned by the user
    Deleted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Uploading => "uploading",
            BatchStatus::Complete => "complete",
            BatchStatus::Failed => "failed",
            BatchStatus::Deleted => "deleted",
        }
    }

    /// Whether `resume` may pick this batch up again.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Pending | BatchStatus::Uploading | BatchStatus::Failed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BatchStatus::Pending),
            "uploading" => Ok(BatchStatus::Uploading),
            "complete" => Ok(BatchStatus::Complete),
            "failed" => Ok(BatchStatus::Failed),
            "deleted" => Ok(BatchStatus::Deleted),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    Failed,
}

/// One logical upload: a file or folder packed, compressed, encrypted and
/// split into chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Human-readable id, e.g. `BATCH_20261019_101500_0007`
    pub batch_id: String,
    /// File or folder name as submitted
    pub original_name: String,
    /// Local path the batch was sliced from (empty for reconciled batches)
    #[serde(default)]
    pub source_path: PathBuf,
    pub is_directory: bool,
    /// Sum of the packed files' sizes
    pub total_size: u64,
    pub file_count: u64,
    /// Known once the packed stream has been fully chunked
    pub chunk_count: u64,
    /// Bytes actually transmitted (ciphertext)
    pub stored_size: u64,
    pub status: BatchStatus,
    /// Unix timestamp (seconds)
    pub created_at: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Destination holding this batch's chunks
    pub destination: String,
    /// Plaintext segment size used when chunking
    pub segment_size: u64,
    /// Per-batch KDF salt (base64)
    pub salt: String,
    pub kdf_iterations: u32,
    /// Keyed BLAKE3 tag proving which secret the batch was encrypted under
    pub key_check: String,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub manifest_locator: Option<String>,
}

/// One encrypted, compressed slice of a batch's packed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub batch_id: String,
    /// 0-based position in the packed stream (authoritative ordering)
    pub index: u64,
    pub plain_size: u64,
    pub stored_size: u64,
    /// BLAKE3 of the plaintext segment (empty for legacy manifests)
    pub plain_hash: String,
    /// BLAKE3 of the transmitted bytes
    pub cipher_hash: String,
    #[serde(default)]
    pub locator: Option<String>,
    pub status: ChunkStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// One file inside a batch's packed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path inside the archive, `/`-separated, rooted at the batch name
    pub relative_path: String,
    pub size: u64,
    /// BLAKE3 of the file content (hex)
    pub hash: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Unix timestamp (seconds)
    #[serde(default)]
    pub mtime: u64,
}

fn default_mode() -> u32 {
    0o644
}

/// Filter for `list_batches`. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub destination: Option<String>,
    pub tag: Option<String>,
}

impl BatchFilter {
    pub fn matches(&self, batch: &Batch) -> bool {
        if let Some(status) = self.status {
            if batch.status != status {
                return false;
            }
        }
        if let Some(dest) = &self.destination {
            if &batch.destination != dest {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !batch.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationTotals {
    pub batches: u64,
    pub stored_size: u64,
}

/// Totals computed from the index's stored rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Batches that are not tombstoned
    pub batch_count: u64,
    pub total_size: u64,
    pub stored_size: u64,
    pub chunk_count: u64,
    pub file_count: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_destination: BTreeMap<String, DestinationTotals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Insert remote batches missing locally, keep everything else
    Augment,
    /// Discard all local rows, then rebuild from the remote history
    Reset,
}

/// Outcome of reconciling the index against the remote card history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: u64,
    pub already_present: u64,
    /// Cards or manifests that could not be parsed
    pub skipped: u64,
    /// Cards whose batch never finished (no manifest)
    pub incomplete: u64,
    /// Cards marking a batch as deleted
    pub tombstoned: u64,
}

/// One chunk whose remote bytes do not match the recorded hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkMismatch {
    pub index: u64,
    pub expected: String,
    /// Hash of what was fetched, or `missing` when the blob is gone
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub batch_id: String,
    pub chunks_checked: u64,
    /// Sorted by index
    pub mismatches: Vec<ChunkMismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Lowest mismatching chunk index, if any.
    pub fn first_mismatch(&self) -> Option<&ChunkMismatch> {
        self.mismatches.first()
    }
}

/// Format a byte count for humans (`1.5 MB`, `420.7 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(status: BatchStatus, dest: &str, tags: &[&str]) -> Batch {
        Batch {
            batch_id: "BATCH_20260101_000000_0001".into(),
            original_name: "photos".into(),
            source_path: PathBuf::from("/tmp/photos"),
            is_directory: true,
            total_size: 10,
            file_count: 1,
            chunk_count: 1,
            stored_size: 50,
            status,
            created_at: 0,
            title: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: None,
            destination: dest.into(),
            segment_size: 1024,
            salt: String::new(),
            kdf_iterations: 1,
            key_check: String::new(),
            card_id: None,
            manifest_locator: None,
        }
    }

    #[test]
    fn status_parse_and_display() {
        for s in ["pending", "uploading", "complete", "failed", "deleted"] {
            let status: BatchStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&BatchStatus::Complete).unwrap();
        assert_eq!(json, "\"complete\"");
        let back: ChunkStatus = serde_json::from_str("\"uploaded\"").unwrap();
        assert_eq!(back, ChunkStatus::Uploaded);
    }

    #[test]
    fn filter_matches_each_field() {
        let b = batch(BatchStatus::Complete, "vault-a", &["Photos", "2024"]);

        assert!(BatchFilter::default().matches(&b));
        assert!(BatchFilter {
            status: Some(BatchStatus::Complete),
            ..Default::default()
        }
        .matches(&b));
        assert!(!BatchFilter {
            status: Some(BatchStatus::Failed),
            ..Default::default()
        }
        .matches(&b));
        assert!(!BatchFilter {
            destination: Some("vault-b".into()),
            ..Default::default()
        }
        .matches(&b));
        assert!(BatchFilter {
            tag: Some("photos".into()),
            ..Default::default()
        }
        .matches(&b));
        assert!(!BatchFilter {
            tag: Some("music".into()),
            ..Default::default()
        }
        .matches(&b));
    }

    #[test]
    fn resumable_statuses() {
        assert!(BatchStatus::Failed.is_resumable());
        assert!(BatchStatus::Uploading.is_resumable());
        assert!(BatchStatus::Pending.is_resumable());
        assert!(!BatchStatus::Complete.is_resumable());
        assert!(!BatchStatus::Deleted.is_resumable());
    }

    #[test]
    fn verify_report_first_mismatch() {
        let report = VerifyReport {
            batch_id: "b".into(),
            chunks_checked: 3,
            mismatches: vec![ChunkMismatch {
                index: 1,
                expected: "aa".into(),
                actual: "missing".into(),
            }],
        };
        assert!(!report.is_ok());
        assert_eq!(report.first_mismatch().unwrap().index, 1);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(441_115_935), "420.7 MB");
    }
}
