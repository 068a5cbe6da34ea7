use std::path::PathBuf;
use thiserror::Error;

use crate::types::BatchStatus;

pub type SvaultResult<T> = Result<T, SvaultError>;

#[derive(Debug, Error)]
pub enum SvaultError {
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// A chunk's AEAD tag did not verify: tampering, corruption, wrong key or
    /// wrong position. Never retried.
    #[error("authentication failed for batch {batch_id} chunk {index}")]
    Authentication { batch_id: String, index: u64 },

    /// The configured secret is not the one the batch was encrypted under.
    #[error("secret does not match the key batch {batch_id} was encrypted with")]
    KeyMismatch { batch_id: String },

    /// Content hash mismatch. `subject` names the chunk or file.
    #[error("integrity check failed for batch {batch_id} ({subject}): expected {expected}, got {actual}")]
    Integrity {
        batch_id: String,
        subject: String,
        index: Option<u64>,
        expected: String,
        actual: String,
    },

    #[error("transport error ({context}): {message}")]
    Transport { context: String, message: String },

    #[error("remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("unsupported manifest version {found} (newest supported: {max})")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("malformed manifest: {0}")]
    ManifestDecode(String),

    #[error("metadata index unavailable at {}: {reason}", .path.display())]
    IndexUnavailable { path: PathBuf, reason: String },

    #[error("partial upload of batch {batch_id}: {uploaded}/{total} chunks uploaded, failed: {failed:?}")]
    PartialUpload {
        batch_id: String,
        uploaded: u64,
        total: u64,
        failed: Vec<u64>,
    },

    #[error("batch {batch_id} cancelled after {uploaded} chunks uploaded")]
    Cancelled { batch_id: String, uploaded: u64 },

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("cannot {operation} batch {batch_id} in state {status}")]
    InvalidState {
        batch_id: String,
        status: BatchStatus,
        operation: &'static str,
    },

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SvaultError {
    pub fn chunk_integrity(
        batch_id: &str,
        index: u64,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        SvaultError::Integrity {
            batch_id: batch_id.to_string(),
            subject: format!("chunk {index}"),
            index: Some(index),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn file_integrity(
        batch_id: &str,
        path: &str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        SvaultError::Integrity {
            batch_id: batch_id.to_string(),
            subject: format!("file {path}"),
            index: None,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Short machine-readable kind, used in logs and CLI exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            SvaultError::InputNotFound(_) => "input_not_found",
            SvaultError::Authentication { .. } => "authentication",
            SvaultError::KeyMismatch { .. } => "key_mismatch",
            SvaultError::Integrity { .. } => "integrity",
            SvaultError::Transport { .. } => "transport",
            SvaultError::RemoteNotFound(_) => "remote_not_found",
            SvaultError::UnsupportedVersion { .. } => "unsupported_version",
            SvaultError::ManifestDecode(_) => "manifest_decode",
            SvaultError::IndexUnavailable { .. } => "index_unavailable",
            SvaultError::PartialUpload { .. } => "partial_upload",
            SvaultError::Cancelled { .. } => "cancelled",
            SvaultError::BatchNotFound(_) => "batch_not_found",
            SvaultError::InvalidState { .. } => "invalid_state",
            SvaultError::UnknownDestination(_) => "unknown_destination",
            SvaultError::Config(_) => "config",
            SvaultError::Io(_) => "io",
            SvaultError::Other(_) => "other",
        }
    }
}
