//! Transport boundary traits
//!
//! A destination is a named container (a chat channel, a bucket prefix).
//! Uploading returns an opaque `Locator` that is the only way to fetch or
//! delete the blob later. Cards are small free-text messages in the index
//! destination that summarize a batch; their history is what a lost local
//! index is rebuilt from.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid destination name: {0}")]
    InvalidDestination(String),

    /// Transient failure (network, rate limit, timeout); safe to retry
    #[error("transport failure: {0}")]
    Failure(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Failure(_))
    }
}

/// Opaque reference to an uploaded blob, returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Chunk { index: u64 },
    Manifest,
    IndexBackup,
}

/// What a blob is, so transports can name it sensibly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub batch_id: String,
    pub kind: BlobKind,
}

impl BlobMeta {
    pub fn chunk(batch_id: &str, index: u64) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            kind: BlobKind::Chunk { index },
        }
    }

    pub fn manifest(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            kind: BlobKind::Manifest,
        }
    }

    /// Attachment-style file name (`BATCH_..._0001.part10.bin`)
    pub fn file_name(&self) -> String {
        match self.kind {
            BlobKind::Chunk { index } => format!("{}.part{index:06}.bin", self.batch_id),
            BlobKind::Manifest => format!("{}.manifest.json", self.batch_id),
            BlobKind::IndexBackup => format!("{}.index.json", self.batch_id),
        }
    }
}

/// Chat-style blob transport: upload into a destination, fetch by locator.
#[async_trait]
pub trait BlobTransport: Send + Sync + 'static {
    /// Create the destination if it does not exist yet.
    async fn ensure_destination(&self, dest: &str) -> Result<(), TransportError>;

    async fn upload_blob(
        &self,
        dest: &str,
        data: Bytes,
        meta: &BlobMeta,
    ) -> Result<Locator, TransportError>;

    async fn download_blob(&self, locator: &Locator) -> Result<Bytes, TransportError>;

    async fn list_blobs(&self, dest: &str) -> Result<Vec<Locator>, TransportError>;

    /// Deleting a blob that is already gone is `NotFound`.
    async fn delete_blob(&self, locator: &Locator) -> Result<(), TransportError>;
}

/// A card as read back from the index destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub id: String,
    pub body: String,
}

/// Append-mostly log of human-readable batch cards.
#[async_trait]
pub trait CardChannel: Send + Sync + 'static {
    async fn post_card(&self, index_dest: &str, body: &str) -> Result<String, TransportError>;

    async fn update_card(&self, card_id: &str, body: &str) -> Result<(), TransportError>;

    /// Every card in the destination, oldest first.
    async fn list_cards(&self, index_dest: &str) -> Result<Vec<Card>, TransportError>;
}
