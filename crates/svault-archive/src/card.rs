//! Batch cards: the human-readable summary posted to the index destination.
//!
//! The body is free text for people browsing the channel, followed by a
//! single `META:` line carrying JSON the reconciler reads back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use svault_core::{format_bytes, Batch, BatchStatus};

const META_MARKER: &str = "META:";

/// Machine-readable part of a card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMeta {
    pub batch_id: String,
    pub status: BatchStatus,
    pub destination: String,
    /// Locator of the manifest blob, once uploaded
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub chunk_count: u64,
    #[serde(default)]
    pub created_at: i64,
}

impl CardMeta {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            destination: batch.destination.clone(),
            manifest: batch.manifest_locator.clone(),
            chunk_count: batch.chunk_count,
            created_at: batch.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum CardError {
    #[error("card has no {META_MARKER} line")]
    MissingMeta,

    #[error("card metadata is malformed: {0}")]
    Malformed(String),
}

/// Render the card body for `batch` with `uploaded` chunks acknowledged.
pub fn render_card(batch: &Batch, uploaded: u64) -> String {
    let mut lines = vec![
        "SliceVault archive".to_string(),
        format!("Batch ID: {}", batch.batch_id),
        format!("Name: {}", batch.original_name),
    ];
    if let Some(title) = &batch.title {
        lines.push(format!("Title: {title}"));
    }
    if !batch.tags.is_empty() {
        lines.push(format!("Tags: {}", batch.tags.join(", ")));
    }
    if let Some(description) = &batch.description {
        lines.push(format!("Description: {description}"));
    }
    lines.push(format!("Status: {}", batch.status));
    lines.push(format!(
        "Size: {} in {} file(s)",
        format_bytes(batch.total_size),
        batch.file_count
    ));
    if batch.chunk_count > 0 {
        lines.push(format!("Chunks: {uploaded}/{}", batch.chunk_count));
    } else {
        lines.push(format!("Chunks: {uploaded} uploaded"));
    }
    if batch.stored_size > 0 {
        lines.push(format!("Stored: {}", format_bytes(batch.stored_size)));
    }
    lines.push(format!("Destination: {}", batch.destination));

    let meta = CardMeta::from_batch(batch);
    // CardMeta holds only strings and integers, serialization cannot fail.
    let json = serde_json::to_string(&meta).unwrap_or_default();
    lines.push(format!("{META_MARKER} {json}"));
    lines.join("\n")
}

/// Extract the metadata from a card body. The last `META:` line wins.
pub fn parse_card(body: &str) -> Result<CardMeta, CardError> {
    let line = body
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(META_MARKER))
        .ok_or(CardError::MissingMeta)?;
    let meta: CardMeta =
        serde_json::from_str(line.trim()).map_err(|e| CardError::Malformed(e.to_string()))?;
    if meta.batch_id.is_empty() {
        return Err(CardError::Malformed("empty batch id".into()));
    }
    Ok(meta)
}
