//! svault-core: types shared by every slicevault crate
//!
//! - `config`: TOML configuration schema (`svault.toml`)
//! - `error`: the engine's error taxonomy
//! - `types`: batches, chunks, file records, filters, and reports

pub mod config;
pub mod error;
pub mod types;

pub use error::{SvaultError, SvaultResult};
pub use types::{
    format_bytes, Aggregate, Batch, BatchFilter, BatchStatus, ChunkMismatch, ChunkRecord,
    ChunkStatus, DestinationTotals, FileRecord, SyncMode, SyncReport, VerifyReport,
};
