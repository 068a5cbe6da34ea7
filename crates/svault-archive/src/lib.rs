//! svault-archive: the slicevault archive engine
//!
//! - `manifest`: versioned JSON description of a batch
//! - `index`: local metadata index (batches, chunks, files)
//! - `distribution`: destination choice for new batches
//! - `card`: human-readable batch cards with a machine-readable tail
//! - `engine`: settings, shared handles, delete/list/stats/backup
//! - `upload`: slice and resume
//! - `download`: assemble and verify
//! - `reconcile`: rebuild the index from the card history

pub mod card;
pub mod distribution;
pub mod download;
pub mod engine;
pub mod index;
pub mod manifest;
pub mod reconcile;
pub mod retry;
pub mod upload;

pub use download::AssembleReport;
pub use engine::{Engine, EngineSettings, Progress, ProgressFn, SliceOptions};
pub use index::MetadataIndex;
pub use manifest::{Manifest, MANIFEST_VERSION};
