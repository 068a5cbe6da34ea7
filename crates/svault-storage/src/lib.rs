//! svault-storage: the blob transport boundary and its OpenDAL implementation
//!
//! The engine only ever talks to `BlobTransport` (chunk and manifest blobs)
//! and `CardChannel` (one human-readable card per batch). `OpendalTransport`
//! implements both over any OpenDAL service.

pub mod blob_store;
pub mod health;
pub mod operator;
pub mod transport;

pub use blob_store::OpendalTransport;
pub use health::{check_destinations, check_health, DestinationHealth};
pub use operator::{build_operator, build_s3_operator, S3Credentials};
pub use transport::{BlobKind, BlobMeta, BlobTransport, Card, CardChannel, Locator, TransportError};
