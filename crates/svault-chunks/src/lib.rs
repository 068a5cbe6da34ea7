//! svault-chunks: turning files into bounded, hash-verified segments and back
//!
//! # Overview
//! - `blake3`: deterministic file/slice hashing (content identity)
//! - `compress`: zstd at a fixed level, applied per segment
//! - `chunker`: lazy fixed-size splitting of a byte stream, plus size budgeting
//! - `pack`: scanning inputs and packing/unpacking them as a tar stream

pub mod blake3;
pub mod chunker;
pub mod compress;
pub mod pack;

// Convenience re-exports for the most common operations
pub use blake3::{hash_bytes, hash_file_streaming, hash_from_hex, hash_to_hex, Hash};
pub use chunker::{expected_chunk_count, rejoin, segment_budget, split, Chunker, Segment};
pub use compress::{compress, decompress, max_compressed_len, COMPRESSION_LEVEL};
pub use pack::{scan, unpack_archive, write_archive, ScanResult, ScannedFile};
