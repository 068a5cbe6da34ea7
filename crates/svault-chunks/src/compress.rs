//! Per-segment zstd compression
//!
//! The level is fixed so that re-deriving a batch's segments (resume) is
//! reproducible; decompression does not depend on it.

use anyhow::{Context, Result};

/// zstd level used for every segment
pub const COMPRESSION_LEVEL: i32 = 9;

/// Single-pass compression, so the output never exceeds `max_compressed_len`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, COMPRESSION_LEVEL).context("zstd compress segment")
}

/// Decompress one segment. Output larger than `max_len` is an error, so a
/// forged frame cannot inflate past the batch's segment size.
pub fn decompress(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    zstd::bulk::decompress(data, max_len).context("zstd decompress segment")
}

/// Worst-case compressed size of `len` input bytes, frame header included.
pub fn max_compressed_len(len: usize) -> usize {
    zstd::zstd_safe::compress_bound(len)
}
