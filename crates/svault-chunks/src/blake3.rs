//! BLAKE3 content hashing for files, readers and byte slices
//!
//! Every plaintext segment, transmitted chunk and packed file is identified
//! by its BLAKE3 digest, stored as 64 lowercase hex chars.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hash everything a reader yields, returning the digest and byte count.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(Hash, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024]; // 64KB read buffer
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).context("reading for hash")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

/// Hash a file using the streaming interface (never loads it fully)
pub fn hash_file_streaming(path: &Path) -> Result<Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening file for streaming hash: {}", path.display()))?;
    let (hash, _) =
        hash_reader(file).with_context(|| format!("hashing {}", path.display()))?;
    Ok(hash)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_hash_is_deterministic() {
        assert_eq!(hash_bytes(b""), hash_bytes(b""));
    }

    #[test]
    fn hash_hex_roundtrip() {
        let h = hash_bytes(b"hello slicevault");
        let hex = hash_to_hex(&h);
        assert_eq!(hex.len(), 64);
        assert_eq!(hash_from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(hash_from_hex("xyz").is_err());
    }

    #[test]
    fn streaming_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file_streaming(&path).unwrap(), hash_bytes(&data));
        let (h, n) = hash_reader(&data[..]).unwrap();
        assert_eq!(h, hash_bytes(&data));
        assert_eq!(n, data.len() as u64);
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            prop_assert_eq!(hash_bytes(&data), hash_bytes(&data));
        }
    }
}
