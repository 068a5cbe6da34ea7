//! Salt handling and the key-check tag

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::CryptoError;
use crate::kdf::BatchKey;
use crate::SALT_SIZE;

const KEY_CHECK_CONTEXT: &[u8] = b"slicevault key check v1";

/// Generate a random per-batch KDF salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Encode a salt for storage in the index and manifest.
pub fn encode_salt(salt: &[u8; SALT_SIZE]) -> String {
    STANDARD.encode(salt)
}

pub fn decode_salt(encoded: &str) -> Result<[u8; SALT_SIZE], CryptoError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidSalt(e.to_string()))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidSalt(format!("expected {SALT_SIZE} bytes, got {}", v.len()))
    })
}

/// Keyed BLAKE3 tag over a fixed context.
///
/// Stored beside the salt so a wrong secret is reported before any chunk is
/// fetched. Reveals nothing about the key beyond equality.
pub fn key_check(key: &BatchKey) -> String {
    blake3::keyed_hash(key.as_bytes(), KEY_CHECK_CONTEXT)
        .to_hex()
        .to_string()
}

/// Constant-time comparison of a stored tag against `key`.
pub fn verify_key_check(key: &BatchKey, stored: &str) -> bool {
    match blake3::Hash::from_hex(stored) {
        // blake3::Hash equality is constant-time
        Ok(expected) => blake3::keyed_hash(key.as_bytes(), KEY_CHECK_CONTEXT) == expected,
        Err(_) => false,
    }
}
