use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag verification failed: wrong key, tampered or corrupted bytes, or
    /// a chunk presented at the wrong position or in the wrong batch.
    #[error("authentication failed: invalid key, corrupted data, or wrong chunk index/batch")]
    Authentication,

    #[error("encrypted chunk too short: {len} bytes (minimum {min})")]
    Truncated { len: usize, min: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid salt: {0}")]
    InvalidSalt(String),
}
