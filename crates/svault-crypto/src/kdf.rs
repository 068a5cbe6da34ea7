//! Key derivation: secret + per-batch salt → batch key (PBKDF2-HMAC-SHA256)

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key protecting every chunk of one batch.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct BatchKey {
    bytes: [u8; KEY_SIZE],
}

impl BatchKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for BatchKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// HMAC-SHA256 iterations (default: 600,000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 600_000,
        }
    }
}

/// Derive a batch key from the deployment secret and the batch's salt.
///
/// The salt is random per batch and stored in the manifest (it does not need
/// to be secret). The same secret, salt and iteration count always yield the
/// same key, which is what lets a restored index decrypt old batches.
pub fn derive_batch_key(
    secret: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<BatchKey, CryptoError> {
    if params.iterations == 0 {
        return Err(CryptoError::KeyDerivation(
            "iteration count must be at least 1".into(),
        ));
    }
    if secret.expose_secret().is_empty() {
        return Err(CryptoError::KeyDerivation("secret is empty".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        secret.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut key,
    );
    tracing::trace!(iterations = params.iterations, "derived batch key");

    Ok(BatchKey::from_bytes(key))
}
