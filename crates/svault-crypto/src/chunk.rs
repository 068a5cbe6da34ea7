//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = chunk_index (8 bytes, big-endian) || batch_id (UTF-8)
//! ```
//!
//! The AAD binds each chunk to its position and batch, so chunks cannot be
//! reordered or moved between batches without failing authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::error::CryptoError;
use crate::kdf::BatchKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt a single chunk with XChaCha20-Poly1305 under a fresh random nonce.
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt_chunk(
    key: &BatchKey,
    batch_id: &str,
    chunk_index: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let aad = build_aad(chunk_index, batch_id);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a single chunk. Never returns altered plaintext: any mismatch in
/// key, bytes, index or batch id is `CryptoError::Authentication`.
pub fn decrypt_chunk(
    key: &BatchKey,
    batch_id: &str,
    chunk_index: u64,
    encrypted: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated {
            len: encrypted.len(),
            min: NONCE_SIZE + TAG_SIZE,
        });
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let aad = build_aad(chunk_index, batch_id);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Build AAD: chunk_index (8 bytes BE) || batch_id
fn build_aad(chunk_index: u64, batch_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + batch_id.len());
    aad.extend_from_slice(&chunk_index.to_be_bytes());
    aad.extend_from_slice(batch_id.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ENCRYPTION_OVERHEAD, KEY_SIZE};
    use proptest::prelude::*;

    fn key(byte: u8) -> BatchKey {
        BatchKey::from_bytes([byte; KEY_SIZE])
    }

    const BATCH: &str = "BATCH_20260101_120000_0001";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(1);
        let plaintext = b"hello, encrypted world!";

        let encrypted = encrypt_chunk(&k, BATCH, 0, plaintext).unwrap();
        let decrypted = decrypt_chunk(&k, BATCH, 0, &encrypted).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let k = key(1);
        let encrypted = encrypt_chunk(&k, BATCH, 0, b"").unwrap();
        assert_eq!(encrypted.len(), ENCRYPTION_OVERHEAD);
        assert_eq!(decrypt_chunk(&k, BATCH, 0, &encrypted).unwrap(), b"");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let k = key(1);
        let a = encrypt_chunk(&k, BATCH, 0, b"same").unwrap();
        let b = encrypt_chunk(&k, BATCH, 0, b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let encrypted = encrypt_chunk(&key(1), BATCH, 0, b"secret data").unwrap();
        let result = decrypt_chunk(&key(2), BATCH, 0, &encrypted);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_decrypt_wrong_chunk_index() {
        let k = key(1);
        let encrypted = encrypt_chunk(&k, BATCH, 0, b"secret data").unwrap();
        let result = decrypt_chunk(&k, BATCH, 1, &encrypted);
        assert!(
            matches!(result, Err(CryptoError::Authentication)),
            "wrong chunk_index must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_decrypt_wrong_batch() {
        let k = key(1);
        let encrypted = encrypt_chunk(&k, BATCH, 0, b"secret data").unwrap();
        let result = decrypt_chunk(&k, "BATCH_20260101_120000_0002", 0, &encrypted);
        assert!(result.is_err(), "chunk moved between batches must fail");
    }

    #[test]
    fn test_encrypted_size() {
        let k = key(1);
        let encrypted = encrypt_chunk(&k, BATCH, 0, &vec![0u8; 1000]).unwrap();
        // nonce (24) + plaintext (1000) + tag (16) = 1040
        assert_eq!(encrypted.len(), 24 + 1000 + 16);
    }

    #[test]
    fn test_truncated_input() {
        let result = decrypt_chunk(&key(1), BATCH, 0, &[0u8; 10]);
        assert!(matches!(result, Err(CryptoError::Truncated { len: 10, .. })));
    }

    proptest! {
        #[test]
        fn roundtrip_any_payload(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            index in any::<u64>(),
        ) {
            let k = key(9);
            let encrypted = encrypt_chunk(&k, BATCH, index, &data).unwrap();
            prop_assert_eq!(encrypted.len(), data.len() + ENCRYPTION_OVERHEAD);
            let decrypted = decrypt_chunk(&k, BATCH, index, &encrypted).unwrap();
            prop_assert_eq!(decrypted, data);
        }

        #[test]
        fn any_flipped_byte_fails(
            data in proptest::collection::vec(any::<u8>(), 1..=512),
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let k = key(9);
            let mut encrypted = encrypt_chunk(&k, BATCH, 3, &data).unwrap();
            let i = pos.index(encrypted.len());
            encrypted[i] ^= flip;
            let result = decrypt_chunk(&k, BATCH, 3, &encrypted);
            prop_assert!(matches!(result, Err(CryptoError::Authentication)));
        }
    }
}
