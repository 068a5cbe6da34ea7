//! svault-crypto: per-batch encryption for slicevault
//!
//! Pipeline: packed stream → segment → zstd compress → encrypt → BLAKE3 hash ciphertext → upload
//!
//! Key derivation:
//! ```text
//! Secret (deployment-wide)
//!   └── Batch Key (256-bit, PBKDF2-HMAC-SHA256, per-batch random 128-bit salt)
//!       ├── Chunk AEAD: XChaCha20-Poly1305 (nonce=random_192bit, AAD=chunk_idx||batch_id)
//!       └── Key check: BLAKE3 keyed hash, stored in the manifest
//! ```

pub mod chunk;
pub mod error;
pub mod kdf;
pub mod keys;

pub use chunk::{decrypt_chunk, encrypt_chunk};
pub use error::CryptoError;
pub use kdf::{derive_batch_key, BatchKey, KdfParams};
pub use keys::{decode_salt, encode_salt, generate_salt, key_check, verify_key_check};

/// Size of a batch key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the per-batch KDF salt
pub const SALT_SIZE: usize = 16;

/// Bytes added to every chunk by encryption (nonce prefix + tag)
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
