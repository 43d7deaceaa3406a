//! AES-256-GCM envelope encryption for broker access tokens.
//!
//! Every call to [`encrypt`] draws a fresh 96-bit nonce from the OS RNG and
//! prepends it to the ciphertext, so the output is a single opaque blob:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The master key must be 32 bytes (256 bits) and is provided from an
//! environment variable at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Cipher failures.
///
/// None of the variants carry plaintext or key bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Key is not exactly 256 bits. Raised before any cryptographic work.
    #[error("encryption key must be {KEY_SIZE} bytes (256 bits), got {0} bytes")]
    InvalidKeyLength(usize),

    /// Key material is not valid base64.
    #[error("encryption key is not valid base64")]
    InvalidKeyEncoding,

    /// Blob is too short to contain a nonce and tag.
    #[error("encrypted blob too short: {0} bytes")]
    Truncated(usize),

    /// Tag verification failed (wrong key, tampered or corrupted data).
    #[error("ciphertext failed authentication")]
    Authentication,

    /// The AEAD backend refused to seal the plaintext.
    #[error("encryption failed")]
    Encryption,
}

/// Decodes a base64 master key and checks it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<[u8; KEY_SIZE], CipherError> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|_| CipherError::InvalidKeyEncoding)?;

    key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CipherError::InvalidKeyLength(key_bytes.len()))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

/// Encrypts `plaintext` under `key`, returning `nonce || ciphertext || tag`.
///
/// # Security
/// - Uses a cryptographically secure random nonce (never reuse)
/// - No associated data
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Decrypts a blob produced by [`encrypt`].
///
/// Fails closed: a short blob is rejected before the cipher runs, and a tag
/// mismatch never yields partial plaintext.
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CipherError::Truncated(blob.len()));
    }

    let (nonce_bytes, sealed) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, sealed)
        .map_err(|_| CipherError::Authentication)
}
