//! AES-256-GCM authenticated encryption.
//!
//! Each call to `seal` generates a fresh random 12-byte nonce.  The
//! authentication tag is carried between the nonce and the ciphertext,
//! which is the layout both the settings file and the backup payload
//! use on disk.
//!
//! Layout of the returned byte buffer:
//!   [ 12-byte nonce | 16-byte auth tag | ciphertext ]

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};

use crate::errors::{Result, SyncError};

/// Size of the AES-256-GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Smallest possible sealed blob: nonce + tag around an empty plaintext.
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

/// Encrypt `plaintext` with a 32-byte `key`.
///
/// Returns `nonce || tag || ciphertext`.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    // Build the cipher from the raw key bytes.
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SyncError::EncryptionFailed(format!("invalid key length: {e}")))?;

    // Generate a random 12-byte nonce.
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // The aead crate appends the tag to the ciphertext; split it back
    // out so the tag can sit up front per the on-disk layout.
    let mut combined = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SyncError::EncryptionFailed(format!("encryption error: {e}")))?;
    let tag = combined.split_off(combined.len() - TAG_LEN);
    let ciphertext = combined;

    let mut output = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&tag);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data that was produced by `seal`.
///
/// Expects `nonce || tag || ciphertext`.  A tag mismatch (wrong key or
/// corrupted bytes) returns `SyncError::AuthenticationFailed` — callers
/// must propagate it, never treat it as empty data.
pub fn open(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    // Make sure we have at least a nonce and a tag worth of bytes.
    if blob.len() < MIN_SEALED_LEN {
        return Err(SyncError::AuthenticationFailed);
    }

    let (nonce_bytes, rest) = blob.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    // Re-join ciphertext and tag into the order the aead crate expects.
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SyncError::AuthenticationFailed)?;

    cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| SyncError::AuthenticationFailed)
}
