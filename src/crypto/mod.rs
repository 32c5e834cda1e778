//! Cryptographic primitives for sherpa-sync.
//!
//! This module provides:
//! - AES-256-GCM sealing and opening (`encryption`)
//! - Argon2id password-based key derivation (`kdf`)
//! - Master-key lifecycle over the OS key store (`master_key`)

pub mod encryption;
pub mod kdf;
pub mod master_key;

// Re-export the most commonly used items so callers can write:
//   use crate::crypto::{seal, open, derive_backup_key, ...};
pub use encryption::{open, seal, MIN_SEALED_LEN, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_backup_key, generate_salt, SALT_LEN};
pub use master_key::{
    load_or_create, KeyStore, MasterKey, MemoryKeyStore, OsKeyStore, MASTER_KEY_LEN,
};
