//! Master-key management backed by the OS secure key-value store.
//!
//! The master key protects the on-disk settings file.  It is generated
//! once per user profile, persisted in the platform credential store
//! (Keychain / Credential Manager / Secret Service), and cached in
//! memory for the process lifetime.  It is never rotated automatically
//! and is distinct from any backup password-derived key.

use rand::RngCore;
use zeroize::Zeroize;

use crate::errors::{Result, SyncError};

/// Length of the master key in bytes (256 bits).
pub const MASTER_KEY_LEN: usize = 32;

/// Service name used in the OS credential store.
const SERVICE_NAME: &str = "sherpa-sync";

/// Entry name identifying the master key within the service.
const ENTRY_NAME: &str = "settings-master-key";

/// A wrapper around the 32-byte master key that automatically zeroes
/// its memory when dropped.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    /// Create a new `MasterKey` from raw bytes.
    pub fn new(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Access the raw key bytes (e.g. to pass to the AEAD layer).
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }
}

/// Abstraction over the OS-level secure key-value store, so tests can
/// swap in an in-memory implementation instead of the real keyring.
pub trait KeyStore: Send + Sync {
    /// Load the persisted master-key bytes, or `None` if no key exists yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Persist the master-key bytes.
    fn store(&self, key: &[u8]) -> Result<()>;
}

/// Load the master key from `store`, generating and persisting a fresh
/// one on first use.
///
/// Callers serialize access to this function (the settings store calls
/// it under its own lock), so concurrent first-time initialization
/// cannot mint two different keys.
pub fn load_or_create(store: &dyn KeyStore) -> Result<MasterKey> {
    if let Some(mut bytes) = store.load()? {
        if bytes.len() != MASTER_KEY_LEN {
            bytes.zeroize();
            return Err(SyncError::KeyStoreError(format!(
                "stored master key has {} bytes, expected {MASTER_KEY_LEN}",
                bytes.len()
            )));
        }
        let mut fixed = [0u8; MASTER_KEY_LEN];
        fixed.copy_from_slice(&bytes);
        bytes.zeroize();
        tracing::debug!("loaded existing master key from OS key store");
        return Ok(MasterKey::new(fixed));
    }

    // First use: generate a random key and persist it before returning.
    let mut fresh = [0u8; MASTER_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut fresh);
    store.store(&fresh)?;
    tracing::info!("generated new master key and stored it in the OS key store");
    Ok(MasterKey::new(fresh))
}

// ---------------------------------------------------------------------------
// OS-backed implementation
// ---------------------------------------------------------------------------

/// Production `KeyStore` backed by the platform credential store:
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service (GNOME Keyring / KDE Wallet)
pub struct OsKeyStore {
    service: String,
    entry: String,
}

impl OsKeyStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            entry: ENTRY_NAME.to_string(),
        }
    }

    /// Create a key store with custom service/entry names (useful for
    /// keeping test runs isolated from the real profile).
    pub fn with_names(service: &str, entry: &str) -> Self {
        Self {
            service: service.to_string(),
            entry: entry.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.entry)
            .map_err(|e| SyncError::KeyStoreError(format!("failed to create keyring entry: {e}")))
    }
}

impl Default for OsKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for OsKeyStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        let entry = self.entry()?;
        match entry.get_secret() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SyncError::KeyStoreError(format!(
                "failed to read master key from keyring: {e}"
            ))),
        }
    }

    fn store(&self, key: &[u8]) -> Result<()> {
        let entry = self.entry()?;
        entry.set_secret(key).map_err(|e| {
            SyncError::KeyStoreError(format!("failed to store master key in keyring: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// A `KeyStore` that keeps the master key in memory.  Used by tests and
/// by embedders that manage persistence themselves.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: std::sync::Mutex<Option<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.key.lock().expect("key store lock poisoned").clone())
    }

    fn store(&self, key: &[u8]) -> Result<()> {
        *self.key.lock().expect("key store lock poisoned") = Some(key.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_generates_and_persists_a_key() {
        let store = MemoryKeyStore::new();
        assert!(store.load().unwrap().is_none());

        let key = load_or_create(&store).unwrap();
        assert_eq!(key.as_bytes().len(), MASTER_KEY_LEN);

        // The generated key must now be persisted.
        let persisted = store.load().unwrap().expect("key should be stored");
        assert_eq!(persisted.as_slice(), key.as_bytes());
    }

    #[test]
    fn subsequent_loads_return_the_same_key() {
        let store = MemoryKeyStore::new();
        let first = load_or_create(&store).unwrap();
        let second = load_or_create(&store).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn wrong_length_key_is_rejected() {
        let store = MemoryKeyStore::new();
        store.store(&[0u8; 16]).unwrap();

        let result = load_or_create(&store);
        assert!(matches!(result, Err(SyncError::KeyStoreError(_))));
    }
}
