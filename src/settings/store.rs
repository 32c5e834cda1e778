//! Encrypted local settings store.
//!
//! `SettingsStore` owns the on-disk settings file and an explicit
//! read-through cache in front of it.  All reads and writes go through
//! one per-process lock; the read-modify-write `update` holds that lock
//! across the full transform so concurrent callers cannot produce a
//! lost update.
//!
//! On-disk layout of the settings file:
//!   [ 12-byte nonce | 16-byte auth tag | ciphertext ]
//!
//! A sibling `<file>.bak` holds the prior revision, copied best-effort
//! before every overwrite.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::crypto::master_key::{load_or_create, KeyStore, MasterKey};
use crate::crypto::{open, seal};
use crate::errors::{Result, SyncError};

use super::model::SettingsAggregate;

/// Callback invoked synchronously after every successful save.
pub type ChangeListener = Box<dyn Fn(&SettingsAggregate) + Send + Sync>;

struct Inner {
    /// Read-through cache; `None` means the next `get` reads from disk.
    cache: Option<SettingsAggregate>,

    /// Master key, acquired lazily under this same lock so concurrent
    /// first-time initialization cannot mint two keys.
    master_key: Option<Arc<MasterKey>>,
}

/// The encrypted settings store.
pub struct SettingsStore {
    /// Path to the encrypted settings file on disk.
    path: PathBuf,

    /// OS-level secure store persisting the master key.
    key_store: Arc<dyn KeyStore>,

    inner: Mutex<Inner>,

    listeners: Mutex<Vec<ChangeListener>>,
}

impl SettingsStore {
    /// Create a store over the settings file at `path`.
    ///
    /// Nothing is read or decrypted until the first `get`.
    pub fn new(path: impl Into<PathBuf>, key_store: Arc<dyn KeyStore>) -> Self {
        Self {
            path: path.into(),
            key_store,
            inner: Mutex::new(Inner {
                cache: None,
                master_key: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current settings aggregate.
    ///
    /// Serves the cached value when present; otherwise reads and
    /// decrypts the file, caching the result.  A missing file yields an
    /// empty default aggregate — never an error.  A failed decryption
    /// (tag mismatch from a corrupted or foreign file) propagates as
    /// `SyncError::AuthenticationFailed` and is never treated as empty
    /// settings.
    pub fn get(&self) -> Result<SettingsAggregate> {
        let mut inner = self.inner.lock().expect("settings lock poisoned");
        self.get_locked(&mut inner)
    }

    /// Encrypt and persist `aggregate`, replacing the current settings.
    ///
    /// Stamps `last_modified`, keeps a `.bak` copy of the prior
    /// revision, writes atomically, refreshes the cache, and fires
    /// change listeners synchronously.
    pub fn save(&self, aggregate: SettingsAggregate) -> Result<SettingsAggregate> {
        let saved = {
            let mut inner = self.inner.lock().expect("settings lock poisoned");
            self.save_locked(&mut inner, aggregate)?
        };
        self.notify(&saved);
        Ok(saved)
    }

    /// Read-modify-write under the store lock.
    ///
    /// The lock is held across `transform`, so two concurrent updates
    /// serialize instead of clobbering each other.
    pub fn update<F>(&self, transform: F) -> Result<SettingsAggregate>
    where
        F: FnOnce(SettingsAggregate) -> SettingsAggregate,
    {
        let saved = {
            let mut inner = self.inner.lock().expect("settings lock poisoned");
            let current = self.get_locked(&mut inner)?;
            self.save_locked(&mut inner, transform(current))?
        };
        self.notify(&saved);
        Ok(saved)
    }

    /// File-presence check only — no decryption.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Drop the in-memory cache so the next `get` re-reads the file.
    pub fn invalidate(&self) {
        self.inner.lock().expect("settings lock poisoned").cache = None;
    }

    /// Register a listener fired synchronously after every save.
    pub fn subscribe(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Path of the `.bak` sibling holding the prior revision.
    pub fn backup_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{name}.bak"))
    }

    // ------------------------------------------------------------------
    // Locked internals
    // ------------------------------------------------------------------

    fn get_locked(&self, inner: &mut Inner) -> Result<SettingsAggregate> {
        if let Some(cached) = &inner.cache {
            return Ok(cached.clone());
        }

        if !self.path.exists() {
            let empty = SettingsAggregate::default();
            inner.cache = Some(empty.clone());
            return Ok(empty);
        }

        let blob = fs::read(&self.path)?;
        let key = self.master_key_locked(inner)?;
        let plaintext = open(key.as_bytes(), &blob)?;

        let aggregate: SettingsAggregate = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::SerializationError(format!("settings payload: {e}")))?;

        inner.cache = Some(aggregate.clone());
        Ok(aggregate)
    }

    fn save_locked(
        &self,
        inner: &mut Inner,
        mut aggregate: SettingsAggregate,
    ) -> Result<SettingsAggregate> {
        let key = self.master_key_locked(inner)?;

        // Keep the prior revision around.  Failure to copy is non-fatal:
        // the save itself must still go through.
        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, self.backup_path()) {
                tracing::warn!("could not keep .bak copy of settings: {e}");
            }
        }

        aggregate.last_modified = Utc::now();

        let plaintext = serde_json::to_vec(&aggregate)
            .map_err(|e| SyncError::SerializationError(format!("settings payload: {e}")))?;
        let blob = seal(key.as_bytes(), &plaintext)?;

        // Atomic write: temp file in the same directory, then rename.
        let parent = self.path.parent().unwrap_or(Path::new("."));
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy()
        ));
        fs::write(&tmp_path, &blob)?;
        fs::rename(&tmp_path, &self.path)?;

        inner.cache = Some(aggregate.clone());
        Ok(aggregate)
    }

    /// Acquire the master key, creating and persisting one on first use.
    ///
    /// Runs under the store lock, which makes first-use creation
    /// race-free across components sharing this store.
    fn master_key_locked(&self, inner: &mut Inner) -> Result<Arc<MasterKey>> {
        if let Some(key) = &inner.master_key {
            return Ok(Arc::clone(key));
        }
        let key = Arc::new(load_or_create(self.key_store.as_ref())?);
        inner.master_key = Some(Arc::clone(&key));
        Ok(key)
    }

    /// Fire change listeners outside the store lock so a listener may
    /// call back into the store.
    fn notify(&self, aggregate: &SettingsAggregate) {
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(aggregate);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::crypto::master_key::MemoryKeyStore;
    use crate::settings::model::{CloudProviderConfig, ProviderKind};

    fn store_in(dir: &TempDir) -> SettingsStore {
        SettingsStore::new(
            dir.path().join("settings.dat"),
            Arc::new(MemoryKeyStore::new()),
        )
    }

    #[test]
    fn get_returns_empty_default_when_no_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let aggregate = store.get().unwrap();
        assert!(aggregate.identities.is_empty());
        assert!(aggregate.active_provider_id.is_none());
        assert!(!store.exists());
    }

    #[test]
    fn save_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut aggregate = store.get().unwrap();
        aggregate.cloud_providers.push(CloudProviderConfig {
            id: "p1".into(),
            display_name: "Vault".into(),
            kind: ProviderKind::HashicorpVault,
            settings: Default::default(),
        });
        store.save(aggregate).unwrap();
        assert!(store.exists());

        // Invalidate so the next get must decrypt from disk.
        store.invalidate();
        let reread = store.get().unwrap();
        assert_eq!(reread.cloud_providers.len(), 1);
        assert_eq!(reread.cloud_providers[0].id, "p1");
    }

    #[test]
    fn save_keeps_bak_copy_of_prior_revision() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut first = store.get().unwrap();
        first.preferences.machine_label = "laptop".into();
        store.save(first).unwrap();
        let first_bytes = fs::read(dir.path().join("settings.dat")).unwrap();

        let mut second = store.get().unwrap();
        second.preferences.machine_label = "desktop".into();
        store.save(second).unwrap();

        let bak_bytes = fs::read(store.backup_path()).unwrap();
        assert_eq!(bak_bytes, first_bytes, ".bak must hold the prior revision");
    }

    #[test]
    fn corrupted_file_propagates_authentication_failure() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(store.get().unwrap()).unwrap();

        // Flip a byte in the ciphertext portion.
        let path = dir.path().join("settings.dat");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        store.invalidate();
        let result = store.get();
        assert!(
            matches!(result, Err(SyncError::AuthenticationFailed)),
            "corruption must never read as empty settings"
        );
    }

    #[test]
    fn foreign_key_cannot_read_the_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(store.get().unwrap()).unwrap();

        // A second store with a different master key must fail the tag check.
        let other = store_in(&dir);
        let result = other.get();
        assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
    }

    #[test]
    fn update_holds_lock_across_transform() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));

        // Seed a counter-like field.
        store
            .update(|mut s| {
                s.preferences.machine_label = "0".into();
                s
            })
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .update(|mut s| {
                        let n: u32 = s.preferences.machine_label.parse().unwrap();
                        s.preferences.machine_label = (n + 1).to_string();
                        s
                    })
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let final_state = store.get().unwrap();
        assert_eq!(
            final_state.preferences.machine_label, "8",
            "no increment may be lost"
        );
    }

    #[test]
    fn save_fires_change_listeners_synchronously() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        static FIRED: AtomicUsize = AtomicUsize::new(0);
        store.subscribe(Box::new(|_| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));

        store.save(store.get().unwrap()).unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn save_stamps_last_modified() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let before = store.get().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let saved = store.save(before.clone()).unwrap();
        assert!(saved.last_modified > before.last_modified);
    }
}
