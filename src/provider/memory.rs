//! In-memory provider.
//!
//! Implements the full storage contract over a `BTreeMap`.  Used by the
//! service tests (no remote backend, no sanitization to exercise) and
//! by embedders that want the services without a cloud account.  Every
//! `get` is recorded so tests can assert which entries an operation
//! actually fetched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::Result;

use super::{finish_listing, SecretsProvider};

#[derive(Default)]
pub struct MemoryProvider {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fetched: Mutex<Vec<String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys passed to `get` so far, in call order.
    pub fn fetched_keys(&self) -> Vec<String> {
        self.fetched.lock().expect("fetch log poisoned").clone()
    }

    /// Remove an entry directly, bypassing the contract.  Lets tests
    /// simulate out-of-band deletion by another machine.
    pub fn remove_raw(&self, key: &str) {
        self.entries.lock().expect("entries poisoned").remove(key);
    }

    /// Insert an entry directly, bypassing the contract.
    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.entries
            .lock()
            .expect("entries poisoned")
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl SecretsProvider for MemoryProvider {
    async fn test_connection(&self) -> bool {
        true
    }

    async fn store(
        &self,
        key: &str,
        value: &[u8],
        _tags: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        self.entries
            .lock()
            .expect("entries poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.fetched
            .lock()
            .expect("fetch log poisoned")
            .push(key.to_string());
        Ok(self.entries.lock().expect("entries poisoned").get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.entries.lock().expect("entries poisoned").remove(key);
        // Idempotent: absent keys delete successfully too.
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .expect("entries poisoned")
            .contains_key(key))
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .entries
            .lock()
            .expect("entries poisoned")
            .keys()
            .cloned()
            .collect();
        Ok(finish_listing(keys, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contract_basics() {
        let provider = MemoryProvider::new();

        assert!(provider.store("a/one", b"1", None).await.unwrap());
        assert!(provider.store("b/two", b"2", None).await.unwrap());

        assert!(provider.exists("a/one").await.unwrap());
        assert_eq!(provider.get("a/one").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(provider.get("missing").await.unwrap(), None);

        assert_eq!(
            provider.list(Some("a/")).await.unwrap(),
            vec!["a/one".to_string()]
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let provider = MemoryProvider::new();
        provider.store("k", b"v", None).await.unwrap();

        assert!(provider.delete("k").await.unwrap());
        assert!(provider.delete("k").await.unwrap(), "second delete succeeds");
        assert!(!provider.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn fetches_are_recorded() {
        let provider = MemoryProvider::new();
        provider.store("k", b"v", None).await.unwrap();

        let _ = provider.get("k").await.unwrap();
        let _ = provider.get("other").await.unwrap();

        assert_eq!(provider.fetched_keys(), vec!["k", "other"]);
    }
}
