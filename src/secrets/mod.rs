//! Managed secrets service.
//!
//! Each logical secret is split across two provider entries under
//! separate prefixes: the raw bytes under `sherpa-secrets/{key}` and a
//! metadata sidecar under `sherpa-secrets-meta/{key}`.  A secret exists
//! if and only if its metadata entry is present and parseable — the
//! value entry alone is invisible.
//!
//! Writes go value-first, then metadata.  A crash between the two
//! leaves the metadata absent and the secret invisible to `list`/`get`,
//! which is the intended failure mode: an invisible orphan value beats
//! a visible secret whose bytes cannot be fetched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};
use crate::provider::ProviderSource;

/// Provider prefix for secret values.
pub const VALUE_PREFIX: &str = "sherpa-secrets/";

/// Provider prefix for secret metadata sidecars.
pub const META_PREFIX: &str = "sherpa-secrets-meta/";

/// What a managed secret holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    Text,
    File,
}

/// Metadata describing one managed secret.  The value bytes live in a
/// separate provider entry and are fetched independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedSecret {
    pub key: String,
    pub kind: SecretKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Name the file had when it was imported (file-typed secrets only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_name: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CRUD over managed secrets on the active cloud provider.
pub struct ManagedSecretsService {
    source: Arc<dyn ProviderSource>,
}

impl ManagedSecretsService {
    pub fn new(source: Arc<dyn ProviderSource>) -> Self {
        Self { source }
    }

    fn value_key(key: &str) -> String {
        format!("{VALUE_PREFIX}{key}")
    }

    fn meta_key(key: &str) -> String {
        format!("{META_PREFIX}{key}")
    }

    /// All secrets whose metadata is present and parseable.
    ///
    /// Entries with missing or unparsable metadata are skipped: a
    /// partially-written secret from an interrupted session must not
    /// break enumeration for everything else.  Use `list_corrupt` to
    /// surface what this skips.
    pub async fn list(&self) -> Result<Vec<ManagedSecret>> {
        let provider = self.source.active_provider()?;

        let mut secrets = Vec::new();
        for meta_key in provider.list(Some(META_PREFIX)).await? {
            match provider.get(&meta_key).await? {
                Some(bytes) => match serde_json::from_slice::<ManagedSecret>(&bytes) {
                    Ok(secret) => secrets.push(secret),
                    Err(e) => {
                        tracing::debug!("skipping secret with unparsable metadata '{meta_key}': {e}");
                    }
                },
                None => {
                    tracing::debug!("skipping secret with missing metadata '{meta_key}'");
                }
            }
        }
        Ok(secrets)
    }

    /// Metadata keys that `list` would skip: present in the metadata
    /// namespace but missing or unparsable.  Diagnostic only.
    pub async fn list_corrupt(&self) -> Result<Vec<String>> {
        let provider = self.source.active_provider()?;

        let mut corrupt = Vec::new();
        for meta_key in provider.list(Some(META_PREFIX)).await? {
            let ok = match provider.get(&meta_key).await? {
                Some(bytes) => serde_json::from_slice::<ManagedSecret>(&bytes).is_ok(),
                None => false,
            };
            if !ok {
                corrupt.push(meta_key);
            }
        }
        Ok(corrupt)
    }

    /// The metadata for `key`, or `None`.  Metadata presence alone
    /// decides existence.
    pub async fn get(&self, key: &str) -> Result<Option<ManagedSecret>> {
        let provider = self.source.active_provider()?;

        let bytes = match provider.get(&Self::meta_key(key)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match serde_json::from_slice(&bytes) {
            Ok(secret) => Ok(Some(secret)),
            Err(e) => {
                tracing::debug!("metadata for '{key}' is unparsable: {e}");
                Ok(None)
            }
        }
    }

    /// The value bytes for `key`, or `None`.  Retrievable independently
    /// of the metadata entry.
    pub async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let provider = self.source.active_provider()?;
        provider.get(&Self::value_key(key)).await
    }

    /// Create a secret: value entry first, then the metadata entry that
    /// makes it visible.
    pub async fn create(
        &self,
        key: &str,
        value: &[u8],
        kind: SecretKind,
        description: Option<&str>,
        original_file_name: Option<&str>,
    ) -> Result<bool> {
        if key.is_empty() {
            return Err(SyncError::ValidationError(
                "secret key cannot be empty".into(),
            ));
        }
        let provider = self.source.active_provider()?;

        if !provider.store(&Self::value_key(key), value, None).await? {
            return Ok(false);
        }

        let now = Utc::now();
        let secret = ManagedSecret {
            key: key.to_string(),
            kind,
            description: description.map(str::to_string),
            original_file_name: original_file_name.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let meta_bytes = serde_json::to_vec(&secret)
            .map_err(|e| SyncError::SerializationError(format!("secret metadata: {e}")))?;

        provider.store(&Self::meta_key(key), &meta_bytes, None).await
    }

    /// Merge the supplied fields into an existing secret and refresh its
    /// updated timestamp.  Returns `false` — not an error — when the
    /// secret does not exist.
    pub async fn update(
        &self,
        key: &str,
        value: Option<&[u8]>,
        description: Option<&str>,
    ) -> Result<bool> {
        let mut secret = match self.get(key).await? {
            Some(secret) => secret,
            None => return Ok(false),
        };
        let provider = self.source.active_provider()?;

        if let Some(value) = value {
            if !provider.store(&Self::value_key(key), value, None).await? {
                return Ok(false);
            }
        }
        if let Some(description) = description {
            secret.description = Some(description.to_string());
        }
        secret.updated_at = Utc::now();

        let meta_bytes = serde_json::to_vec(&secret)
            .map_err(|e| SyncError::SerializationError(format!("secret metadata: {e}")))?;
        provider.store(&Self::meta_key(key), &meta_bytes, None).await
    }

    /// Delete both entries.  Metadata goes first so an interruption
    /// leaves an invisible orphan value rather than a visible secret
    /// with no bytes.  Safe to call twice — provider deletes are
    /// idempotent.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let provider = self.source.active_provider()?;

        let meta = provider.delete(&Self::meta_key(key)).await?;
        let value = provider.delete(&Self::value_key(key)).await?;
        Ok(meta && value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, SecretsProvider, StaticProviderSource};

    fn service_over(provider: Arc<MemoryProvider>) -> ManagedSecretsService {
        ManagedSecretsService::new(Arc::new(StaticProviderSource(provider)))
    }

    #[tokio::test]
    async fn create_rejects_empty_key() {
        let service = service_over(Arc::new(MemoryProvider::new()));
        let result = service
            .create("", b"value", SecretKind::Text, None, None)
            .await;
        assert!(matches!(result, Err(SyncError::ValidationError(_))));
    }

    #[tokio::test]
    async fn update_on_missing_key_returns_false() {
        let provider = Arc::new(MemoryProvider::new());
        let service = service_over(Arc::clone(&provider));

        let updated = service.update("ghost", Some(b"v"), None).await.unwrap();
        assert!(!updated);
        // Nothing may be written for a missing key.
        assert!(provider.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_merges_only_supplied_fields() {
        let provider = Arc::new(MemoryProvider::new());
        let service = service_over(Arc::clone(&provider));

        service
            .create("token", b"v1", SecretKind::Text, Some("CI token"), None)
            .await
            .unwrap();
        let before = service.get("token").await.unwrap().unwrap();

        // Update the value only: the description must survive.
        assert!(service.update("token", Some(b"v2"), None).await.unwrap());
        let after = service.get("token").await.unwrap().unwrap();

        assert_eq!(after.description.as_deref(), Some("CI token"));
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(
            service.get_value("token").await.unwrap(),
            Some(b"v2".to_vec())
        );
    }

    #[tokio::test]
    async fn unparsable_metadata_hides_the_secret() {
        let provider = Arc::new(MemoryProvider::new());
        let service = service_over(Arc::clone(&provider));

        service
            .create("good", b"v", SecretKind::Text, None, None)
            .await
            .unwrap();
        provider.insert_raw("sherpa-secrets-meta/bad", b"not json");
        provider.insert_raw("sherpa-secrets/bad", b"orphan bytes");

        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "good");
        assert!(service.get("bad").await.unwrap().is_none());

        // The diagnostic enumeration surfaces what list hides.
        assert_eq!(
            service.list_corrupt().await.unwrap(),
            vec!["sherpa-secrets-meta/bad".to_string()]
        );
    }
}
