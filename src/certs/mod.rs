//! Certificate synchronization service.
//!
//! Each certificate occupies three provider entries sharing a
//! serial-derived key stem:
//! - `CERT_{serial}_META` — JSON metadata, including the caller-visible
//!   certificate id (the provider key carries the serial, not the id —
//!   deliberately different keys)
//! - `CERT_{serial}_P12` — the PKCS#12 bundle
//! - `CERT_{serial}_PWD` — the bundle password
//!
//! Resolution is a linear scan over the `_META` entries; bundle and
//! password are fetched only after the id matches, so key material for
//! non-matching certificates never crosses the wire.

pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};
use crate::provider::ProviderSource;

pub use store::{
    default_certificate_store, CachedCertificateStore, CertificateStore,
    KeychainCertificateStore, RecordingCertificateStore, SigningIdentity,
    UnsupportedCertificateStore,
};

/// Prefix shared by all certificate entries.
pub const CERT_PREFIX: &str = "CERT_";

const META_SUFFIX: &str = "_META";
const P12_SUFFIX: &str = "_P12";
const PWD_SUFFIX: &str = "_PWD";

/// Metadata sidecar describing one synchronized certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateSecretMetadata {
    /// The caller-visible identifier — lives only in this payload.
    pub certificate_id: String,

    pub serial_number: String,
    pub common_name: String,

    /// Development / distribution and friends.
    pub certificate_type: String,

    pub expires_at: DateTime<Utc>,

    /// Label of the machine that published this certificate.
    pub created_by_machine: String,

    pub created_at: DateTime<Utc>,
}

fn meta_key(serial: &str) -> String {
    format!("{CERT_PREFIX}{serial}{META_SUFFIX}")
}

fn p12_key(serial: &str) -> String {
    format!("{CERT_PREFIX}{serial}{P12_SUFFIX}")
}

fn pwd_key(serial: &str) -> String {
    format!("{CERT_PREFIX}{serial}{PWD_SUFFIX}")
}

/// Syncs signing certificates between the active cloud provider and the
/// platform certificate store.
pub struct CertificateSyncService {
    source: Arc<dyn ProviderSource>,
    cert_store: Arc<dyn CertificateStore>,
}

impl CertificateSyncService {
    pub fn new(source: Arc<dyn ProviderSource>, cert_store: Arc<dyn CertificateStore>) -> Self {
        Self { source, cert_store }
    }

    /// Resolve `certificate_id` against the stored metadata entries and
    /// install the matching bundle into the platform store.
    ///
    /// Returns `false` when no metadata entry carries the id, when the
    /// bundle or password entry is missing, or when this platform has
    /// no certificate store.  Only a matching certificate ever has its
    /// P12 or password fetched.
    pub async fn download_and_install(&self, certificate_id: &str) -> Result<bool> {
        let provider = self.source.active_provider()?;

        let keys = provider.list(Some(CERT_PREFIX)).await?;
        let mut matched: Option<CertificateSecretMetadata> = None;
        for key in keys.iter().filter(|k| k.ends_with(META_SUFFIX)) {
            let Some(bytes) = provider.get(key).await? else {
                continue;
            };
            let meta: CertificateSecretMetadata = match serde_json::from_slice(&bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!("skipping unparsable certificate metadata '{key}': {e}");
                    continue;
                }
            };
            if meta.certificate_id == certificate_id {
                matched = Some(meta);
                break;
            }
        }

        let Some(meta) = matched else {
            return Ok(false);
        };

        let Some(p12) = provider.get(&p12_key(&meta.serial_number)).await? else {
            tracing::warn!(
                "certificate '{certificate_id}' has metadata but no bundle entry"
            );
            return Ok(false);
        };
        let Some(password_bytes) = provider.get(&pwd_key(&meta.serial_number)).await? else {
            tracing::warn!(
                "certificate '{certificate_id}' has metadata but no password entry"
            );
            return Ok(false);
        };
        let password = String::from_utf8(password_bytes).map_err(|_| {
            SyncError::ProviderError(format!(
                "stored password for certificate '{certificate_id}' is not valid UTF-8"
            ))
        })?;

        if !self.cert_store.is_supported() {
            return Ok(false);
        }
        self.cert_store.install_bundle(&p12, &password).await
    }

    /// Metadata for every certificate published to the active provider.
    /// Unparsable entries are skipped, same as the managed-secrets list.
    pub async fn list_remote(&self) -> Result<Vec<CertificateSecretMetadata>> {
        let provider = self.source.active_provider()?;

        let mut certificates = Vec::new();
        for key in provider.list(Some(CERT_PREFIX)).await? {
            if !key.ends_with(META_SUFFIX) {
                continue;
            }
            let Some(bytes) = provider.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice(&bytes) {
                Ok(meta) => certificates.push(meta),
                Err(e) => {
                    tracing::debug!("skipping unparsable certificate metadata '{key}': {e}");
                }
            }
        }
        Ok(certificates)
    }

    /// Publish a locally installed identity so other machines can
    /// install it: bundle and password first, metadata last — the
    /// metadata entry is what makes the certificate visible.
    pub async fn upload(
        &self,
        identity: &SigningIdentity,
        certificate_id: &str,
        certificate_type: &str,
        expires_at: DateTime<Utc>,
        bundle_password: &str,
        machine_label: &str,
    ) -> Result<bool> {
        let provider = self.source.active_provider()?;

        if !self.cert_store.is_supported() {
            return Ok(false);
        }
        let p12 = self
            .cert_store
            .export_p12(&identity.identity, bundle_password)
            .await?;

        let serial = &identity.serial_number;
        if !provider.store(&p12_key(serial), &p12, None).await? {
            return Ok(false);
        }
        if !provider
            .store(&pwd_key(serial), bundle_password.as_bytes(), None)
            .await?
        {
            return Ok(false);
        }

        let meta = CertificateSecretMetadata {
            certificate_id: certificate_id.to_string(),
            serial_number: serial.clone(),
            common_name: identity.common_name.clone(),
            certificate_type: certificate_type.to_string(),
            expires_at,
            created_by_machine: machine_label.to_string(),
            created_at: Utc::now(),
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| SyncError::SerializationError(format!("certificate metadata: {e}")))?;
        provider.store(&meta_key(serial), &meta_bytes, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, SecretsProvider, StaticProviderSource};

    fn meta_json(certificate_id: &str, serial: &str) -> Vec<u8> {
        serde_json::to_vec(&CertificateSecretMetadata {
            certificate_id: certificate_id.into(),
            serial_number: serial.into(),
            common_name: "Apple Development: Jane Doe".into(),
            certificate_type: "development".into(),
            expires_at: Utc::now(),
            created_by_machine: "build-mac".into(),
            created_at: Utc::now(),
        })
        .unwrap()
    }

    fn seeded_provider() -> Arc<MemoryProvider> {
        let provider = Arc::new(MemoryProvider::new());
        provider.insert_raw("CERT_ABC123_META", &meta_json("cert-1", "ABC123"));
        provider.insert_raw("CERT_ABC123_P12", b"pkcs12 bytes");
        provider.insert_raw("CERT_ABC123_PWD", b"password");
        provider
    }

    #[tokio::test]
    async fn matching_id_fetches_all_three_entries_and_installs() {
        let provider = seeded_provider();
        let cert_store = Arc::new(RecordingCertificateStore::new(true));
        let service = CertificateSyncService::new(
            Arc::new(StaticProviderSource(provider.clone())),
            cert_store.clone(),
        );

        assert!(service.download_and_install("cert-1").await.unwrap());

        let fetched = provider.fetched_keys();
        assert!(fetched.contains(&"CERT_ABC123_META".to_string()));
        assert!(fetched.contains(&"CERT_ABC123_P12".to_string()));
        assert!(fetched.contains(&"CERT_ABC123_PWD".to_string()));

        let installs = cert_store.installed();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].0, b"pkcs12 bytes");
        assert_eq!(installs[0].1, "password");
    }

    #[tokio::test]
    async fn non_matching_id_never_fetches_key_material() {
        let provider = seeded_provider();
        let cert_store = Arc::new(RecordingCertificateStore::new(true));
        let service = CertificateSyncService::new(
            Arc::new(StaticProviderSource(provider.clone())),
            cert_store.clone(),
        );

        assert!(!service.download_and_install("cert-2").await.unwrap());

        let fetched = provider.fetched_keys();
        assert_eq!(fetched, vec!["CERT_ABC123_META".to_string()]);
        assert!(cert_store.installed().is_empty());
    }

    #[tokio::test]
    async fn unsupported_platform_returns_false_without_installing() {
        let provider = seeded_provider();
        let service = CertificateSyncService::new(
            Arc::new(StaticProviderSource(provider)),
            Arc::new(RecordingCertificateStore::new(false)),
        );

        assert!(!service.download_and_install("cert-1").await.unwrap());
    }

    #[tokio::test]
    async fn upload_publishes_the_three_entry_stem() {
        let provider = Arc::new(MemoryProvider::new());
        let identity = SigningIdentity {
            identity: "HASH1".into(),
            common_name: "Apple Distribution: Acme".into(),
            serial_number: "FEED01".into(),
        };
        let cert_store =
            Arc::new(RecordingCertificateStore::new(true).with_identity(identity.clone()));
        let service = CertificateSyncService::new(
            Arc::new(StaticProviderSource(provider.clone())),
            cert_store,
        );

        let published = service
            .upload(
                &identity,
                "cert-9",
                "distribution",
                Utc::now(),
                "bundle-pw",
                "build-mac",
            )
            .await
            .unwrap();
        assert!(published);

        let keys = provider.list(Some(CERT_PREFIX)).await.unwrap();
        assert_eq!(
            keys,
            vec![
                "CERT_FEED01_META".to_string(),
                "CERT_FEED01_P12".to_string(),
                "CERT_FEED01_PWD".to_string(),
            ]
        );
    }
}
