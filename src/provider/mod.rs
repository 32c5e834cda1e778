//! Cloud secrets provider abstraction.
//!
//! One uniform contract over several incompatible remote secret-manager
//! APIs.  Each backend lives in its own module and is selected by the
//! `ProviderKind` tag at construction time — a closed set, no runtime
//! type inspection:
//! - Azure Key Vault (`azure`)
//! - AWS Secrets Manager (`aws`)
//! - Google Secret Manager (`gcp`)
//! - HashiCorp Vault KV v2 (`hashicorp`)
//! - An in-memory backend for tests and keyless embeddings (`memory`)
//!
//! Error policy at this boundary: transport and backend failures are
//! logged and converted to the operation's safe default (false /
//! not-found / empty set).  Authentication and authorization failures
//! are the exception — they surface as
//! `SyncError::ProviderAuthRequired` so the caller can prompt for
//! re-authentication instead of concluding the key does not exist.
//!
//! Cancellation: every operation is an `async fn`; dropping the future
//! aborts that call and only that call.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod hashicorp;
pub mod memory;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::SyncOptions;
use crate::errors::{Result, SyncError};
use crate::settings::{CloudProviderConfig, ProviderKind, SettingsStore};

pub use aws::AwsSecretsManagerProvider;
pub use azure::AzureKeyVaultProvider;
pub use gcp::GoogleSecretManagerProvider;
pub use hashicorp::HashicorpVaultProvider;
pub use memory::MemoryProvider;

/// The uniform storage contract every backend implements.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// One cheap read-only probe call against the backend.
    async fn test_connection(&self) -> bool;

    /// Store `value` under the logical `key`.  Returns `false` on a
    /// transport failure (logged).
    async fn store(
        &self,
        key: &str,
        value: &[u8],
        tags: Option<&HashMap<String, String>>,
    ) -> Result<bool>;

    /// Fetch the bytes stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete `key`.  Idempotent: deleting an absent key is success.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All original (unsanitized) keys, optionally filtered to those
    /// starting with `prefix`, in sorted order.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;
}

/// Construct the concrete provider for a configuration.
pub fn create_provider(
    config: &CloudProviderConfig,
    options: &SyncOptions,
) -> Result<Arc<dyn SecretsProvider>> {
    Ok(match config.kind {
        ProviderKind::AzureKeyVault => Arc::new(AzureKeyVaultProvider::new(config, options)?),
        ProviderKind::AwsSecretsManager => Arc::new(AwsSecretsManagerProvider::new(config, options)?),
        ProviderKind::GoogleSecretManager => {
            Arc::new(GoogleSecretManagerProvider::new(config, options)?)
        }
        ProviderKind::HashicorpVault => Arc::new(HashicorpVaultProvider::new(config, options)?),
    })
}

// ---------------------------------------------------------------------------
// Provider resolution
// ---------------------------------------------------------------------------

/// Resolves the provider an operation should go through.
///
/// The services check this per call so "no active provider configured"
/// fails fast, before any remote work.
pub trait ProviderSource: Send + Sync {
    fn active_provider(&self) -> Result<Arc<dyn SecretsProvider>>;
}

/// Resolves the active provider from the settings store, rebuilding the
/// concrete provider whenever the active configuration changes.
pub struct SettingsProviderSource {
    store: Arc<SettingsStore>,
    options: SyncOptions,
    cached: Mutex<Option<(CloudProviderConfig, Arc<dyn SecretsProvider>)>>,
}

impl SettingsProviderSource {
    pub fn new(store: Arc<SettingsStore>, options: SyncOptions) -> Self {
        Self {
            store,
            options,
            cached: Mutex::new(None),
        }
    }
}

impl ProviderSource for SettingsProviderSource {
    fn active_provider(&self) -> Result<Arc<dyn SecretsProvider>> {
        let settings = self.store.get()?;
        let config = settings
            .active_provider()
            .ok_or(SyncError::ProviderUnavailable)?;

        let mut cached = self.cached.lock().expect("provider cache lock poisoned");
        if let Some((cached_config, provider)) = cached.as_ref() {
            if cached_config == config {
                return Ok(Arc::clone(provider));
            }
        }

        let provider = create_provider(config, &self.options)?;
        *cached = Some((config.clone(), Arc::clone(&provider)));
        Ok(provider)
    }
}

/// Wraps a fixed provider.  Used by tests and single-backend embedders.
pub struct StaticProviderSource(pub Arc<dyn SecretsProvider>);

impl ProviderSource for StaticProviderSource {
    fn active_provider(&self) -> Result<Arc<dyn SecretsProvider>> {
        Ok(Arc::clone(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

/// Build the HTTP client a backend uses, with the configured timeouts.
pub(crate) fn http_client(options: &SyncOptions) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(options.request_timeout())
        .connect_timeout(options.connect_timeout())
        .build()
        .map_err(|e| SyncError::ProviderError(format!("failed to build HTTP client: {e}")))
}

/// Whether a status means our credentials were rejected.
pub(crate) fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Send a request, applying the boundary error policy.
///
/// - Transport failure: logged, `Ok(None)` — the caller substitutes the
///   operation's safe default.
/// - 401/403: `Err(ProviderAuthRequired)`.
/// - Anything else: `Ok(Some(response))` for the caller to interpret.
pub(crate) async fn send_logged(
    request: reqwest::RequestBuilder,
    backend: &str,
    what: &str,
) -> Result<Option<reqwest::Response>> {
    match request.send().await {
        Ok(response) => {
            let status = response.status();
            if is_auth_status(status) {
                return Err(SyncError::ProviderAuthRequired(format!(
                    "{backend}: {what} returned HTTP {status}"
                )));
            }
            Ok(Some(response))
        }
        Err(e) => {
            tracing::warn!("{backend}: {what} failed in transport: {e}");
            Ok(None)
        }
    }
}

/// Fetch a required backend setting or fail with a named validation error.
pub(crate) fn required_setting(config: &CloudProviderConfig, name: &str) -> Result<String> {
    config
        .setting(name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::ValidationError(format!(
                "provider '{}' is missing required setting '{name}'",
                config.id
            ))
        })
}

// ---------------------------------------------------------------------------
// Key sanitization
// ---------------------------------------------------------------------------

/// Escape a logical key into a backend's restricted alphabet.
///
/// Every byte that is not ASCII, not allowed by `is_allowed`, or equal
/// to the escape character itself becomes `<esc>XX` (two uppercase hex
/// digits).  The mapping is byte-wise, so it composes over
/// concatenation and `unescape_key` inverts it exactly.
pub(crate) fn escape_key(key: &str, esc: char, is_allowed: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        let c = b as char;
        if b.is_ascii() && c != esc && is_allowed(c) {
            out.push(c);
        } else {
            let _ = write!(out, "{esc}{b:02X}");
        }
    }
    out
}

/// Invert `escape_key`.  Returns `None` for names this crate did not
/// produce (stray entries in a shared vault).
pub(crate) fn unescape_key(escaped: &str, esc: char) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] as char == esc {
            if i + 3 > bytes.len() {
                return None;
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Collect unescaped names into the contract's ordered, prefix-filtered
/// key set.
pub(crate) fn finish_listing(mut keys: Vec<String>, prefix: Option<&str>) -> Vec<String> {
    if let Some(prefix) = prefix {
        keys.retain(|k| k.starts_with(prefix));
    }
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn azure_alphabet(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-'
    }

    #[test]
    fn escape_round_trips_awkward_keys() {
        let keys = [
            "sherpa-secrets/db password",
            "CERT_ABC123_META",
            "plain",
            "trailing-",
            "uni·code",
            "-2F tricky",
        ];
        for key in keys {
            let escaped = escape_key(key, '-', azure_alphabet);
            assert!(
                escaped.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
                "escaped form must stay in the alphabet: {escaped}"
            );
            assert_eq!(unescape_key(&escaped, '-').as_deref(), Some(key));
        }
    }

    #[test]
    fn escape_composes_over_concatenation() {
        let a = escape_key("sherpa-secrets/", '-', azure_alphabet);
        let b = escape_key("sherpa-secrets/k1", '-', azure_alphabet);
        assert!(b.starts_with(&a));
    }

    #[test]
    fn unescape_rejects_foreign_names() {
        // Dangling escape and bad hex digits were not produced by us.
        assert_eq!(unescape_key("abc-", '-'), None);
        assert_eq!(unescape_key("abc-Z9", '-'), None);
    }

    #[test]
    fn finish_listing_sorts_filters_and_dedups() {
        let keys = vec![
            "b/two".to_string(),
            "a/one".to_string(),
            "b/two".to_string(),
            "other".to_string(),
        ];
        assert_eq!(finish_listing(keys.clone(), None).len(), 3);
        assert_eq!(
            finish_listing(keys, Some("b/")),
            vec!["b/two".to_string()]
        );
    }
}
