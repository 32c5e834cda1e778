//! HashiCorp Vault backend (KV secrets engine, version 2).
//!
//! Authenticates with an `X-Vault-Token` header.  KV v2 wraps payloads
//! twice (`data.data`), versions every write, and splits value and
//! bookkeeping across `data/` and `metadata/` endpoints — a delete must
//! go through `metadata/` to remove all versions.  Values are JSON, so
//! binary payloads are base64-encoded under a single `value` field.
//!
//! Keys are escaped into `[0-9a-zA-Z-_]` with `_XX` so the sanitized
//! name is a single clean path segment, and unescaped again on `list`.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::config::SyncOptions;
use crate::errors::{Result, SyncError};
use crate::settings::CloudProviderConfig;

use super::{
    escape_key, finish_listing, http_client, required_setting, send_logged, unescape_key,
    SecretsProvider,
};

/// Escape character for the path-segment alphabet.
const ESC: char = '_';

pub struct HashicorpVaultProvider {
    http: reqwest::Client,
    address: String,
    token: String,
    mount: String,
}

impl HashicorpVaultProvider {
    /// Required settings: `address`, `token`.  Optional: `mount`
    /// (defaults to `secret`).
    pub fn new(config: &CloudProviderConfig, options: &SyncOptions) -> Result<Self> {
        let address = required_setting(config, "address")?;
        Url::parse(&address)
            .map_err(|e| SyncError::ValidationError(format!("invalid vault address: {e}")))?;

        Ok(Self {
            http: http_client(options)?,
            address: address.trim_end_matches('/').to_string(),
            token: required_setting(config, "token")?,
            mount: config
                .setting("mount")
                .filter(|m| !m.is_empty())
                .unwrap_or("secret")
                .to_string(),
        })
    }

    fn data_url(&self, name: &str) -> String {
        format!("{}/v1/{}/data/{name}", self.address, self.mount)
    }

    fn metadata_url(&self, name: &str) -> String {
        format!("{}/v1/{}/metadata/{name}", self.address, self.mount)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("X-Vault-Token", self.token.as_str())
    }

    fn sanitize(key: &str) -> String {
        escape_key(key, ESC, |c| c.is_ascii_alphanumeric() || c == '-')
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadOuter,
}

#[derive(Deserialize)]
struct ReadOuter {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ListResponse {
    data: ListKeys,
}

#[derive(Deserialize)]
struct ListKeys {
    #[serde(default)]
    keys: Vec<String>,
}

#[async_trait]
impl SecretsProvider for HashicorpVaultProvider {
    async fn test_connection(&self) -> bool {
        let url = format!("{}/v1/sys/health", self.address);
        match send_logged(
            self.http.get(&url),
            "vault",
            "connection probe",
        )
        .await
        {
            // 200 = active, 429 = unsealed standby, 473 = performance
            // standby — all reachable and serving.
            Ok(Some(resp)) => matches!(resp.status().as_u16(), 200 | 429 | 473),
            _ => false,
        }
    }

    async fn store(
        &self,
        key: &str,
        value: &[u8],
        tags: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let name = Self::sanitize(key);
        let body = serde_json::json!({ "data": { "value": BASE64.encode(value) } });
        let request = self
            .request(reqwest::Method::POST, &self.data_url(&name))
            .json(&body);

        let stored = match send_logged(request, "vault", "write secret").await? {
            Some(resp) if resp.status().is_success() => true,
            Some(resp) => {
                tracing::warn!("vault: write secret returned HTTP {}", resp.status());
                false
            }
            None => false,
        };

        // Tags ride along as custom metadata; losing them does not fail
        // the write.
        if stored {
            if let Some(tags) = tags {
                let meta = serde_json::json!({ "custom_metadata": tags });
                let request = self
                    .request(reqwest::Method::POST, &self.metadata_url(&name))
                    .json(&meta);
                if let Ok(Some(resp)) = send_logged(request, "vault", "write metadata").await {
                    if !resp.status().is_success() {
                        tracing::warn!(
                            "vault: write metadata returned HTTP {}",
                            resp.status()
                        );
                    }
                }
            }
        }

        Ok(stored)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = Self::sanitize(key);
        let request = self.request(reqwest::Method::GET, &self.data_url(&name));

        let resp = match send_logged(request, "vault", "read secret").await? {
            Some(resp) => resp,
            None => return Ok(None),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            tracing::warn!("vault: read secret returned HTTP {}", resp.status());
            return Ok(None);
        }

        let read: ReadResponse = match resp.json().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("vault: read secret returned an unreadable body: {e}");
                return Ok(None);
            }
        };

        let encoded = read
            .data
            .data
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SyncError::ProviderError(format!("vault: secret '{key}' has no value field"))
            })?;

        BASE64.decode(encoded).map(Some).map_err(|e| {
            SyncError::ProviderError(format!(
                "vault: stored value for '{key}' is not valid base64: {e}"
            ))
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key);
        let request = self.request(reqwest::Method::DELETE, &self.metadata_url(&name));

        match send_logged(request, "vault", "delete secret").await? {
            // Deleting an absent secret is success.
            Some(resp)
                if resp.status().is_success()
                    || resp.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                Ok(true)
            }
            Some(resp) => {
                tracing::warn!("vault: delete secret returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key);
        let request = self.request(reqwest::Method::GET, &self.metadata_url(&name));

        match send_logged(request, "vault", "probe secret").await? {
            Some(resp) => Ok(resp.status().is_success()),
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        // Sanitized names never contain '/', so the mount is flat and a
        // single directory listing covers everything.
        let url = format!("{}/v1/{}/metadata?list=true", self.address, self.mount);
        let request = self.request(reqwest::Method::GET, &url);

        let resp = match send_logged(request, "vault", "list secrets").await? {
            Some(resp) => resp,
            None => return Ok(Vec::new()),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Nothing written under this mount yet.
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            tracing::warn!("vault: list secrets returned HTTP {}", resp.status());
            return Ok(Vec::new());
        }

        let listing: ListResponse = match resp.json().await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("vault: list secrets returned an unreadable body: {e}");
                return Ok(Vec::new());
            }
        };

        let mut keys = Vec::new();
        for name in listing.data.keys {
            match unescape_key(&name, ESC) {
                Some(original) => keys.push(original),
                None => tracing::debug!("vault: skipping foreign secret name '{name}'"),
            }
        }

        Ok(finish_listing(keys, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_produces_a_single_path_segment() {
        let name = HashicorpVaultProvider::sanitize("sherpa-secrets/deploy token");
        assert!(!name.contains('/'));
        assert!(!name.contains(' '));
        assert_eq!(
            unescape_key(&name, ESC).as_deref(),
            Some("sherpa-secrets/deploy token")
        );
    }
}
