//! Azure Key Vault backend.
//!
//! Speaks the Key Vault secrets REST API (`api-version=7.4`) with a
//! bearer token supplied through the provider configuration.  Key Vault
//! secret values are text, so binary payloads are base64-encoded on
//! write and decoded on read.  Secret names are restricted to
//! `[0-9a-zA-Z-]` with a 127-character ceiling; logical keys are
//! escaped into that alphabet and unescaped again on `list`.

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

const API_VERSION: &str = "7.4";

/// Escape character for the Key Vault name alphabet.
const ESC: char = '-';

/// Key Vault caps secret names at 127 characters.
const MAX_NAME_LEN: usize = 127;

pub struct AzureKeyVaultProvider {
    http: reqwest::Client,
    vault_url: String,
    access_token: String,
}

impl AzureKeyVaultProvider {
    /// Required settings: `vault_url`, `access_token`.
    pub fn new(config: &CloudProviderConfig, options: &SyncOptions) -> Result<Self> {
        let vault_url = required_setting(config, "vault_url")?;
        Url::parse(&vault_url)
            .map_err(|e| SyncError::ValidationError(format!("invalid vault_url: {e}")))?;

        Ok(Self {
            http: http_client(options)?,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            access_token: required_setting(config, "access_token")?,
        })
    }

    fn secret_url(&self, name: &str) -> String {
        format!(
            "{}/secrets/{name}?api-version={API_VERSION}",
            self.vault_url
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    fn sanitize(key: &str) -> Result<String> {
        let name = escape_key(key, ESC, |c| c.is_ascii_alphanumeric() || c == '-');
        if name.len() > MAX_NAME_LEN {
            return Err(SyncError::ValidationError(format!(
                "key '{key}' exceeds the Key Vault name limit of {MAX_NAME_LEN} characters"
            )));
        }
        Ok(name)
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretItem>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct SecretItem {
    /// Full secret identifier URL; the name is its last path segment.
    id: String,
}

#[async_trait]
impl SecretsProvider for AzureKeyVaultProvider {
    async fn test_connection(&self) -> bool {
        let url = format!(
            "{}/secrets?api-version={API_VERSION}&maxresults=1",
            self.vault_url
        );
        match send_logged(
            self.request(reqwest::Method::GET, &url),
            "azure",
            "connection probe",
        )
        .await
        {
            Ok(Some(resp)) => resp.status().is_success(),
            _ => false,
        }
    }

    async fn store(
        &self,
        key: &str,
        value: &[u8],
        tags: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let name = Self::sanitize(key)?;

        let mut body = serde_json::json!({ "value": BASE64.encode(value) });
        if let Some(tags) = tags {
            body["tags"] = serde_json::json!(tags);
        }

        let request = self
            .request(reqwest::Method::PUT, &self.secret_url(&name))
            .json(&body);
        match send_logged(request, "azure", "store secret").await? {
            Some(resp) if resp.status().is_success() => Ok(true),
            Some(resp) => {
                tracing::warn!("azure: store secret returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = Self::sanitize(key)?;
        let request = self.request(reqwest::Method::GET, &self.secret_url(&name));

        let resp = match send_logged(request, "azure", "get secret").await? {
            Some(resp) => resp,
            None => return Ok(None),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            tracing::warn!("azure: get secret returned HTTP {}", resp.status());
            return Ok(None);
        }

        let bundle: SecretBundle = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("azure: get secret returned an unreadable body: {e}");
                return Ok(None);
            }
        };

        // The stored value is our own base64; a decode failure means the
        // entry is corrupt, not absent.
        BASE64
            .decode(&bundle.value)
            .map(Some)
            .map_err(|e| SyncError::ProviderError(format!("azure: stored value for '{key}' is not valid base64: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key)?;
        let request = self.request(reqwest::Method::DELETE, &self.secret_url(&name));

        match send_logged(request, "azure", "delete secret").await? {
            // Deleting an absent secret is success.
            Some(resp)
                if resp.status().is_success()
                    || resp.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                Ok(true)
            }
            Some(resp) => {
                tracing::warn!("azure: delete secret returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key)?;
        let request = self.request(reqwest::Method::GET, &self.secret_url(&name));

        match send_logged(request, "azure", "probe secret").await? {
            Some(resp) => Ok(resp.status().is_success()),
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut url = format!(
            "{}/secrets?api-version={API_VERSION}&maxresults=25",
            self.vault_url
        );

        loop {
            let request = self.request(reqwest::Method::GET, &url);
            let resp = match send_logged(request, "azure", "list secrets").await? {
                Some(resp) if resp.status().is_success() => resp,
                Some(resp) => {
                    tracing::warn!("azure: list secrets returned HTTP {}", resp.status());
                    return Ok(Vec::new());
                }
                None => return Ok(Vec::new()),
            };

            let page: SecretListPage = match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("azure: list secrets returned an unreadable body: {e}");
                    return Ok(Vec::new());
                }
            };

            for item in page.value {
                let name = item.id.rsplit('/').next().unwrap_or_default();
                match unescape_key(name, ESC) {
                    Some(original) => keys.push(original),
                    // Not a name this crate produced; someone else's entry.
                    None => tracing::debug!("azure: skipping foreign secret name '{name}'"),
                }
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(finish_listing(keys, prefix))
    }
}
