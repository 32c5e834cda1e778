//! Google Secret Manager backend.
//!
//! Speaks the Secret Manager REST API with a bearer token from the
//! provider configuration.  A secret is a container; its bytes live in
//! versions, so a write is "ensure the container exists, then add a
//! version" and a read accesses `versions/latest`.  Payload bytes are
//! base64 on the wire.
//!
//! Secret ids are restricted to letters, digits, hyphens and
//! underscores, must begin with a letter, and cap at 255 characters.
//! Logical keys are escaped with `_XX` behind a constant `k` prefix
//! (which guarantees the leading letter) and unescaped again on `list`.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use crate::config::SyncOptions;
use crate::errors::{Result, SyncError};
use crate::settings::CloudProviderConfig;

use super::{
    escape_key, finish_listing, http_client, required_setting, send_logged, unescape_key,
    SecretsProvider,
};

const API_BASE: &str = "https://secretmanager.googleapis.com/v1";

/// Escape character for the Secret Manager id alphabet.
const ESC: char = '_';

/// Constant prefix satisfying the leading-letter rule.
const ID_PREFIX: char = 'k';

/// Secret Manager caps ids at 255 characters.
const MAX_ID_LEN: usize = 255;

pub struct GoogleSecretManagerProvider {
    http: reqwest::Client,
    project_id: String,
    access_token: String,
}

impl GoogleSecretManagerProvider {
    /// Required settings: `project_id`, `access_token`.
    pub fn new(config: &CloudProviderConfig, options: &SyncOptions) -> Result<Self> {
        Ok(Self {
            http: http_client(options)?,
            project_id: required_setting(config, "project_id")?,
            access_token: required_setting(config, "access_token")?,
        })
    }

    fn secret_name(&self, id: &str) -> String {
        format!("{API_BASE}/projects/{}/secrets/{id}", self.project_id)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    fn sanitize(key: &str) -> Result<String> {
        let escaped = escape_key(key, ESC, |c| c.is_ascii_alphanumeric() || c == '-');
        let id = format!("{ID_PREFIX}{escaped}");
        if id.len() > MAX_ID_LEN {
            return Err(SyncError::ValidationError(format!(
                "key '{key}' exceeds the Secret Manager id limit of {MAX_ID_LEN} characters"
            )));
        }
        Ok(id)
    }

    fn desanitize(id: &str) -> Option<String> {
        let escaped = id.strip_prefix(ID_PREFIX)?;
        unescape_key(escaped, ESC)
    }

    /// Ensure the secret container exists.  `Ok(true)` when it exists
    /// (created now or already present), `Ok(false)` on failure.
    async fn ensure_container(
        &self,
        id: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let url = format!(
            "{API_BASE}/projects/{}/secrets?secretId={id}",
            self.project_id
        );
        let mut body = serde_json::json!({ "replication": { "automatic": {} } });
        if let Some(tags) = tags {
            body["labels"] = serde_json::json!(tags);
        }

        let request = self.request(reqwest::Method::POST, &url).json(&body);
        match send_logged(request, "gcp", "create secret").await? {
            Some(resp)
                if resp.status().is_success()
                    || resp.status() == reqwest::StatusCode::CONFLICT =>
            {
                Ok(true)
            }
            Some(resp) => {
                tracing::warn!("gcp: create secret returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: AccessPayload,
}

#[derive(Deserialize)]
struct AccessPayload {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    secrets: Vec<ListEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListEntry {
    /// Full resource name `projects/{p}/secrets/{id}`.
    name: String,
}

#[async_trait]
impl SecretsProvider for GoogleSecretManagerProvider {
    async fn test_connection(&self) -> bool {
        let url = format!(
            "{API_BASE}/projects/{}/secrets?pageSize=1",
            self.project_id
        );
        match send_logged(
            self.request(reqwest::Method::GET, &url),
            "gcp",
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
        let id = Self::sanitize(key)?;

        if !self.ensure_container(&id, tags).await? {
            return Ok(false);
        }

        let url = format!("{}:addVersion", self.secret_name(&id));
        let body = serde_json::json!({ "payload": { "data": BASE64.encode(value) } });
        let request = self.request(reqwest::Method::POST, &url).json(&body);

        match send_logged(request, "gcp", "add secret version").await? {
            Some(resp) if resp.status().is_success() => Ok(true),
            Some(resp) => {
                tracing::warn!("gcp: add secret version returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let id = Self::sanitize(key)?;
        let url = format!("{}/versions/latest:access", self.secret_name(&id));

        let resp = match send_logged(
            self.request(reqwest::Method::GET, &url),
            "gcp",
            "access secret",
        )
        .await?
        {
            Some(resp) => resp,
            None => return Ok(None),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            tracing::warn!("gcp: access secret returned HTTP {}", resp.status());
            return Ok(None);
        }

        let access: AccessResponse = match resp.json().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("gcp: access secret returned an unreadable body: {e}");
                return Ok(None);
            }
        };

        BASE64.decode(&access.payload.data).map(Some).map_err(|e| {
            SyncError::ProviderError(format!(
                "gcp: stored value for '{key}' is not valid base64: {e}"
            ))
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let id = Self::sanitize(key)?;
        let request = self.request(reqwest::Method::DELETE, &self.secret_name(&id));

        match send_logged(request, "gcp", "delete secret").await? {
            // Deleting an absent secret is success.
            Some(resp)
                if resp.status().is_success()
                    || resp.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                Ok(true)
            }
            Some(resp) => {
                tracing::warn!("gcp: delete secret returned HTTP {}", resp.status());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let id = Self::sanitize(key)?;
        let request = self.request(reqwest::Method::GET, &self.secret_name(&id));

        match send_logged(request, "gcp", "probe secret").await? {
            Some(resp) => Ok(resp.status().is_success()),
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{API_BASE}/projects/{}/secrets?pageSize=100",
                self.project_id
            );
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }

            let resp = match send_logged(
                self.request(reqwest::Method::GET, &url),
                "gcp",
                "list secrets",
            )
            .await?
            {
                Some(resp) if resp.status().is_success() => resp,
                Some(resp) => {
                    tracing::warn!("gcp: list secrets returned HTTP {}", resp.status());
                    return Ok(Vec::new());
                }
                None => return Ok(Vec::new()),
            };

            let page: ListPage = match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("gcp: list secrets returned an unreadable body: {e}");
                    return Ok(Vec::new());
                }
            };

            for entry in page.secrets {
                let id = entry.name.rsplit('/').next().unwrap_or_default();
                match Self::desanitize(id) {
                    Some(original) => keys.push(original),
                    None => tracing::debug!("gcp: skipping foreign secret id '{id}'"),
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(finish_listing(keys, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_starts_with_a_letter_and_stays_in_alphabet() {
        let id = GoogleSecretManagerProvider::sanitize("1-starts/with digit").unwrap();
        assert!(id.starts_with(ID_PREFIX));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn desanitize_inverts_sanitize() {
        for key in ["sherpa-secrets-meta/token", "under_score", "CERT_X_PWD"] {
            let id = GoogleSecretManagerProvider::sanitize(key).unwrap();
            assert_eq!(
                GoogleSecretManagerProvider::desanitize(&id).as_deref(),
                Some(key)
            );
        }
    }

    #[test]
    fn desanitize_rejects_ids_without_our_prefix() {
        assert_eq!(GoogleSecretManagerProvider::desanitize("zz-foreign"), None);
    }
}
