//! AWS Secrets Manager backend.
//!
//! Secrets Manager speaks a target-based JSON protocol: every call is a
//! `POST /` with an `X-Amz-Target` header naming the action, signed
//! with Signature Version 4.  The signer is built here on the same
//! `hmac`/`sha2` stack the rest of the crate uses.
//!
//! Binary payloads travel in `SecretBinary` (base64 on the wire).
//! Secret names allow `[A-Za-z0-9/_+=.@-]` up to 512 characters, so
//! most logical keys pass through unchanged; anything else is escaped
//! with `=XX` and unescaped again on `list`.
//!
//! AWS reports authentication problems as HTTP 400 with a typed error
//! body rather than 401/403, so the auth triage here inspects the
//! `__type` field.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::SyncOptions;
use crate::errors::{Result, SyncError};
use crate::settings::CloudProviderConfig;

use super::{escape_key, finish_listing, http_client, required_setting, unescape_key, SecretsProvider};

const SERVICE: &str = "secretsmanager";

/// Escape character for the Secrets Manager name alphabet.  `=` is a
/// legal name character that never appears in our logical keys, so the
/// common case stores names verbatim.
const ESC: char = '=';

/// Secrets Manager caps names at 512 characters.
const MAX_NAME_LEN: usize = 512;

pub struct AwsSecretsManagerProvider {
    http: reqwest::Client,
    region: String,
    endpoint: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

/// Outcome of one Secrets Manager call after boundary triage.
enum Outcome {
    Success(serde_json::Value),
    /// The API answered with a typed error (e.g. `ResourceNotFoundException`).
    Api(String),
    /// Transport failure or unreadable response; already logged.
    Transport,
}

impl AwsSecretsManagerProvider {
    /// Required settings: `region`, `access_key_id`, `secret_access_key`.
    /// Optional: `session_token`.
    pub fn new(config: &CloudProviderConfig, options: &SyncOptions) -> Result<Self> {
        let region = required_setting(config, "region")?;
        Ok(Self {
            http: http_client(options)?,
            endpoint: format!("https://{SERVICE}.{region}.amazonaws.com/"),
            region,
            access_key_id: required_setting(config, "access_key_id")?,
            secret_access_key: required_setting(config, "secret_access_key")?,
            session_token: config.setting("session_token").map(str::to_string),
        })
    }

    fn sanitize(key: &str) -> Result<String> {
        let name = escape_key(key, ESC, |c| {
            c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '=' | '.' | '@' | '-')
        });
        if name.len() > MAX_NAME_LEN {
            return Err(SyncError::ValidationError(format!(
                "key '{key}' exceeds the Secrets Manager name limit of {MAX_NAME_LEN} characters"
            )));
        }
        Ok(name)
    }

    /// Perform one signed Secrets Manager action.
    async fn call(&self, action: &str, body: &serde_json::Value) -> Result<Outcome> {
        let payload = body.to_string();
        let now = Utc::now();
        let target = format!("{SERVICE}.{action}");

        let mut request = self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/x-amz-json-1.1")
            .header("x-amz-target", target.as_str())
            .header("x-amz-date", amz_date(&now))
            .header(
                "authorization",
                self.authorization_header(&target, &payload, &now)?,
            )
            .body(payload);
        if let Some(token) = &self.session_token {
            request = request.header("x-amz-security-token", token.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("aws: {action} failed in transport: {e}");
                return Ok(Outcome::Transport);
            }
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("aws: {action} response body unreadable: {e}");
                return Ok(Outcome::Transport);
            }
        };

        if status.is_success() {
            let value = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                match serde_json::from_slice(&bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("aws: {action} returned unparsable JSON: {e}");
                        return Ok(Outcome::Transport);
                    }
                }
            };
            return Ok(Outcome::Success(value));
        }

        #[derive(Deserialize)]
        struct ApiError {
            #[serde(rename = "__type", default)]
            type_name: String,
        }
        let type_name = serde_json::from_slice::<ApiError>(&bytes)
            .map(|e| e.type_name)
            .unwrap_or_default();

        if is_auth_error(&type_name) {
            return Err(SyncError::ProviderAuthRequired(format!(
                "aws: {action} rejected credentials ({type_name})"
            )));
        }

        Ok(Outcome::Api(type_name))
    }

    fn authorization_header(
        &self,
        target: &str,
        payload: &str,
        now: &DateTime<Utc>,
    ) -> Result<String> {
        let host = format!("{SERVICE}.{}.amazonaws.com", self.region);
        let date = amz_date(now);
        let day = now.format("%Y%m%d").to_string();

        // Canonical headers, sorted by name, lowercase.
        let mut headers: Vec<(&str, String)> = vec![
            ("content-type", "application/x-amz-json-1.1".to_string()),
            ("host", host),
            ("x-amz-date", date.clone()),
            ("x-amz-target", target.to_string()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
            hex::encode(Sha256::digest(payload.as_bytes()))
        );

        let scope = format!("{day}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(&self.secret_access_key, &day, &self.region, SERVICE)?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key_id
        ))
    }
}

fn amz_date(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| SyncError::ProviderError(format!("aws: invalid HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// The SigV4 key-derivation chain: secret → date → region → service.
fn derive_signing_key(secret: &str, day: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), day.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn is_auth_error(type_name: &str) -> bool {
    [
        "UnrecognizedClientException",
        "InvalidSignatureException",
        "AccessDeniedException",
        "ExpiredTokenException",
        "IncompleteSignatureException",
        "MissingAuthenticationTokenException",
    ]
    .iter()
    .any(|known| type_name.contains(known))
}

fn is_not_found(type_name: &str) -> bool {
    type_name.contains("ResourceNotFoundException")
}

#[async_trait]
impl SecretsProvider for AwsSecretsManagerProvider {
    async fn test_connection(&self) -> bool {
        matches!(
            self.call("ListSecrets", &serde_json::json!({ "MaxResults": 1 }))
                .await,
            Ok(Outcome::Success(_))
        )
    }

    async fn store(
        &self,
        key: &str,
        value: &[u8],
        tags: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let name = Self::sanitize(key)?;
        let encoded = BASE64.encode(value);

        let mut create = serde_json::json!({ "Name": name, "SecretBinary": encoded });
        if let Some(tags) = tags {
            let tag_list: Vec<_> = tags
                .iter()
                .map(|(k, v)| serde_json::json!({ "Key": k, "Value": v }))
                .collect();
            create["Tags"] = serde_json::Value::Array(tag_list);
        }

        match self.call("CreateSecret", &create).await? {
            Outcome::Success(_) => Ok(true),
            Outcome::Api(type_name) if type_name.contains("ResourceExistsException") => {
                // Secret already exists: push a new version instead.
                let put = serde_json::json!({ "SecretId": name, "SecretBinary": encoded });
                match self.call("PutSecretValue", &put).await? {
                    Outcome::Success(_) => Ok(true),
                    Outcome::Api(type_name) => {
                        tracing::warn!("aws: PutSecretValue failed with {type_name}");
                        Ok(false)
                    }
                    Outcome::Transport => Ok(false),
                }
            }
            Outcome::Api(type_name) => {
                tracing::warn!("aws: CreateSecret failed with {type_name}");
                Ok(false)
            }
            Outcome::Transport => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = Self::sanitize(key)?;
        let body = serde_json::json!({ "SecretId": name });

        let value = match self.call("GetSecretValue", &body).await? {
            Outcome::Success(value) => value,
            Outcome::Api(type_name) if is_not_found(&type_name) => return Ok(None),
            Outcome::Api(type_name) => {
                tracing::warn!("aws: GetSecretValue failed with {type_name}");
                return Ok(None);
            }
            Outcome::Transport => return Ok(None),
        };

        if let Some(binary) = value.get("SecretBinary").and_then(|v| v.as_str()) {
            return BASE64.decode(binary).map(Some).map_err(|e| {
                SyncError::ProviderError(format!(
                    "aws: stored value for '{key}' is not valid base64: {e}"
                ))
            });
        }
        // Secrets written by other tooling may carry a string payload.
        if let Some(text) = value.get("SecretString").and_then(|v| v.as_str()) {
            return Ok(Some(text.as_bytes().to_vec()));
        }
        Err(SyncError::ProviderError(format!(
            "aws: secret '{key}' has neither SecretBinary nor SecretString"
        )))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key)?;
        let body = serde_json::json!({
            "SecretId": name,
            "ForceDeleteWithoutRecovery": true,
        });

        match self.call("DeleteSecret", &body).await? {
            Outcome::Success(_) => Ok(true),
            // Deleting an absent secret is success.
            Outcome::Api(type_name) if is_not_found(&type_name) => Ok(true),
            Outcome::Api(type_name) => {
                tracing::warn!("aws: DeleteSecret failed with {type_name}");
                Ok(false)
            }
            Outcome::Transport => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let name = Self::sanitize(key)?;
        let body = serde_json::json!({ "SecretId": name });

        match self.call("DescribeSecret", &body).await? {
            Outcome::Success(_) => Ok(true),
            Outcome::Api(type_name) if is_not_found(&type_name) => Ok(false),
            Outcome::Api(type_name) => {
                tracing::warn!("aws: DescribeSecret failed with {type_name}");
                Ok(false)
            }
            Outcome::Transport => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Page {
            #[serde(rename = "SecretList", default)]
            secrets: Vec<Entry>,
            #[serde(rename = "NextToken")]
            next_token: Option<String>,
        }
        #[derive(Deserialize)]
        struct Entry {
            #[serde(rename = "Name")]
            name: String,
        }

        let mut keys = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut body = serde_json::json!({ "MaxResults": 100 });
            if let Some(token) = &next_token {
                body["NextToken"] = serde_json::json!(token);
            }

            let value = match self.call("ListSecrets", &body).await? {
                Outcome::Success(value) => value,
                Outcome::Api(type_name) => {
                    tracing::warn!("aws: ListSecrets failed with {type_name}");
                    return Ok(Vec::new());
                }
                Outcome::Transport => return Ok(Vec::new()),
            };

            let page: Page = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("aws: ListSecrets returned an unexpected shape: {e}");
                    return Ok(Vec::new());
                }
            };

            for entry in page.secrets {
                match unescape_key(&entry.name, ESC) {
                    Some(original) => keys.push(original),
                    None => tracing::debug!("aws: skipping foreign secret name '{}'", entry.name),
                }
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
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
    fn signing_key_matches_the_documented_derivation() {
        // Worked example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn sanitize_passes_common_keys_through_unchanged() {
        assert_eq!(
            AwsSecretsManagerProvider::sanitize("sherpa-secrets/db-url").unwrap(),
            "sherpa-secrets/db-url"
        );
        assert_eq!(
            AwsSecretsManagerProvider::sanitize("CERT_ABC123_META").unwrap(),
            "CERT_ABC123_META"
        );
    }

    #[test]
    fn sanitize_round_trips_awkward_keys() {
        let key = "space key=and equals";
        let name = AwsSecretsManagerProvider::sanitize(key).unwrap();
        assert!(!name.contains(' '));
        assert_eq!(unescape_key(&name, ESC).as_deref(), Some(key));
    }

    #[test]
    fn auth_errors_are_recognized_by_type() {
        assert!(is_auth_error(
            "com.amazonaws.secretsmanager#AccessDeniedException"
        ));
        assert!(is_auth_error("UnrecognizedClientException"));
        assert!(!is_auth_error("ResourceNotFoundException"));
    }
}
