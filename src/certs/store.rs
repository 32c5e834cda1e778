//! Platform certificate-store collaborator.
//!
//! The trait is the boundary: enumeration of signing identities in the
//! developer-CA family, private-key presence checks, PKCS#12 / DER
//! export, install, and delete.  On macOS it is backed by the
//! `security(1)` tool; other platforms report no support.
//!
//! Enumeration is comparatively expensive, so `CachedCertificateStore`
//! keeps the result for a few minutes and drops it the moment any
//! mutating call goes through.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{Result, SyncError};

/// One signing identity in the platform store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    /// Opaque identity handle understood by the platform store (the
    /// SHA-1 hash on macOS).
    pub identity: String,

    pub common_name: String,

    /// Certificate serial number, uppercase hex.
    pub serial_number: String,
}

/// The platform certificate store.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Whether this platform has a usable certificate store at all.
    fn is_supported(&self) -> bool;

    /// Signing identities belonging to the developer-CA family.
    async fn list_signing_identities(&self) -> Result<Vec<SigningIdentity>>;

    /// Whether the private key for the certificate with `serial` is
    /// present locally.
    async fn has_private_key(&self, serial: &str) -> Result<bool>;

    /// Export an identity as a password-protected PKCS#12 bundle.
    async fn export_p12(&self, identity: &str, password: &str) -> Result<Vec<u8>>;

    /// Export the DER public certificate with `serial`.
    async fn export_certificate(&self, serial: &str) -> Result<Vec<u8>>;

    /// Install a PKCS#12 bundle into the store.
    async fn install_bundle(&self, p12: &[u8], password: &str) -> Result<bool>;

    /// Remove an identity from the store.
    async fn delete_identity(&self, identity: &str) -> Result<bool>;
}

/// The store implementation for the current platform, wrapped in the
/// enumeration cache.
pub fn default_certificate_store(cache_ttl: Duration) -> Arc<dyn CertificateStore> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(CachedCertificateStore::new(
            Arc::new(KeychainCertificateStore::new()),
            cache_ttl,
        ))
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = cache_ttl;
        Arc::new(UnsupportedCertificateStore)
    }
}

// ---------------------------------------------------------------------------
// Enumeration cache
// ---------------------------------------------------------------------------

/// Decorator caching `list_signing_identities` for `ttl`.  Any mutating
/// call invalidates the cache immediately; everything else delegates.
pub struct CachedCertificateStore {
    inner: Arc<dyn CertificateStore>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Vec<SigningIdentity>)>>,
}

impl CachedCertificateStore {
    pub fn new(inner: Arc<dyn CertificateStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }

    fn invalidate(&self) {
        *self.cached.lock().expect("identity cache poisoned") = None;
    }
}

#[async_trait]
impl CertificateStore for CachedCertificateStore {
    fn is_supported(&self) -> bool {
        self.inner.is_supported()
    }

    async fn list_signing_identities(&self) -> Result<Vec<SigningIdentity>> {
        if let Some((at, identities)) = self
            .cached
            .lock()
            .expect("identity cache poisoned")
            .as_ref()
        {
            if at.elapsed() < self.ttl {
                return Ok(identities.clone());
            }
        }

        let identities = self.inner.list_signing_identities().await?;
        *self.cached.lock().expect("identity cache poisoned") =
            Some((Instant::now(), identities.clone()));
        Ok(identities)
    }

    async fn has_private_key(&self, serial: &str) -> Result<bool> {
        self.inner.has_private_key(serial).await
    }

    async fn export_p12(&self, identity: &str, password: &str) -> Result<Vec<u8>> {
        self.inner.export_p12(identity, password).await
    }

    async fn export_certificate(&self, serial: &str) -> Result<Vec<u8>> {
        self.inner.export_certificate(serial).await
    }

    async fn install_bundle(&self, p12: &[u8], password: &str) -> Result<bool> {
        self.invalidate();
        self.inner.install_bundle(p12, password).await
    }

    async fn delete_identity(&self, identity: &str) -> Result<bool> {
        self.invalidate();
        self.inner.delete_identity(identity).await
    }
}

// ---------------------------------------------------------------------------
// macOS keychain implementation
// ---------------------------------------------------------------------------

/// Common-name prefixes of the developer-CA certificate family we sync.
const FAMILY_PREFIXES: &[&str] = &[
    "Apple Development",
    "Apple Distribution",
    "iPhone Developer",
    "iPhone Distribution",
    "Developer ID Application",
];

/// Keychain-backed store driving the `security(1)` tool.
#[derive(Default)]
pub struct KeychainCertificateStore;

impl KeychainCertificateStore {
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str], stdin: Option<&[u8]>) -> Result<std::process::Output> {
        let mut command = Command::new("security");
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        if let Some(bytes) = stdin {
            command.stdin(Stdio::piped());
            let mut child = command.spawn().map_err(|e| {
                SyncError::CertificateStoreError(format!("failed to spawn security: {e}"))
            })?;
            if let Some(mut pipe) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                pipe.write_all(bytes).await?;
            }
            return child.wait_with_output().await.map_err(|e| {
                SyncError::CertificateStoreError(format!("security did not finish: {e}"))
            });
        }

        command.output().await.map_err(|e| {
            SyncError::CertificateStoreError(format!("failed to run security: {e}"))
        })
    }

    /// Parse `security find-identity -v -p codesigning` output lines of
    /// the form:
    ///   `  1) <40-hex-hash> "Apple Development: Jane Doe (TEAM1234)"`
    fn parse_identities(output: &str) -> Vec<(String, String)> {
        let mut parsed = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            let Some((_, rest)) = line.split_once(") ") else {
                continue;
            };
            let Some((hash, quoted)) = rest.split_once(' ') else {
                continue;
            };
            if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let common_name = quoted.trim_matches('"');
            if FAMILY_PREFIXES.iter().any(|p| common_name.starts_with(p)) {
                parsed.push((hash.to_string(), common_name.to_string()));
            }
        }
        parsed
    }

    /// Pull the serial number out of `security find-certificate -c <cn>`
    /// attribute output (`"snbr"<blob>=0x00AB12...`).
    fn parse_serial(output: &str) -> Option<String> {
        let marker = "\"snbr\"<blob>=0x";
        let start = output.find(marker)? + marker.len();
        let hex: String = output[start..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        if hex.is_empty() {
            return None;
        }
        // Attribute blobs are zero-padded; serials are not.
        Some(hex.trim_start_matches("00").to_ascii_uppercase())
    }

    async fn serial_for(&self, common_name: &str) -> Option<String> {
        let output = Self::run(&["find-certificate", "-c", common_name], None)
            .await
            .ok()?;
        Self::parse_serial(&String::from_utf8_lossy(&output.stdout))
    }

    async fn identity_by_serial(&self, serial: &str) -> Result<Option<SigningIdentity>> {
        let identities = self.list_signing_identities().await?;
        Ok(identities
            .into_iter()
            .find(|i| i.serial_number.eq_ignore_ascii_case(serial)))
    }

    /// Decode the PEM `security` prints into DER.
    fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let body: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("");
        BASE64
            .decode(body.as_bytes())
            .map_err(|e| SyncError::CertificateStoreError(format!("invalid PEM output: {e}")))
    }

    fn scratch_path(suffix: &str) -> std::path::PathBuf {
        use rand::RngCore;
        let mut tag = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut tag);
        std::env::temp_dir().join(format!("sherpa-sync-{}{suffix}", hex::encode(tag)))
    }
}

#[async_trait]
impl CertificateStore for KeychainCertificateStore {
    fn is_supported(&self) -> bool {
        cfg!(target_os = "macos")
    }

    async fn list_signing_identities(&self) -> Result<Vec<SigningIdentity>> {
        let output = Self::run(&["find-identity", "-v", "-p", "codesigning"], None).await?;
        if !output.status.success() {
            return Err(SyncError::CertificateStoreError(format!(
                "find-identity exited with {}",
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut identities = Vec::new();
        for (hash, common_name) in Self::parse_identities(&text) {
            // Identities without a resolvable certificate are skipped.
            if let Some(serial) = self.serial_for(&common_name).await {
                identities.push(SigningIdentity {
                    identity: hash,
                    common_name,
                    serial_number: serial,
                });
            }
        }
        Ok(identities)
    }

    async fn has_private_key(&self, serial: &str) -> Result<bool> {
        // find-identity only reports certificate + private-key pairs, so
        // membership in the listing is the presence check.
        Ok(self.identity_by_serial(serial).await?.is_some())
    }

    async fn export_p12(&self, identity: &str, password: &str) -> Result<Vec<u8>> {
        let identity = self.list_signing_identities().await?.into_iter().find(|i| i.identity == identity).ok_or_else(|| {
            SyncError::CertificateStoreError(format!("no signing identity '{identity}'"))
        })?;

        let out_path = Self::scratch_path(".p12");
        let out = out_path.to_string_lossy().into_owned();
        let output = Self::run(
            &[
                "export",
                "-t",
                "identities",
                "-f",
                "pkcs12",
                "-P",
                password,
                "-c",
                &identity.common_name,
                "-o",
                &out,
            ],
            None,
        )
        .await?;

        let bytes = if output.status.success() {
            std::fs::read(&out_path).map_err(SyncError::Io)
        } else {
            Err(SyncError::CertificateStoreError(format!(
                "export exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        };
        let _ = std::fs::remove_file(&out_path);
        bytes
    }

    async fn export_certificate(&self, serial: &str) -> Result<Vec<u8>> {
        let identity = self.identity_by_serial(serial).await?.ok_or_else(|| {
            SyncError::CertificateStoreError(format!("no certificate with serial {serial}"))
        })?;

        let output = Self::run(
            &["find-certificate", "-c", &identity.common_name, "-p"],
            None,
        )
        .await?;
        if !output.status.success() {
            return Err(SyncError::CertificateStoreError(format!(
                "find-certificate exited with {}",
                output.status
            )));
        }
        Self::pem_to_der(&String::from_utf8_lossy(&output.stdout))
    }

    async fn install_bundle(&self, p12: &[u8], password: &str) -> Result<bool> {
        let path = Self::scratch_path(".p12");
        std::fs::write(&path, p12)?;
        let path_arg = path.to_string_lossy().into_owned();

        let output = Self::run(
            &[
                "import",
                &path_arg,
                "-P",
                password,
                "-T",
                "/usr/bin/codesign",
            ],
            None,
        )
        .await;
        let _ = std::fs::remove_file(&path);
        let output = output?;

        if output.status.success() {
            Ok(true)
        } else {
            tracing::warn!(
                "security import exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(false)
        }
    }

    async fn delete_identity(&self, identity: &str) -> Result<bool> {
        let output = Self::run(&["delete-identity", "-Z", identity], None).await?;
        if output.status.success() {
            Ok(true)
        } else {
            tracing::warn!("security delete-identity exited with {}", output.status);
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Unsupported platform
// ---------------------------------------------------------------------------

/// Store for platforms without a certificate store integration.
pub struct UnsupportedCertificateStore;

#[async_trait]
impl CertificateStore for UnsupportedCertificateStore {
    fn is_supported(&self) -> bool {
        false
    }

    async fn list_signing_identities(&self) -> Result<Vec<SigningIdentity>> {
        Ok(Vec::new())
    }

    async fn has_private_key(&self, _serial: &str) -> Result<bool> {
        Ok(false)
    }

    async fn export_p12(&self, _identity: &str, _password: &str) -> Result<Vec<u8>> {
        Err(SyncError::CertificateStoreError(
            "no certificate store on this platform".into(),
        ))
    }

    async fn export_certificate(&self, _serial: &str) -> Result<Vec<u8>> {
        Err(SyncError::CertificateStoreError(
            "no certificate store on this platform".into(),
        ))
    }

    async fn install_bundle(&self, _p12: &[u8], _password: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete_identity(&self, _identity: &str) -> Result<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Recording store for tests
// ---------------------------------------------------------------------------

/// A `CertificateStore` over fixed data that records mutations and
/// counts enumerations.  Used by service tests and the cache tests.
pub struct RecordingCertificateStore {
    supported: bool,
    identities: Mutex<Vec<SigningIdentity>>,
    pub list_calls: std::sync::atomic::AtomicUsize,
    installs: Mutex<Vec<(Vec<u8>, String)>>,
}

impl RecordingCertificateStore {
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            identities: Mutex::new(Vec::new()),
            list_calls: std::sync::atomic::AtomicUsize::new(0),
            installs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_identity(self, identity: SigningIdentity) -> Self {
        self.identities
            .lock()
            .expect("identities poisoned")
            .push(identity);
        self
    }

    /// Bundles passed to `install_bundle`, in call order.
    pub fn installed(&self) -> Vec<(Vec<u8>, String)> {
        self.installs.lock().expect("installs poisoned").clone()
    }
}

#[async_trait]
impl CertificateStore for RecordingCertificateStore {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn list_signing_identities(&self) -> Result<Vec<SigningIdentity>> {
        self.list_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.identities.lock().expect("identities poisoned").clone())
    }

    async fn has_private_key(&self, serial: &str) -> Result<bool> {
        Ok(self
            .identities
            .lock()
            .expect("identities poisoned")
            .iter()
            .any(|i| i.serial_number == serial))
    }

    async fn export_p12(&self, identity: &str, _password: &str) -> Result<Vec<u8>> {
        let known = self
            .identities
            .lock()
            .expect("identities poisoned")
            .iter()
            .any(|i| i.identity == identity);
        if known {
            Ok(format!("p12-for-{identity}").into_bytes())
        } else {
            Err(SyncError::CertificateStoreError(format!(
                "no signing identity '{identity}'"
            )))
        }
    }

    async fn export_certificate(&self, serial: &str) -> Result<Vec<u8>> {
        Ok(format!("der-for-{serial}").into_bytes())
    }

    async fn install_bundle(&self, p12: &[u8], password: &str) -> Result<bool> {
        self.installs
            .lock()
            .expect("installs poisoned")
            .push((p12.to_vec(), password.to_string()));
        Ok(true)
    }

    async fn delete_identity(&self, identity: &str) -> Result<bool> {
        let mut identities = self.identities.lock().expect("identities poisoned");
        let before = identities.len();
        identities.retain(|i| i.identity != identity);
        Ok(identities.len() < before)
    }
}
