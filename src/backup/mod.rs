//! Portable, password-protected settings backup.
//!
//! A backup file has this layout:
//!
//! ```text
//! [MSSBAK01: 8 bytes][salt: 32 bytes][nonce: 12 bytes][tag: 16 bytes][ciphertext]
//! ```
//!
//! - **Magic** (`MSSBAK01`): identifies the file as a settings backup.
//! - **Salt**: random per export; feeds Argon2id together with the
//!   caller's password.  The master key plays no part here — a backup
//!   must import on a machine that has never seen this profile.
//! - **Nonce / tag / ciphertext**: AES-256-GCM over the serialized
//!   settings aggregate.
//!
//! Because salt and nonce are fresh on every call, two exports of the
//! same aggregate with the same password never produce identical bytes.

use std::sync::Arc;

use zeroize::Zeroize;

use crate::crypto::{derive_backup_key, generate_salt, open, seal, MIN_SEALED_LEN, SALT_LEN};
use crate::errors::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::settings::{SettingsAggregate, SettingsStore};

/// Magic bytes at the start of every backup.
pub const BACKUP_MAGIC: &[u8; 8] = b"MSSBAK01";

/// Smallest byte count a well-formed backup can have.
pub const MIN_BACKUP_LEN: usize = BACKUP_MAGIC.len() + SALT_LEN + MIN_SEALED_LEN;

/// Exports and imports password-protected settings backups.
pub struct BackupCodec {
    store: Arc<SettingsStore>,
    identities: Arc<dyn IdentityProvider>,
}

impl BackupCodec {
    pub fn new(store: Arc<SettingsStore>, identities: Arc<dyn IdentityProvider>) -> Self {
        Self { store, identities }
    }

    /// Export the current settings aggregate as an encrypted backup.
    ///
    /// Identity records without inline private-key content get their
    /// keys pulled live from the identity provider so the backup is
    /// self-sufficient.  An empty password is rejected before any I/O.
    pub async fn export(&self, password: &str) -> Result<Vec<u8>> {
        require_password(password)?;

        let mut aggregate = self.store.get()?;

        // Make the backup self-sufficient: fill in missing private keys.
        for identity in &mut aggregate.identities {
            if identity.private_key.is_none() {
                identity.private_key = self.identities.private_key(&identity.id).await?;
            }
        }

        let payload = serde_json::to_vec(&aggregate)
            .map_err(|e| SyncError::SerializationError(format!("backup payload: {e}")))?;

        let salt = generate_salt();
        let mut key = derive_backup_key(password.as_bytes(), &salt)?;
        let sealed = seal(&key, &payload);
        key.zeroize();
        let sealed = sealed?;

        let mut out = Vec::with_capacity(BACKUP_MAGIC.len() + SALT_LEN + sealed.len());
        out.extend_from_slice(BACKUP_MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt and deserialize a backup produced by `export`.
    ///
    /// Malformed input (bad magic, too short) fails before any key
    /// derivation or decryption is attempted.  A wrong password fails
    /// the authentication tag and surfaces as
    /// `SyncError::AuthenticationFailed` — distinguishable from
    /// `MalformedBackup`.
    pub fn import(bytes: &[u8], password: &str) -> Result<SettingsAggregate> {
        require_password(password)?;
        check_header(bytes)?;

        let salt = &bytes[BACKUP_MAGIC.len()..BACKUP_MAGIC.len() + SALT_LEN];
        let sealed = &bytes[BACKUP_MAGIC.len() + SALT_LEN..];

        let mut key = derive_backup_key(password.as_bytes(), salt)?;
        let plaintext = open(&key, sealed);
        key.zeroize();
        let plaintext = plaintext?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::SerializationError(format!("backup payload: {e}")))
    }

    /// Cheap pre-flight check: header and length sniff only.
    ///
    /// Performs no decryption and never fails — malformed input simply
    /// returns `false`.
    pub fn validate(bytes: &[u8]) -> bool {
        check_header(bytes).is_ok()
    }
}

/// Reject empty passwords synchronously, before any crypto or I/O.
fn require_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(SyncError::ValidationError(
            "backup password cannot be empty".into(),
        ));
    }
    Ok(())
}

fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < MIN_BACKUP_LEN {
        return Err(SyncError::MalformedBackup(format!(
            "{} bytes is below the minimum backup size of {MIN_BACKUP_LEN}",
            bytes.len()
        )));
    }
    if &bytes[..BACKUP_MAGIC.len()] != BACKUP_MAGIC {
        return Err(SyncError::MalformedBackup("missing MSSBAK01 magic".into()));
    }
    Ok(())
}
