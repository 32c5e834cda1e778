use thiserror::Error;

/// All errors that can occur in sherpa-sync.
#[derive(Debug, Error)]
pub enum SyncError {
    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed — wrong password or corrupted data")]
    AuthenticationFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // --- Backup errors ---
    #[error("Malformed backup: {0}")]
    MalformedBackup(String),

    // --- Validation errors ---
    #[error("Validation failed: {0}")]
    ValidationError(String),

    // --- Provider errors ---
    #[error("No active cloud secrets provider is configured")]
    ProviderUnavailable,

    #[error("Provider authentication required: {0}")]
    ProviderAuthRequired(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    // --- Key store errors ---
    #[error("Key store error: {0}")]
    KeyStoreError(String),

    // --- Certificate store errors ---
    #[error("Certificate store error: {0}")]
    CertificateStoreError(String),

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SyncError {
    /// Returns `true` if this error means the remote backend rejected our
    /// credentials, so the caller should prompt for re-authentication
    /// rather than treating the data as absent.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, SyncError::ProviderAuthRequired(_))
    }
}

/// Convenience type alias for sherpa-sync results.
pub type Result<T> = std::result::Result<T, SyncError>;
