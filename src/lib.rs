//! Cross-machine secrets and signing-credential synchronization core.
//!
//! What lives here:
//! - an encrypted local settings store (AES-256-GCM under an OS-kept
//!   master key) with an explicit read-through cache (`settings`)
//! - a password-protected portable backup codec (`backup`)
//! - one storage contract over four remote secret-manager backends
//!   (`provider`)
//! - a managed secrets service splitting values from metadata sidecars
//!   (`secrets`)
//! - a certificate synchronization service over the platform
//!   certificate store (`certs`)
//!
//! The UI, CLI and logging setup live with the embedding application;
//! this crate only emits `tracing` events.

pub mod backup;
pub mod certs;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod identity;
pub mod provider;
pub mod secrets;
pub mod settings;

pub use backup::BackupCodec;
pub use certs::CertificateSyncService;
pub use config::SyncOptions;
pub use errors::{Result, SyncError};
pub use provider::{create_provider, ProviderSource, SecretsProvider};
pub use secrets::ManagedSecretsService;
pub use settings::{SettingsAggregate, SettingsStore};
