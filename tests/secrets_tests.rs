//! Integration tests for the managed secrets service.

use std::sync::Arc;

use tempfile::TempDir;

use sherpa_sync::crypto::MemoryKeyStore;
use sherpa_sync::errors::SyncError;
use sherpa_sync::provider::{
    MemoryProvider, ProviderSource, SettingsProviderSource, StaticProviderSource,
};
use sherpa_sync::secrets::{ManagedSecretsService, SecretKind};
use sherpa_sync::settings::SettingsStore;
use sherpa_sync::SyncOptions;

fn service() -> (Arc<MemoryProvider>, ManagedSecretsService) {
    let provider = Arc::new(MemoryProvider::new());
    let source = StaticProviderSource(provider.clone());
    (provider, ManagedSecretsService::new(Arc::new(source)))
}

// ---------------------------------------------------------------------------
// Secret lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_list_get_delete_lifecycle() {
    let (_provider, service) = service();

    let created = service
        .create("deploy-token", b"tok_12345", SecretKind::Text, None, None)
        .await
        .unwrap();
    assert!(created);

    let listed = service.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "deploy-token");
    assert_eq!(listed[0].kind, SecretKind::Text);

    assert_eq!(
        service.get_value("deploy-token").await.unwrap(),
        Some(b"tok_12345".to_vec())
    );

    assert!(service.delete("deploy-token").await.unwrap());
    assert!(service.list().await.unwrap().is_empty());
    assert_eq!(service.get_value("deploy-token").await.unwrap(), None);
}

#[tokio::test]
async fn file_secrets_keep_their_original_file_name() {
    let (_provider, service) = service();

    service
        .create(
            "keystore",
            b"\x00binary\xFF",
            SecretKind::File,
            Some("release keystore"),
            Some("release.jks"),
        )
        .await
        .unwrap();

    let secret = service.get("keystore").await.unwrap().unwrap();
    assert_eq!(secret.kind, SecretKind::File);
    assert_eq!(secret.original_file_name.as_deref(), Some("release.jks"));
    assert_eq!(secret.description.as_deref(), Some("release keystore"));
    assert_eq!(
        service.get_value("keystore").await.unwrap(),
        Some(b"\x00binary\xFF".to_vec())
    );
}

// ---------------------------------------------------------------------------
// Orphan tolerance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn secret_without_metadata_is_invisible_even_if_its_value_remains() {
    let (provider, service) = service();

    service
        .create("k", b"v", SecretKind::Text, None, None)
        .await
        .unwrap();

    // Simulate another machine deleting only the metadata entry.
    provider.remove_raw("sherpa-secrets-meta/k");

    assert!(service.list().await.unwrap().is_empty());
    assert!(service.get("k").await.unwrap().is_none());

    // The orphan value entry is still physically there.
    assert_eq!(
        service.get_value("k").await.unwrap(),
        Some(b"v".to_vec()),
        "metadata is the sole visibility gate, not the value entry"
    );
}

// ---------------------------------------------------------------------------
// Idempotent delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_twice_succeeds_both_times() {
    let (_provider, service) = service();

    service
        .create("k", b"v", SecretKind::Text, None, None)
        .await
        .unwrap();

    assert!(service.delete("k").await.unwrap());
    assert!(
        service.delete("k").await.unwrap(),
        "provider deletes are idempotent, so a second delete is still success"
    );
}

// ---------------------------------------------------------------------------
// Provider availability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operations_fail_fast_without_an_active_provider() {
    // A settings store with no active provider configured.
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SettingsStore::new(
        dir.path().join("settings.dat"),
        Arc::new(MemoryKeyStore::new()),
    ));
    let source = Arc::new(SettingsProviderSource::new(store, SyncOptions::default()));

    assert!(matches!(
        source.active_provider(),
        Err(SyncError::ProviderUnavailable)
    ));

    let service = ManagedSecretsService::new(source);
    let result = service.create("k", b"v", SecretKind::Text, None, None).await;
    assert!(matches!(result, Err(SyncError::ProviderUnavailable)));

    let result = service.list().await;
    assert!(matches!(result, Err(SyncError::ProviderUnavailable)));
}
