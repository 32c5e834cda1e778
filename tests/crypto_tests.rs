//! Integration tests for the sherpa-sync crypto module.

use sherpa_sync::crypto::{
    derive_backup_key, generate_salt, open, seal, MIN_SEALED_LEN, NONCE_LEN, TAG_LEN,
};
use sherpa_sync::errors::SyncError;

// ---------------------------------------------------------------------------
// Seal/open round-trip
// ---------------------------------------------------------------------------

#[test]
fn seal_open_roundtrip() {
    let key = [0xABu8; 32];
    let plaintext = b"{\"identities\":[],\"version\":1}";

    let blob = seal(&key, plaintext).expect("seal should succeed");

    // Blob layout: 12-byte nonce + 16-byte tag + ciphertext.
    assert_eq!(blob.len(), NONCE_LEN + TAG_LEN + plaintext.len());

    let recovered = open(&key, &blob).expect("open should succeed");
    assert_eq!(recovered, plaintext);
}

#[test]
fn seal_produces_different_output_each_time() {
    let key = [0xCDu8; 32];
    let plaintext = b"same plaintext";

    let blob1 = seal(&key, plaintext).expect("seal 1");
    let blob2 = seal(&key, plaintext).expect("seal 2");

    // Because each call generates a new random nonce, the output must differ.
    assert_ne!(blob1, blob2, "two seals of the same plaintext must differ");
}

#[test]
fn open_with_wrong_key_fails() {
    let key = [0x11u8; 32];
    let wrong_key = [0x22u8; 32];

    let blob = seal(&key, b"secret payload").expect("seal");
    let result = open(&wrong_key, &blob);

    assert!(
        matches!(result, Err(SyncError::AuthenticationFailed)),
        "opening with the wrong key must fail the tag check"
    );
}

#[test]
fn open_with_truncated_data_fails() {
    // Anything shorter than nonce + tag must be rejected up front.
    let key = [0xAAu8; 32];
    for len in [0, 5, NONCE_LEN, MIN_SEALED_LEN - 1] {
        let result = open(&key, &vec![0u8; len]);
        assert!(result.is_err(), "{len}-byte blob must fail");
    }
}

#[test]
fn open_with_corrupted_tag_fails() {
    let key = [0xBBu8; 32];
    let mut blob = seal(&key, b"payload").expect("seal");

    // Flip a byte inside the tag region (bytes 12..28).
    blob[NONCE_LEN + 3] ^= 0xFF;

    let result = open(&key, &blob);
    assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
}

#[test]
fn open_with_corrupted_ciphertext_fails() {
    let key = [0xEEu8; 32];
    let mut blob = seal(&key, b"payload").expect("seal");

    let last = blob.len() - 1;
    blob[last] ^= 0x01;

    let result = open(&key, &blob);
    assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
}

// ---------------------------------------------------------------------------
// Key derivation (Argon2id)
// ---------------------------------------------------------------------------

#[test]
fn derive_backup_key_same_inputs_same_output() {
    let password = b"my-secure-passphrase";
    let salt = generate_salt();

    let key1 = derive_backup_key(password, &salt).expect("derive 1");
    let key2 = derive_backup_key(password, &salt).expect("derive 2");

    assert_eq!(key1, key2, "same password + salt must produce the same key");
}

#[test]
fn derive_backup_key_different_salts_different_keys() {
    let password = b"same-password";
    let salt1 = generate_salt();
    let salt2 = generate_salt();

    let key1 = derive_backup_key(password, &salt1).expect("derive 1");
    let key2 = derive_backup_key(password, &salt2).expect("derive 2");

    assert_ne!(key1, key2, "different salts must produce different keys");
}

#[test]
fn generated_salts_are_unique() {
    assert_ne!(generate_salt(), generate_salt());
}
