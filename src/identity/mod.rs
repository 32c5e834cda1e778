//! Identity-provider collaborator.
//!
//! Supplies private-key material for identities whose keys are not
//! stored inline in the settings aggregate, so that portable backups
//! can be made self-sufficient.  The real implementation wraps the
//! issuing service's API and lives with the embedding application.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Result;

/// Source of private-key material for identity records.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the PEM private key for `identity_id`, or `None` if the
    /// provider does not hold one.
    async fn private_key(&self, identity_id: &str) -> Result<Option<String>>;
}

/// An `IdentityProvider` over a fixed in-memory map.
///
/// Used by tests and by embedders that keep key material locally.
#[derive(Default)]
pub struct StaticIdentityProvider {
    keys: HashMap<String, String>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key for an identity id, builder-style.
    pub fn with_key(mut self, identity_id: &str, pem: &str) -> Self {
        self.keys.insert(identity_id.to_string(), pem.to_string());
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn private_key(&self, identity_id: &str) -> Result<Option<String>> {
        Ok(self.keys.get(identity_id).cloned())
    }
}
