//! Credential collaborator contract.
//!
//! The credential store (encryption, CRUD) is external; the core consumes
//! credential content by id and client authentication for the RPC login
//! handshake.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    SshKey,
    Password,
}

/// Token returned by a successful client login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("credential backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve the raw credential content (key text or password) by id.
    async fn credential_content(&self, id: &str) -> Result<(String, CredentialKind), CredentialError>;

    /// Validate a client id/secret pair and mint an access token.
    async fn authenticate_client(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, CredentialError>;
}

/// In-memory provider for tests.
#[derive(Default)]
pub struct MemoryCredentials {
    contents: RwLock<HashMap<String, (String, CredentialKind)>>,
    clients: RwLock<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_content(&self, id: &str, content: &str, kind: CredentialKind) {
        self.contents
            .write()
            .insert(id.to_string(), (content.to_string(), kind));
    }

    pub fn insert_client(&self, client_id: &str, client_secret: &str) {
        self.clients
            .write()
            .insert(client_id.to_string(), client_secret.to_string());
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentials {
    async fn credential_content(&self, id: &str) -> Result<(String, CredentialKind), CredentialError> {
        self.contents
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }

    async fn authenticate_client(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, CredentialError> {
        match self.clients.read().get(client_id) {
            Some(secret) if secret == client_secret => Ok(AccessToken {
                access_token: format!("token-{client_id}"),
                token_type: "bearer".to_string(),
                expires_in: 3600,
            }),
            _ => Err(CredentialError::AuthFailed(format!(
                "invalid credentials for {client_id}"
            ))),
        }
    }
}
