//! Message-level authentication.
//!
//! A connection earns a token through the `System/Auth` login handshake;
//! the `AuthGate` base handler then requires that token for everything
//! outside the system service. Fine-grained (resource, action) permission
//! checks would slot into the gate; today the gate is token presence only.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use fleet_core::credentials::CredentialProvider;

use crate::dispatcher::MessageHandler;
use crate::error::RpcError;
use crate::message::{msg_type, service, Message};

/// Login payload sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub client_id: String,
    pub client_secret: String,
}

/// Access tokens by connection id. Populated on login, dropped when the
/// connection closes.
#[derive(Default)]
pub struct TokenTable {
    tokens: DashMap<String, String>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn_id: &str, token: &str) {
        self.tokens.insert(conn_id.to_string(), token.to_string());
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.tokens.contains_key(conn_id)
    }

    pub fn remove(&self, conn_id: &str) {
        self.tokens.remove(conn_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Base gate: system traffic and login attempts pass, everything else
/// needs a token entry for the connection.
pub struct AuthGate {
    tokens: Arc<TokenTable>,
}

impl AuthGate {
    pub fn new(tokens: Arc<TokenTable>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl MessageHandler for AuthGate {
    async fn handle(&self, conn_id: &str, msg: &Message) -> Result<Option<Value>, RpcError> {
        if msg.service == service::SYSTEM || msg.msg_type == msg_type::AUTH {
            return Ok(None);
        }
        if self.tokens.contains(conn_id) {
            Ok(None)
        } else {
            debug!("rejecting unauthenticated message {} on {conn_id}", msg.id);
            Err(RpcError::NotAuthenticated)
        }
    }
}

/// `System/Auth` login handler.
pub struct AuthHandler {
    tokens: Arc<TokenTable>,
    credentials: Arc<dyn CredentialProvider>,
}

impl AuthHandler {
    pub fn new(tokens: Arc<TokenTable>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { tokens, credentials }
    }
}

#[async_trait]
impl MessageHandler for AuthHandler {
    async fn handle(&self, conn_id: &str, msg: &Message) -> Result<Option<Value>, RpcError> {
        let request: AuthRequest = serde_json::from_slice(&msg.payload)
            .map_err(|e| RpcError::AuthFailed(format!("malformed auth payload: {e}")))?;

        let token = self
            .credentials
            .authenticate_client(&request.client_id, &request.client_secret)
            .await
            .map_err(|e| RpcError::AuthFailed(e.to_string()))?;

        self.tokens.insert(conn_id, &token.access_token);
        info!("client {} authenticated on connection {conn_id}", request.client_id);

        let value = serde_json::to_value(&token)
            .map_err(|e| RpcError::Internal(format!("encode token: {e}")))?;
        Ok(Some(value))
    }
}

/// `System/Heartbeat` handler: acknowledge with a plain OK.
pub struct HeartbeatHandler;

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, _conn_id: &str, _msg: &Message) -> Result<Option<Value>, RpcError> {
        Ok(Some(Value::String("OK".to_string())))
    }
}
