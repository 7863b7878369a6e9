//! Target server model and lookup contract.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_ssh_port() -> u16 {
    22
}

/// An external host managed by the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Credential id resolved through the credential collaborator.
    pub credential_id: String,
    /// Servers running the all-in-one bundle monitor themselves and are
    /// never assigned to an orchestrator node.
    #[serde(default)]
    pub install_aio: bool,
}

impl Server {
    pub fn ssh_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("server catalog error: {0}")]
pub struct CatalogError(pub String);

/// Lookup of server records by id. The record store itself (database,
/// HTTP layer) is external; the control loops only resolve ids.
#[async_trait]
pub trait ServerCatalog: Send + Sync {
    async fn server(&self, id: &str) -> Result<Option<Server>, CatalogError>;
}

/// In-memory catalog for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryCatalog {
    servers: RwLock<HashMap<String, Server>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, server: Server) {
        self.servers.write().insert(server.id.clone(), server);
    }

    pub fn remove(&self, id: &str) {
        self.servers.write().remove(id);
    }
}

#[async_trait]
impl ServerCatalog for MemoryCatalog {
    async fn server(&self, id: &str) -> Result<Option<Server>, CatalogError> {
        Ok(self.servers.read().get(id).cloned())
    }
}
