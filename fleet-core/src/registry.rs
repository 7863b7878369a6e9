//! Service registry contract.
//!
//! Used by the monitor subsystem to discover the orchestrator instances a
//! server can be assigned to. Instances are compared by `instance_id`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub instance_id: String,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
#[error("registry error: {0}")]
pub struct RegistryError(pub String);

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError>;
}

/// In-memory registry for tests.
#[derive(Default)]
pub struct MemoryRegistry {
    instances: RwLock<Vec<ServiceInstance>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: &str, address: &str) {
        self.instances.write().push(ServiceInstance {
            instance_id: instance_id.to_string(),
            address: address.to_string(),
        });
    }

    pub fn deregister(&self, instance_id: &str) {
        self.instances.write().retain(|i| i.instance_id != instance_id);
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn discover(&self, _service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self.instances.read().clone())
    }
}
