//! Key-value store contract.
//!
//! The control plane keeps its shared state (monitor assignments) in an
//! external KV store. Only the five operations below are consumed; the
//! store itself is a collaborator behind this trait.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    #[error("kv operation failed: {0}")]
    Operation(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Returns (key, value) pairs for every key starting with `prefix`,
    /// in key order.
    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError>;
    async fn delete_with_prefix(&self, prefix: &str) -> Result<(), KvError>;
}

/// In-memory store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete_with_prefix(&self, prefix: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write();
        let keys: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }
}
