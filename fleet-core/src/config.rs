//! Node configuration.
//!
//! All knobs come from `FLEET_*` environment variables with defaults that
//! match a single-node deployment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub enable_auth: bool,
    pub monitor_interval_secs: u64,
    pub history_path: String,
    pub history_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8700".to_string(),
            max_connections: 1024,
            heartbeat_interval_secs: 25,
            request_timeout_secs: 30,
            enable_auth: true,
            monitor_interval_secs: 30,
            history_path: "fleet-history.db".to_string(),
            history_ttl_secs: 7 * 24 * 3600,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: std::env::var("FLEET_LISTEN_ADDR").unwrap_or(d.listen_addr),
            max_connections: env_parse("FLEET_MAX_CONNECTIONS", d.max_connections),
            heartbeat_interval_secs: env_parse("FLEET_HEARTBEAT_INTERVAL", d.heartbeat_interval_secs),
            request_timeout_secs: env_parse("FLEET_REQUEST_TIMEOUT", d.request_timeout_secs),
            enable_auth: env_parse("FLEET_ENABLE_AUTH", d.enable_auth),
            monitor_interval_secs: env_parse("FLEET_MONITOR_INTERVAL", d.monitor_interval_secs),
            history_path: std::env::var("FLEET_HISTORY_PATH").unwrap_or(d.history_path),
            history_ttl_secs: env_parse("FLEET_HISTORY_TTL", d.history_ttl_secs),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }
}
