//! Monitor assignment control loop.
//!
//! Every non-AIO server is bound to exactly one orchestrator node through
//! the shared KV store; the owning node probes it on every scheduler tick.
//! Assignment picks the instance with the fewest existing assignments,
//! ties broken by discovery order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use fleet_core::kv::{KvError, KvStore};
use fleet_core::metrics::MetricSink;
use fleet_core::registry::{RegistryError, ServiceRegistry};
use fleet_core::server::{Server, ServerCatalog};
use fleet_exec::command::{ExecSpec, ExecuteRequest};
use fleet_exec::executor::BatchExecutor;

use crate::probe::{probe_batch, samples_from_batch};

pub const ASSIGNMENT_PREFIX: &str = "/monitor/assignments/";

/// Registry service name the orchestrator nodes publish under.
pub const ORCHESTRATOR_SERVICE: &str = "fleet-orchestrator";

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no orchestrator instances available")]
    NoInstances,
    #[error("{0}")]
    Internal(String),
}

/// One server → node binding, stored at `/monitor/assignments/<server_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorAssignment {
    pub server_id: String,
    pub server_name: String,
    pub assigned_node: String,
    pub assign_time: DateTime<Utc>,
}

pub struct MonitorManager {
    kv: Arc<dyn KvStore>,
    registry: Arc<dyn ServiceRegistry>,
    sink: Arc<dyn MetricSink>,
    catalog: Arc<dyn ServerCatalog>,
    executor: Arc<dyn BatchExecutor>,
    node_id: String,
}

fn assignment_key(server_id: &str) -> String {
    format!("{ASSIGNMENT_PREFIX}{server_id}")
}

impl MonitorManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        registry: Arc<dyn ServiceRegistry>,
        sink: Arc<dyn MetricSink>,
        catalog: Arc<dyn ServerCatalog>,
        executor: Arc<dyn BatchExecutor>,
        node_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            registry,
            sink,
            catalog,
            executor,
            node_id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn assignments(&self) -> Result<Vec<MonitorAssignment>, MonitorError> {
        let entries = self.kv.get_with_prefix(ASSIGNMENT_PREFIX).await?;
        let mut assignments = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_str::<MonitorAssignment>(&value) {
                Ok(assignment) => assignments.push(assignment),
                Err(e) => warn!("undecodable assignment at {key}: {e}"),
            }
        }
        Ok(assignments)
    }

    /// New server: AIO installs monitor themselves, everything else gets
    /// bound to the least-loaded orchestrator instance.
    pub async fn on_server_created(&self, server: &Server) -> Result<(), MonitorError> {
        if server.install_aio {
            return Ok(());
        }
        self.assign(server).await
    }

    /// Updated server: a flip to AIO removes the binding; a non-AIO server
    /// without a binding gets one.
    pub async fn on_server_updated(&self, server: &Server) -> Result<(), MonitorError> {
        let key = assignment_key(&server.id);
        if server.install_aio {
            self.kv.delete(&key).await?;
            info!("assignment for {} removed (AIO install)", server.id);
            return Ok(());
        }
        if self.kv.get(&key).await?.is_none() {
            self.assign(server).await?;
        }
        Ok(())
    }

    pub async fn on_server_deleted(&self, server_id: &str) -> Result<(), MonitorError> {
        self.kv.delete(&assignment_key(server_id)).await?;
        Ok(())
    }

    async fn assign(&self, server: &Server) -> Result<(), MonitorError> {
        let instances = self.registry.discover(ORCHESTRATOR_SERVICE).await?;
        if instances.is_empty() {
            return Err(MonitorError::NoInstances);
        }
        let assignments = self.assignments().await?;

        let chosen = instances
            .iter()
            .min_by_key(|instance| {
                assignments
                    .iter()
                    .filter(|a| a.assigned_node == instance.instance_id)
                    .count()
            })
            .map(|instance| instance.instance_id.clone())
            .unwrap_or_else(|| self.node_id.clone());

        let assignment = MonitorAssignment {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            assigned_node: chosen.clone(),
            assign_time: Utc::now(),
        };
        let value = serde_json::to_string(&assignment)
            .map_err(|e| MonitorError::Internal(format!("encode assignment: {e}")))?;
        self.kv.put(&assignment_key(&server.id), &value).await?;
        info!("server {} assigned to {chosen}", server.id);
        Ok(())
    }

    /// One scheduler tick: probe every server assigned to this node, one
    /// worker per probe. Per-server failures are logged; the tick never
    /// aborts.
    pub async fn probe_tick(self: &Arc<Self>) {
        let assignments = match self.assignments().await {
            Ok(assignments) => assignments,
            Err(e) => {
                warn!("assignment scan failed: {e}");
                return;
            }
        };

        let mut handles = Vec::new();
        for assignment in assignments {
            if assignment.assigned_node != self.node_id {
                continue;
            }
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = manager.probe_server(&assignment).await {
                    warn!("probe of {} failed: {e}", assignment.server_id);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn probe_server(&self, assignment: &MonitorAssignment) -> Result<(), String> {
        let server = self
            .catalog
            .server(&assignment.server_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("server {} not in catalog", assignment.server_id))?;

        let request = ExecuteRequest {
            spec: ExecSpec::Batch(probe_batch(&server.id)),
            server,
            save_log: false,
        };
        let result = self.executor.execute(request).await.map_err(|e| e.to_string())?;
        let batch = result
            .batch_result
            .ok_or_else(|| "probe produced no batch result".to_string())?;

        let samples = samples_from_batch(&assignment.server_id, &batch, Utc::now());
        debug!(
            "probe of {} produced {} samples",
            assignment.server_id,
            samples.len()
        );
        if !samples.is_empty() {
            self.sink.store(samples).await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
