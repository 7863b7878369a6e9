//! Metric sink contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One parsed probe measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub server_id: String,
    pub name: String,
    pub value: f64,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("metric sink error: {0}")]
pub struct SinkError(pub String);

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn store(&self, batch: Vec<MetricSample>) -> Result<(), SinkError>;
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<MetricSample>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<MetricSample>> {
        self.batches.lock().clone()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn store(&self, batch: Vec<MetricSample>) -> Result<(), SinkError> {
        self.batches.lock().push(batch);
        Ok(())
    }
}
