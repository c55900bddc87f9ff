//! External collaborators the executor notifies but does not depend on.

use async_trait::async_trait;
use tracing::info;

use crate::model::{ExecutionPlan, Strategy};

/// Cross-agent coordination hook notified before a run starts
#[async_trait]
pub trait NeuralCoordinator: Send + Sync {
    async fn coordinate_execution(&self, strategy: &Strategy, plan: &ExecutionPlan) -> anyhow::Result<()>;
}

/// Coordinator that accepts every execution
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCoordinator;

#[async_trait]
impl NeuralCoordinator for NoopCoordinator {
    async fn coordinate_execution(&self, _strategy: &Strategy, _plan: &ExecutionPlan) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Destination for execution metrics
pub trait MetricsSink: Send + Sync {
    fn record_metric(&self, name: &str, value: serde_json::Value);
}

/// Emits metrics as tracing events under the `recovery::metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_metric(&self, name: &str, value: serde_json::Value) {
        info!(target: "recovery::metrics", metric = name, value = %value, "metric");
    }
}
