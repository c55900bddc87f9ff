//! Resource-manager collaborator and its heuristic default.
//!
//! Allocations are advisory bookkeeping: nothing is reserved on the host,
//! but every allocation handed out must be released before an execution ends.

pub mod probe;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{ResourceAllocation, ResourceAllocationPlan, ResourceRequirements, SystemState};

pub use probe::{StaticProbe, SysinfoProbe, SystemProbe};

#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn get_system_state(&self) -> anyhow::Result<SystemState>;

    async fn create_allocation_plan(
        &self,
        requirements: &[(String, ResourceRequirements)],
        available: &ResourceRequirements,
    ) -> anyhow::Result<ResourceAllocationPlan>;

    async fn allocate_resources(
        &self,
        execution_id: Uuid,
        action_id: Option<&str>,
        resources: &ResourceRequirements,
    ) -> anyhow::Result<ResourceAllocation>;

    async fn release_resources(&self, allocation: &ResourceAllocation) -> anyhow::Result<()>;
}

/// Sum per-action requirements and compare against what is available
pub fn plan_allocation(
    requirements: &[(String, ResourceRequirements)],
    available: &ResourceRequirements,
) -> ResourceAllocationPlan {
    let total: ResourceRequirements = requirements.iter().map(|(_, r)| *r).sum();
    let shortfalls = total.shortfalls(available);
    ResourceAllocationPlan {
        total,
        available: *available,
        per_action: requirements.to_vec(),
        feasible: shortfalls.is_empty(),
        shortfalls,
    }
}

/// Tracks allocations in memory and reads host state through a [`SystemProbe`]
pub struct HeuristicResourceManager {
    probe: Arc<dyn SystemProbe>,
    allocations: DashMap<Uuid, (Uuid, ResourceAllocation)>,
}

impl Default for HeuristicResourceManager {
    fn default() -> Self {
        Self::new(Arc::new(SysinfoProbe::default()))
    }
}

impl HeuristicResourceManager {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self {
            probe,
            allocations: DashMap::new(),
        }
    }

    /// Allocations not yet released
    pub fn outstanding(&self) -> Vec<ResourceAllocation> {
        self.allocations.iter().map(|e| e.value().1.clone()).collect()
    }

    pub fn outstanding_for(&self, execution_id: Uuid) -> usize {
        self.allocations
            .iter()
            .filter(|e| e.value().0 == execution_id)
            .count()
    }
}

#[async_trait]
impl ResourceManager for HeuristicResourceManager {
    async fn get_system_state(&self) -> anyhow::Result<SystemState> {
        self.probe.snapshot()
    }

    async fn create_allocation_plan(
        &self,
        requirements: &[(String, ResourceRequirements)],
        available: &ResourceRequirements,
    ) -> anyhow::Result<ResourceAllocationPlan> {
        let plan = plan_allocation(requirements, available);
        if !plan.feasible {
            warn!(shortfalls = ?plan.shortfalls, "Resource plan exceeds available capacity");
        }
        Ok(plan)
    }

    async fn allocate_resources(
        &self,
        execution_id: Uuid,
        action_id: Option<&str>,
        resources: &ResourceRequirements,
    ) -> anyhow::Result<ResourceAllocation> {
        let allocation = ResourceAllocation::new(action_id.map(str::to_string), *resources);
        debug!(
            execution_id = %execution_id,
            allocation_id = %allocation.id,
            action_id = ?action_id,
            "Allocated resources"
        );
        self.allocations
            .insert(allocation.id, (execution_id, allocation.clone()));
        Ok(allocation)
    }

    async fn release_resources(&self, allocation: &ResourceAllocation) -> anyhow::Result<()> {
        match self.allocations.remove(&allocation.id) {
            Some(_) => debug!(allocation_id = %allocation.id, "Released resources"),
            None => debug!(allocation_id = %allocation.id, "Allocation already released"),
        }
        Ok(())
    }
}

/// Mark an allocation released locally after the manager confirmed it
pub(crate) fn mark_released(allocation: &mut ResourceAllocation) {
    if allocation.released_at.is_none() {
        allocation.released_at = Some(Utc::now());
    }
}
