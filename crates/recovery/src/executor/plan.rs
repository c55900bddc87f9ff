//! Execution planning: estimates, rollback plan, resource plan, dependencies.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ResolutionExecutor;
use crate::model::{
    ActionDependency, DependencyKind, ExecutionPlan, PlannedAction, ResourceRequirements, Strategy,
    SystemState,
};
use crate::resources::plan_allocation;

/// Ordering edges between the actions of a strategy.
///
/// Actions touching the same component are chained in execution order;
/// `depends_on` entries naming unknown actions are ignored.
pub fn dependency_edges(strategy: &Strategy) -> Vec<ActionDependency> {
    let mut edges = Vec::new();
    let mut last_on_component: HashMap<&str, &str> = HashMap::new();

    for action in strategy.ordered_actions() {
        if let Some(component) = action.component.as_deref() {
            if let Some(previous) = last_on_component.insert(component, action.id.as_str()) {
                edges.push(ActionDependency {
                    from: previous.to_string(),
                    to: action.id.clone(),
                    kind: DependencyKind::Component,
                });
            }
        }
        for dependency in &action.depends_on {
            if strategy.action(dependency).is_none() {
                warn!(
                    action_id = %action.id,
                    depends_on = %dependency,
                    "Ignoring dependency on unknown action"
                );
                continue;
            }
            let edge = ActionDependency {
                from: dependency.clone(),
                to: action.id.clone(),
                kind: DependencyKind::Explicit,
            };
            if !edges.iter().any(|e| e.from == edge.from && e.to == edge.to) {
                edges.push(edge);
            }
        }
    }
    edges
}

impl ResolutionExecutor {
    /// Build the read-only plan for running `strategy` against `state`
    pub async fn prepare_execution(
        &self,
        execution_id: Uuid,
        strategy: &Strategy,
        state: &SystemState,
    ) -> ExecutionPlan {
        let actions: Vec<PlannedAction> = strategy
            .ordered_actions()
            .into_iter()
            .map(|action| PlannedAction {
                estimated_duration: self.registry.estimate_execution_time(action),
                resources: self.registry.estimate_resource_requirements(action),
                action: action.clone(),
            })
            .collect();

        let requirements: Vec<(String, ResourceRequirements)> = actions
            .iter()
            .map(|p| (p.action.id.clone(), p.resources))
            .collect();
        let resources = self.resources.clone();
        let available = state.available;
        let resource_plan = match self
            .resource_breaker
            .execute(|| async { resources.create_allocation_plan(&requirements, &available).await })
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(execution_id = %execution_id, "Resource planning degraded to local heuristic: {}", e);
                plan_allocation(&requirements, &available)
            }
        };
        if !resource_plan.feasible {
            warn!(
                execution_id = %execution_id,
                shortfalls = ?resource_plan.shortfalls,
                "Strategy may exceed available resources"
            );
        }

        let rollback_plan = self.rollback.create_rollback_plan(strategy, state);
        let dependencies = dependency_edges(strategy);
        let estimated_duration: Duration = actions.iter().map(|p| p.estimated_duration).sum();

        debug!(
            execution_id = %execution_id,
            actions = actions.len(),
            dependencies = dependencies.len(),
            estimated_ms = estimated_duration.as_millis() as u64,
            "Prepared execution plan"
        );

        ExecutionPlan {
            execution_id,
            strategy_id: strategy.id.clone(),
            actions,
            checkpoints: strategy.checkpoints.clone(),
            rollback_plan,
            resource_plan,
            dependencies,
            estimated_duration,
            created_at: Utc::now(),
        }
    }
}
