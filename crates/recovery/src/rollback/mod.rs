//! Rollback planning and execution.
//!
//! Every forward action gets at most one compensating action. Compensators
//! run in ascending `order`, which is derived as `1000 - position` from the
//! action's 1-based place in execution order, so the last forward action is
//! undone first even when declared orders are absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, ExecutionEvent};
use crate::history::BoundedHistory;
use crate::model::{Action, ExecutionContext, RollbackDirective, Strategy, SystemState};
use crate::registry::ActionExecutorRegistry;

/// Base from which compensator orders are derived
pub const ROLLBACK_ORDER_BASE: i64 = 1000;

/// Action type used when no specific compensation is known
pub const PLACEHOLDER_ROLLBACK: &str = "verify_system_state";

/// How a compensating action was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    /// Static mapping from the forward action type
    Mapped,
    /// Generic state verification for unmapped types
    Placeholder,
    /// Supplied by the strategy
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackTemplate {
    pub action_type: &'static str,
    pub kind: RollbackKind,
}

/// Compensating action type for a forward action type
pub fn rollback_template(action_type: &str) -> RollbackTemplate {
    let mapped = match action_type {
        "restart_component" => Some("verify_status"),
        "update_configuration" => Some("restore_configuration"),
        "reallocate_resources" => Some("release_resources"),
        "repair_data" => Some("verify_data_integrity"),
        _ => None,
    };
    match mapped {
        Some(action_type) => RollbackTemplate {
            action_type,
            kind: RollbackKind::Mapped,
        },
        None => RollbackTemplate {
            action_type: PLACEHOLDER_ROLLBACK,
            kind: RollbackKind::Placeholder,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    pub action: Action,
    /// Id of the forward action this undoes
    pub compensates: String,
    pub order: i64,
    pub kind: RollbackKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: Uuid,
    pub strategy_id: String,
    pub actions: Vec<RollbackAction>,
    pub state_snapshot: SystemState,
    /// Forward actions declared without a safe rollback
    pub irreversible: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RollbackPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn compensator_for(&self, action_id: &str) -> Option<&RollbackAction> {
        self.actions.iter().find(|a| a.compensates == action_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackActionResult {
    pub action_id: String,
    pub action_type: String,
    pub compensates: String,
    pub successful: bool,
    pub duration: Duration,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub execution_id: Uuid,
    pub successful: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub action_results: Vec<RollbackActionResult>,
    /// Attempted actions that could not be compensated
    pub irreversible: Vec<String>,
    pub error: Option<String>,
}

impl RollbackResult {
    pub fn failed_actions(&self) -> Vec<String> {
        self.action_results
            .iter()
            .filter(|r| !r.successful)
            .map(|r| r.action_id.clone())
            .collect()
    }
}

pub struct RollbackManager {
    registry: Arc<ActionExecutorRegistry>,
    history: BoundedHistory<RollbackResult>,
    events: EventBus,
}

impl RollbackManager {
    pub fn new(registry: Arc<ActionExecutorRegistry>, history_size: usize, events: EventBus) -> Self {
        Self {
            registry,
            history: BoundedHistory::new(history_size),
            events,
        }
    }

    /// Build the compensation plan for a strategy. Malformed strategies yield
    /// an empty plan carrying the error.
    pub fn create_rollback_plan(&self, strategy: &Strategy, state: &SystemState) -> RollbackPlan {
        let mut plan = RollbackPlan {
            id: Uuid::new_v4(),
            strategy_id: strategy.id.clone(),
            actions: Vec::new(),
            state_snapshot: state.clone(),
            irreversible: Vec::new(),
            error: None,
            created_at: Utc::now(),
        };
        if strategy.id.trim().is_empty() {
            plan.error = Some("strategy has no id".to_string());
            return plan;
        }
        if strategy.actions.is_empty() {
            plan.error = Some(format!("strategy {} has no actions", strategy.id));
            return plan;
        }

        for (position, action) in strategy.ordered_actions().into_iter().enumerate() {
            let order = ROLLBACK_ORDER_BASE - (position as i64 + 1);
            let compensator = match &action.rollback {
                RollbackDirective::Irreversible => {
                    plan.irreversible.push(action.id.clone());
                    continue;
                }
                RollbackDirective::Explicit { action: explicit } => RollbackAction {
                    action: explicit.as_ref().clone(),
                    compensates: action.id.clone(),
                    order,
                    kind: RollbackKind::Explicit,
                },
                RollbackDirective::Derive => {
                    let template = rollback_template(&action.action_type);
                    let mut compensating =
                        Action::new(format!("rollback-{}", action.id), template.action_type)
                            .with_order(order.max(0) as u32);
                    compensating.parameters = action.parameters.clone();
                    compensating
                        .parameters
                        .insert("compensates".to_string(), serde_json::json!(action.id));
                    compensating.component = action.component.clone();
                    compensating.required = false;
                    RollbackAction {
                        action: compensating,
                        compensates: action.id.clone(),
                        order,
                        kind: template.kind,
                    }
                }
            };
            plan.actions.push(compensator);
        }
        plan.actions.sort_by_key(|a| a.order);

        debug!(
            strategy_id = %strategy.id,
            compensators = plan.actions.len(),
            irreversible = plan.irreversible.len(),
            "Created rollback plan"
        );
        plan
    }

    /// Compensate every attempted action of `context`. Never stops early; the
    /// result is successful only if every compensator succeeded.
    pub async fn execute_rollback(&self, plan: &RollbackPlan, context: &ExecutionContext) -> RollbackResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let rollback_id = Uuid::new_v4();
        let execution_id = context.execution_id;

        let mut attempted: HashSet<&str> = context.completed_actions.iter().map(String::as_str).collect();
        if let Some(failed) = &context.failed_action {
            attempted.insert(failed.as_str());
        }

        let mut steps: Vec<&RollbackAction> = plan
            .actions
            .iter()
            .filter(|a| attempted.contains(a.compensates.as_str()))
            .collect();
        steps.sort_by_key(|a| a.order);
        let irreversible: Vec<String> = plan
            .irreversible
            .iter()
            .filter(|id| attempted.contains(id.as_str()))
            .cloned()
            .collect();

        info!(
            execution_id = %execution_id,
            rollback_id = %rollback_id,
            steps = steps.len(),
            "Starting rollback"
        );
        self.events.publish(ExecutionEvent::RollbackStarted {
            rollback_id,
            execution_id,
            action_count: steps.len(),
        });
        for id in &irreversible {
            warn!(execution_id = %execution_id, action_id = %id, "Action declared irreversible, not compensated");
        }

        let view = context.view();
        let mut action_results = Vec::with_capacity(steps.len());
        for step in steps {
            let step_clock = Instant::now();
            let outcome = match self.registry.get_executor_for_action(&step.action.action_type) {
                Ok(executor) => {
                    if let Err(e) = executor.prepare(&step.action, &view).await {
                        Err(anyhow::anyhow!("prepare failed: {}", e))
                    } else {
                        let outcome = executor.execute(&step.action, &view).await;
                        if let Err(e) = executor.cleanup(&step.action, &view).await {
                            warn!(action_id = %step.action.id, "Rollback cleanup failed: {}", e);
                        }
                        outcome
                    }
                }
                Err(e) => Err(anyhow::Error::new(e)),
            };
            let result = match outcome {
                Ok(output) => {
                    debug!(action_id = %step.action.id, compensates = %step.compensates, "Compensation succeeded");
                    RollbackActionResult {
                        action_id: step.action.id.clone(),
                        action_type: step.action.action_type.clone(),
                        compensates: step.compensates.clone(),
                        successful: true,
                        duration: step_clock.elapsed(),
                        output: Some(output),
                        error: None,
                    }
                }
                Err(e) => {
                    error!(
                        execution_id = %execution_id,
                        action_id = %step.action.id,
                        compensates = %step.compensates,
                        "Compensation failed: {}",
                        e
                    );
                    RollbackActionResult {
                        action_id: step.action.id.clone(),
                        action_type: step.action.action_type.clone(),
                        compensates: step.compensates.clone(),
                        successful: false,
                        duration: step_clock.elapsed(),
                        output: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            action_results.push(result);
        }

        let successful = plan.error.is_none() && action_results.iter().all(|r| r.successful);
        let result = RollbackResult {
            id: rollback_id,
            plan_id: plan.id,
            execution_id,
            successful,
            started_at,
            completed_at: Utc::now(),
            duration: clock.elapsed(),
            action_results,
            irreversible,
            error: plan.error.clone(),
        };
        self.history.push(result.clone());

        if successful {
            info!(execution_id = %execution_id, rollback_id = %rollback_id, "Rollback completed");
            self.events.publish(ExecutionEvent::RollbackCompleted {
                rollback_id,
                execution_id,
                duration_ms: result.duration.as_millis() as u64,
            });
        } else {
            warn!(execution_id = %execution_id, rollback_id = %rollback_id, "Rollback finished with failures");
            self.events.publish(ExecutionEvent::RollbackFailed {
                rollback_id,
                execution_id,
                failed_actions: result.failed_actions(),
            });
        }
        result
    }

    pub fn get_rollback(&self, rollback_id: Uuid) -> Option<RollbackResult> {
        self.history.find(|r| r.id == rollback_id)
    }

    /// Oldest first
    pub fn rollback_history(&self) -> Vec<RollbackResult> {
        self.history.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CausalAnalysisResult;
    use serde_json::json;

    fn manager() -> RollbackManager {
        RollbackManager::new(
            Arc::new(ActionExecutorRegistry::with_builtin_executors()),
            10,
            EventBus::default(),
        )
    }

    fn strategy() -> Strategy {
        Strategy::new("s1", "fix api")
            .with_action(
                Action::new("cfg", "update_configuration")
                    .with_parameter("config_key", json!("pool_size"))
                    .with_parameter("value", json!(20))
                    .with_parameter("previous_value", json!(10)),
            )
            .with_action(Action::new("restart", "restart_component").on_component("api"))
            .with_action(Action::new("custom", "flush_cache"))
    }

    #[test]
    fn test_template_mapping() {
        assert_eq!(rollback_template("restart_component").action_type, "verify_status");
        assert_eq!(rollback_template("update_configuration").action_type, "restore_configuration");
        assert_eq!(rollback_template("reallocate_resources").action_type, "release_resources");
        assert_eq!(rollback_template("repair_data").action_type, "verify_data_integrity");
        let placeholder = rollback_template("flush_cache");
        assert_eq!(placeholder.action_type, PLACEHOLDER_ROLLBACK);
        assert_eq!(placeholder.kind, RollbackKind::Placeholder);
    }

    #[test]
    fn test_plan_reverses_forward_order() {
        let plan = manager().create_rollback_plan(&strategy(), &SystemState::unknown());
        assert!(plan.error.is_none());
        let compensated: Vec<&str> = plan.actions.iter().map(|a| a.compensates.as_str()).collect();
        assert_eq!(compensated, vec!["custom", "restart", "cfg"]);
        let orders: Vec<i64> = plan.actions.iter().map(|a| a.order).collect();
        assert_eq!(orders, vec![997, 998, 999]);

        let restore = plan.compensator_for("cfg").expect("cfg compensated");
        assert_eq!(restore.action.parameters["previous_value"], json!(10));
    }

    #[test]
    fn test_plan_reverses_strategy_without_declared_orders() {
        let strategy: Strategy = serde_json::from_value(json!({
            "id": "s2",
            "name": "from config",
            "actions": [
                { "id": "a", "action_type": "noop" },
                { "id": "b", "action_type": "restart_component", "component": "api" },
                { "id": "c", "action_type": "flush_cache" }
            ]
        }))
        .expect("strategy deserializes");
        assert!(strategy.actions.iter().all(|a| a.order == 0));

        let plan = manager().create_rollback_plan(&strategy, &SystemState::unknown());
        let compensated: Vec<&str> = plan.actions.iter().map(|a| a.compensates.as_str()).collect();
        assert_eq!(compensated, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_malformed_strategy_yields_embedded_error() {
        let plan = manager().create_rollback_plan(&Strategy::new("s1", "empty"), &SystemState::unknown());
        assert!(plan.is_empty());
        assert!(plan.error.is_some());
    }

    #[test]
    fn test_directives_respected() {
        let strategy = Strategy::new("s1", "mixed")
            .with_action(Action::new("wipe", "purge_queue").with_rollback(RollbackDirective::Irreversible))
            .with_action(Action::new("scale", "scale_out").with_rollback(RollbackDirective::Explicit {
                action: Box::new(Action::new("scale-in", "noop")),
            }));
        let plan = manager().create_rollback_plan(&strategy, &SystemState::unknown());
        assert_eq!(plan.irreversible, vec!["wipe".to_string()]);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, RollbackKind::Explicit);
        assert_eq!(plan.actions[0].action.id, "scale-in");
    }

    #[tokio::test]
    async fn test_only_attempted_actions_are_compensated() {
        let manager = manager();
        let strategy = strategy();
        let plan = manager.create_rollback_plan(&strategy, &SystemState::unknown());
        let mut ctx = ExecutionContext::new(
            Uuid::new_v4(),
            strategy,
            CausalAnalysisResult::new("a"),
            SystemState::unknown(),
            false,
        );
        ctx.completed_actions.push("cfg".into());
        ctx.failed_action = Some("restart".into());

        let result = manager.execute_rollback(&plan, &ctx).await;
        assert!(result.successful);
        let undone: Vec<&str> = result.action_results.iter().map(|r| r.compensates.as_str()).collect();
        assert_eq!(undone, vec!["restart", "cfg"]);
        assert!(manager.get_rollback(result.id).is_some());
    }
}
