//! Built-in executors for the standard remediation and compensation actions.
//!
//! These executors do not reach into real infrastructure. They validate
//! parameters, report what they would change as structured output, and carry
//! the planning estimates for their action type.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{ActionExecutor, ValidationOutcome};
use crate::model::{Action, ActionContext, ResourceRequirements};

/// Resource dimensions understood by `reallocate_resources`
const RESOURCE_TYPES: [&str; 4] = ["cpu", "memory", "disk", "network"];

/// Every action type shipped with the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAction {
    RestartComponent,
    UpdateConfiguration,
    ReallocateResources,
    DiagnoseShallow,
    DiagnoseMedium,
    DiagnoseDeep,
    RepairData,
    Noop,
    VerifyStatus,
    RestoreConfiguration,
    ReleaseResources,
    VerifyDataIntegrity,
    VerifySystemState,
}

impl BuiltinAction {
    pub fn all() -> [BuiltinAction; 13] {
        use BuiltinAction::*;
        [
            RestartComponent,
            UpdateConfiguration,
            ReallocateResources,
            DiagnoseShallow,
            DiagnoseMedium,
            DiagnoseDeep,
            RepairData,
            Noop,
            VerifyStatus,
            RestoreConfiguration,
            ReleaseResources,
            VerifyDataIntegrity,
            VerifySystemState,
        ]
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            BuiltinAction::RestartComponent => "restart_component",
            BuiltinAction::UpdateConfiguration => "update_configuration",
            BuiltinAction::ReallocateResources => "reallocate_resources",
            BuiltinAction::DiagnoseShallow => "diagnose_shallow",
            BuiltinAction::DiagnoseMedium => "diagnose_medium",
            BuiltinAction::DiagnoseDeep => "diagnose_deep",
            BuiltinAction::RepairData => "repair_data",
            BuiltinAction::Noop => "noop",
            BuiltinAction::VerifyStatus => "verify_status",
            BuiltinAction::RestoreConfiguration => "restore_configuration",
            BuiltinAction::ReleaseResources => "release_resources",
            BuiltinAction::VerifyDataIntegrity => "verify_data_integrity",
            BuiltinAction::VerifySystemState => "verify_system_state",
        }
    }

    pub fn from_action_type(action_type: &str) -> Option<Self> {
        Self::all().into_iter().find(|b| b.action_type() == action_type)
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            BuiltinAction::UpdateConfiguration => &["config_key", "value"],
            BuiltinAction::ReallocateResources => &["resource_type", "amount"],
            BuiltinAction::RepairData | BuiltinAction::VerifyDataIntegrity => &["dataset"],
            BuiltinAction::RestoreConfiguration => &["config_key"],
            BuiltinAction::ReleaseResources => &["resource_type"],
            _ => &[],
        }
    }

    fn needs_component(&self) -> bool {
        matches!(self, BuiltinAction::RestartComponent | BuiltinAction::VerifyStatus)
    }

    fn estimated_duration(&self, action: &Action) -> Duration {
        match self {
            BuiltinAction::RestartComponent => {
                if graceful(action) {
                    Duration::from_secs(10)
                } else {
                    Duration::from_secs(5)
                }
            }
            BuiltinAction::UpdateConfiguration => Duration::from_secs(2),
            BuiltinAction::ReallocateResources => Duration::from_secs(3),
            BuiltinAction::DiagnoseShallow => Duration::from_secs(1),
            BuiltinAction::DiagnoseMedium => Duration::from_secs(5),
            BuiltinAction::DiagnoseDeep => Duration::from_secs(15),
            BuiltinAction::RepairData => Duration::from_secs(30),
            BuiltinAction::Noop => Duration::from_millis(10),
            BuiltinAction::VerifyStatus => Duration::from_secs(1),
            BuiltinAction::RestoreConfiguration => Duration::from_secs(2),
            BuiltinAction::ReleaseResources => Duration::from_secs(1),
            BuiltinAction::VerifyDataIntegrity => Duration::from_secs(10),
            BuiltinAction::VerifySystemState => Duration::from_secs(1),
        }
    }

    fn resource_requirements(&self, action: &Action) -> ResourceRequirements {
        match self {
            BuiltinAction::RestartComponent => ResourceRequirements::new(0.5, 256, 0, 0.0),
            BuiltinAction::UpdateConfiguration => ResourceRequirements::new(0.1, 64, 1, 0.0),
            BuiltinAction::ReallocateResources => reallocation_amount(action),
            BuiltinAction::DiagnoseShallow => ResourceRequirements::new(0.2, 64, 0, 1.0),
            BuiltinAction::DiagnoseMedium => ResourceRequirements::new(0.5, 128, 10, 5.0),
            BuiltinAction::DiagnoseDeep => ResourceRequirements::new(1.0, 512, 100, 10.0),
            BuiltinAction::RepairData => ResourceRequirements::new(1.0, 512, 1024, 10.0),
            BuiltinAction::Noop => ResourceRequirements::zero(),
            BuiltinAction::VerifyStatus => ResourceRequirements::new(0.1, 32, 0, 0.5),
            BuiltinAction::RestoreConfiguration => ResourceRequirements::new(0.1, 64, 1, 0.0),
            BuiltinAction::ReleaseResources => ResourceRequirements::new(0.1, 32, 0, 0.0),
            BuiltinAction::VerifyDataIntegrity => ResourceRequirements::new(0.5, 256, 0, 0.0),
            BuiltinAction::VerifySystemState => ResourceRequirements::new(0.1, 32, 0, 0.0),
        }
    }

    fn validate(&self, action: &Action) -> ValidationOutcome {
        let mut errors = Vec::new();
        for key in self.required_parameters() {
            if !action.parameters.contains_key(*key) {
                errors.push(format!("missing required parameter '{}'", key));
            }
        }
        if self.needs_component() && component(action).is_none() {
            errors.push("missing target component".to_string());
        }
        if *self == BuiltinAction::ReallocateResources {
            if let Some(kind) = action.parameter_str("resource_type") {
                if !RESOURCE_TYPES.contains(&kind) {
                    errors.push(format!("unknown resource_type '{}'", kind));
                }
            }
            if let Some(amount) = action.parameters.get("amount") {
                match amount.as_f64() {
                    Some(a) if a > 0.0 => {}
                    _ => errors.push("amount must be a positive number".to_string()),
                }
            }
        }
        ValidationOutcome::invalid(errors)
    }

    fn run(&self, action: &Action, context: &ActionContext) -> anyhow::Result<Value> {
        let outcome = self.validate(action);
        if !outcome.valid {
            anyhow::bail!("{}: {}", self.action_type(), outcome.errors.join("; "));
        }
        let param = |key: &str| action.parameters.get(key).cloned().unwrap_or(Value::Null);

        let output = match self {
            BuiltinAction::RestartComponent => json!({
                "component": component(action),
                "graceful": graceful(action),
                "restarted": true,
            }),
            BuiltinAction::UpdateConfiguration => json!({
                "config_key": param("config_key"),
                "previous_value": param("previous_value"),
                "new_value": param("value"),
                "updated": true,
            }),
            BuiltinAction::ReallocateResources => json!({
                "resource_type": param("resource_type"),
                "amount": param("amount"),
                "reallocated": true,
            }),
            BuiltinAction::DiagnoseShallow
            | BuiltinAction::DiagnoseMedium
            | BuiltinAction::DiagnoseDeep => {
                let depth = match self {
                    BuiltinAction::DiagnoseShallow => "shallow",
                    BuiltinAction::DiagnoseMedium => "medium",
                    _ => "deep",
                };
                json!({
                    "depth": depth,
                    "target": component(action),
                    "cpu_usage_percent": context.system_state.cpu_usage_percent,
                    "memory_usage_percent": context.system_state.memory_usage_percent,
                    "disk_usage_percent": context.system_state.disk_usage_percent,
                })
            }
            BuiltinAction::RepairData => json!({
                "dataset": param("dataset"),
                "repair_strategy": action.parameter_str("strategy").unwrap_or("auto"),
                "repaired": true,
            }),
            BuiltinAction::Noop => json!({ "noop": true }),
            BuiltinAction::VerifyStatus => json!({
                "component": component(action),
                "healthy": true,
            }),
            BuiltinAction::RestoreConfiguration => json!({
                "config_key": param("config_key"),
                "restored_value": param("previous_value"),
                "restored": true,
            }),
            BuiltinAction::ReleaseResources => json!({
                "resource_type": param("resource_type"),
                "amount": param("amount"),
                "released": true,
            }),
            BuiltinAction::VerifyDataIntegrity => json!({
                "dataset": param("dataset"),
                "consistent": true,
            }),
            BuiltinAction::VerifySystemState => json!({
                "observed": context.system_state.observed,
                "cpu_usage_percent": context.system_state.cpu_usage_percent,
                "memory_usage_percent": context.system_state.memory_usage_percent,
                "compensates": param("compensates"),
                "verified": true,
            }),
        };
        Ok(output)
    }
}

fn component(action: &Action) -> Option<String> {
    action
        .parameter_str("component")
        .map(str::to_string)
        .or_else(|| action.component.clone())
}

fn graceful(action: &Action) -> bool {
    action
        .parameters
        .get("graceful")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn reallocation_amount(action: &Action) -> ResourceRequirements {
    let amount = action
        .parameters
        .get("amount")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0);
    match action.parameter_str("resource_type") {
        Some("cpu") => ResourceRequirements::new(amount, 0, 0, 0.0),
        Some("memory") => ResourceRequirements::new(0.0, amount as u64, 0, 0.0),
        Some("disk") => ResourceRequirements::new(0.0, 0, amount as u64, 0.0),
        Some("network") => ResourceRequirements::new(0.0, 0, 0, amount),
        _ => ResourceRequirements::zero(),
    }
}

/// Executor backed by one [`BuiltinAction`]
#[derive(Debug, Clone, Copy)]
pub struct BuiltinExecutor {
    kind: BuiltinAction,
}

impl BuiltinExecutor {
    pub fn new(kind: BuiltinAction) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BuiltinAction {
        self.kind
    }
}

#[async_trait]
impl ActionExecutor for BuiltinExecutor {
    async fn execute(&self, action: &Action, context: &ActionContext) -> anyhow::Result<Value> {
        debug!(
            action_id = %action.id,
            action_type = self.kind.action_type(),
            execution_id = %context.execution_id,
            "Running built-in action"
        );
        self.kind.run(action, context)
    }

    async fn validate(&self, action: &Action, _context: &ActionContext) -> Option<ValidationOutcome> {
        Some(self.kind.validate(action))
    }

    fn estimate_execution_time(&self, action: &Action) -> Option<Duration> {
        Some(self.kind.estimated_duration(action))
    }

    fn estimate_resource_requirements(&self, action: &Action) -> Option<ResourceRequirements> {
        Some(self.kind.resource_requirements(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(kind: BuiltinAction) -> BuiltinExecutor {
        BuiltinExecutor::new(kind)
    }

    #[tokio::test]
    async fn test_restart_component_uses_action_component() {
        let action = Action::new("r1", "restart_component").on_component("api");
        let out = executor(BuiltinAction::RestartComponent)
            .execute(&action, &ActionContext::detached())
            .await
            .expect("restart succeeds");
        assert_eq!(out["component"], "api");
        assert_eq!(out["graceful"], true);
    }

    #[tokio::test]
    async fn test_restart_without_component_fails() {
        let action = Action::new("r1", "restart_component");
        let result = executor(BuiltinAction::RestartComponent)
            .execute(&action, &ActionContext::detached())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reallocate_validation() {
        let exec = executor(BuiltinAction::ReallocateResources);
        let ctx = ActionContext::detached();

        let bad = Action::new("x", "reallocate_resources")
            .with_parameter("resource_type", json!("gpu"))
            .with_parameter("amount", json!(-1));
        let outcome = exec.validate(&bad, &ctx).await.expect("builtin validates");
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 2);

        let good = Action::new("x", "reallocate_resources")
            .with_parameter("resource_type", json!("memory"))
            .with_parameter("amount", json!(512));
        assert!(exec.validate(&good, &ctx).await.expect("builtin validates").valid);
        assert_eq!(
            exec.estimate_resource_requirements(&good),
            Some(ResourceRequirements::new(0.0, 512, 0, 0.0))
        );
    }

    #[test]
    fn test_restart_estimate_depends_on_mode() {
        let exec = executor(BuiltinAction::RestartComponent);
        let graceful = Action::new("r", "restart_component");
        let forced = Action::new("r", "restart_component").with_parameter("graceful", json!(false));
        assert!(exec.estimate_execution_time(&graceful) > exec.estimate_execution_time(&forced));
    }

    #[test]
    fn test_action_type_lookup() {
        for builtin in BuiltinAction::all() {
            assert_eq!(BuiltinAction::from_action_type(builtin.action_type()), Some(builtin));
        }
        assert!(BuiltinAction::from_action_type("reboot_datacenter").is_none());
    }
}
