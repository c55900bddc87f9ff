//! Action executor registry.
//!
//! Maps an action type to the [`ActionExecutor`] that carries it out. Only
//! [`ActionExecutor::execute`] is mandatory; every other hook has a default
//! the registry treats as "no opinion".

pub mod builtin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{Action, ActionContext, ResourceRequirements};

pub use builtin::BuiltinAction;

/// Estimate used when an executor offers none
pub const DEFAULT_EXECUTION_ESTIMATE: Duration = Duration::from_secs(5);

pub type RegistrationId = Uuid;

/// Result of validating an action's parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Plugin that performs one action type
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action, context: &ActionContext)
        -> anyhow::Result<serde_json::Value>;

    /// `None` means the executor does not validate
    async fn validate(&self, _action: &Action, _context: &ActionContext) -> Option<ValidationOutcome> {
        None
    }

    async fn prepare(&self, _action: &Action, _context: &ActionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after `execute` whether or not it succeeded
    async fn cleanup(&self, _action: &Action, _context: &ActionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn estimate_execution_time(&self, _action: &Action) -> Option<Duration> {
        None
    }

    fn estimate_resource_requirements(&self, _action: &Action) -> Option<ResourceRequirements> {
        None
    }
}

#[derive(Clone)]
struct Registration {
    id: RegistrationId,
    executor: Arc<dyn ActionExecutor>,
    registered_at: DateTime<Utc>,
}

/// Registered executor as reported by [`ActionExecutorRegistry::registrations`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub id: RegistrationId,
    pub action_type: String,
    pub registered_at: DateTime<Utc>,
}

/// Thread-safe action type → executor map
#[derive(Default)]
pub struct ActionExecutorRegistry {
    by_type: DashMap<String, Registration>,
    by_id: DashMap<RegistrationId, String>,
}

impl std::fmt::Debug for ActionExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutorRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl ActionExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every [`BuiltinAction`]
    pub fn with_builtin_executors() -> Self {
        let registry = Self::new();
        for builtin in BuiltinAction::all() {
            registry.register(builtin.action_type(), Arc::new(builtin::BuiltinExecutor::new(builtin)));
        }
        registry
    }

    /// Register an executor, replacing any previous one for the same type
    pub fn register(
        &self,
        action_type: impl Into<String>,
        executor: Arc<dyn ActionExecutor>,
    ) -> RegistrationId {
        let action_type = action_type.into();
        let id = Uuid::new_v4();
        let previous = self.by_type.insert(
            action_type.clone(),
            Registration {
                id,
                executor,
                registered_at: Utc::now(),
            },
        );
        if let Some(previous) = previous {
            self.by_id.remove(&previous.id);
            warn!(action_type = %action_type, "Replacing existing executor registration");
        }
        self.by_id.insert(id, action_type.clone());
        debug!(action_type = %action_type, registration_id = %id, "Registered action executor");
        id
    }

    pub fn unregister(&self, id: RegistrationId) -> Result<(), RegistryError> {
        let (_, action_type) = self
            .by_id
            .remove(&id)
            .ok_or(RegistryError::UnknownRegistration(id))?;
        self.by_type.remove_if(&action_type, |_, reg| reg.id == id);
        info!(action_type = %action_type, registration_id = %id, "Unregistered action executor");
        Ok(())
    }

    pub fn get_executor_for_action(
        &self,
        action_type: &str,
    ) -> Result<Arc<dyn ActionExecutor>, RegistryError> {
        self.by_type
            .get(action_type)
            .map(|reg| reg.executor.clone())
            .ok_or_else(|| RegistryError::ExecutorNotFound(action_type.to_string()))
    }

    pub fn has_executor(&self, action_type: &str) -> bool {
        self.by_type.contains_key(action_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        let mut infos: Vec<RegistrationInfo> = self
            .by_type
            .iter()
            .map(|e| RegistrationInfo {
                id: e.value().id,
                action_type: e.key().clone(),
                registered_at: e.value().registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.action_type.cmp(&b.action_type));
        infos
    }

    /// Unknown executors and executors without a validation hook accept
    pub async fn validate_action(&self, action: &Action, context: &ActionContext) -> ValidationOutcome {
        let Ok(executor) = self.get_executor_for_action(&action.action_type) else {
            return ValidationOutcome::ok();
        };
        executor
            .validate(action, context)
            .await
            .unwrap_or_else(ValidationOutcome::ok)
    }

    pub fn estimate_execution_time(&self, action: &Action) -> Duration {
        self.get_executor_for_action(&action.action_type)
            .ok()
            .and_then(|e| e.estimate_execution_time(action))
            .unwrap_or(DEFAULT_EXECUTION_ESTIMATE)
    }

    pub fn estimate_resource_requirements(&self, action: &Action) -> ResourceRequirements {
        self.get_executor_for_action(&action.action_type)
            .ok()
            .and_then(|e| e.estimate_resource_requirements(action))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ActionExecutor for EchoExecutor {
        async fn execute(
            &self,
            action: &Action,
            _context: &ActionContext,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "echo": action.id }))
        }
    }

    #[tokio::test]
    async fn test_minimal_executor_gets_permissive_defaults() {
        let registry = ActionExecutorRegistry::new();
        registry.register("echo", Arc::new(EchoExecutor));
        let action = Action::new("a1", "echo");

        assert!(registry.validate_action(&action, &ActionContext::detached()).await.valid);
        assert_eq!(registry.estimate_execution_time(&action), DEFAULT_EXECUTION_ESTIMATE);
        assert!(registry.estimate_resource_requirements(&action).is_zero());
    }

    #[test]
    fn test_unknown_type_is_error() {
        let registry = ActionExecutorRegistry::new();
        let err = registry.get_executor_for_action("reboot").err();
        assert_eq!(err, Some(RegistryError::ExecutorNotFound("reboot".into())));
    }

    #[test]
    fn test_unregister_removes_executor() {
        let registry = ActionExecutorRegistry::new();
        let id = registry.register("echo", Arc::new(EchoExecutor));
        assert!(registry.has_executor("echo"));

        registry.unregister(id).expect("registered");
        assert!(!registry.has_executor("echo"));
        assert_eq!(
            registry.unregister(id),
            Err(RegistryError::UnknownRegistration(id))
        );
    }

    #[test]
    fn test_replaced_registration_id_is_stale() {
        let registry = ActionExecutorRegistry::new();
        let first = registry.register("echo", Arc::new(EchoExecutor));
        let _second = registry.register("echo", Arc::new(EchoExecutor));

        assert!(registry.unregister(first).is_err());
        assert!(registry.has_executor("echo"));
    }

    #[test]
    fn test_builtin_types_registered() {
        let registry = ActionExecutorRegistry::with_builtin_executors();
        let types = registry.registered_types();
        for expected in [
            "restart_component",
            "update_configuration",
            "reallocate_resources",
            "diagnose_shallow",
            "diagnose_medium",
            "diagnose_deep",
            "repair_data",
            "noop",
            "verify_status",
            "restore_configuration",
            "release_resources",
            "verify_data_integrity",
            "verify_system_state",
        ] {
            assert!(types.iter().any(|t| t == expected), "missing {}", expected);
        }
    }
}
