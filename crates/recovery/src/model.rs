//! Data model shared by every recovery component.
//!
//! Strategies and analysis results are caller-owned inputs. Plans, contexts
//! and results are produced by the [`ResolutionExecutor`](crate::ResolutionExecutor)
//! for a single run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::time::Duration;
use uuid::Uuid;

use crate::rollback::{RollbackPlan, RollbackResult};

/// Free-form action parameters
pub type Parameters = HashMap<String, serde_json::Value>;

/// Ordered remediation plan handed to the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Strategy {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            actions: Vec::new(),
            checkpoints: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append an action; its order defaults to its position when left at zero
    pub fn with_action(mut self, mut action: Action) -> Self {
        if action.order == 0 {
            action.order = self.actions.len() as u32 + 1;
        }
        self.actions.push(action);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoints.push(checkpoint);
        self
    }

    /// Actions sorted by their declared order (stable for equal orders)
    pub fn ordered_actions(&self) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.order);
        actions
    }

    pub fn action(&self, action_id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == action_id)
    }
}

/// How a strategy wants an action to be compensated on rollback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RollbackDirective {
    /// Use the static action-type mapping
    #[default]
    Derive,
    /// Use a caller-supplied compensating action
    Explicit { action: Box<Action> },
    /// No safe rollback exists for this action
    Irreversible,
}

/// One unit of remediation work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub order: u32,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub fallbacks: Vec<Action>,
    /// Component this action touches, used for dependency edges
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub rollback: RollbackDirective,
}

fn default_required() -> bool {
    true
}

impl Action {
    pub fn new(id: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            parameters: HashMap::new(),
            order: 0,
            required: true,
            fallbacks: Vec::new(),
            component: None,
            depends_on: Vec::new(),
            rollback: RollbackDirective::Derive,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_fallback(mut self, fallback: Action) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    pub fn on_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn depends_on(mut self, action_id: impl Into<String>) -> Self {
        self.depends_on.push(action_id.into());
        self
    }

    pub fn with_rollback(mut self, directive: RollbackDirective) -> Self {
        self.rollback = directive;
        self
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Named verification point fired after a specific action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub after_action: String,
    /// A failed verification aborts the run instead of being logged
    #[serde(default)]
    pub gates_progress: bool,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, after_action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            after_action: after_action.into(),
            gates_progress: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn gating(mut self) -> Self {
        self.gates_progress = true;
        self
    }
}

/// Comparison used by verification criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Equals,
    NotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Exists,
}

/// A check on the resulting system state that proves the fault is gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCriterion {
    /// Dotted path into the serialized [`SystemState`], e.g. `metrics.error_rate`
    pub path: String,
    pub comparison: Comparison,
    #[serde(default)]
    pub expected: serde_json::Value,
}

impl VerificationCriterion {
    pub fn new(path: impl Into<String>, comparison: Comparison, expected: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            comparison,
            expected,
        }
    }
}

/// Output of the causal-analysis collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CausalAnalysisResult {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub root_causes: Vec<serde_json::Value>,
    #[serde(default)]
    pub verification_criteria: Vec<VerificationCriterion>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CausalAnalysisResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_criterion(mut self, criterion: VerificationCriterion) -> Self {
        self.verification_criteria.push(criterion);
        self
    }
}

/// Logical resource amounts used for planning and accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: f64,
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_mb: u64, disk_mb: u64, network_mbps: f64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb,
            network_mbps,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0.0 && self.memory_mb == 0 && self.disk_mb == 0 && self.network_mbps == 0.0
    }

    /// Names of the dimensions where `self` exceeds `available`
    pub fn shortfalls(&self, available: &ResourceRequirements) -> Vec<String> {
        let mut shortfalls = Vec::new();
        if self.cpu_cores > available.cpu_cores {
            shortfalls.push(format!(
                "cpu: need {:.2} cores, {:.2} available",
                self.cpu_cores, available.cpu_cores
            ));
        }
        if self.memory_mb > available.memory_mb {
            shortfalls.push(format!(
                "memory: need {} MB, {} MB available",
                self.memory_mb, available.memory_mb
            ));
        }
        if self.disk_mb > available.disk_mb {
            shortfalls.push(format!(
                "disk: need {} MB, {} MB available",
                self.disk_mb, available.disk_mb
            ));
        }
        if self.network_mbps > available.network_mbps {
            shortfalls.push(format!(
                "network: need {:.1} Mbps, {:.1} Mbps available",
                self.network_mbps, available.network_mbps
            ));
        }
        shortfalls
    }

    pub fn fits_within(&self, available: &ResourceRequirements) -> bool {
        self.shortfalls(available).is_empty()
    }
}

impl Add for ResourceRequirements {
    type Output = ResourceRequirements;

    fn add(self, rhs: Self) -> Self::Output {
        ResourceRequirements {
            cpu_cores: self.cpu_cores + rhs.cpu_cores,
            memory_mb: self.memory_mb.saturating_add(rhs.memory_mb),
            disk_mb: self.disk_mb.saturating_add(rhs.disk_mb),
            network_mbps: self.network_mbps + rhs.network_mbps,
        }
    }
}

impl AddAssign for ResourceRequirements {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ResourceRequirements {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ResourceRequirements::zero(), |acc, r| acc + r)
    }
}

/// Snapshot of the host state at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub captured_at: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub load_average: f64,
    pub available: ResourceRequirements,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
    /// False when the snapshot is a fallback rather than a real reading
    pub observed: bool,
}

impl SystemState {
    /// Fallback snapshot used when no reading could be taken
    pub fn unknown() -> Self {
        Self {
            captured_at: Utc::now(),
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            disk_usage_percent: 0.0,
            load_average: 0.0,
            available: ResourceRequirements::zero(),
            metrics: HashMap::new(),
            observed: false,
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Resolve a dotted path against the serialized snapshot
    pub fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        let root = serde_json::to_value(self).ok()?;
        let mut current = &root;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Advisory allocation record held for the duration of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: Uuid,
    pub action_id: Option<String>,
    pub resources: ResourceRequirements,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    pub fn new(action_id: Option<String>, resources: ResourceRequirements) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            resources,
            allocated_at: Utc::now(),
            released_at: None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Live state of one execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub strategy: Strategy,
    pub analysis: CausalAnalysisResult,
    pub system_state_before: SystemState,
    pub system_state_current: SystemState,
    pub scratch: HashMap<String, serde_json::Value>,
    pub completed_actions: Vec<String>,
    pub reached_checkpoints: Vec<String>,
    /// Action whose failure stopped the run, if any
    pub failed_action: Option<String>,
    pub resource_allocations: Vec<ResourceAllocation>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub dry_run: bool,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        strategy: Strategy,
        analysis: CausalAnalysisResult,
        system_state: SystemState,
        dry_run: bool,
    ) -> Self {
        Self {
            execution_id,
            strategy,
            analysis,
            system_state_current: system_state.clone(),
            system_state_before: system_state,
            scratch: HashMap::new(),
            completed_actions: Vec::new(),
            reached_checkpoints: Vec::new(),
            failed_action: None,
            resource_allocations: Vec::new(),
            metadata: HashMap::new(),
            dry_run,
        }
    }

    pub fn is_completed(&self, action_id: &str) -> bool {
        self.completed_actions.iter().any(|a| a == action_id)
    }

    /// Mark a checkpoint reached; ignored unless its action has completed
    pub fn mark_checkpoint_reached(&mut self, checkpoint: &Checkpoint) -> bool {
        if !self.is_completed(&checkpoint.after_action) {
            return false;
        }
        if !self.reached_checkpoints.contains(&checkpoint.name) {
            self.reached_checkpoints.push(checkpoint.name.clone());
        }
        true
    }

    /// Read-only view handed to executors and verifiers
    pub fn view(&self) -> ActionContext {
        ActionContext {
            execution_id: self.execution_id,
            strategy_id: self.strategy.id.clone(),
            analysis_id: self.analysis.id.clone(),
            dry_run: self.dry_run,
            system_state: self.system_state_current.clone(),
            scratch: self.scratch.clone(),
            completed_actions: self.completed_actions.clone(),
        }
    }
}

/// Read-only snapshot of an [`ExecutionContext`]
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub analysis_id: String,
    pub dry_run: bool,
    pub system_state: SystemState,
    pub scratch: HashMap<String, serde_json::Value>,
    pub completed_actions: Vec<String>,
}

impl ActionContext {
    /// Context not bound to a running execution (tests, ad hoc verification)
    pub fn detached() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            strategy_id: String::new(),
            analysis_id: String::new(),
            dry_run: false,
            system_state: SystemState::unknown(),
            scratch: HashMap::new(),
            completed_actions: Vec::new(),
        }
    }

    /// Output recorded by a previously completed action
    pub fn action_output(&self, action_id: &str) -> Option<&serde_json::Value> {
        self.scratch.get(&scratch_key(action_id))
    }
}

/// Scratch-space key under which an action's output is stored
pub fn scratch_key(action_id: &str) -> String {
    format!("action:{}", action_id)
}

/// Action annotated with planning estimates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: Action,
    pub estimated_duration: Duration,
    pub resources: ResourceRequirements,
}

/// Aggregate resource plan for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocationPlan {
    pub total: ResourceRequirements,
    pub available: ResourceRequirements,
    pub per_action: Vec<(String, ResourceRequirements)>,
    pub feasible: bool,
    pub shortfalls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Both actions touch the same component
    Component,
    /// Declared through `Action::depends_on`
    Explicit,
}

/// Edge `from → to`: `to` must run after `from`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDependency {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
}

/// Read-only view of the run derived from a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub actions: Vec<PlannedAction>,
    pub checkpoints: Vec<Checkpoint>,
    pub rollback_plan: RollbackPlan,
    pub resource_plan: ResourceAllocationPlan,
    pub dependencies: Vec<ActionDependency>,
    pub estimated_duration: Duration,
    pub created_at: DateTime<Utc>,
}

/// Sample of resources consumed by a single action
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageSample {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: f64,
}

impl From<ResourceRequirements> for ResourceUsageSample {
    fn from(r: ResourceRequirements) -> Self {
        Self {
            cpu_cores: r.cpu_cores,
            memory_mb: r.memory_mb,
            disk_mb: r.disk_mb,
            network_mbps: r.network_mbps,
        }
    }
}

/// Per-action outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub action_id: String,
    pub action_type: String,
    pub successful: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Failure classification when it is more specific than a plain action failure
    #[serde(default)]
    pub error_kind: Option<ExecutionErrorKind>,
    pub resource_usage: Option<ResourceUsageSample>,
    /// Id of the fallback that produced the outcome
    pub fallback_used: Option<String>,
    pub fallback_attempts: Vec<ActionExecutionResult>,
    pub simulated: bool,
}

impl ActionExecutionResult {
    pub(crate) fn success(
        action: &Action,
        started_at: DateTime<Utc>,
        duration: Duration,
        output: serde_json::Value,
    ) -> Self {
        Self {
            action_id: action.id.clone(),
            action_type: action.action_type.clone(),
            successful: true,
            started_at,
            ended_at: Utc::now(),
            duration,
            output: Some(output),
            error: None,
            error_kind: None,
            resource_usage: None,
            fallback_used: None,
            fallback_attempts: Vec::new(),
            simulated: false,
        }
    }

    pub(crate) fn failure(
        action: &Action,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action.id.clone(),
            action_type: action.action_type.clone(),
            successful: false,
            started_at,
            ended_at: Utc::now(),
            duration,
            output: None,
            error: Some(error.into()),
            error_kind: None,
            resource_usage: None,
            fallback_used: None,
            fallback_attempts: Vec::new(),
            simulated: false,
        }
    }
}

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Preparing,
    Executing,
    RollingBack,
    Cancelling,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Preparing, Executing)
                | (Preparing, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, RollingBack)
                | (Executing, Cancelling)
                | (RollingBack, Failed)
                | (Cancelling, Failed)
                | (Cancelling, RollingBack)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Preparing => "preparing",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::RollingBack => "rolling_back",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Types of execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    ActionFailed,
    ValidationFailed,
    Timeout,
    Cancelled,
    CheckpointGate,
    Internal,
}

/// Execution error attached to a result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub action_id: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action_id: None,
        }
    }

    pub fn for_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            format!("execution timed out after {} ms", timeout.as_millis()),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ExecutionErrorKind::Timeout
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action_id {
            Some(action_id) => write!(f, "{:?} [{}]: {}", self.kind, action_id, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Outcome of a single verification criterion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub criterion: VerificationCriterion,
    pub observed: Option<serde_json::Value>,
    pub satisfied: bool,
}

/// Whether the original fault is considered resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionVerdict {
    pub resolved: bool,
    pub confidence: f64,
    /// True when no criteria were available and resolution was assumed
    pub assumed: bool,
    pub criteria: Vec<CriterionOutcome>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_duration: Duration,
    pub action_duration_total: Duration,
    pub average_action_duration: Duration,
    pub max_action_duration: Duration,
    pub overhead: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityMetrics {
    pub actions_succeeded: u32,
    pub actions_failed: u32,
    pub action_success_rate: f64,
    pub checkpoints_passed: u32,
    pub checkpoints_failed: u32,
    pub checkpoint_success_rate: f64,
    pub fallbacks_used: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub resources: ResourceRequirements,
    pub performance: PerformanceMetrics,
    pub reliability: ReliabilityMetrics,
}

/// Structured result of `execute_strategy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub successful: bool,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub action_results: Vec<ActionExecutionResult>,
    pub completed_actions: Vec<String>,
    pub reached_checkpoints: Vec<String>,
    pub resource_allocations: Vec<ResourceAllocation>,
    pub rollback_performed: bool,
    pub rollback_result: Option<RollbackResult>,
    pub error: Option<ExecutionError>,
    pub resulting_state: Option<SystemState>,
    pub resolution: Option<ResolutionVerdict>,
    pub metrics: ExecutionMetrics,
    pub report_id: Option<String>,
    pub dry_run: bool,
}

impl ExecutionResult {
    /// Failed result with no progress, used when the normal path broke down
    pub fn fallback(
        execution_id: Uuid,
        strategy_id: impl Into<String>,
        started_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            execution_id,
            strategy_id: strategy_id.into(),
            successful: false,
            status: ExecutionStatus::Failed,
            started_at,
            completed_at,
            duration: (completed_at - started_at).to_std().unwrap_or_default(),
            action_results: Vec::new(),
            completed_actions: Vec::new(),
            reached_checkpoints: Vec::new(),
            resource_allocations: Vec::new(),
            rollback_performed: false,
            rollback_result: None,
            error: Some(error),
            resulting_state: None,
            resolution: None,
            metrics: ExecutionMetrics::default(),
            report_id: None,
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_assigns_positional_order() {
        let strategy = Strategy::new("s1", "restart")
            .with_action(Action::new("a", "noop"))
            .with_action(Action::new("b", "noop").with_order(10))
            .with_action(Action::new("c", "noop"));

        let orders: Vec<u32> = strategy.actions.iter().map(|a| a.order).collect();
        assert_eq!(orders, vec![1, 10, 3]);
        let ordered: Vec<&str> = strategy.ordered_actions().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ordered, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_resource_shortfalls() {
        let need = ResourceRequirements::new(4.0, 2048, 10, 0.0);
        let have = ResourceRequirements::new(2.0, 4096, 100, 100.0);
        let shortfalls = need.shortfalls(&have);
        assert_eq!(shortfalls.len(), 1);
        assert!(shortfalls[0].starts_with("cpu"));
        assert!(!need.fits_within(&have));
    }

    #[test]
    fn test_system_state_lookup() {
        let state = SystemState::unknown().with_metric("error_rate", serde_json::json!(0.02));
        assert_eq!(state.lookup("metrics.error_rate"), Some(serde_json::json!(0.02)));
        assert_eq!(state.lookup("available.memory_mb"), Some(serde_json::json!(0)));
        assert!(state.lookup("metrics.missing").is_none());
    }

    #[test]
    fn test_checkpoint_requires_completed_action() {
        let strategy = Strategy::new("s", "s").with_action(Action::new("a", "noop"));
        let mut ctx = ExecutionContext::new(
            Uuid::new_v4(),
            strategy,
            CausalAnalysisResult::new("x"),
            SystemState::unknown(),
            false,
        );
        let checkpoint = Checkpoint::new("after-a", "a");

        assert!(!ctx.mark_checkpoint_reached(&checkpoint));
        ctx.completed_actions.push("a".to_string());
        assert!(ctx.mark_checkpoint_reached(&checkpoint));
        assert!(ctx.mark_checkpoint_reached(&checkpoint));
        assert_eq!(ctx.reached_checkpoints, vec!["after-a".to_string()]);
    }

    #[test]
    fn test_status_transitions() {
        assert!(ExecutionStatus::Preparing.can_transition_to(ExecutionStatus::Executing));
        assert!(ExecutionStatus::Executing.can_transition_to(ExecutionStatus::RollingBack));
        assert!(ExecutionStatus::RollingBack.can_transition_to(ExecutionStatus::Failed));
        assert!(!ExecutionStatus::RollingBack.can_transition_to(ExecutionStatus::Completed));
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Failed));
    }
}
