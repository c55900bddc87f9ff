//! Resolution executor.
//!
//! Drives one strategy at a time per call, any number of calls concurrently:
//! plan, run actions in order with fallbacks and checkpoints, release
//! resources, verify resolution, roll back on failure, and archive the
//! outcome.

pub mod plan;
pub mod verification;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::collaborators::{MetricsSink, NeuralCoordinator, TracingMetricsSink};
use crate::config::RecoveryConfig;
use crate::error::ExecutorError;
use crate::events::{EventBus, ExecutionEvent};
use crate::history::BoundedHistory;
use crate::model::{
    scratch_key, Action, ActionExecutionResult, CausalAnalysisResult, ExecutionContext,
    ExecutionError, ExecutionErrorKind, ExecutionMetrics, ExecutionPlan, ExecutionResult,
    ExecutionStatus, PerformanceMetrics, ReliabilityMetrics, ResourceRequirements,
    ResourceUsageSample, Strategy, SystemState,
};
use crate::monitor::{AnomalyDetector, ExecutionMonitor, MonitoringOptions, ProbeSampler, ResourceSampler, ThresholdAnomalyDetector};
use crate::reliability::CircuitBreaker;
use crate::registry::ActionExecutorRegistry;
use crate::resources::{mark_released, HeuristicResourceManager, ResourceManager, SystemProbe};
use crate::rollback::RollbackManager;

pub use verification::{evaluate_criterion, verify_resolution};

/// Per-call execution options
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub auto_rollback: bool,
    pub timeout: Duration,
    /// Log per-action progress at info level
    pub progress_reporting: bool,
    /// Overrides the configured sampling interval; zero disables sampling
    pub monitoring_interval: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            auto_rollback: true,
            timeout: Duration::from_secs(60),
            progress_reporting: true,
            monitoring_interval: None,
        }
    }
}

impl ExecuteOptions {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            dry_run: false,
            auto_rollback: config.executor.auto_rollback,
            timeout: config.executor.default_timeout(),
            progress_reporting: config.executor.progress_reporting,
            monitoring_interval: None,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_rollback(mut self) -> Self {
        self.auto_rollback = false;
        self
    }

    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = Some(interval);
        self
    }
}

/// Filter for [`ResolutionExecutor::get_execution_history`]
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub successful: Option<bool>,
    pub strategy_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecutionInfo {
    pub execution_id: Uuid,
    pub strategy_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_actions: usize,
    pub total_actions: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub enum ExecutionDetails {
    Active(ActiveExecutionInfo),
    Completed(Box<ExecutionResult>),
}

/// State shared between the action loop and the orchestrating call
struct RunProgress {
    context: ExecutionContext,
    action_results: Vec<ActionExecutionResult>,
    error: Option<ExecutionError>,
    checkpoints_passed: u32,
    checkpoints_failed: u32,
}

struct ActiveExecution {
    strategy_id: String,
    started_at: DateTime<Utc>,
    total_actions: usize,
    dry_run: bool,
    status: Arc<Mutex<ExecutionStatus>>,
    cancel: CancellationToken,
    progress: Arc<Mutex<RunProgress>>,
}

pub struct ResolutionExecutor {
    config: RecoveryConfig,
    registry: Arc<ActionExecutorRegistry>,
    checkpoints: Arc<CheckpointManager>,
    rollback: Arc<RollbackManager>,
    monitor: Arc<ExecutionMonitor>,
    resources: Arc<dyn ResourceManager>,
    coordinator: Option<Arc<dyn NeuralCoordinator>>,
    metrics: Arc<dyn MetricsSink>,
    events: EventBus,
    resource_breaker: Arc<CircuitBreaker>,
    coordinator_breaker: Arc<CircuitBreaker>,
    active: DashMap<Uuid, ActiveExecution>,
    history: BoundedHistory<ExecutionResult>,
}

/// Builder wiring the executor's collaborators
#[derive(Default)]
pub struct ResolutionExecutorBuilder {
    config: RecoveryConfig,
    registry: Option<Arc<ActionExecutorRegistry>>,
    resources: Option<Arc<dyn ResourceManager>>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    detector: Option<Arc<dyn AnomalyDetector>>,
    coordinator: Option<Arc<dyn NeuralCoordinator>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    events: Option<EventBus>,
}

impl ResolutionExecutorBuilder {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn registry(mut self, registry: Arc<ActionExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resource_manager(mut self, resources: Arc<dyn ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Use `probe` for both the heuristic resource manager and the sampler
    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.resources = Some(Arc::new(HeuristicResourceManager::new(probe.clone())));
        self.sampler = Some(Arc::new(ProbeSampler::new(probe)));
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn anomaly_detector(mut self, detector: Arc<dyn AnomalyDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn NeuralCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> ResolutionExecutor {
        let config = self.config;
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.events.channel_capacity));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ActionExecutorRegistry::with_builtin_executors()));
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(HeuristicResourceManager::default()));
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(ProbeSampler::sysinfo()));
        let detector = self.detector.unwrap_or_else(|| {
            Arc::new(ThresholdAnomalyDetector {
                cpu_threshold: config.monitor.cpu_anomaly_threshold,
                memory_threshold: config.monitor.memory_anomaly_threshold,
            })
        });
        let breaker_config = (&config.circuit_breaker).into();

        ResolutionExecutor {
            checkpoints: Arc::new(CheckpointManager::new(config.checkpoints.history_size, events.clone())),
            rollback: Arc::new(RollbackManager::new(
                registry.clone(),
                config.rollback.history_size,
                events.clone(),
            )),
            monitor: Arc::new(ExecutionMonitor::new(
                config.monitor.clone(),
                sampler,
                detector,
                events.clone(),
            )),
            resource_breaker: Arc::new(CircuitBreaker::new("resource_manager", breaker_config)),
            coordinator_breaker: Arc::new(CircuitBreaker::new(
                "neural_coordinator",
                (&config.circuit_breaker).into(),
            )),
            history: BoundedHistory::new(config.executor.history_size),
            registry,
            resources,
            coordinator: self.coordinator,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(TracingMetricsSink)),
            events,
            active: DashMap::new(),
            config,
        }
    }
}

impl ResolutionExecutor {
    pub fn new(config: RecoveryConfig) -> Self {
        ResolutionExecutorBuilder::new(config).build()
    }

    pub fn builder(config: RecoveryConfig) -> ResolutionExecutorBuilder {
        ResolutionExecutorBuilder::new(config)
    }

    pub fn registry(&self) -> &Arc<ActionExecutorRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn rollback_manager(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions::from_config(&self.config)
    }

    /// Reject strategies that cannot run at all before touching anything
    fn validate_strategy(&self, strategy: &Strategy) -> Result<(), ExecutorError> {
        if strategy.actions.is_empty() {
            return Err(ExecutorError::InvalidStrategy {
                strategy_id: strategy.id.clone(),
                reason: "strategy has no actions".to_string(),
            });
        }
        fn check(registry: &ActionExecutorRegistry, action: &Action) -> Result<(), ExecutorError> {
            if !registry.has_executor(&action.action_type) {
                return Err(ExecutorError::ExecutorNotFound {
                    action_type: action.action_type.clone(),
                    action_id: action.id.clone(),
                });
            }
            action.fallbacks.iter().try_for_each(|f| check(registry, f))
        }
        strategy
            .actions
            .iter()
            .try_for_each(|a| check(&self.registry, a))
    }

    /// Current host state, or [`SystemState::unknown`] when it cannot be read
    async fn capture_state(&self) -> SystemState {
        let resources = self.resources.clone();
        match self
            .resource_breaker
            .execute(|| async { resources.get_system_state().await })
            .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!("System state unavailable, using fallback snapshot: {}", e);
                SystemState::unknown()
            }
        }
    }

    /// Execute a strategy to completion.
    ///
    /// Returns `Err` only for strategies that cannot start; every runtime
    /// failure is reported inside the returned [`ExecutionResult`].
    pub async fn execute_strategy(
        &self,
        strategy: &Strategy,
        analysis: &CausalAnalysisResult,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.validate_strategy(strategy)?;

        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            execution_id = %execution_id,
            strategy_id = %strategy.id,
            actions = strategy.actions.len(),
            dry_run = options.dry_run,
            "Starting execution of strategy {}",
            strategy.name
        );

        match self
            .run_execution(execution_id, started_at, strategy, analysis, &options)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(execution_id = %execution_id, "Execution aborted internally: {}", e);
                if let Some((_, active)) = self.active.remove(&execution_id) {
                    active.cancel.cancel();
                }
                let mut result = ExecutionResult::fallback(
                    execution_id,
                    strategy.id.clone(),
                    started_at,
                    ExecutionError::new(ExecutionErrorKind::Internal, e.to_string()),
                );
                result.dry_run = options.dry_run;
                result.report_id = self
                    .monitor
                    .complete_monitoring(execution_id, &result)
                    .map(|r| r.id);
                self.history.push(result.clone());
                self.events.publish(ExecutionEvent::ExecutionFailed {
                    execution_id,
                    strategy_id: strategy.id.clone(),
                    error: e.to_string(),
                    rollback_performed: false,
                });
                Ok(result)
            }
        }
    }

    fn transition(
        execution_id: Uuid,
        status: &Mutex<ExecutionStatus>,
        next: ExecutionStatus,
    ) -> Result<(), ExecutorError> {
        let mut current = status.lock();
        if !current.can_transition_to(next) {
            return Err(ExecutorError::InvalidTransition {
                execution_id,
                from: *current,
                to: next,
            });
        }
        debug!(execution_id = %execution_id, from = %*current, to = %next, "Execution status change");
        *current = next;
        Ok(())
    }

    async fn run_execution(
        &self,
        execution_id: Uuid,
        started_at: DateTime<Utc>,
        strategy: &Strategy,
        analysis: &CausalAnalysisResult,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let wall_clock = Instant::now();
        let status = Arc::new(Mutex::new(ExecutionStatus::Preparing));

        let initial_state = self.capture_state().await;
        let plan = self
            .prepare_execution(execution_id, strategy, &initial_state)
            .await;

        let context = ExecutionContext::new(
            execution_id,
            strategy.clone(),
            analysis.clone(),
            initial_state,
            options.dry_run,
        );
        let progress = Arc::new(Mutex::new(RunProgress {
            context,
            action_results: Vec::new(),
            error: None,
            checkpoints_passed: 0,
            checkpoints_failed: 0,
        }));
        let cancel = CancellationToken::new();
        self.active.insert(
            execution_id,
            ActiveExecution {
                strategy_id: strategy.id.clone(),
                started_at,
                total_actions: strategy.actions.len(),
                dry_run: options.dry_run,
                status: status.clone(),
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
        );

        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            strategy_id: strategy.id.clone(),
            action_count: strategy.actions.len(),
            dry_run: options.dry_run,
        });
        let interval = options
            .monitoring_interval
            .unwrap_or_else(|| self.config.monitor.sampling_interval());
        self.monitor
            .start_monitoring(execution_id, strategy, MonitoringOptions::with_interval(interval));
        self.notify_coordinator(execution_id, strategy, &plan).await;

        Self::transition(execution_id, &status, ExecutionStatus::Executing)?;

        // The loop runs as its own task so the timeout can win the race.
        // `stop` is separate from `cancel` so a user cancel still lets the
        // in-flight action finish.
        let stop = CancellationToken::new();
        let runner = ActionRunner {
            execution_id,
            plan: plan.clone(),
            options: options.clone(),
            dry_run_range: (
                self.config.executor.dry_run_min_ms,
                self.config.executor.dry_run_max_ms,
            ),
            deadline: Instant::now() + options.timeout,
            cancel: cancel.clone(),
            stop: stop.clone(),
            registry: self.registry.clone(),
            checkpoints: self.checkpoints.clone(),
            monitor: self.monitor.clone(),
            resources: self.resources.clone(),
            resource_breaker: self.resource_breaker.clone(),
            events: self.events.clone(),
            progress: progress.clone(),
        };
        let mut handle = tokio::spawn(runner.run());

        tokio::select! {
            joined = &mut handle => {
                if let Err(join_error) = joined {
                    error!(execution_id = %execution_id, "Action loop terminated abnormally: {}", join_error);
                    let mut progress = progress.lock();
                    progress.error = Some(ExecutionError::new(
                        ExecutionErrorKind::Internal,
                        format!("action loop terminated abnormally: {}", join_error),
                    ));
                }
            }
            _ = tokio::time::sleep(options.timeout) => {
                stop.cancel();
                warn!(
                    execution_id = %execution_id,
                    timeout_ms = options.timeout.as_millis() as u64,
                    "Execution timed out"
                );
                progress.lock().error = Some(ExecutionError::timeout(options.timeout));
                let grace = self.config.executor.timeout_grace();
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    handle.abort();
                    let _ = (&mut handle).await;
                    debug!(execution_id = %execution_id, "Action loop aborted after grace period");
                }
            }
        }

        let (mut context, action_results, error, checkpoints_passed, checkpoints_failed) = {
            let progress = progress.lock();
            (
                progress.context.clone(),
                progress.action_results.clone(),
                progress.error.clone(),
                progress.checkpoints_passed,
                progress.checkpoints_failed,
            )
        };

        self.release_allocations(execution_id, &mut context).await;

        let resulting_state = self.capture_state().await;
        context.system_state_current = resulting_state.clone();

        let successful = error.is_none();
        let resolution = Some(verify_resolution(analysis, &resulting_state, options.dry_run));

        let wall = wall_clock.elapsed();
        let metrics = compute_metrics(wall, &action_results, checkpoints_passed, checkpoints_failed);
        self.monitor
            .record_overhead_duration(execution_id, metrics.performance.overhead);

        let mut rollback_performed = false;
        let mut rollback_result = None;
        if successful {
            Self::transition(execution_id, &status, ExecutionStatus::Completed)?;
        } else {
            if error.as_ref().map(|e| e.kind) == Some(ExecutionErrorKind::Cancelled) {
                Self::transition(execution_id, &status, ExecutionStatus::Cancelling)?;
            }
            if options.auto_rollback && !options.dry_run {
                Self::transition(execution_id, &status, ExecutionStatus::RollingBack)?;
                let result = self.rollback.execute_rollback(&plan.rollback_plan, &context).await;
                if !result.successful {
                    warn!(
                        execution_id = %execution_id,
                        failed = ?result.failed_actions(),
                        "Rollback did not fully succeed"
                    );
                }
                rollback_performed = true;
                rollback_result = Some(result);
            }
            Self::transition(execution_id, &status, ExecutionStatus::Failed)?;
        }

        let completed_at = Utc::now();
        let mut result = ExecutionResult {
            execution_id,
            strategy_id: strategy.id.clone(),
            successful,
            status: *status.lock(),
            started_at,
            completed_at,
            duration: wall_clock.elapsed(),
            action_results,
            completed_actions: context.completed_actions.clone(),
            reached_checkpoints: context.reached_checkpoints.clone(),
            resource_allocations: context.resource_allocations.clone(),
            rollback_performed,
            rollback_result,
            error,
            resulting_state: Some(resulting_state),
            resolution,
            metrics,
            report_id: None,
            dry_run: options.dry_run,
        };

        self.finalize(&mut result);
        Ok(result)
    }

    async fn notify_coordinator(&self, execution_id: Uuid, strategy: &Strategy, plan: &ExecutionPlan) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        if let Err(e) = self
            .coordinator_breaker
            .execute(|| async { coordinator.coordinate_execution(strategy, plan).await })
            .await
        {
            warn!(execution_id = %execution_id, "Coordinator notification failed: {}", e);
        }
    }

    /// Release every allocation; failures are logged and never block.
    /// Releases bypass the resource breaker so an open circuit cannot strand
    /// capacity.
    async fn release_allocations(&self, execution_id: Uuid, context: &mut ExecutionContext) {
        for allocation in context.resource_allocations.iter_mut() {
            if allocation.is_released() {
                continue;
            }
            match self.resources.release_resources(allocation).await {
                Ok(()) => mark_released(allocation),
                Err(e) => warn!(
                    execution_id = %execution_id,
                    allocation_id = %allocation.id,
                    "Failed to release allocation: {}",
                    e
                ),
            }
        }
    }

    fn finalize(&self, result: &mut ExecutionResult) {
        let execution_id = result.execution_id;
        result.report_id = self
            .monitor
            .complete_monitoring(execution_id, result)
            .map(|r| r.id);
        self.history.push(result.clone());
        self.active.remove(&execution_id);

        let duration_ms = result.duration.as_millis() as u64;
        if result.successful {
            let resolved = result.resolution.as_ref().map(|r| r.resolved).unwrap_or(false);
            info!(
                execution_id = %execution_id,
                strategy_id = %result.strategy_id,
                duration_ms,
                resolved,
                "Execution completed"
            );
            self.events.publish(ExecutionEvent::ExecutionCompleted {
                execution_id,
                strategy_id: result.strategy_id.clone(),
                duration_ms,
                resolved,
            });
        } else {
            let message = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            error!(
                execution_id = %execution_id,
                strategy_id = %result.strategy_id,
                duration_ms,
                rollback = result.rollback_performed,
                "Execution failed: {}",
                message
            );
            self.events.publish(ExecutionEvent::ExecutionFailed {
                execution_id,
                strategy_id: result.strategy_id.clone(),
                error: message,
                rollback_performed: result.rollback_performed,
            });
        }

        let reliability = &result.metrics.reliability;
        self.metrics.record_metric("recovery.execution.duration_ms", json!(duration_ms));
        self.metrics.record_metric("recovery.execution.successful", json!(result.successful));
        self.metrics
            .record_metric("recovery.execution.action_success_rate", json!(reliability.action_success_rate));
        self.metrics
            .record_metric("recovery.execution.fallbacks_used", json!(reliability.fallbacks_used));
        self.metrics
            .record_metric("recovery.execution.rollback_performed", json!(result.rollback_performed));
    }

    pub fn get_active_executions(&self) -> Vec<ActiveExecutionInfo> {
        self.active
            .iter()
            .map(|e| active_info(*e.key(), e.value()))
            .collect()
    }

    /// Archived results, newest first
    pub fn get_execution_history(&self, filter: &HistoryFilter) -> Vec<ExecutionResult> {
        self.history
            .newest_first()
            .into_iter()
            .filter(|r| filter.successful.map_or(true, |s| r.successful == s))
            .filter(|r| {
                filter
                    .strategy_id
                    .as_deref()
                    .map_or(true, |id| r.strategy_id == id)
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn get_execution_details(&self, execution_id: Uuid) -> Option<ExecutionDetails> {
        if let Some(info) = self.active.get(&execution_id).map(|e| active_info(execution_id, e.value())) {
            return Some(ExecutionDetails::Active(info));
        }
        self.history
            .find(|r| r.execution_id == execution_id)
            .map(|r| ExecutionDetails::Completed(Box::new(r)))
    }

    /// Request cooperative cancellation; takes effect between actions
    pub fn cancel_execution(&self, execution_id: Uuid) -> bool {
        match self.active.get(&execution_id) {
            Some(entry) => {
                info!(execution_id = %execution_id, "Cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn active_info(execution_id: Uuid, active: &ActiveExecution) -> ActiveExecutionInfo {
    ActiveExecutionInfo {
        execution_id,
        strategy_id: active.strategy_id.clone(),
        status: *active.status.lock(),
        started_at: active.started_at,
        completed_actions: active.progress.lock().context.completed_actions.len(),
        total_actions: active.total_actions,
        dry_run: active.dry_run,
    }
}

fn compute_metrics(
    wall: Duration,
    action_results: &[ActionExecutionResult],
    checkpoints_passed: u32,
    checkpoints_failed: u32,
) -> ExecutionMetrics {
    let usage = |r: &ActionExecutionResult| {
        r.resource_usage
            .map(|u| ResourceRequirements::new(u.cpu_cores, u.memory_mb, u.disk_mb, u.network_mbps))
            .unwrap_or_default()
    };
    let resources: ResourceRequirements = action_results
        .iter()
        .map(|r| usage(r) + r.fallback_attempts.iter().map(usage).sum::<ResourceRequirements>())
        .sum();

    let action_duration_total: Duration = action_results.iter().map(|r| r.duration).sum();
    let max_action_duration = action_results
        .iter()
        .map(|r| r.duration)
        .max()
        .unwrap_or_default();
    let average_action_duration = if action_results.is_empty() {
        Duration::ZERO
    } else {
        action_duration_total / action_results.len() as u32
    };

    let actions_succeeded = action_results.iter().filter(|r| r.successful).count() as u32;
    let actions_failed = action_results.len() as u32 - actions_succeeded;
    let checkpoint_total = checkpoints_passed + checkpoints_failed;

    ExecutionMetrics {
        resources,
        performance: PerformanceMetrics {
            total_duration: wall,
            action_duration_total,
            average_action_duration,
            max_action_duration,
            overhead: wall.saturating_sub(action_duration_total),
        },
        reliability: ReliabilityMetrics {
            actions_succeeded,
            actions_failed,
            action_success_rate: if action_results.is_empty() {
                0.0
            } else {
                f64::from(actions_succeeded) / action_results.len() as f64
            },
            checkpoints_passed,
            checkpoints_failed,
            checkpoint_success_rate: if checkpoint_total == 0 {
                1.0
            } else {
                f64::from(checkpoints_passed) / f64::from(checkpoint_total)
            },
            fallbacks_used: action_results
                .iter()
                .filter(|r| r.fallback_used.is_some())
                .count() as u32,
        },
    }
}

/// Owns everything the spawned action loop needs
struct ActionRunner {
    execution_id: Uuid,
    plan: ExecutionPlan,
    options: ExecuteOptions,
    dry_run_range: (u64, u64),
    deadline: Instant,
    cancel: CancellationToken,
    stop: CancellationToken,
    registry: Arc<ActionExecutorRegistry>,
    checkpoints: Arc<CheckpointManager>,
    monitor: Arc<ExecutionMonitor>,
    resources: Arc<dyn ResourceManager>,
    resource_breaker: Arc<CircuitBreaker>,
    events: EventBus,
    progress: Arc<Mutex<RunProgress>>,
}

impl ActionRunner {
    fn fail(&self, error: ExecutionError) {
        let mut progress = self.progress.lock();
        if progress.error.is_none() {
            progress.error = Some(error);
        }
    }

    async fn run(self) {
        let total = self.plan.actions.len();
        for (index, planned) in self.plan.actions.iter().enumerate() {
            let action = &planned.action;

            if self.cancel.is_cancelled() {
                info!(execution_id = %self.execution_id, action_id = %action.id, "Execution cancelled before action");
                self.fail(ExecutionError::new(ExecutionErrorKind::Cancelled, "execution cancelled").for_action(&action.id));
                return;
            }
            if self.stop.is_cancelled() || Instant::now() >= self.deadline {
                self.fail(ExecutionError::timeout(self.options.timeout).for_action(&action.id));
                return;
            }

            if self.options.progress_reporting {
                info!(
                    execution_id = %self.execution_id,
                    action_id = %action.id,
                    action_type = %action.action_type,
                    "Executing action {}/{}",
                    index + 1,
                    total
                );
            } else {
                debug!(execution_id = %self.execution_id, action_id = %action.id, "Executing action");
            }
            self.events.publish(ExecutionEvent::ActionStarted {
                execution_id: self.execution_id,
                action_id: action.id.clone(),
                action_type: action.action_type.clone(),
            });

            let result = self.run_with_fallbacks(action).await;
            self.monitor.record_action_execution(self.execution_id, &result);

            // Timed out while the action ran: record it and publish nothing further
            if self.stop.is_cancelled() {
                let mut progress = self.progress.lock();
                if result.successful {
                    progress.context.completed_actions.push(action.id.clone());
                }
                progress.action_results.push(result);
                return;
            }

            if result.successful {
                {
                    let mut progress = self.progress.lock();
                    progress.context.completed_actions.push(action.id.clone());
                    if let Some(output) = &result.output {
                        progress.context.scratch.insert(scratch_key(&action.id), output.clone());
                    }
                    progress.action_results.push(result.clone());
                }
                self.events.publish(ExecutionEvent::ActionCompleted {
                    execution_id: self.execution_id,
                    action_id: action.id.clone(),
                    duration_ms: result.duration.as_millis() as u64,
                    fallback_used: result.fallback_used.clone(),
                });

                if let Err(gate) = self.process_checkpoints(&action.id).await {
                    self.fail(gate);
                    return;
                }
            } else {
                let message = result.error.clone().unwrap_or_else(|| "action failed".to_string());
                let result_kind = result.error_kind;
                self.progress.lock().action_results.push(result);
                self.events.publish(ExecutionEvent::ActionFailed {
                    execution_id: self.execution_id,
                    action_id: action.id.clone(),
                    error: message.clone(),
                });

                if action.required {
                    error!(execution_id = %self.execution_id, action_id = %action.id, "Required action failed: {}", message);
                    self.progress.lock().context.failed_action = Some(action.id.clone());
                    let kind = result_kind.unwrap_or(ExecutionErrorKind::ActionFailed);
                    self.fail(ExecutionError::new(kind, message).for_action(&action.id));
                    return;
                }
                warn!(execution_id = %self.execution_id, action_id = %action.id, "Optional action failed, continuing: {}", message);
            }
        }
    }

    /// Run the action, then its fallbacks in order until one succeeds
    async fn run_with_fallbacks(&self, action: &Action) -> ActionExecutionResult {
        let mut result = self.run_single(action).await;
        if result.successful {
            return result;
        }
        for fallback in &action.fallbacks {
            if self.stop.is_cancelled() || self.cancel.is_cancelled() {
                break;
            }
            info!(
                execution_id = %self.execution_id,
                action_id = %action.id,
                fallback_id = %fallback.id,
                "Trying fallback action"
            );
            let attempt = self.run_single(fallback).await;
            let recovered = attempt.successful;
            result.duration += attempt.duration;
            result.ended_at = attempt.ended_at;
            if recovered {
                result.successful = true;
                result.fallback_used = Some(fallback.id.clone());
                result.error_kind = None;
                result.output = attempt.output.clone();
                result.simulated = attempt.simulated;
            }
            result.fallback_attempts.push(attempt);
            if recovered {
                break;
            }
        }
        result
    }

    async fn run_single(&self, action: &Action) -> ActionExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let estimate = self.registry.estimate_resource_requirements(action);

        if self.options.dry_run {
            let (min, max) = self.dry_run_range;
            let simulated_ms = rand::thread_rng().gen_range(min..=max.max(min));
            let mut result = ActionExecutionResult::success(
                action,
                started_at,
                Duration::from_millis(simulated_ms),
                json!({ "simulated": true, "action_type": action.action_type }),
            );
            result.simulated = true;
            result.resource_usage = Some(ResourceUsageSample::from(estimate));
            return result;
        }

        let executor = match self.registry.get_executor_for_action(&action.action_type) {
            Ok(executor) => executor,
            Err(e) => return ActionExecutionResult::failure(action, started_at, clock.elapsed(), e.to_string()),
        };
        let view = self.progress.lock().context.view();

        let validation = self.registry.validate_action(action, &view).await;
        if !validation.valid {
            let mut result = ActionExecutionResult::failure(
                action,
                started_at,
                clock.elapsed(),
                format!("validation failed: {}", validation.errors.join("; ")),
            );
            result.error_kind = Some(ExecutionErrorKind::ValidationFailed);
            return result;
        }

        if self.stop.is_cancelled() {
            return self.stopped(action, started_at, clock.elapsed());
        }
        if !estimate.is_zero() {
            self.allocate(action, &estimate).await;
        }

        let outcome = match executor.prepare(action, &view).await {
            Ok(()) if self.stop.is_cancelled() => Err(anyhow::anyhow!("execution stopped before execute")),
            Ok(()) => executor.execute(action, &view).await,
            Err(e) => Err(e.context("prepare failed")),
        };
        if let Err(e) = executor.cleanup(action, &view).await {
            warn!(execution_id = %self.execution_id, action_id = %action.id, "Action cleanup failed: {}", e);
        }

        let mut result = match outcome {
            Ok(output) => ActionExecutionResult::success(action, started_at, clock.elapsed(), output),
            Err(e) => ActionExecutionResult::failure(action, started_at, clock.elapsed(), format!("{:#}", e)),
        };
        result.resource_usage = Some(ResourceUsageSample::from(estimate));
        result
    }

    fn stopped(&self, action: &Action, started_at: DateTime<Utc>, elapsed: Duration) -> ActionExecutionResult {
        debug!(execution_id = %self.execution_id, action_id = %action.id, "Action skipped after timeout");
        let mut result = ActionExecutionResult::failure(action, started_at, elapsed, "execution stopped before execute");
        result.error_kind = Some(ExecutionErrorKind::Timeout);
        result
    }

    async fn allocate(&self, action: &Action, estimate: &ResourceRequirements) {
        let resources = self.resources.clone();
        let execution_id = self.execution_id;
        let action_id = action.id.clone();
        match self
            .resource_breaker
            .execute(|| async {
                resources
                    .allocate_resources(execution_id, Some(&action_id), estimate)
                    .await
            })
            .await
        {
            Ok(allocation) => self.progress.lock().context.resource_allocations.push(allocation),
            Err(e) => warn!(execution_id = %execution_id, action_id = %action.id, "Allocation skipped: {}", e),
        }
    }

    /// Verify checkpoints that follow `action_id`. A failure is returned only
    /// for gating checkpoints.
    async fn process_checkpoints(&self, action_id: &str) -> Result<(), ExecutionError> {
        let checkpoints: Vec<_> = self
            .plan
            .checkpoints
            .iter()
            .filter(|c| c.after_action == action_id)
            .cloned()
            .collect();

        for checkpoint in checkpoints {
            let checkpoint_id = self.checkpoints.ensure_registered(&checkpoint);
            let view = self.progress.lock().context.view();
            let verified = match self.checkpoints.verify_checkpoint(checkpoint_id, &view).await {
                Ok(verification) => verification.verified,
                Err(e) => {
                    warn!(
                        execution_id = %self.execution_id,
                        checkpoint = %checkpoint.name,
                        "Checkpoint could not be verified: {}",
                        e
                    );
                    self.events.publish(ExecutionEvent::CheckpointError {
                        execution_id: self.execution_id,
                        checkpoint: checkpoint.name.clone(),
                        error: e.to_string(),
                    });
                    false
                }
            };
            self.monitor
                .record_checkpoint_verification(self.execution_id, &checkpoint.name, verified);

            {
                let mut progress = self.progress.lock();
                if verified {
                    progress.checkpoints_passed += 1;
                    progress.context.mark_checkpoint_reached(&checkpoint);
                } else {
                    progress.checkpoints_failed += 1;
                }
            }

            if !verified {
                if checkpoint.gates_progress {
                    return Err(ExecutionError::new(
                        ExecutionErrorKind::CheckpointGate,
                        format!("gating checkpoint '{}' failed verification", checkpoint.name),
                    )
                    .for_action(action_id));
                }
                warn!(
                    execution_id = %self.execution_id,
                    checkpoint = %checkpoint.name,
                    "Checkpoint failed, continuing"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::StaticProbe;

    fn executor() -> ResolutionExecutor {
        let mut config = RecoveryConfig::default();
        config.monitor.sampling_interval_ms = 0;
        ResolutionExecutor::builder(config)
            .probe(Arc::new(StaticProbe::healthy()))
            .build()
    }

    #[tokio::test]
    async fn test_empty_strategy_rejected() {
        let err = executor()
            .execute_strategy(
                &Strategy::new("s", "empty"),
                &CausalAnalysisResult::new("a"),
                ExecuteOptions::default(),
            )
            .await
            .err();
        assert!(matches!(err, Some(ExecutorError::InvalidStrategy { .. })));
    }

    #[tokio::test]
    async fn test_unknown_fallback_type_rejected() {
        let strategy = Strategy::new("s", "s")
            .with_action(Action::new("a", "noop").with_fallback(Action::new("f", "teleport")));
        let err = executor()
            .execute_strategy(&strategy, &CausalAnalysisResult::new("a"), ExecuteOptions::default())
            .await
            .err();
        match err {
            Some(ExecutorError::ExecutorNotFound { action_type, action_id }) => {
                assert_eq!(action_type, "teleport");
                assert_eq!(action_id, "f");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simple_success() {
        let executor = executor();
        let strategy = Strategy::new("s", "s")
            .with_action(Action::new("a", "noop"))
            .with_action(Action::new("b", "restart_component").on_component("api"));
        let result = executor
            .execute_strategy(&strategy, &CausalAnalysisResult::new("x"), ExecuteOptions::default())
            .await
            .expect("strategy accepted");

        assert!(result.successful);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.completed_actions, vec!["a".to_string(), "b".to_string()]);
        assert!(result.resource_allocations.iter().all(|a| a.is_released()));
        assert!(result.report_id.is_some());
        assert!(executor.get_active_executions().is_empty());
    }

    #[test]
    fn test_metrics_overhead_saturates() {
        let action = Action::new("a", "noop");
        let results = vec![ActionExecutionResult::success(
            &action,
            Utc::now(),
            Duration::from_secs(5),
            json!({}),
        )];
        let metrics = compute_metrics(Duration::from_secs(1), &results, 0, 0);
        assert_eq!(metrics.performance.overhead, Duration::ZERO);
        assert_eq!(metrics.reliability.action_success_rate, 1.0);
        assert_eq!(metrics.reliability.checkpoint_success_rate, 1.0);
    }
}
