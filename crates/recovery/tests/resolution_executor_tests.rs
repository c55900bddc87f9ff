//! Resolution Executor Integration Tests
//!
//! End-to-end runs through the public executor API:
//! - action ordering, fallbacks and optional failures
//! - rollback after required failures, timeouts and cancellation
//! - checkpoints, dry runs, resolution verification
//! - history, concurrency and lifecycle events

use anyhow::Result;
use async_trait::async_trait;
use recovery::{
    Action, ActionContext, ActionExecutor, ActionExecutorRegistry, CausalAnalysisResult,
    CheckpointDefinition, Comparison, ExecuteOptions, ExecutionDetails, ExecutionErrorKind,
    ExecutionStatus, EventTopics, FnVerifier, HistoryFilter, RecordingObserver, RecoveryConfig,
    HeuristicResourceManager, ProbeSampler, ResolutionExecutor, ResourceRequirements,
    RollbackDirective, StaticProbe, Strategy, ValidationOutcome, VerificationCriterion,
    VerifierOutcome,
};
use rstest::rstest;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Always fails with the given message
struct FailingExecutor {
    message: &'static str,
    calls: AtomicU32,
}

impl FailingExecutor {
    fn new(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            message,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ActionExecutor for FailingExecutor {
    async fn execute(&self, _action: &Action, _context: &ActionContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!(self.message)
    }
}

/// Sleeps before succeeding
struct SlowExecutor {
    delay: Duration,
}

#[async_trait]
impl ActionExecutor for SlowExecutor {
    async fn execute(&self, action: &Action, _context: &ActionContext) -> Result<Value> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "slept_ms": self.delay.as_millis() as u64, "action": action.id }))
    }
}

/// Validation outlasts the execution timeout; the action needs resources
struct SlowValidationExecutor {
    executions: AtomicU32,
}

#[async_trait]
impl ActionExecutor for SlowValidationExecutor {
    async fn execute(&self, _action: &Action, _context: &ActionContext) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(json!({}))
    }

    async fn validate(&self, _action: &Action, _context: &ActionContext) -> Option<ValidationOutcome> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Some(ValidationOutcome::ok())
    }

    fn estimate_resource_requirements(&self, _action: &Action) -> Option<ResourceRequirements> {
        Some(ResourceRequirements::new(0.5, 128, 0, 0.0))
    }
}

/// Echoes the output of the previous action stored in the scratch space
struct ScratchReader;

#[async_trait]
impl ActionExecutor for ScratchReader {
    async fn execute(&self, action: &Action, context: &ActionContext) -> Result<Value> {
        let source = action.parameter_str("source").unwrap_or_default();
        Ok(json!({ "seen": context.action_output(source).cloned() }))
    }
}

fn test_config() -> RecoveryConfig {
    let mut config = RecoveryConfig::default();
    config.monitor.sampling_interval_ms = 0;
    config
}

fn setup() -> (ResolutionExecutor, Arc<ActionExecutorRegistry>, Arc<StaticProbe>) {
    recovery::init_test_tracing();
    let registry = Arc::new(ActionExecutorRegistry::with_builtin_executors());
    let probe = Arc::new(StaticProbe::healthy());
    let executor = ResolutionExecutor::builder(test_config())
        .registry(registry.clone())
        .probe(probe.clone())
        .build();
    (executor, registry, probe)
}

fn analysis() -> CausalAnalysisResult {
    CausalAnalysisResult::new("incident-1")
}

#[tokio::test]
async fn test_actions_run_in_order_and_share_outputs() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("read_scratch", Arc::new(ScratchReader));

    let strategy = Strategy::new("ordered", "ordered")
        .with_action(
            Action::new("restart", "restart_component")
                .on_component("api")
                .with_order(1),
        )
        .with_action(
            Action::new("read", "read_scratch")
                .with_parameter("source", json!("restart"))
                .with_order(2),
        );

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    assert!(result.successful);
    assert_eq!(result.completed_actions, vec!["restart", "read"]);
    let seen = result.action_results[1]
        .output
        .as_ref()
        .and_then(|o| o.get("seen"))
        .cloned()
        .unwrap_or(Value::Null);
    assert_eq!(seen["restarted"], json!(true));
    assert!(!result.rollback_performed);
    Ok(())
}

#[tokio::test]
async fn test_fallback_recovers_failed_action() -> Result<()> {
    let (executor, registry, _) = setup();
    let failing = FailingExecutor::new("primary broke");
    registry.register("flaky", failing.clone());

    let strategy = Strategy::new("fallback", "fallback").with_action(
        Action::new("primary", "flaky")
            .with_fallback(Action::new("second", "flaky"))
            .with_fallback(Action::new("third", "noop")),
    );

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    assert!(result.successful);
    let primary = &result.action_results[0];
    assert_eq!(primary.fallback_used.as_deref(), Some("third"));
    assert_eq!(primary.fallback_attempts.len(), 2);
    assert!(primary.error.as_deref().unwrap_or_default().contains("primary broke"));
    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.metrics.reliability.fallbacks_used, 1);
    Ok(())
}

#[tokio::test]
async fn test_optional_failure_does_not_stop_execution() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("broken", FailingExecutor::new("nope"));

    let strategy = Strategy::new("optional", "optional")
        .with_action(Action::new("a", "broken").optional())
        .with_action(Action::new("b", "noop"));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    assert!(result.successful);
    assert_eq!(result.completed_actions, vec!["b"]);
    assert_eq!(result.metrics.reliability.actions_failed, 1);
    assert_eq!(result.metrics.reliability.action_success_rate, 0.5);
    Ok(())
}

#[tokio::test]
async fn test_required_failure_rolls_back_in_reverse_order() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("broken", FailingExecutor::new("disk on fire"));
    let observer = RecordingObserver::new();
    executor.events().register_observer(observer.clone());

    let strategy = Strategy::new("rollback", "rollback")
        .with_action(
            Action::new("config", "update_configuration")
                .with_parameter("config_key", json!("pool_size"))
                .with_parameter("value", json!(32))
                .with_parameter("previous_value", json!(16)),
        )
        .with_action(Action::new("restart", "restart_component").on_component("db"))
        .with_action(Action::new("repair", "broken"))
        .with_action(Action::new("never", "noop"));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    assert!(!result.successful);
    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.as_ref().expect("failure recorded");
    assert_eq!(error.kind, ExecutionErrorKind::ActionFailed);
    assert_eq!(error.action_id.as_deref(), Some("repair"));
    // Verification still runs after an early abort
    let verdict = result.resolution.as_ref().expect("verdict computed on failure");
    assert!(verdict.assumed);
    assert_eq!(result.action_results.len(), 3);

    assert!(result.rollback_performed);
    let rollback = result.rollback_result.as_ref().expect("rollback ran");
    let compensated: Vec<&str> = rollback
        .action_results
        .iter()
        .map(|r| r.compensates.as_str())
        .collect();
    assert_eq!(compensated, vec!["repair", "restart", "config"]);
    assert!(rollback.successful);
    assert_eq!(rollback.action_results[2].action_type, "restore_configuration");
    assert_eq!(rollback.action_results[2].output.as_ref().map(|o| o["restored_value"].clone()), Some(json!(16)));

    assert_eq!(observer.count(EventTopics::ROLLBACK_COMPLETED), 1);
    assert_eq!(observer.count(EventTopics::EXECUTION_FAILED), 1);
    assert_eq!(observer.count(EventTopics::EXECUTION_COMPLETED), 0);
    Ok(())
}

#[tokio::test]
async fn test_irreversible_action_is_reported_not_compensated() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("broken", FailingExecutor::new("nope"));

    let mut purge = Action::new("purge", "noop");
    purge.rollback = RollbackDirective::Irreversible;
    let strategy = Strategy::new("irreversible", "irreversible")
        .with_action(purge)
        .with_action(Action::new("fail", "broken"));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    let rollback = result.rollback_result.expect("rollback ran");
    assert_eq!(rollback.irreversible, vec!["purge"]);
    assert!(rollback.action_results.iter().all(|r| r.compensates != "purge"));
    assert!(rollback.successful);
    Ok(())
}

#[tokio::test]
async fn test_auto_rollback_can_be_disabled() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("broken", FailingExecutor::new("nope"));
    let strategy = Strategy::new("s", "s").with_action(Action::new("a", "broken"));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default().without_rollback())
        .await?;

    assert!(!result.successful);
    assert!(!result.rollback_performed);
    assert!(result.rollback_result.is_none());
    Ok(())
}

#[tokio::test]
async fn test_timeout_fails_and_compensates_completed_actions() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register(
        "slow",
        Arc::new(SlowExecutor {
            delay: Duration::from_secs(10),
        }),
    );

    let strategy = Strategy::new("slow", "slow")
        .with_action(Action::new("quick", "noop"))
        .with_action(Action::new("stuck", "slow"));

    let started = std::time::Instant::now();
    let result = executor
        .execute_strategy(
            &strategy,
            &analysis(),
            ExecuteOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await?;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!result.successful);
    assert!(result.error.as_ref().map(|e| e.is_timeout()).unwrap_or(false));
    assert_eq!(result.completed_actions, vec!["quick"]);
    let rollback = result.rollback_result.expect("rollback ran");
    let compensated: Vec<&str> = rollback
        .action_results
        .iter()
        .map(|r| r.compensates.as_str())
        .collect();
    assert_eq!(compensated, vec!["quick"]);
    Ok(())
}

#[rstest]
#[case::aborted_during_validation(100)]
#[case::stopped_before_allocation(1_000)]
#[tokio::test]
async fn test_timed_out_action_leaves_nothing_behind(#[case] grace_ms: u64) -> Result<()> {
    recovery::init_test_tracing();
    let mut config = test_config();
    config.executor.timeout_grace_ms = grace_ms;
    let probe = Arc::new(StaticProbe::healthy());
    let manager = Arc::new(HeuristicResourceManager::new(probe.clone()));
    let registry = Arc::new(ActionExecutorRegistry::with_builtin_executors());
    let slow = Arc::new(SlowValidationExecutor {
        executions: AtomicU32::new(0),
    });
    registry.register("slow_validation", slow.clone());
    let executor = ResolutionExecutor::builder(config)
        .registry(registry)
        .resource_manager(manager.clone())
        .sampler(Arc::new(ProbeSampler::new(probe)))
        .build();
    let observer = RecordingObserver::new();
    executor.events().register_observer(observer.clone());

    let strategy = Strategy::new("late", "late").with_action(Action::new("late", "slow_validation"));
    let result = executor
        .execute_strategy(
            &strategy,
            &analysis(),
            ExecuteOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await?;

    assert!(result.error.as_ref().map(|e| e.is_timeout()).unwrap_or(false));
    assert!(manager.outstanding().is_empty());
    let events_at_return = observer.events().len();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(manager.outstanding().is_empty());
    assert_eq!(slow.executions.load(Ordering::SeqCst), 0);
    assert_eq!(observer.events().len(), events_at_return);
    assert_eq!(observer.count(EventTopics::ACTION_FAILED), 0);
    Ok(())
}

#[tokio::test]
async fn test_validation_failure_is_classified() -> Result<()> {
    let (executor, _, _) = setup();
    let strategy = Strategy::new("invalid-params", "invalid-params")
        .with_action(Action::new("config", "update_configuration").with_parameter("value", json!(3)));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    assert!(!result.successful);
    let error = result.error.as_ref().expect("failure recorded");
    assert_eq!(error.kind, ExecutionErrorKind::ValidationFailed);
    assert_eq!(error.action_id.as_deref(), Some("config"));
    assert!(error.message.contains("config_key"));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_between_actions() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register(
        "slow",
        Arc::new(SlowExecutor {
            delay: Duration::from_millis(400),
        }),
    );
    let executor = Arc::new(executor);

    let strategy = Strategy::new("cancel-me", "cancel-me")
        .with_action(Action::new("first", "slow"))
        .with_action(Action::new("second", "noop"));

    let runner = executor.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
            .await
    });

    let mut execution_id = None;
    for _ in 0..100 {
        if let Some(active) = executor.get_active_executions().first() {
            execution_id = Some(active.execution_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let execution_id = execution_id.expect("execution became active");
    assert!(matches!(
        executor.get_execution_details(execution_id),
        Some(ExecutionDetails::Active(_))
    ));
    assert!(executor.cancel_execution(execution_id));

    let result = handle.await??;
    assert!(!result.successful);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ExecutionErrorKind::Cancelled)
    );
    assert_eq!(result.completed_actions, vec!["first"]);
    assert!(result.rollback_performed);

    assert!(!executor.cancel_execution(execution_id));
    assert!(matches!(
        executor.get_execution_details(execution_id),
        Some(ExecutionDetails::Completed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_dry_run_simulates_without_side_effects() -> Result<()> {
    let (executor, registry, _) = setup();
    let failing = FailingExecutor::new("must not run");
    registry.register("dangerous", failing.clone());

    let strategy = Strategy::new("dry", "dry")
        .with_action(Action::new("danger", "dangerous"))
        .with_action(Action::new("restart", "restart_component").on_component("api"));

    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default().dry_run())
        .await?;

    assert!(result.successful);
    assert!(result.dry_run);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
    assert!(result.action_results.iter().all(|r| r.simulated));
    assert!(result.resource_allocations.is_empty());
    assert!(result.action_results.iter().all(|r| {
        let ms = r.duration.as_millis() as u64;
        (50..=250).contains(&ms)
    }));
    let verdict = result.resolution.expect("verdict on success");
    assert!(!verdict.resolved);
    assert!(!result.rollback_performed);
    Ok(())
}

#[tokio::test]
async fn test_resolution_verified_against_resulting_state() -> Result<()> {
    let (executor, _, probe) = setup();
    probe.update(|s| {
        s.metrics.insert("error_rate".into(), json!(0.01));
    });
    let analysis = CausalAnalysisResult::new("incident-2").with_criterion(VerificationCriterion::new(
        "metrics.error_rate",
        Comparison::LessThan,
        json!(0.05),
    ));
    let strategy = Strategy::new("s", "s").with_action(Action::new("a", "noop"));

    let result = executor
        .execute_strategy(&strategy, &analysis, ExecuteOptions::default())
        .await?;

    let verdict = result.resolution.expect("verdict on success");
    assert!(verdict.resolved);
    assert!(!verdict.assumed);
    assert_eq!(verdict.confidence, 1.0);
    Ok(())
}

#[tokio::test]
async fn test_failed_checkpoint_continues_unless_gating() -> Result<()> {
    let (executor, _, _) = setup();
    for name in ["soft", "hard"] {
        let id = executor
            .checkpoints()
            .register_checkpoint(CheckpointDefinition::new(name, "a"));
        executor.checkpoints().register_verifier(
            id,
            Arc::new(FnVerifier::new("always-fails", |_, _| Ok(VerifierOutcome::failed(0.2)))),
        )?;
    }

    let soft = Strategy::new("soft", "soft")
        .with_action(Action::new("a", "noop"))
        .with_action(Action::new("b", "noop"))
        .with_checkpoint(recovery::Checkpoint::new("soft", "a"))
        .with_checkpoint(recovery::Checkpoint::new("passes", "b"));
    let result = executor
        .execute_strategy(&soft, &analysis(), ExecuteOptions::default())
        .await?;
    assert!(result.successful);
    assert_eq!(result.reached_checkpoints, vec!["passes"]);
    assert_eq!(result.metrics.reliability.checkpoints_failed, 1);
    assert_eq!(result.metrics.reliability.checkpoint_success_rate, 0.5);

    let hard = Strategy::new("hard", "hard")
        .with_action(Action::new("a", "noop"))
        .with_action(Action::new("b", "noop"))
        .with_checkpoint(recovery::Checkpoint::new("hard", "a").gating());
    let result = executor
        .execute_strategy(&hard, &analysis(), ExecuteOptions::default())
        .await?;
    assert!(!result.successful);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ExecutionErrorKind::CheckpointGate)
    );
    assert_eq!(result.completed_actions, vec!["a"]);
    assert!(result.rollback_performed);
    Ok(())
}

#[tokio::test]
async fn test_invalid_strategies_rejected_before_execution() {
    let (executor, _, _) = setup();
    let observer = RecordingObserver::new();
    executor.events().register_observer(observer.clone());

    let empty = Strategy::new("empty", "empty");
    assert!(executor
        .execute_strategy(&empty, &analysis(), ExecuteOptions::default())
        .await
        .is_err());

    let unknown = Strategy::new("unknown", "unknown").with_action(Action::new("a", "summon_dragons"));
    assert!(executor
        .execute_strategy(&unknown, &analysis(), ExecuteOptions::default())
        .await
        .is_err());

    assert!(observer.events().is_empty());
    assert!(executor.get_execution_history(&HistoryFilter::default()).is_empty());
}

#[tokio::test]
async fn test_history_filters_newest_first() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register("broken", FailingExecutor::new("nope"));

    let good = Strategy::new("good", "good").with_action(Action::new("a", "noop"));
    let bad = Strategy::new("bad", "bad").with_action(Action::new("a", "broken"));
    for strategy in [&good, &bad, &good] {
        executor
            .execute_strategy(strategy, &analysis(), ExecuteOptions::default())
            .await?;
    }

    let all = executor.get_execution_history(&HistoryFilter::default());
    assert_eq!(all.len(), 3);
    assert!(all[0].started_at >= all[1].started_at);
    assert_eq!(all[1].strategy_id, "bad");

    let failed = executor.get_execution_history(&HistoryFilter {
        successful: Some(false),
        ..Default::default()
    });
    assert_eq!(failed.len(), 1);

    let limited = executor.get_execution_history(&HistoryFilter {
        strategy_id: Some("good".into()),
        limit: Some(1),
        ..Default::default()
    });
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].execution_id, all[0].execution_id);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_executions_are_isolated() -> Result<()> {
    let (executor, registry, _) = setup();
    registry.register(
        "slow",
        Arc::new(SlowExecutor {
            delay: Duration::from_millis(20),
        }),
    );
    let executor = Arc::new(executor);

    let mut handles = Vec::new();
    for i in 0..5 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let strategy = Strategy::new(format!("s{}", i), "parallel")
                .with_action(Action::new("a", "slow"))
                .with_action(Action::new("b", "noop"));
            executor
                .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
                .await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let result = handle.await??;
        assert!(result.successful);
        assert_eq!(result.completed_actions, vec!["a", "b"]);
        ids.insert(result.execution_id);
    }
    assert_eq!(ids.len(), 5);
    assert!(executor.get_active_executions().is_empty());
    assert_eq!(executor.get_execution_history(&HistoryFilter::default()).len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_events_and_monitoring_report() -> Result<()> {
    let (executor, _, _) = setup();
    let observer = RecordingObserver::new();
    executor.events().register_observer(observer.clone());

    let strategy = Strategy::new("events", "events")
        .with_action(Action::new("a", "noop"))
        .with_checkpoint(recovery::Checkpoint::new("after-a", "a"));
    let result = executor
        .execute_strategy(&strategy, &analysis(), ExecuteOptions::default())
        .await?;

    let topics = observer.topics();
    assert_eq!(topics.first().map(String::as_str), Some(EventTopics::EXECUTION_STARTED));
    assert_eq!(topics.last().map(String::as_str), Some(EventTopics::EXECUTION_COMPLETED));
    for topic in [
        EventTopics::MONITORING_STARTED,
        EventTopics::ACTION_STARTED,
        EventTopics::ACTION_COMPLETED,
        EventTopics::CHECKPOINT_PROCESSING,
        EventTopics::CHECKPOINT_REACHED,
        EventTopics::MONITORING_COMPLETED,
    ] {
        assert_eq!(observer.count(topic), 1, "topic {}", topic);
    }

    let report_id = result.report_id.expect("report produced");
    let report = executor.monitor().get_report(&report_id).expect("report stored");
    assert_eq!(report.execution_id, result.execution_id);
    Ok(())
}
