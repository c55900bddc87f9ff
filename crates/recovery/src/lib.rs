//! Autonomous Recovery Execution Engine

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::items_after_test_module)]
#![allow(clippy::new_without_default)]
#![allow(clippy::field_reassign_with_default)]
//!
//! This crate executes recovery strategies produced by upstream diagnosis:
//! ordered remediation actions run through pluggable executors, with
//! fallbacks, checkpoint verification, resource accounting, live monitoring
//! and automatic rollback when a required step fails.
//!
//! # Architecture
//!
//! - **ResolutionExecutor**: Orchestrates one strategy per call, many calls concurrently
//! - **ActionExecutorRegistry**: Action type → executor plugin map with builtin executors
//! - **CheckpointManager**: Verifies progress markers between actions
//! - **RollbackManager**: Derives and runs compensating actions in reverse order
//! - **ExecutionMonitor**: Samples resources during a run and produces a report
//! - **ResourceManager**: Advisory resource planning and allocation
//! - **EventBus**: Lifecycle event fan-out to subscribers and observers
//! - **CircuitBreaker**: Guards calls into external collaborators
//!
//! # Usage
//!
//! ```no_run
//! use recovery::{Action, CausalAnalysisResult, RecoveryConfig, ResolutionExecutor, Strategy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RecoveryConfig::default().with_env_overrides()?;
//!     recovery::init_tracing(&config.logging);
//!
//!     let executor = ResolutionExecutor::new(config);
//!     let strategy = Strategy::new("restart-api", "Restart the API tier")
//!         .with_action(Action::new("restart", "restart_component").on_component("api"))
//!         .with_action(Action::new("check", "verify_status").on_component("api"));
//!
//!     let result = executor
//!         .execute_strategy(&strategy, &CausalAnalysisResult::new("incident-42"), executor.default_options())
//!         .await?;
//!     println!("Execution finished: {}", result.status);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod reliability;
pub mod resources;
pub mod rollback;

pub use checkpoint::{
    create_default_verifier, CheckpointDefinition, CheckpointId, CheckpointManager,
    CheckpointVerifier, FnVerifier, VerificationResult, VerifierOutcome,
};
pub use collaborators::{MetricsSink, NeuralCoordinator, NoopCoordinator, TracingMetricsSink};
pub use config::{
    CheckpointConfig, CircuitBreakerSettings, EventsConfig, ExecutorConfig, LoggingConfig,
    MonitorConfig, RecoveryConfig, RollbackConfig,
};
pub use error::{CheckpointError, ConfigError, ExecutorError, RegistryError};
pub use events::{EventBus, EventEnvelope, EventObserver, EventTopics, ExecutionEvent, RecordingObserver};
pub use executor::{
    evaluate_criterion, verify_resolution, ActiveExecutionInfo, ExecuteOptions, ExecutionDetails,
    HistoryFilter, ResolutionExecutor, ResolutionExecutorBuilder,
};
pub use history::BoundedHistory;
pub use logging::{init_test_tracing, init_tracing};
pub use model::{
    Action, ActionContext, ActionExecutionResult, CausalAnalysisResult, Checkpoint, Comparison,
    ExecutionContext, ExecutionError, ExecutionErrorKind, ExecutionMetrics, ExecutionPlan,
    ExecutionResult, ExecutionStatus, ResolutionVerdict, ResourceAllocation, ResourceRequirements,
    RollbackDirective, Strategy, SystemState, VerificationCriterion,
};
pub use monitor::{
    Anomaly, AnomalyDetector, ExecutionMonitor, MonitoringData, MonitoringOptions, MonitoringReport,
    ProbeSampler, ResourceSample, ResourceSampler, ThresholdAnomalyDetector,
};
pub use registry::{ActionExecutor, ActionExecutorRegistry, BuiltinAction, ValidationOutcome};
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerState};
pub use resources::{HeuristicResourceManager, ResourceManager, StaticProbe, SysinfoProbe, SystemProbe};
pub use rollback::{RollbackManager, RollbackPlan, RollbackResult};

