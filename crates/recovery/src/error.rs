//! Error taxonomy for programmer-level failures.
//!
//! Expected runtime failures (action errors, timeouts, failed checkpoints)
//! are reported inside [`ExecutionResult`](crate::ExecutionResult) as
//! [`ExecutionError`](crate::ExecutionError). The enums here cover misuse
//! that callers must fix.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned directly by the resolution executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid strategy '{strategy_id}': {reason}")]
    InvalidStrategy { strategy_id: String, reason: String },

    #[error("No executor registered for action type '{action_type}' (action '{action_id}')")]
    ExecutorNotFound {
        action_type: String,
        action_id: String,
    },

    #[error("Invalid status transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: Uuid,
        from: crate::ExecutionStatus,
        to: crate::ExecutionStatus,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Errors raised by the action executor registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No executor registered for action type '{0}'")]
    ExecutorNotFound(String),

    #[error("Unknown executor registration {0}")]
    UnknownRegistration(Uuid),
}

/// Errors raised by the checkpoint manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Unknown checkpoint {0}")]
    UnknownCheckpoint(Uuid),

    #[error("Checkpoint '{0}' has no registered verifiers")]
    NoVerifiers(String),
}

/// Configuration validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
